fn main() {
    use build_script_cfg::Cfg;

    let cpu = Cfg::new("use_cpu");
    if cfg!(feature = "common-cpu") {
        cpu.define();
    }
}
