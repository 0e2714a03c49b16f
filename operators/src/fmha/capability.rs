//! 算子的静态能力声明及其检查。

use super::{
    args::Inputs,
    attn_bias::{AttnBias, MaskKind},
};
use crate::{dtype_name, DeviceKind, Tensor};
use digit_layout::{types as ty, DigitLayout};

/// 只有部分硬件代际能突破的 head_dim 上限。
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct HeadDimCeiling {
    pub max_head_dim: usize,
    /// 不受上限约束的算力版本。
    pub waived: Vec<(u32, u32)>,
}

impl Default for HeadDimCeiling {
    fn default() -> Self {
        Self {
            max_head_dim: 192,
            waived: vec![(8, 0), (9, 0)],
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct Capability {
    pub devices: Vec<DeviceKind>,
    pub min_compute_capability: (u32, u32),
    pub dtypes: Vec<DigitLayout>,
    pub bf16_min_compute_capability: (u32, u32),
    pub max_k: usize,
    pub attn_bias: Vec<MaskKind>,
    /// 除填充键外，因果掩码要求查询与键等长。
    pub causal_requires_square: bool,
    pub supports_dropout: bool,
    pub supports_custom_scale: bool,
    pub supports_different_value_embed: bool,
    pub supports_bmghk: bool,
    /// 最后一阶的对齐要求，以元素计。
    pub lastdim_alignment: usize,
    pub head_dim_ceiling: Option<HeadDimCeiling>,
    pub supports_head_broadcast: bool,
}

impl Default for Capability {
    #[inline]
    fn default() -> Self {
        Self::flash_fw()
    }
}

impl Capability {
    pub fn flash_fw() -> Self {
        Self {
            devices: vec![DeviceKind::Cuda],
            min_compute_capability: (8, 0),
            dtypes: vec![ty::F16, ty::BF16],
            bf16_min_compute_capability: (8, 0),
            max_k: 256,
            attn_bias: MaskKind::ALL.to_vec(),
            causal_requires_square: true,
            supports_dropout: true,
            supports_custom_scale: true,
            supports_different_value_embed: false,
            supports_bmghk: true,
            lastdim_alignment: 8,
            head_dim_ceiling: None,
            supports_head_broadcast: true,
        }
    }

    /// 同正向，但不支持分组形式和广播的键值头，且 head_dim 上限依赖硬件代际。
    pub fn flash_bw() -> Self {
        Self {
            supports_bmghk: false,
            head_dim_ceiling: Some(HeadDimCeiling::default()),
            supports_head_broadcast: false,
            ..Self::flash_fw()
        }
    }

    pub fn split_kv_fw() -> Self {
        Self {
            dtypes: vec![ty::F16, ty::BF16, ty::F32],
            supports_dropout: false,
            ..Self::flash_fw()
        }
    }

    /// 按固定顺序列出 `inp` 未通过的检查，为空表示支持。
    pub fn not_supported_reasons(&self, inp: &Inputs) -> Vec<String> {
        let mut reasons = Vec::new();
        let Inputs {
            query,
            key,
            value,
            attn_bias,
            p,
            scale,
        } = inp;

        let ndim = query.ndim();
        if !matches!(ndim, 4 | 5) || key.ndim() != ndim || value.ndim() != ndim {
            reasons.push(format!(
                "query/key/value ndim = {}/{}/{} (supported: 4 or 5, all equal)",
                ndim,
                key.ndim(),
                value.ndim()
            ));
            return reasons;
        }

        let device = inp.device();
        let capability = device.compute_capability();
        if !self.devices.contains(&device.kind()) {
            let supported = self.devices.iter().map(|d| d.type_name()).collect::<Vec<_>>();
            reasons.push(format!("device={} (supported: {supported:?})", device.type_name()));
        }
        if let Some(cc) = capability {
            if cc < self.min_compute_capability {
                reasons.push(format!(
                    "requires device with capability >= {:?} but your GPU has capability {cc:?} (too old)",
                    self.min_compute_capability
                ));
            }
        }

        let dt = inp.dtype();
        if !self.dtypes.contains(&dt) {
            let supported = self.dtypes.iter().map(|&dt| dtype_name(dt)).collect::<Vec<_>>();
            reasons.push(format!("dtype={} (supported: {supported:?})", dtype_name(dt)));
        }
        if dt == ty::BF16 && capability.is_some_and(|cc| cc < self.bf16_min_compute_capability) {
            reasons.push("bf16 is only supported on A100+ GPUs".into());
        }

        let kind = attn_bias.kind();
        if !self.attn_bias.contains(&kind) {
            reasons.push(format!("attn_bias type is {kind}"));
        }
        if self.causal_requires_square && !is_square(attn_bias, query.dim(1), key.dim(1)) {
            reasons.push(format!(
                "{kind} requires every query block to be as long as its key block"
            ));
        }

        let head_dim = query.dim(-1);
        let head_dim_v = value.dim(-1);
        if head_dim.max(head_dim_v) > self.max_k {
            reasons.push(format!(
                "max(query.shape[-1], value.shape[-1]) > {}",
                self.max_k
            ));
        }
        if !self.supports_different_value_embed && head_dim != head_dim_v {
            reasons.push("query.shape[-1] != value.shape[-1]".into());
        }
        if ndim == 5 && !self.supports_bmghk {
            reasons.push("operator does not support BMGHK format".into());
        }
        if *p != 0. && !self.supports_dropout {
            reasons.push("dropout > 0.0".into());
        }
        if scale.is_some() && !self.supports_custom_scale {
            reasons.push("has custom scale".into());
        }

        for (name, x) in [("query", query), ("key", key), ("value", value)] {
            check_lastdim_alignment_stride1(&mut reasons, name, x, self.lastdim_alignment);
        }

        if let (Some(ceiling), Some(cc)) = (&self.head_dim_ceiling, capability) {
            let max = ceiling.max_head_dim;
            if key.dim(-1).max(head_dim) > max && !ceiling.waived.contains(&cc) {
                let tiers = ceiling
                    .waived
                    .iter()
                    .map(|(major, minor)| format!("{major}.{minor}"))
                    .collect::<Vec<_>>()
                    .join(" or ");
                reasons.push(format!(
                    "requires a GPU with compute capability {tiers} for 'query.shape[-1] > {max}'"
                ));
            }
        }
        if !self.supports_head_broadcast
            && ndim == 4
            && (key.stride(2) == 0 || value.stride(2) == 0)
            && key.dim(2) > 1
        {
            reasons.push("key/value heads broadcast with stride 0".into());
        }

        reasons
    }
}

pub fn check_lastdim_alignment_stride1(
    reasons: &mut Vec<String>,
    name: &str,
    x: &Tensor,
    alignment: usize,
) {
    if x.dim(-1) % alignment != 0 {
        reasons.push(format!("{name}.shape[-1] % {alignment} != 0"));
    } else if x.stride(-2) % alignment as isize != 0 {
        reasons.push(format!(
            "{name}.stride(-2) % {alignment} != 0 ({name}.stride() = {:?})",
            x.strides()
        ));
    }
    if x.stride(-1) > 1 {
        reasons.push(format!(
            "{name}.stride(-1) > 1 ({name}.stride() = {:?}) - you should call `.contiguous()` on the input",
            x.strides()
        ));
    }
}

fn is_square(attn_bias: &AttnBias, seqlen_q: usize, seqlen_kv: usize) -> bool {
    match attn_bias {
        AttnBias::LowerTriangular => seqlen_q == seqlen_kv,
        AttnBias::BlockDiagonalCausal(m) => m
            .q_seqinfo
            .intervals()
            .zip(m.k_seqinfo.intervals())
            .all(|((qs, qe), (ks, ke))| qe - qs == ke - ks),
        AttnBias::None
        | AttnBias::BlockDiagonal(_)
        | AttnBias::BlockDiagonalCausalWithOffsetPaddedKeys(_) => true,
    }
}

#[cfg(test)]
mod test {
    use super::Capability;
    use crate::{
        fmha::{
            attn_bias::{AttnBias, BlockDiagonalMask},
            Inputs,
        },
        Device, Tensor,
    };
    use digit_layout::{types as ty, DigitLayout};

    fn inputs(dt: DigitLayout, shape: &[usize], device: Device) -> Inputs {
        let t = || Tensor::zeros(dt, shape, device);
        Inputs::new(t(), t(), t())
    }

    const A100: Device = Device::cuda(0, (8, 0));
    const RTX: Device = Device::cuda(0, (8, 6));

    #[test]
    fn test_supported() {
        let inp = inputs(ty::F16, &[2, 128, 16, 128], A100);
        assert!(Capability::flash_fw().not_supported_reasons(&inp).is_empty());
        assert!(Capability::flash_bw().not_supported_reasons(&inp).is_empty());
    }

    #[test]
    fn test_rejects_dtype_and_head_dim() {
        let inp = inputs(ty::F32, &[1, 4, 2, 512], A100);
        let reasons = Capability::flash_fw().not_supported_reasons(&inp);
        assert_eq!(reasons.len(), 2);
        assert!(reasons[0].starts_with("dtype=float32"));
        assert!(reasons[1].contains("> 256"));

        assert!(Capability::split_kv_fw()
            .not_supported_reasons(&inputs(ty::F32, &[1, 4, 2, 64], A100))
            .is_empty());
    }

    #[test]
    fn test_rejects_device_first() {
        let inp = inputs(ty::F32, &[1, 4, 2, 64], Device::cpu());
        let reasons = Capability::flash_fw().not_supported_reasons(&inp);
        assert!(reasons[0].starts_with("device=cpu"));
        assert!(reasons[1].starts_with("dtype="));

        let inp = inputs(ty::BF16, &[1, 4, 2, 64], Device::cuda(0, (7, 5)));
        let reasons = Capability::flash_fw().not_supported_reasons(&inp);
        assert!(reasons[0].contains("too old"));
        assert!(reasons[1].starts_with("bf16"));
    }

    #[test]
    fn test_rejects_alignment() {
        let inp = inputs(ty::F16, &[1, 4, 2, 12], A100);
        let reasons = Capability::flash_fw().not_supported_reasons(&inp);
        assert!(reasons.iter().any(|r| r == "query.shape[-1] % 8 != 0"));

        let mut inp = inputs(ty::F16, &[1, 8, 8, 16], A100);
        inp.query = Tensor::zeros(ty::F16, &[1, 8, 16, 8], A100).permute(&[0, 3, 1, 2]);
        assert_eq!(inp.query.strides(), &[1024, 1, 128, 8]);
        let reasons = Capability::flash_fw().not_supported_reasons(&inp);
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].starts_with("query.stride(-1) > 1"));
    }

    #[test]
    fn test_rejects_non_square_causal() {
        let mut inp = inputs(ty::F16, &[1, 4, 2, 64], A100);
        inp.key = Tensor::zeros(ty::F16, &[1, 6, 2, 64], A100);
        inp.value = inp.key.clone();
        assert!(Capability::flash_fw().not_supported_reasons(&inp).is_empty());

        let inp = inp.with_bias(AttnBias::LowerTriangular);
        assert_eq!(Capability::flash_fw().not_supported_reasons(&inp).len(), 1);

        let mask = BlockDiagonalMask::from_seqlens(&[1, 3], Some(&[3, 1])).unwrap();
        let inp = inputs(ty::F16, &[1, 4, 2, 64], A100).with_bias(mask.make_causal());
        assert_eq!(Capability::flash_fw().not_supported_reasons(&inp).len(), 1);
    }

    #[test]
    fn test_backward_ceiling() {
        let inp = inputs(ty::F16, &[1, 4, 2, 256], RTX);
        assert!(Capability::flash_fw().not_supported_reasons(&inp).is_empty());
        let reasons = Capability::flash_bw().not_supported_reasons(&inp);
        assert_eq!(
            reasons,
            ["requires a GPU with compute capability 8.0 or 9.0 for 'query.shape[-1] > 192'"]
        );

        for cc in [(8, 0), (9, 0)] {
            let inp = inputs(ty::F16, &[1, 4, 2, 256], Device::cuda(0, cc));
            assert!(Capability::flash_bw().not_supported_reasons(&inp).is_empty());
        }

        let mut capability = Capability::flash_bw();
        capability.head_dim_ceiling.as_mut().unwrap().waived.push((8, 6));
        assert!(capability.not_supported_reasons(&inp).is_empty());
    }

    #[test]
    fn test_backward_rejects_broadcast_and_grouped() {
        let mut inp = inputs(ty::F16, &[1, 4, 4, 64], A100);
        inp.key = Tensor::zeros(ty::F16, &[1, 4, 1, 64], A100).expand(2, 4);
        inp.value = inp.key.clone();
        assert!(Capability::flash_fw().not_supported_reasons(&inp).is_empty());
        assert_eq!(Capability::flash_bw().not_supported_reasons(&inp).len(), 1);

        let inp = inputs(ty::F16, &[1, 4, 2, 2, 64], A100);
        assert!(Capability::flash_fw().not_supported_reasons(&inp).is_empty());
        assert_eq!(
            Capability::flash_bw().not_supported_reasons(&inp),
            ["operator does not support BMGHK format"]
        );
    }

    #[test]
    fn test_split_kv_rejects_dropout() {
        let inp = inputs(ty::F16, &[1, 4, 2, 64], A100).with_dropout(0.1);
        assert!(Capability::flash_fw().not_supported_reasons(&inp).is_empty());
        assert_eq!(
            Capability::split_kv_fw().not_supported_reasons(&inp),
            ["dropout > 0.0"]
        );
    }
}
