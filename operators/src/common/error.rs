use std::{error::Error, fmt};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LaunchErrorKind {
    TypeMismatch,
    RankNotSupport,
    ShapeMismatch,
    DeviceMismatch,
    ArgsNotSupport,
    UnsupportedConfiguration,
    KernelFailure,
}

#[derive(Clone, Debug)]
pub struct LaunchError {
    pub kind: LaunchErrorKind,
    pub info: String,
    /// 所有未通过的检查，按检查顺序排列。
    pub reasons: Vec<String>,
}

impl LaunchError {
    #[inline]
    pub fn is(&self, kind: LaunchErrorKind) -> bool {
        self.kind == kind
    }
}

impl fmt::Display for LaunchError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.info)?;
        for reason in &self.reasons {
            write!(f, "\n    `{reason}`")?;
        }
        Ok(())
    }
}

impl Error for LaunchError {}

pub(super) mod functions {
    use super::{LaunchError, LaunchErrorKind::*};

    macro_rules! builder {
        ($ty:ident: $name:ident $kind:expr) => {
            #[inline]
            pub fn $name(info: impl Into<String>) -> $ty {
                $ty {
                    kind: $kind,
                    info: info.into(),
                    reasons: vec![],
                }
            }
        };
    }

    builder!(LaunchError: type_mismatch    TypeMismatch  );
    builder!(LaunchError: rank_not_support RankNotSupport);
    builder!(LaunchError: shape_mismatch   ShapeMismatch );
    builder!(LaunchError: device_mismatch  DeviceMismatch);
    builder!(LaunchError: args_not_support ArgsNotSupport);

    builder!(LaunchError: kernel_failure   KernelFailure );

    /// 被能力检查拒绝，`reasons` 非空。
    pub fn unsupported(op: &str, reasons: Vec<String>) -> LaunchError {
        debug_assert!(!reasons.is_empty());
        LaunchError {
            kind: UnsupportedConfiguration,
            info: format!("{op} is not supported for these inputs"),
            reasons,
        }
    }
}

#[test]
fn test_display_lists_reasons() {
    use functions::unsupported;

    let e = unsupported(
        "flshattF@0.0.0",
        vec!["dtype=float32".into(), "query.stride(-1) > 1".into()],
    );
    let text = e.to_string();
    assert!(text.starts_with("UnsupportedConfiguration: flshattF@0.0.0"));
    assert!(text.contains("`dtype=float32`"));
    assert!(text.contains("`query.stride(-1) > 1`"));
    assert!(e.is(LaunchErrorKind::UnsupportedConfiguration));
}
