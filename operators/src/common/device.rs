use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum DeviceKind {
    Cpu,
    Cuda,
}

impl DeviceKind {
    #[inline]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
        }
    }
}

/// 算力硬件抽象。
///
/// 存储总是主机可寻址的，标签只决定算子是否接受张量。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Device {
    kind: DeviceKind,
    ordinal: usize,
    capability: Option<(u32, u32)>,
}

impl Device {
    #[inline]
    pub const fn cpu() -> Self {
        Self {
            kind: DeviceKind::Cpu,
            ordinal: 0,
            capability: None,
        }
    }

    #[inline]
    pub const fn cuda(ordinal: usize, capability: (u32, u32)) -> Self {
        Self {
            kind: DeviceKind::Cuda,
            ordinal,
            capability: Some(capability),
        }
    }

    #[inline]
    pub const fn kind(&self) -> DeviceKind {
        self.kind
    }

    /// 加速器的 `(major, minor)`，主机为 `None`。
    #[inline]
    pub const fn compute_capability(&self) -> Option<(u32, u32)> {
        self.capability
    }

    #[inline]
    pub const fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            DeviceKind::Cpu => write!(f, "cpu"),
            DeviceKind::Cuda => write!(f, "cuda:{}", self.ordinal),
        }
    }
}
