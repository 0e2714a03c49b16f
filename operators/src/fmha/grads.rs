use crate::Tensor;
use log::debug;

/// 反向的梯度缓冲区，核函数布局。
pub enum GradBuffers {
    /// 一块 `[tokens, 3, heads, head_dim]` 存储，`dq`、`dk`、`dv` 是其第 1 阶的三个切片。
    Packed {
        chunk: Tensor,
        dq: Tensor,
        dk: Tensor,
        dv: Tensor,
    },
    Separate {
        dq: Tensor,
        dk: Tensor,
        dv: Tensor,
    },
}

impl GradBuffers {
    /// `query`、`key`、`value` 是同一存储上形状相同的视图时打包，否则分配三块连续存储。
    /// 不初始化。
    pub fn allocate(query: &Tensor, key: &Tensor, value: &Tensor) -> Self {
        let shared = query.shape() == key.shape()
            && query.shape() == value.shape()
            && query.same_storage(key)
            && query.same_storage(value);
        match *query.shape() {
            [n, h, d] if shared => {
                debug!("packing gradients of shared-storage qkv into [{n}, 3, {h}, {d}]");
                let chunk = Tensor::empty(query.dt(), &[n, 3, h, d], query.device());
                Self::Packed {
                    dq: chunk.index(1, 0),
                    dk: chunk.index(1, 1),
                    dv: chunk.index(1, 2),
                    chunk,
                }
            }
            _ => Self::Separate {
                dq: query.empty_like(),
                dk: key.empty_like(),
                dv: value.empty_like(),
            },
        }
    }

    #[inline]
    pub fn is_packed(&self) -> bool {
        matches!(self, Self::Packed { .. })
    }

    pub fn parts(&self) -> (&Tensor, &Tensor, &Tensor) {
        match self {
            Self::Packed { dq, dk, dv, .. } | Self::Separate { dq, dk, dv } => (dq, dk, dv),
        }
    }

    pub fn into_parts(self) -> (Tensor, Tensor, Tensor) {
        match self {
            Self::Packed { dq, dk, dv, .. } | Self::Separate { dq, dk, dv } => (dq, dk, dv),
        }
    }
}

#[cfg(test)]
mod test {
    use super::GradBuffers;
    use crate::{Device, Tensor};
    use digit_layout::types as ty;

    #[test]
    fn test_packed_from_shared_storage() {
        let qkv = Tensor::zeros(ty::F16, &[10, 3, 4, 8], Device::cuda(0, (8, 0)));
        let (q, k, v) = (qkv.index(1, 0), qkv.index(1, 1), qkv.index(1, 2));
        let grads = GradBuffers::allocate(&q, &k, &v);
        assert!(grads.is_packed());

        let (dq, dk, dv) = grads.parts();
        assert!(dq.same_storage(dk) && dq.same_storage(dv));
        assert!(!dq.same_storage(&q));
        assert_eq!(dq.shape(), &[10, 4, 8]);
        assert_eq!(dq.strides(), &[96, 8, 1]);
        assert_eq!((dq.offset(), dk.offset(), dv.offset()), (0, 32, 64));
    }

    #[test]
    fn test_separate() {
        let cuda = Device::cuda(0, (8, 0));
        let q = Tensor::zeros(ty::F16, &[10, 4, 8], cuda);
        let k = Tensor::zeros(ty::F16, &[10, 4, 8], cuda);
        let grads = GradBuffers::allocate(&q, &k, &k);
        assert!(!grads.is_packed());
        let (dq, dk, dv) = grads.into_parts();
        assert!(!dq.same_storage(&dk) && !dk.same_storage(&dv));
        assert!(dq.is_contiguous());

        // 头数不同，不能打包
        let qkv = Tensor::zeros(ty::F16, &[10, 6, 8], cuda);
        let (q, k, v) = (qkv.slice(1, 0, 4), qkv.slice(1, 4, 1), qkv.slice(1, 5, 1));
        assert!(!GradBuffers::allocate(&q, &k, &v).is_packed());
    }
}
