use super::attn_bias::AttnBias;
use crate::{
    args_not_support,
    common::utils::{device_distinct, dim_distinct, rank_error, type_distinct},
    shape_mismatch, Device, LaunchError, Tensor,
};
use digit_layout::DigitLayout;

/// 注意力计算的全部输入。
///
/// `query`、`key`、`value` 形状为 `[batch, seq, heads, head_dim]`，
/// 分组形式为 `[batch, seq, groups, heads_per_group, head_dim]`。
#[derive(Clone)]
pub struct Inputs {
    pub query: Tensor,
    pub key: Tensor,
    pub value: Tensor,
    pub attn_bias: AttnBias,
    pub p: f32,
    /// 缺省为 `head_dim^-0.5`。
    pub scale: Option<f32>,
}

pub(crate) struct Meta {
    pub dt: DigitLayout,
    pub batch: usize,
    pub seqlen_q: usize,
    pub seqlen_kv: usize,
    pub head_dim: usize,
    pub head_dim_v: usize,
}

impl Inputs {
    pub fn new(query: Tensor, key: Tensor, value: Tensor) -> Self {
        Self {
            query,
            key,
            value,
            attn_bias: AttnBias::None,
            p: 0.,
            scale: None,
        }
    }

    #[inline]
    pub fn with_bias(self, attn_bias: AttnBias) -> Self {
        Self { attn_bias, ..self }
    }

    #[inline]
    pub fn with_dropout(self, p: f32) -> Self {
        Self { p, ..self }
    }

    #[inline]
    pub fn with_scale(self, scale: f32) -> Self {
        Self {
            scale: Some(scale),
            ..self
        }
    }

    #[inline]
    pub fn device(&self) -> Device {
        self.query.device()
    }

    #[inline]
    pub fn dtype(&self) -> DigitLayout {
        self.query.dt()
    }

    /// 检查张量与掩码是否描述同一个注意力问题。
    pub fn validate(&self) -> Result<(), LaunchError> {
        self.meta().map(|_| ())
    }

    pub(crate) fn meta(&self) -> Result<Meta, LaunchError> {
        let Self {
            query,
            key,
            value,
            attn_bias,
            p,
            ..
        } = self;

        let ndim = query.ndim();
        if !matches!(ndim, 4 | 5) {
            return Err(rank_error("query", &[4, 5], ndim));
        }
        if key.ndim() != ndim {
            return Err(rank_error("key", &[ndim], key.ndim()));
        }
        if value.ndim() != ndim {
            return Err(rank_error("value", &[ndim], value.ndim()));
        }
        let dt = type_distinct(&[query.dt(), key.dt(), value.dt()])?;
        device_distinct(&[query, key, value])?;

        let batch = distinct("batch", &[query.dim(0), key.dim(0), value.dim(0)])?;
        let seqlen_q = query.dim(1);
        let seqlen_kv = distinct("key/value seqlen", &[key.dim(1), value.dim(1)])?;
        let head_dim = distinct("query/key head_dim", &[query.dim(-1), key.dim(-1)])?;
        let head_dim_v = value.dim(-1);

        if ndim == 5 {
            distinct("groups", &[query.dim(2), key.dim(2), value.dim(2)])?;
            distinct("heads_per_group", &[query.dim(3), key.dim(3), value.dim(3)])?;
        } else {
            let kv_heads = distinct("key/value heads", &[key.dim(2), value.dim(2)])?;
            if kv_heads == 0 || query.dim(2) % kv_heads != 0 {
                return Err(shape_mismatch(format!(
                    "{} query heads cannot be grouped over {kv_heads} key/value heads",
                    query.dim(2)
                )));
            }
        }

        if !(0. ..1.).contains(p) {
            return Err(args_not_support(format!("dropout probability {p} outside [0, 1)")));
        }

        let packed = |q_end: usize, k_end: usize| {
            if batch != 1 {
                return Err(shape_mismatch(format!(
                    "{} expects sequences packed into batch 1, got batch {batch}",
                    attn_bias.kind()
                )));
            }
            if q_end != seqlen_q || k_end != seqlen_kv {
                return Err(shape_mismatch(format!(
                    "{} covers {q_end} queries and {k_end} keys, \
                     tensors hold {seqlen_q} and {seqlen_kv}",
                    attn_bias.kind()
                )));
            }
            Ok(())
        };
        match attn_bias {
            AttnBias::None | AttnBias::LowerTriangular => {}
            AttnBias::BlockDiagonal(m) | AttnBias::BlockDiagonalCausal(m) => packed(
                last(&m.q_seqinfo.seqstart_py),
                last(&m.k_seqinfo.seqstart_py),
            )?,
            AttnBias::BlockDiagonalCausalWithOffsetPaddedKeys(m) => packed(
                last(&m.q_seqinfo.seqstart_py),
                last(&m.k_seqinfo.seqstart_py),
            )?,
        }

        Ok(Meta {
            dt,
            batch,
            seqlen_q,
            seqlen_kv,
            head_dim,
            head_dim_v,
        })
    }
}

#[inline]
fn distinct(what: &str, dims: &[usize]) -> Result<usize, LaunchError> {
    dim_distinct(dims).ok_or_else(|| shape_mismatch(format!("{what} differ: {dims:?}")))
}

#[inline]
fn last(offsets: &[usize]) -> usize {
    offsets.last().copied().unwrap_or(0)
}
