//! 将注意力输入转换为变长核函数布局。
//!
//! 核函数的张量都是 `[total_tokens, heads, head_dim]`，
//! 另有 `int32` 起始偏移表将 token 阶切分为序列。

use super::{args::Inputs, attn_bias::AttnBias};
use crate::{
    args_not_support, common::utils::rank_error, shape_mismatch, Device, LaunchError, Tensor,
};
use log::warn;

/// 核函数布局的输入及启动参数。
#[derive(Clone)]
pub struct Converted {
    pub inp: Inputs,
    pub softmax_scale: f32,
    pub cu_seqlens_q: Tensor,
    pub max_seqlen_q: usize,
    pub cu_seqlens_k: Tensor,
    pub max_seqlen_k: usize,
    /// 每个序列实际使用的键长，仅用于填充键。
    pub seqused_k: Option<Tensor>,
}

/// 将 `inp` 展平为 `[batch * seq, heads, head_dim]`。
///
/// `supports_mqa` 时分组形式并入头阶，步长为 0 的键值头截为一个头。
pub fn convert_input_format(inp: &Inputs, supports_mqa: bool) -> Result<Converted, LaunchError> {
    let Inputs {
        query,
        key,
        value,
        attn_bias,
        scale,
        ..
    } = inp;

    let ndim = query.ndim();
    if !matches!(ndim, 4 | 5) {
        return Err(rank_error("query", &[4, 5], ndim));
    }
    if key.ndim() != ndim || value.ndim() != ndim {
        return Err(rank_error("key/value", &[ndim], key.ndim().max(value.ndim())));
    }

    let batch = query.dim(0);
    let seqlen_q = query.dim(1);
    let seqlen_kv = key.dim(1);
    let head_dim_q = query.dim(-1);
    let device = query.device();

    let (cu_seqlens_q, max_seqlen_q, cu_seqlens_k, max_seqlen_k, seqused_k) = match attn_bias {
        AttnBias::BlockDiagonal(m) | AttnBias::BlockDiagonalCausal(m) => (
            m.q_seqinfo.seqstart_on(device),
            m.q_seqinfo.max_seqlen,
            m.k_seqinfo.seqstart_on(device),
            m.k_seqinfo.max_seqlen,
            None,
        ),
        AttnBias::BlockDiagonalCausalWithOffsetPaddedKeys(m) => (
            m.q_seqinfo.seqstart_on(device),
            m.q_seqinfo.max_seqlen,
            m.k_seqinfo.seqstart.to_device(device),
            m.k_seqinfo.max_seqlen,
            Some(m.k_seqinfo.seqlen.to_device(device)),
        ),
        AttnBias::None | AttnBias::LowerTriangular => {
            let cu_seqlens_k = uniform_seqstart(batch, seqlen_kv, device);
            let cu_seqlens_q = if seqlen_q == seqlen_kv {
                cu_seqlens_k.clone()
            } else {
                uniform_seqstart(batch, seqlen_q, device)
            };
            (cu_seqlens_q, seqlen_q, cu_seqlens_k, seqlen_kv, None)
        }
    };

    let (query, key, value) = if ndim == 5 {
        if !supports_mqa {
            return Err(args_not_support(
                "grouped-query layout needs a kernel with native multi-query support",
            ));
        }
        (
            fold_group_heads("query", query)?,
            fold_group_heads("key", key)?,
            fold_group_heads("value", value)?,
        )
    } else {
        (query.clone(), key.clone(), value.clone())
    };

    let (key, value) = if supports_mqa && key.stride(2) == 0 && value.stride(2) == 0 {
        (key.slice(2, 0, 1), value.slice(2, 0, 1))
    } else {
        (key, value)
    };

    let heads_q = query.dim(2);
    let heads_kv = key.dim(2);
    if heads_kv == 0 || heads_q % heads_kv != 0 || value.dim(2) != heads_kv {
        return Err(shape_mismatch(format!(
            "{heads_q} query heads cannot share {heads_kv} key and {} value heads",
            value.dim(2)
        )));
    }

    let query = merge("query", &query, 0);
    let key = merge("key", &key, 0);
    let value = merge("value", &value, 0);

    Ok(Converted {
        inp: Inputs {
            query,
            key,
            value,
            ..inp.clone()
        },
        softmax_scale: scale.unwrap_or((head_dim_q as f32).powf(-0.5)),
        cu_seqlens_q,
        max_seqlen_q,
        cu_seqlens_k,
        max_seqlen_k,
        seqused_k,
    })
}

/// 将 `[B, M, G, H, K]` 合并为 `[B, M, G * H, K]`。
///
/// 步长为 0 的头阶直接去掉，结果只有 `G` 个头。
pub fn fold_group_heads(name: &str, x: &Tensor) -> Result<Tensor, LaunchError> {
    if x.ndim() != 5 {
        return Err(rank_error(name, &[5], x.ndim()));
    }
    if x.stride(3) == 0 {
        return Ok(x.index(3, 0));
    }
    Ok(merge(name, x, 2))
}

/// 合并 `start` 与 `start + 1` 阶，步长不允许时拷贝。
fn merge(name: &str, x: &Tensor, start: usize) -> Tensor {
    x.merge(start, 2).unwrap_or_else(|| {
        warn!(
            "{name} {:?} with strides {:?} is copied to merge axes {start} and {}",
            x.shape(),
            x.strides(),
            start + 1,
        );
        x.merge_or_copy(start, 2)
    })
}

fn uniform_seqstart(batch: usize, seqlen: usize, device: Device) -> Tensor {
    let offsets = (0..=batch)
        .map(|i| (i * seqlen) as i32)
        .collect::<Vec<_>>();
    Tensor::from_i32(&offsets, device)
}
