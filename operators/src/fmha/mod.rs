//! 融合多头注意力算子。
//!
//! [`Inputs`] 经 [`Capability`](capability::Capability) 检查后，
//! 由 [`layout::convert_input_format`] 展平，交给 [`FlashKernel`](kernel::FlashKernel)。

mod args;
mod grads;

pub mod attn_bias;
pub mod capability;
pub mod dispatch;
pub mod flash;
pub mod kernel;
pub mod layout;

#[cfg(any(use_cpu, test))]
pub mod common_cpu;

pub use args::Inputs;
pub use attn_bias::AttnBias;
pub use flash::{BwOp, FwOp};
pub use grads::GradBuffers;

use crate::{LaunchError, Tensor};
use capability::Capability;
use kernel::RngState;

/// 正向留给反向的上下文。
#[derive(Clone)]
pub struct Context {
    pub out: Tensor,
    pub lse: Tensor,
    /// 启用 dropout 时设置。
    pub op_bw: Option<BwOp>,
    /// 启用 dropout 时设置，反向依赖它重建掩码。
    pub rng_state: Option<RngState>,
}

/// 形状与调用方的 `query`、`key`、`value` 一致。
pub struct Gradients {
    pub dq: Tensor,
    pub dk: Tensor,
    pub dv: Tensor,
}

pub trait AttentionOp {
    /// `<prefix>@<kernel version>`。
    fn name(&self) -> &str;

    fn capability(&self) -> &Capability;

    /// 算子拒绝 `inp` 的全部原因，接受时为空。
    fn not_supported_reasons(&self, inp: &Inputs) -> Vec<String> {
        self.capability().not_supported_reasons(inp)
    }
}

pub trait AttentionFwOp: AttentionOp {
    /// 输出形状为 `[*query.shape[..-1], value.shape[-1]]`，能产生上下文时一并返回。
    fn apply(
        &self,
        inp: &Inputs,
        needs_gradient: bool,
    ) -> Result<(Tensor, Option<Context>), LaunchError>;

    fn operator_flop(&self, inp: &Inputs) -> u64 {
        inputs_flop(inp)
    }
}

pub trait AttentionBwOp: AttentionOp {
    /// 消耗同一 `inp` 正向产生的上下文。
    fn apply(&self, ctx: Context, inp: &Inputs, grad: &Tensor) -> Result<Gradients, LaunchError>;

    fn operator_flop(&self, inp: &Inputs) -> u64 {
        inputs_flop(inp) * 5 / 2
    }
}

/// 一次正向注意力的理论浮点运算数。
///
/// 形状为 `[batch, seq, heads, head_dim]`，给出偏移表时序列阶切分为互不可见的序列。
pub fn attn_operator_flop(
    q_shape: &[usize],
    k_shape: &[usize],
    v_shape: &[usize],
    causal: bool,
    seqstart_q: Option<&[usize]>,
    seqstart_k: Option<&[usize]>,
) -> u64 {
    let whole_q = [0, q_shape[1]];
    let whole_k = [0, k_shape[1]];
    let seqstart_q = seqstart_q.unwrap_or(&whole_q);
    let seqstart_k = seqstart_k.unwrap_or(&whole_k);

    let k = q_shape[q_shape.len() - 1] as u64;
    let kv = v_shape[v_shape.len() - 1] as u64;
    let mut total = seqstart_q
        .windows(2)
        .zip(seqstart_k.windows(2))
        .map(|(q, k_)| {
            let (mq, mk) = ((q[1] - q[0]) as u64, (k_[1] - k_[0]) as u64);
            2 * mq * mk * k + 2 * mq * mk * kv
        })
        .sum::<u64>();
    total *= (q_shape[2] * q_shape[0]) as u64;
    if causal {
        total /= 2
    }
    total
}

/// 展平后的 `inp` 的浮点运算数，形状不成立时为 0。
fn inputs_flop(inp: &Inputs) -> u64 {
    if inp.meta().is_err() {
        return 0;
    }
    let q = inp.query.shape();
    let heads = q[2..q.len() - 1].iter().product::<usize>();
    let flat = |x: &Tensor| [1, x.dim(0) * x.dim(1), heads, x.dim(-1)];

    let uniform = |batch: usize, seqlen: usize| (0..=batch).map(|i| i * seqlen).collect::<Vec<_>>();
    let (seqstart_q, seqstart_k) = match &inp.attn_bias {
        AttnBias::None | AttnBias::LowerTriangular => (
            uniform(inp.query.dim(0), inp.query.dim(1)),
            uniform(inp.key.dim(0), inp.key.dim(1)),
        ),
        AttnBias::BlockDiagonal(m) | AttnBias::BlockDiagonalCausal(m) => (
            m.q_seqinfo.seqstart_py.clone(),
            m.k_seqinfo.seqstart_py.clone(),
        ),
        AttnBias::BlockDiagonalCausalWithOffsetPaddedKeys(m) => (
            m.q_seqinfo.seqstart_py.clone(),
            m.k_seqinfo.seqstart_py.clone(),
        ),
    };
    attn_operator_flop(
        &flat(&inp.query),
        &flat(&inp.key),
        &flat(&inp.value),
        inp.attn_bias.is_causal(),
        Some(&seqstart_q),
        Some(&seqstart_k),
    )
}
