//! 融合注意力核函数的边界。
//!
//! 张量以 `[total_tokens, heads, head_dim]` 传入，
//! 失败以 [`KernelFailure`](crate::LaunchErrorKind::KernelFailure) 返回。

use crate::{LaunchError, Tensor};

/// 核函数入口所在的命名空间。
pub const NAMESPACE: &str = "fmha_flash";

/// `fmha_flash::<entry>`.
#[inline]
pub fn qualified_name(entry: &str) -> String {
    format!("{NAMESPACE}::{entry}")
}

/// 用于重现一次正向的 dropout 掩码。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct RngState {
    pub seed: u64,
    pub offset: u64,
}

pub struct FlashFwdArgs<'a> {
    pub query: &'a Tensor,
    pub key: &'a Tensor,
    pub value: &'a Tensor,
    pub cu_seqlens_q: &'a Tensor,
    pub cu_seqlens_k: &'a Tensor,
    pub seqused_k: Option<&'a Tensor>,
    pub max_seqlen_q: usize,
    pub max_seqlen_k: usize,
    pub dropout_p: f32,
    pub softmax_scale: f32,
    pub causal: bool,
    pub return_softmax: bool,
}

pub struct FlashFwdOutput {
    /// `[total_q, heads_q, head_dim_v]`.
    pub out: Tensor,
    /// `f32` `[num_seqs, heads_q, >= max_seqlen_q]`，填充部分为 `+inf`。
    pub softmax_lse: Tensor,
    pub rng_state: RngState,
}

pub struct FlashBwdArgs<'a> {
    pub grad_out: &'a Tensor,
    pub query: &'a Tensor,
    pub key: &'a Tensor,
    pub value: &'a Tensor,
    pub out: &'a Tensor,
    /// `[num_seqs, heads_q, max_seqlen_q]`，连续。
    pub lse: &'a Tensor,
    /// 每个元素都会被覆盖。
    pub dq: &'a Tensor,
    pub dk: &'a Tensor,
    pub dv: &'a Tensor,
    pub cu_seqlens_q: &'a Tensor,
    pub cu_seqlens_k: &'a Tensor,
    pub seqused_k: Option<&'a Tensor>,
    pub max_seqlen_q: usize,
    pub max_seqlen_k: usize,
    pub dropout_p: f32,
    pub softmax_scale: f32,
    pub causal: bool,
    pub rng_state: Option<RngState>,
}

/// 融合注意力核函数库。
///
/// 因果掩码对齐每个 `(query block, used key block)` 的右下角。
pub trait FlashKernel {
    fn version(&self) -> &str;

    fn flash_fwd(&self, args: &FlashFwdArgs) -> Result<FlashFwdOutput, LaunchError>;

    fn flash_bwd(&self, args: &FlashBwdArgs) -> Result<(), LaunchError>;
}
