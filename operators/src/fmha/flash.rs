//! 基于 [`FlashKernel`] 的算子。

use super::{
    args::Meta,
    capability::Capability,
    kernel::{qualified_name, FlashBwdArgs, FlashFwdArgs, FlashFwdOutput, FlashKernel},
    layout::{convert_input_format, Converted},
    AttentionBwOp, AttentionFwOp, AttentionOp, Context, GradBuffers, Gradients, Inputs,
};
use crate::{
    args_not_support, dtype_name, shape_mismatch, type_mismatch, unsupported, LaunchError, Tensor,
};
use log::{debug, info, trace};
use std::rc::Rc;

#[derive(Clone)]
pub struct FwOp {
    kernel: Rc<dyn FlashKernel>,
    capability: Capability,
    name: String,
    backward: BwOp,
}

#[derive(Clone)]
pub struct BwOp {
    kernel: Rc<dyn FlashKernel>,
    capability: Capability,
    name: String,
}

impl FwOp {
    pub const PREFIX: &'static str = "flshattF";
    pub const SPLIT_KV_PREFIX: &'static str = "splitKvF";

    pub fn new(kernel: Rc<dyn FlashKernel>) -> Self {
        Self::build(Self::PREFIX, kernel, Capability::flash_fw())
    }

    /// 只有正向的 split-kv 算子。
    pub fn split_kv(kernel: Rc<dyn FlashKernel>) -> Self {
        Self::build(Self::SPLIT_KV_PREFIX, kernel, Capability::split_kv_fw())
    }

    #[inline]
    pub fn with_capability(self, capability: Capability) -> Self {
        Self { capability, ..self }
    }

    fn build(prefix: &str, kernel: Rc<dyn FlashKernel>, capability: Capability) -> Self {
        let name = format!("{prefix}@{}", kernel.version());
        info!("{name} bound to {}", qualified_name("flash_fwd"));
        Self {
            backward: BwOp::new(kernel.clone()),
            kernel,
            capability,
            name,
        }
    }

    #[inline]
    pub fn version(&self) -> &str {
        self.kernel.version()
    }

    /// 同一核函数上的反向算子。
    #[inline]
    pub fn backward(&self) -> &BwOp {
        &self.backward
    }
}

impl BwOp {
    pub const PREFIX: &'static str = "flshattB";

    pub fn new(kernel: Rc<dyn FlashKernel>) -> Self {
        let name = format!("{}@{}", Self::PREFIX, kernel.version());
        info!("{name} bound to {}", qualified_name("flash_bwd"));
        Self {
            kernel,
            capability: Capability::flash_bw(),
            name,
        }
    }

    #[inline]
    pub fn with_capability(self, capability: Capability) -> Self {
        Self { capability, ..self }
    }

    #[inline]
    pub fn version(&self) -> &str {
        self.kernel.version()
    }
}

impl AttentionOp for FwOp {
    #[inline]
    fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    fn capability(&self) -> &Capability {
        &self.capability
    }
}

impl AttentionOp for BwOp {
    #[inline]
    fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    fn capability(&self) -> &Capability {
        &self.capability
    }
}

/// 分配任何存储之前检查输入。
fn admit(op: &dyn AttentionOp, inp: &Inputs) -> Result<Meta, LaunchError> {
    let meta = inp.meta()?;
    let reasons = op.not_supported_reasons(inp);
    if reasons.is_empty() {
        Ok(meta)
    } else {
        Err(unsupported(op.name(), reasons))
    }
}

impl AttentionFwOp for FwOp {
    /// 无论 `needs_gradient` 与否都产生上下文。
    fn apply(
        &self,
        inp: &Inputs,
        _needs_gradient: bool,
    ) -> Result<(Tensor, Option<Context>), LaunchError> {
        let Meta {
            batch,
            seqlen_q,
            seqlen_kv,
            head_dim,
            head_dim_v,
            ..
        } = admit(self, inp)?;

        let mut out_shape = inp.query.shape().to_vec();
        if let Some(last) = out_shape.last_mut() {
            *last = head_dim_v
        }
        let Converted {
            inp: flat,
            softmax_scale,
            cu_seqlens_q,
            max_seqlen_q,
            cu_seqlens_k,
            max_seqlen_k,
            seqused_k,
        } = convert_input_format(inp, true)?;

        let causal = inp.attn_bias.is_causal();
        trace!(
            "{}: batch {batch} x {seqlen_q}/{seqlen_kv}, head_dim {head_dim}/{head_dim_v}, \
             q {:?} k {:?} v {:?}, max_seqlen {max_seqlen_q}/{max_seqlen_k}, causal {causal}, p {}",
            qualified_name("flash_fwd"),
            flat.query.shape(),
            flat.key.shape(),
            flat.value.shape(),
            inp.p,
        );
        let FlashFwdOutput {
            out,
            softmax_lse,
            rng_state,
        } = self.kernel.flash_fwd(&FlashFwdArgs {
            query: &flat.query,
            key: &flat.key,
            value: &flat.value,
            cu_seqlens_q: &cu_seqlens_q,
            cu_seqlens_k: &cu_seqlens_k,
            seqused_k: seqused_k.as_ref(),
            max_seqlen_q,
            max_seqlen_k,
            dropout_p: inp.p,
            softmax_scale,
            causal,
            return_softmax: false,
        })?;

        let out = restore(&out, &out_shape)?;
        let mut ctx = Context {
            out: out.clone(),
            lse: softmax_lse,
            op_bw: None,
            rng_state: None,
        };
        if inp.p != 0. {
            ctx.op_bw = Some(self.backward.clone());
            ctx.rng_state = Some(rng_state);
        }
        Ok((out, Some(ctx)))
    }
}

impl AttentionBwOp for BwOp {
    fn apply(&self, ctx: Context, inp: &Inputs, grad: &Tensor) -> Result<Gradients, LaunchError> {
        let meta = admit(self, inp)?;
        if grad.dt() != meta.dt {
            return Err(type_mismatch(format!(
                "grad dtype {} differs from inputs {}",
                dtype_name(grad.dt()),
                dtype_name(meta.dt)
            )));
        }
        if grad.shape() != ctx.out.shape() || !matches!(grad.ndim(), 4 | 5) {
            return Err(shape_mismatch(format!(
                "grad {:?} does not match out {:?}",
                grad.shape(),
                ctx.out.shape()
            )));
        }
        if inp.p != 0. && ctx.rng_state.is_none() {
            return Err(args_not_support(
                "dropout is on but the context carries no rng_state",
            ));
        }
        if !ctx.lse.is_contiguous() || ctx.lse.ndim() != 3 {
            return Err(args_not_support(format!(
                "lse {:?} with strides {:?} must be contiguous and 3-dimensional",
                ctx.lse.shape(),
                ctx.lse.strides()
            )));
        }

        let shapes = [inp.query.shape(), inp.key.shape(), inp.value.shape()].map(<[usize]>::to_vec);
        let Converted {
            inp: flat,
            softmax_scale,
            cu_seqlens_q,
            max_seqlen_q,
            cu_seqlens_k,
            max_seqlen_k,
            seqused_k,
        } = convert_input_format(inp, true)?;

        let lse = match ctx.lse.dim(2) {
            len if len < max_seqlen_q => {
                return Err(shape_mismatch(format!(
                    "lse holds {len} rows per head, {max_seqlen_q} needed"
                )))
            }
            len if len > max_seqlen_q => {
                debug!("truncating lse rows from {len} to {max_seqlen_q}");
                ctx.lse.slice(2, 0, max_seqlen_q).contiguous()
            }
            _ => ctx.lse,
        };

        let kernel_out_shape = [flat.query.dim(0), flat.query.dim(1), flat.value.dim(2)];
        let grad_out = flatten(grad).contiguous();
        let out = flatten(&ctx.out);
        if out.shape() != kernel_out_shape {
            return Err(shape_mismatch(format!(
                "out {:?} does not match kernel layout {kernel_out_shape:?}",
                ctx.out.shape()
            )));
        }

        let grads = GradBuffers::allocate(&flat.query, &flat.key, &flat.value);
        let (dq, dk, dv) = grads.parts();
        let causal = inp.attn_bias.is_causal();
        trace!(
            "{}: q {:?} k {:?} v {:?}, packed grads {}",
            qualified_name("flash_bwd"),
            flat.query.shape(),
            flat.key.shape(),
            flat.value.shape(),
            grads.is_packed(),
        );
        self.kernel.flash_bwd(&FlashBwdArgs {
            grad_out: &grad_out,
            query: &flat.query,
            key: &flat.key,
            value: &flat.value,
            out: &out,
            lse: &lse,
            dq,
            dk,
            dv,
            cu_seqlens_q: &cu_seqlens_q,
            cu_seqlens_k: &cu_seqlens_k,
            seqused_k: seqused_k.as_ref(),
            max_seqlen_q,
            max_seqlen_k,
            dropout_p: inp.p,
            softmax_scale,
            causal,
            rng_state: ctx.rng_state,
        })?;

        let (dq, dk, dv) = grads.into_parts();
        let [q_shape, k_shape, v_shape] = shapes;
        Ok(Gradients {
            dq: restore(&dq, &q_shape)?,
            dk: restore(&dk, &k_shape)?,
            dv: restore(&dv, &v_shape)?,
        })
    }
}

/// `[b, m, (g,) h, k]` 合并为核函数布局 `[b * m, heads, k]`。
fn flatten(x: &Tensor) -> Tensor {
    let x = if x.ndim() == 5 {
        x.merge_or_copy(2, 2)
    } else {
        x.clone()
    };
    x.merge_or_copy(0, 2)
}

/// 核函数布局 `[b * m, heads, k]` 分块回调用方的形状。
fn restore(x: &Tensor, shape: &[usize]) -> Result<Tensor, LaunchError> {
    let mismatch = || {
        shape_mismatch(format!(
            "kernel output {:?} cannot be restored to {shape:?}",
            x.shape()
        ))
    };
    let &[bm, heads, k] = x.shape() else {
        return Err(mismatch());
    };
    let (outer, rest) = shape.split_at(2);
    let (inner, last) = rest.split_at(rest.len() - 1);
    if outer.iter().product::<usize>() != bm
        || inner.iter().product::<usize>() != heads
        || last != [k]
    {
        return Err(mismatch());
    }
    let x = x.tile(0, outer);
    Ok(match inner {
        [_] => x,
        _ => x.tile(2, inner),
    })
}

#[cfg(test)]
mod test;
