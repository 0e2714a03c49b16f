use super::{allowed, blocks, check_rows, lse_tensor, Block, Mat3, Shape};
use crate::{
    args_not_support,
    fmha::kernel::{FlashBwdArgs, FlashFwdArgs, FlashFwdOutput, FlashKernel, RngState},
    kernel_failure, LaunchError, Tensor,
};
use rayon::iter::{IntoParallelIterator, ParallelIterator};

/// 只有正向的核函数：键按块切分分别计算，再按 log-sum-exp 合并部分结果。
#[derive(Clone, Debug)]
pub struct SplitKvKernel {
    num_splits: usize,
}

impl Default for SplitKvKernel {
    #[inline]
    fn default() -> Self {
        Self { num_splits: 4 }
    }
}

impl SplitKvKernel {
    #[inline]
    pub fn new(num_splits: usize) -> Self {
        Self {
            num_splits: num_splits.max(1),
        }
    }

    #[inline]
    pub fn num_splits(&self) -> usize {
        self.num_splits
    }
}

impl FlashKernel for SplitKvKernel {
    #[inline]
    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn flash_fwd(&self, args: &FlashFwdArgs) -> Result<FlashFwdOutput, LaunchError> {
        if args.dropout_p != 0. {
            return Err(args_not_support("split-kv kernel has no dropout"));
        }
        if args.return_softmax {
            return Err(args_not_support("return_softmax is not available on host kernels"));
        }
        let shape = Shape::new(args.query, args.key, args.value)?;
        let blocks = blocks(args.cu_seqlens_q, args.cu_seqlens_k, args.seqused_k, &shape)?;
        check_rows(&blocks, args.max_seqlen_q)?;

        let Shape { hq, hk, dv, .. } = shape;
        let out = Tensor::zeros(args.query.dt(), &[shape.nq, hq, dv], args.query.device());
        let lse = lse_tensor(blocks.len(), hq, args.max_seqlen_q, args.query);

        let split = Split {
            q: Mat3::new(args.query),
            k: Mat3::new(args.key),
            v: Mat3::new(args.value),
            group: hq / hk,
            scale: args.softmax_scale,
            causal: args.causal,
            num_splits: self.num_splits,
        };
        let o = Mat3::new(&out);
        let l = Mat3::new(&lse);
        (0..blocks.len() * hq).into_par_iter().for_each(|task| {
            let (i, h) = (task / hq, task % hq);
            let block = blocks[i];
            let (out, lse) = split.forward(block, h);
            o.store(block.q, h, &out);
            l.store(i, h, &lse);
        });

        Ok(FlashFwdOutput {
            out,
            softmax_lse: lse,
            rng_state: RngState { seed: 0, offset: 0 },
        })
    }

    fn flash_bwd(&self, _args: &FlashBwdArgs) -> Result<(), LaunchError> {
        Err(kernel_failure("split-kv kernel has no backward pass"))
    }
}

struct Split {
    q: Mat3,
    k: Mat3,
    v: Mat3,
    group: usize,
    scale: f32,
    causal: bool,
    num_splits: usize,
}

struct Partial {
    /// 块内键全被掩盖时为 `-inf`。
    lse: f32,
    out: Vec<f32>,
}

impl Split {
    fn forward(&self, b: Block, h: usize) -> (Vec<f32>, Vec<f32>) {
        let Block { q, lq, k, lk } = b;
        let (d, dv) = (self.q.d, self.v.d);
        let kvh = h / self.group;
        let qq = self.q.load(q, lq, h);
        let kk = self.k.load(k, lk, kvh);
        let vv = self.v.load(k, lk, kvh);
        let chunk = lk.div_ceil(self.num_splits).max(1);

        let mut out = vec![0.; lq * dv];
        let mut lse = vec![f32::INFINITY; lq];
        for i in 0..lq {
            let qi = &qq[i * d..][..d];
            let partials = (0..lk)
                .step_by(chunk)
                .map(|start| {
                    let end = (start + chunk).min(lk);
                    let s = (start..end)
                        .filter(|&j| allowed(self.causal, i, j, lq, lk))
                        .map(|j| {
                            let kj = &kk[j * d..][..d];
                            let dot = qi.iter().zip(kj).map(|(a, b)| a * b).sum::<f32>();
                            (j, dot * self.scale)
                        })
                        .collect::<Vec<_>>();
                    partial(&s, &vv, dv)
                })
                .collect::<Vec<_>>();

            let max = partials.iter().map(|p| p.lse).fold(f32::NEG_INFINITY, f32::max);
            if max == f32::NEG_INFINITY {
                continue;
            }
            let total = max
                + partials
                    .iter()
                    .map(|p| (p.lse - max).exp())
                    .sum::<f32>()
                    .ln();
            lse[i] = total;
            let row = &mut out[i * dv..][..dv];
            for p in partials.iter().filter(|p| p.lse > f32::NEG_INFINITY) {
                let w = (p.lse - total).exp();
                for (o, x) in row.iter_mut().zip(&p.out) {
                    *o += w * x
                }
            }
        }
        (out, lse)
    }
}

/// 一个块内 `(key index, score)` 的 softmax。
fn partial(scores: &[(usize, f32)], v: &[f32], dv: usize) -> Partial {
    let max = scores
        .iter()
        .map(|&(_, s)| s)
        .fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return Partial {
            lse: f32::NEG_INFINITY,
            out: vec![0.; dv],
        };
    }
    let mut out = vec![0.; dv];
    let mut sum = 0.;
    for &(j, s) in scores {
        let e = (s - max).exp();
        sum += e;
        for (o, x) in out.iter_mut().zip(&v[j * dv..][..dv]) {
            *o += e * x
        }
    }
    out.iter_mut().for_each(|o| *o /= sum);
    Partial {
        lse: max + sum.ln(),
        out,
    }
}
