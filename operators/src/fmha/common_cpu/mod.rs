//! 代替加速器融合核函数的主机实现。
//!
//! 不论设备标签如何都就地读写张量，以 `f32` 计算。

mod split_kv;

pub use split_kv::SplitKvKernel;

use super::kernel::{FlashBwdArgs, FlashFwdArgs, FlashFwdOutput, FlashKernel, RngState};
use crate::{
    args_not_support,
    common::{load, store},
    element_size, kernel_failure, LaunchError, Tensor,
};
use digit_layout::{types as ty, DigitLayout};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rayon::iter::{IntoParallelIterator, ParallelIterator};

/// 稠密注意力，每个任务计算一个 `(sequence, head)`。
#[derive(Clone, Debug)]
pub struct ReferenceKernel {
    lse_row_multiple: usize,
}

impl Default for ReferenceKernel {
    #[inline]
    fn default() -> Self {
        Self {
            lse_row_multiple: 1,
        }
    }
}

impl ReferenceKernel {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// lse 最后一阶向上取整到 `n` 的倍数，填充部分为 `+inf`。
    #[inline]
    pub fn with_lse_row_multiple(n: usize) -> Self {
        Self {
            lse_row_multiple: n.max(1),
        }
    }
}

impl FlashKernel for ReferenceKernel {
    #[inline]
    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn flash_fwd(&self, args: &FlashFwdArgs) -> Result<FlashFwdOutput, LaunchError> {
        if args.return_softmax {
            return Err(args_not_support("return_softmax is not available on host kernels"));
        }
        let shape = Shape::new(args.query, args.key, args.value)?;
        let blocks = blocks(args.cu_seqlens_q, args.cu_seqlens_k, args.seqused_k, &shape)?;
        check_rows(&blocks, args.max_seqlen_q)?;

        let Shape { hq, dv, .. } = shape;
        let lse_len = args.max_seqlen_q.div_ceil(self.lse_row_multiple) * self.lse_row_multiple;
        let out = Tensor::zeros(args.query.dt(), &[shape.nq, hq, dv], args.query.device());
        let lse = lse_tensor(blocks.len(), hq, lse_len, args.query);
        let rng_state = RngState {
            seed: rand::random(),
            offset: 0,
        };

        let scheme = Scheme {
            q: Mat3::new(args.query),
            k: Mat3::new(args.key),
            v: Mat3::new(args.value),
            group: hq / shape.hk,
            scale: args.softmax_scale,
            causal: args.causal,
            dropout: Dropout::new(args.dropout_p, Some(rng_state)),
        };
        let o = Mat3::new(&out);
        let l = Mat3::new(&lse);
        (0..blocks.len() * hq).into_par_iter().for_each(|task| {
            let (i, h) = (task / hq, task % hq);
            let block = blocks[i];
            let (out, lse) = scheme.forward(i, block, h);
            o.store(block.q, h, &out);
            l.store(i, h, &lse);
        });

        Ok(FlashFwdOutput {
            out,
            softmax_lse: lse,
            rng_state,
        })
    }

    fn flash_bwd(&self, args: &FlashBwdArgs) -> Result<(), LaunchError> {
        let shape = Shape::new(args.query, args.key, args.value)?;
        let blocks = blocks(args.cu_seqlens_q, args.cu_seqlens_k, args.seqused_k, &shape)?;
        check_rows(&blocks, args.max_seqlen_q)?;
        let lse = args.lse;
        if lse.ndim() != 3
            || lse.dim(0) != blocks.len()
            || lse.dim(1) != shape.hq
            || lse.dim(2) < args.max_seqlen_q
        {
            return Err(kernel_failure(format!("lse {:?} does not match", args.lse.shape())));
        }
        if args.dropout_p != 0. && args.rng_state.is_none() {
            return Err(kernel_failure("dropout backward without rng_state"));
        }
        for (name, x, rows, heads, d) in [
            ("dq", args.dq, shape.nq, shape.hq, shape.d),
            ("dk", args.dk, shape.nk, shape.hk, shape.d),
            ("dv", args.dv, shape.nk, shape.hk, shape.dv),
            ("grad_out", args.grad_out, shape.nq, shape.hq, shape.dv),
            ("out", args.out, shape.nq, shape.hq, shape.dv),
        ] {
            if x.shape() != &[rows, heads, d][..] {
                return Err(kernel_failure(format!("{name} {:?} does not match", x.shape())));
            }
        }

        let Shape { hk, .. } = shape;
        let group = shape.hq / hk;
        let scheme = Scheme {
            q: Mat3::new(args.query),
            k: Mat3::new(args.key),
            v: Mat3::new(args.value),
            group,
            scale: args.softmax_scale,
            causal: args.causal,
            dropout: Dropout::new(args.dropout_p, args.rng_state),
        };
        let grads = Grads {
            d_out: Mat3::new(args.grad_out),
            out: Mat3::new(args.out),
            lse: Mat3::new(args.lse),
            dq: Mat3::new(args.dq),
            dk: Mat3::new(args.dk),
            dv: Mat3::new(args.dv),
        };
        grads.dq.fill_zero(shape.nq, shape.hq);
        grads.dk.fill_zero(shape.nk, hk);
        grads.dv.fill_zero(shape.nk, hk);

        (0..blocks.len() * hk).into_par_iter().for_each(|task| {
            let (i, g) = (task / hk, task % hk);
            scheme.backward(&grads, i, blocks[i], g)
        });
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
struct Shape {
    nq: usize,
    nk: usize,
    hq: usize,
    hk: usize,
    d: usize,
    dv: usize,
}

impl Shape {
    fn new(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Self, LaunchError> {
        let (&[nq, hq, d], &[nk, hk, dk], &[nv, hv, dv]) = (q.shape(), k.shape(), v.shape())
        else {
            return Err(kernel_failure(
                "query, key and value must be [tokens, heads, head_dim]",
            ));
        };
        if q.dt() != k.dt() || q.dt() != v.dt() {
            return Err(kernel_failure("query, key and value differ in dtype"));
        }
        if d != dk || nk != nv || hk != hv || hk == 0 || hq % hk != 0 {
            return Err(kernel_failure(format!(
                "inconsistent shapes {:?} {:?} {:?}",
                q.shape(),
                k.shape(),
                v.shape()
            )));
        }
        Ok(Self {
            nq,
            nk,
            hq,
            hk,
            d,
            dv,
        })
    }
}

/// 一个序列：查询行 `q..q + lq` 对从 `k` 开始的前 `lk` 个键行。
#[derive(Clone, Copy, Debug)]
struct Block {
    q: usize,
    lq: usize,
    k: usize,
    lk: usize,
}

fn blocks(
    cu_seqlens_q: &Tensor,
    cu_seqlens_k: &Tensor,
    seqused_k: Option<&Tensor>,
    shape: &Shape,
) -> Result<Vec<Block>, LaunchError> {
    let cu_q = cu_seqlens_q.to_i32_vec();
    let cu_k = cu_seqlens_k.to_i32_vec();
    if cu_q.is_empty() || cu_q.len() != cu_k.len() {
        return Err(kernel_failure(format!(
            "offset tables of {} and {} entries",
            cu_q.len(),
            cu_k.len()
        )));
    }
    let used = seqused_k.map(Tensor::to_i32_vec);
    if used.as_ref().is_some_and(|u| u.len() + 1 != cu_k.len()) {
        return Err(kernel_failure("seqused_k does not match the offset tables"));
    }

    let mut ans = Vec::with_capacity(cu_q.len() - 1);
    for (i, (q, k)) in cu_q.windows(2).zip(cu_k.windows(2)).enumerate() {
        let &[q0, q1] = q else { unreachable!() };
        let &[k0, k1] = k else { unreachable!() };
        if q0 < 0 || k0 < 0 || q1 < q0 || k1 < k0 {
            return Err(kernel_failure(format!("offset tables decrease at sequence {i}")));
        }
        let (q0, q1, k0, k1) = (q0 as usize, q1 as usize, k0 as usize, k1 as usize);
        if q1 > shape.nq || k1 > shape.nk {
            return Err(kernel_failure(format!("sequence {i} runs past the token axis")));
        }
        let lk = match &used {
            Some(used) if used[i] < 0 || used[i] as usize > k1 - k0 => {
                return Err(kernel_failure(format!("seqused_k[{i}] = {}", used[i])))
            }
            Some(used) => used[i] as usize,
            None => k1 - k0,
        };
        ans.push(Block {
            q: q0,
            lq: q1 - q0,
            k: k0,
            lk,
        })
    }
    Ok(ans)
}

fn check_rows(blocks: &[Block], max_seqlen_q: usize) -> Result<(), LaunchError> {
    match blocks.iter().find(|b| b.lq > max_seqlen_q) {
        Some(b) => Err(kernel_failure(format!(
            "sequence of {} queries exceeds max_seqlen_q {max_seqlen_q}",
            b.lq
        ))),
        None => Ok(()),
    }
}

fn lse_tensor(nseq: usize, heads: usize, len: usize, like: &Tensor) -> Tensor {
    let inf = vec![f32::INFINITY; nseq * heads * len];
    Tensor::from_f32(ty::F32, &[nseq, heads, len], &inf, like.device())
}

/// 右下对齐的因果掩码。
#[inline(always)]
fn allowed(causal: bool, i: usize, j: usize, lq: usize, lk: usize) -> bool {
    !causal || j + lq <= i + lk
}

#[derive(Clone, Copy)]
struct Mat3 {
    dt: DigitLayout,
    base: *mut u8,
    unit: isize,
    strides: [isize; 3],
    d: usize,
}

unsafe impl Send for Mat3 {}
unsafe impl Sync for Mat3 {}

impl Mat3 {
    fn new(t: &Tensor) -> Self {
        let &[s0, s1, s2] = t.strides() else {
            unreachable!()
        };
        Self {
            dt: t.dt(),
            base: t.base_mut(),
            unit: element_size(t.dt()) as _,
            strides: [s0, s1, s2],
            d: t.dim(-1),
        }
    }

    #[inline]
    fn at(&self, row: usize, head: usize, col: usize) -> *mut u8 {
        let [s0, s1, s2] = self.strides;
        let off = row as isize * s0 + head as isize * s1 + col as isize * s2;
        unsafe { self.base.offset(off * self.unit) }
    }

    /// 一个头的 `rows x d` 行优先拷贝。
    fn load(&self, row0: usize, rows: usize, head: usize) -> Vec<f32> {
        let mut ans = Vec::with_capacity(rows * self.d);
        for r in row0..row0 + rows {
            for c in 0..self.d {
                ans.push(unsafe { load(self.dt, self.at(r, head, c)) })
            }
        }
        ans
    }

    fn store(&self, row0: usize, head: usize, data: &[f32]) {
        if self.d == 0 {
            return;
        }
        for (i, row) in data.chunks(self.d).enumerate() {
            for (c, &x) in row.iter().enumerate() {
                unsafe { store(self.dt, self.at(row0 + i, head, c), x) }
            }
        }
    }

    fn fill_zero(&self, rows: usize, heads: usize) {
        for r in 0..rows {
            for h in 0..heads {
                for c in 0..self.d {
                    unsafe { store(self.dt, self.at(r, h, c), 0.) }
                }
            }
        }
    }
}

/// `(data, row stride, column stride)`
type Operand<'a> = (&'a [f32], isize, isize);

/// `dst[m x n] = beta * lhs[m x k] . rhs[k x n]`，`accumulate` 时累加到 `dst`。
fn matmul(
    dst: &mut [f32],
    accumulate: bool,
    (m, n, k): (usize, usize, usize),
    lhs: Operand,
    rhs: Operand,
    beta: f32,
) {
    if m == 0 || n == 0 {
        return;
    }
    if k == 0 {
        if !accumulate {
            dst.fill(0.)
        }
        return;
    }
    unsafe {
        gemm::gemm(
            m,
            n,
            k,
            dst.as_mut_ptr(),
            1,
            n as isize,
            accumulate,
            lhs.0.as_ptr(),
            lhs.2,
            lhs.1,
            rhs.0.as_ptr(),
            rhs.2,
            rhs.1,
            1.,
            beta,
            false,
            false,
            false,
            gemm::Parallelism::None,
        )
    }
}

fn scores(q: &[f32], k: &[f32], lq: usize, lk: usize, d: usize, scale: f32) -> Vec<f32> {
    let mut s = vec![0.; lq * lk];
    let d_ = d as isize;
    matmul(&mut s, false, (lq, lk, d), (q, d_, 1), (k, 1, d_), scale);
    s
}

#[derive(Clone, Copy)]
struct Dropout {
    p: f32,
    state: Option<RngState>,
}

impl Dropout {
    fn new(p: f32, state: Option<RngState>) -> Self {
        Self { p, state }
    }

    /// 一行中每个键的系数，丢弃为 `0`，否则为 `1 / (1 - p)`。
    fn row(&self, seq: usize, head: usize, row: usize, len: usize) -> Option<Vec<f32>> {
        let state = self.state.filter(|_| self.p > 0.)?;
        let stream = ((seq as u64) << 42) ^ ((head as u64) << 21) ^ row as u64;
        let mixed = state.offset.wrapping_add(stream).wrapping_mul(0x9e37_79b9_7f4a_7c15);
        let seed = state.seed ^ mixed;
        let mut rng = StdRng::seed_from_u64(seed);
        let keep = (1. - self.p).recip();
        Some(
            (0..len)
                .map(|_| if rng.gen::<f32>() < self.p { 0. } else { keep })
                .collect(),
        )
    }
}

struct Scheme {
    q: Mat3,
    k: Mat3,
    v: Mat3,
    group: usize,
    scale: f32,
    causal: bool,
    dropout: Dropout,
}

struct Grads {
    d_out: Mat3,
    out: Mat3,
    lse: Mat3,
    dq: Mat3,
    dk: Mat3,
    dv: Mat3,
}

impl Scheme {
    fn forward(&self, seq: usize, b: Block, h: usize) -> (Vec<f32>, Vec<f32>) {
        let Block { q, lq, k, lk } = b;
        let (d, dv) = (self.q.d, self.v.d);
        let kvh = h / self.group;
        let qq = self.q.load(q, lq, h);
        let kk = self.k.load(k, lk, kvh);
        let vv = self.v.load(k, lk, kvh);

        let s = scores(&qq, &kk, lq, lk, d, self.scale);
        let mut p = vec![0.; lq * lk];
        let mut lse = vec![f32::INFINITY; lq];
        for i in 0..lq {
            let row = &s[i * lk..][..lk];
            let cols = || (0..lk).filter(move |&j| allowed(self.causal, i, j, lq, lk));
            let max = cols().map(|j| row[j]).fold(f32::NEG_INFINITY, f32::max);
            if max == f32::NEG_INFINITY {
                continue;
            }
            let sum = cols().map(|j| (row[j] - max).exp()).sum::<f32>();
            lse[i] = max + sum.ln();
            let drop = self.dropout.row(seq, h, i, lk);
            for j in cols() {
                let factor = drop.as_ref().map_or(1., |f| f[j]);
                p[i * lk + j] = (row[j] - lse[i]).exp() * factor;
            }
        }

        let mut out = vec![0.; lq * dv];
        let dv_ = dv as isize;
        matmul(&mut out, false, (lq, dv, lk), (&p, lk as _, 1), (&vv, dv_, 1), 1.);
        (out, lse)
    }

    /// 键值头 `g` 及共享它的查询头的梯度。
    fn backward(&self, grads: &Grads, seq: usize, b: Block, g: usize) {
        let Block { q, lq, k, lk } = b;
        let (d, dv) = (self.q.d, self.v.d);
        let (d_, dv_, lk_) = (d as isize, dv as isize, lk as isize);
        let kk = self.k.load(k, lk, g);
        let vv = self.v.load(k, lk, g);
        let mut dk = vec![0.; lk * d];
        let mut dvv = vec![0.; lk * dv];

        for h in g * self.group..(g + 1) * self.group {
            let qq = self.q.load(q, lq, h);
            let d_out = grads.d_out.load(q, lq, h);
            let out = grads.out.load(q, lq, h);
            let lse = grads.lse.load(seq, 1, h);

            let s = scores(&qq, &kk, lq, lk, d, self.scale);
            // dropout 前后的概率
            let mut p = vec![0.; lq * lk];
            let mut pd = vec![0.; lq * lk];
            let mut drops = Vec::with_capacity(lq);
            for i in 0..lq {
                let drop = self.dropout.row(seq, h, i, lk);
                if lse[i].is_finite() {
                    for j in (0..lk).filter(|&j| allowed(self.causal, i, j, lq, lk)) {
                        let x = (s[i * lk + j] - lse[i]).exp();
                        p[i * lk + j] = x;
                        pd[i * lk + j] = x * drop.as_ref().map_or(1., |f| f[j]);
                    }
                }
                drops.push(drop)
            }

            matmul(&mut dvv, true, (lk, dv, lq), (&pd, 1, lk_), (&d_out, dv_, 1), 1.);

            let mut dp = vec![0.; lq * lk];
            matmul(&mut dp, false, (lq, lk, dv), (&d_out, dv_, 1), (&vv, 1, dv_), 1.);

            let mut ds = vec![0.; lq * lk];
            for i in 0..lq {
                let delta = (0..dv).map(|c| d_out[i * dv + c] * out[i * dv + c]).sum::<f32>();
                for j in 0..lk {
                    let factor = drops[i].as_ref().map_or(1., |f| f[j]);
                    ds[i * lk + j] = p[i * lk + j] * (dp[i * lk + j] * factor - delta);
                }
            }

            let mut dq = vec![0.; lq * d];
            matmul(&mut dq, false, (lq, d, lk), (&ds, lk_, 1), (&kk, d_, 1), self.scale);
            grads.dq.store(q, h, &dq);

            matmul(&mut dk, true, (lk, d, lq), (&ds, 1, lk_), (&qq, d_, 1), self.scale);
        }

        grads.dk.store(k, g, &dk);
        grads.dv.store(k, g, &dvv);
    }
}
