use super::{BwOp, FwOp};
use crate::{
    common::test_utils::{compare, random},
    fmha::{
        attn_bias::{AttnBias, BlockDiagonalMask, PaddedKeysMask},
        capability::Capability,
        common_cpu::ReferenceKernel,
        AttentionBwOp, AttentionFwOp, AttentionOp, Context, Inputs,
    },
    Device, LaunchErrorKind, Tensor,
};
use digit_layout::types as ty;
use std::rc::Rc;

const CUDA: Device = Device::cuda(0, (8, 0));

fn ops() -> (FwOp, BwOp) {
    let kernel = Rc::new(ReferenceKernel::new());
    (FwOp::new(kernel.clone()), BwOp::new(kernel))
}

/// 放宽到 `f32` 的算子。
fn f32_ops(kernel: ReferenceKernel) -> (FwOp, BwOp) {
    let kernel = Rc::new(kernel);
    let fw = Capability {
        dtypes: vec![ty::F32],
        ..Capability::flash_fw()
    };
    let bw = Capability {
        dtypes: vec![ty::F32],
        ..Capability::flash_bw()
    };
    (
        FwOp::new(kernel.clone()).with_capability(fw),
        BwOp::new(kernel).with_capability(bw),
    )
}

/// `f64` 稠密注意力，每个 batch 使用同一个 `[mq, mk]` 偏置。
struct Naive {
    batch: usize,
    mq: usize,
    mk: usize,
    hq: usize,
    hk: usize,
    d: usize,
    dv: usize,
}

struct Expected {
    out: Vec<f32>,
    dq: Vec<f32>,
    dk: Vec<f32>,
    dv: Vec<f32>,
}

impl Naive {
    fn run(&self, [q, k, v, d_out]: [&[f32]; 4], bias: &[f32], scale: f64) -> Expected {
        let &Self {
            batch,
            mq,
            mk,
            hq,
            hk,
            d,
            dv,
        } = self;
        let group = hq / hk;
        let qi = |b: usize, i: usize, h: usize, c: usize| ((b * mq + i) * hq + h) * d + c;
        let ki = |b: usize, j: usize, g: usize, c: usize| ((b * mk + j) * hk + g) * d + c;
        let vi = |b: usize, j: usize, g: usize, c: usize| ((b * mk + j) * hk + g) * dv + c;
        let oi = |b: usize, i: usize, h: usize, c: usize| ((b * mq + i) * hq + h) * dv + c;

        let mut out = vec![0f64; batch * mq * hq * dv];
        let mut dq = vec![0f64; q.len()];
        let mut dk = vec![0f64; k.len()];
        let mut dvv = vec![0f64; v.len()];
        for b in 0..batch {
            for h in 0..hq {
                let g = h / group;
                let mut p = vec![0f64; mq * mk];
                for i in 0..mq {
                    let s = (0..mk)
                        .map(|j| {
                            if bias[i * mk + j] == f32::NEG_INFINITY {
                                f64::NEG_INFINITY
                            } else {
                                let dot = (0..d)
                                    .map(|c| q[qi(b, i, h, c)] as f64 * k[ki(b, j, g, c)] as f64)
                                    .sum::<f64>();
                                scale * dot
                            }
                        })
                        .collect::<Vec<_>>();
                    let max = s.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                    if max == f64::NEG_INFINITY {
                        continue;
                    }
                    let sum = s.iter().map(|x| (x - max).exp()).sum::<f64>();
                    for j in 0..mk {
                        p[i * mk + j] = (s[j] - max).exp() / sum;
                    }
                }

                for i in 0..mq {
                    for c in 0..dv {
                        out[oi(b, i, h, c)] =
                            (0..mk).map(|j| p[i * mk + j] * v[vi(b, j, g, c)] as f64).sum();
                    }
                    let dp = (0..mk)
                        .map(|j| {
                            (0..dv)
                                .map(|c| d_out[oi(b, i, h, c)] as f64 * v[vi(b, j, g, c)] as f64)
                                .sum::<f64>()
                        })
                        .collect::<Vec<_>>();
                    let delta = (0..mk).map(|j| p[i * mk + j] * dp[j]).sum::<f64>();
                    for j in 0..mk {
                        let pij = p[i * mk + j];
                        for c in 0..dv {
                            dvv[vi(b, j, g, c)] += pij * d_out[oi(b, i, h, c)] as f64;
                        }
                        let ds = pij * (dp[j] - delta);
                        for c in 0..d {
                            dq[qi(b, i, h, c)] += scale * ds * k[ki(b, j, g, c)] as f64;
                            dk[ki(b, j, g, c)] += scale * ds * q[qi(b, i, h, c)] as f64;
                        }
                    }
                }
            }
        }
        let f = |x: Vec<f64>| x.into_iter().map(|x| x as f32).collect();
        Expected {
            out: f(out),
            dq: f(dq),
            dk: f(dk),
            dv: f(dvv),
        }
    }
}

fn assert_close(name: &str, ans: &Tensor, expected: &[f32]) {
    let (outliers, count) = compare(&ans.to_f32_vec(), expected, 1e-4, 1e-3);
    assert_eq!(outliers, 0, "{name}: {outliers}/{count} outliers");
}

/// 以随机数据运行正反向并与 [`Naive`] 比较。
fn check_against_naive(naive: Naive, bias: AttnBias) {
    let Naive {
        batch,
        mq,
        mk,
        hq,
        hk,
        d,
        dv,
    } = naive;
    let (q, k, v) = (
        random(batch * mq * hq * d),
        random(batch * mk * hk * d),
        random(batch * mk * hk * dv),
    );
    let d_out = random(batch * mq * hq * dv);
    let tensor = |shape: &[usize], data: &[f32]| Tensor::from_f32(ty::F32, shape, data, CUDA);
    let inp = Inputs::new(
        tensor(&[batch, mq, hq, d], &q),
        tensor(&[batch, mk, hk, d], &k),
        tensor(&[batch, mk, hk, dv], &v),
    )
    .with_bias(bias.clone());
    let grad = tensor(&[batch, mq, hq, dv], &d_out);

    let (fw, bw) = f32_ops(ReferenceKernel::new());
    let (out, ctx) = fw.apply(&inp, true).unwrap();
    let grads = bw.apply(ctx.unwrap(), &inp, &grad).unwrap();

    let bias = bias.materialize(mq, mk);
    let scale = (d as f64).powf(-0.5);
    let expected = naive.run([&q, &k, &v, &d_out], &bias, scale);
    assert_close("out", &out, &expected.out);
    assert_close("dq", &grads.dq, &expected.dq);
    assert_close("dk", &grads.dk, &expected.dk);
    assert_close("dv", &grads.dv, &expected.dv);
}

#[test]
fn test_name() {
    let (fw, bw) = ops();
    assert_eq!(fw.name(), "flshattF@0.0.0");
    assert_eq!(bw.name(), "flshattB@0.0.0");
    assert_eq!(fw.backward().name(), bw.name());
    assert_eq!(fw.version(), "0.0.0");
}

#[test]
fn test_dense_shapes() {
    let (fw, bw) = ops();
    let t = |shape: &[usize]| {
        let n = shape.iter().product();
        Tensor::from_f32(ty::F16, shape, &random(n), CUDA)
    };
    let shape = [2, 128, 16, 128];
    let inp = Inputs::new(t(&shape), t(&shape), t(&shape));

    let (out, ctx) = fw.apply(&inp, true).unwrap();
    assert_eq!(out.shape(), &shape);
    let ctx = ctx.unwrap();
    assert_eq!(ctx.lse.shape(), &[2, 16, 128]);
    assert!(ctx.op_bw.is_none());
    assert!(ctx.rng_state.is_none());

    let grads = bw.apply(ctx, &inp, &t(&shape)).unwrap();
    assert_eq!(grads.dq.shape(), &shape);
    assert_eq!(grads.dk.shape(), &shape);
    assert_eq!(grads.dv.shape(), &shape);
}

#[test]
fn test_no_mask() {
    let naive = Naive {
        batch: 2,
        mq: 5,
        mk: 7,
        hq: 4,
        hk: 2,
        d: 8,
        dv: 8,
    };
    check_against_naive(naive, AttnBias::None)
}

#[test]
fn test_lower_triangular() {
    let naive = Naive {
        batch: 2,
        mq: 6,
        mk: 6,
        hq: 2,
        hk: 2,
        d: 16,
        dv: 16,
    };
    check_against_naive(naive, AttnBias::LowerTriangular)
}

#[test]
fn test_block_diagonal() {
    let mask = BlockDiagonalMask::from_seqlens(&[2, 4], Some(&[5, 3])).unwrap();
    let naive = Naive {
        batch: 1,
        mq: 6,
        mk: 8,
        hq: 4,
        hk: 1,
        d: 8,
        dv: 8,
    };
    check_against_naive(naive, AttnBias::BlockDiagonal(mask))
}

#[test]
fn test_block_diagonal_causal() {
    let mask = BlockDiagonalMask::from_seqlens(&[3, 5], None).unwrap();
    let naive = Naive {
        batch: 1,
        mq: 8,
        mk: 8,
        hq: 2,
        hk: 2,
        d: 8,
        dv: 8,
    };
    check_against_naive(naive, mask.make_causal())
}

#[test]
fn test_padded_keys() {
    // 三个序列，键填充到 32，分别使用 10、20、15
    let mask = PaddedKeysMask::from_seqlens(&[3, 5, 4], 32, &[10, 20, 15]).unwrap();
    let naive = Naive {
        batch: 1,
        mq: 12,
        mk: 96,
        hq: 2,
        hk: 2,
        d: 8,
        dv: 8,
    };
    check_against_naive(naive, AttnBias::BlockDiagonalCausalWithOffsetPaddedKeys(mask))
}

#[test]
fn test_grouped_forward() {
    let (fw, bw) = ops();
    let q = random(4 * 2 * 2 * 8);
    let k = random(6 * 2 * 8);
    let v = random(6 * 2 * 8);
    let t = |shape: &[usize], data: &[f32]| Tensor::from_f32(ty::F16, shape, data, CUDA);
    // 每组一个键值头，组内广播
    let inp = Inputs::new(
        t(&[1, 4, 2, 2, 8], &q),
        t(&[1, 6, 2, 1, 8], &k).expand(3, 2),
        t(&[1, 6, 2, 1, 8], &v).expand(3, 2),
    );
    let (out, ctx) = fw.apply(&inp, true).unwrap();
    assert_eq!(out.shape(), &[1, 4, 2, 2, 8]);

    // 半精度存储的输入
    let (q, k, v) = (
        inp.query.to_f32_vec(),
        inp.key.index(3, 0).to_f32_vec(),
        inp.value.index(3, 0).to_f32_vec(),
    );
    let naive = Naive {
        batch: 1,
        mq: 4,
        mk: 6,
        hq: 4,
        hk: 2,
        d: 8,
        dv: 8,
    };
    let d_out = vec![0.; q.len()];
    let expected = naive.run([&q, &k, &v, &d_out], &[0.; 24], 8f64.powf(-0.5));
    let (outliers, _) = compare(&out.to_f32_vec(), &expected.out, 2e-3, 1e-2);
    assert_eq!(outliers, 0);

    // 分组形式没有反向
    let err = bw.apply(ctx.unwrap(), &inp, &out).err().unwrap();
    assert!(err.is(LaunchErrorKind::UnsupportedConfiguration));
    assert!(err.reasons.iter().any(|r| r.contains("BMGHK")));
}

#[test]
fn test_broadcast_heads() {
    let (fw, bw) = ops();
    let t = |shape: &[usize]| {
        let n = shape.iter().product();
        Tensor::from_f32(ty::F16, shape, &random(n), CUDA)
    };
    let inp = Inputs::new(
        t(&[1, 4, 2, 8]),
        t(&[1, 6, 1, 8]).expand(2, 2),
        t(&[1, 6, 1, 8]).expand(2, 2),
    );
    let (out, ctx) = fw.apply(&inp, true).unwrap();
    assert_eq!(out.shape(), &[1, 4, 2, 8]);

    let err = bw.apply(ctx.unwrap(), &inp, &out).err().unwrap();
    assert!(err.is(LaunchErrorKind::UnsupportedConfiguration));
}

#[test]
fn test_packed_gradients() {
    let (fw, bw) = f32_ops(ReferenceKernel::new());
    let (b, m, h, k) = (2, 5, 2, 8);
    let qkv = Tensor::from_f32(ty::F32, &[b, m, 3, h, k], &random(b * m * 3 * h * k), CUDA);
    let inp = Inputs::new(qkv.index(2, 0), qkv.index(2, 1), qkv.index(2, 2));
    let (out, ctx) = fw.apply(&inp, true).unwrap();
    let grad = Tensor::from_f32(ty::F32, &[b, m, h, k], &random(b * m * h * k), CUDA);
    let packed = bw.apply(ctx.unwrap(), &inp, &grad).unwrap();

    assert!(packed.dq.same_storage(&packed.dk));
    assert!(packed.dq.same_storage(&packed.dv));
    let strides = [(m * 3 * h * k) as isize, (3 * h * k) as isize, k as isize, 1];
    for x in [&packed.dq, &packed.dk, &packed.dv] {
        assert_eq!(x.shape(), &[b, m, h, k]);
        assert_eq!(x.strides(), &strides);
    }

    // 同一问题，分开存储
    let inp_ = Inputs::new(
        inp.query.contiguous(),
        inp.key.contiguous(),
        inp.value.contiguous(),
    );
    let (out_, ctx_) = fw.apply(&inp_, true).unwrap();
    assert_close("out", &out_, &out.to_f32_vec());
    let separate = bw.apply(ctx_.unwrap(), &inp_, &grad).unwrap();
    assert!(!separate.dq.same_storage(&separate.dk));
    assert!(separate.dq.is_contiguous());
    assert_close("dq", &packed.dq, &separate.dq.to_f32_vec());
    assert_close("dk", &packed.dk, &separate.dk.to_f32_vec());
    assert_close("dv", &packed.dv, &separate.dv.to_f32_vec());
}

#[test]
fn test_lse_rows() {
    let (b, m, h, k) = (2, 6, 2, 8);
    let t = || Tensor::from_f32(ty::F32, &[b, m, h, k], &random(b * m * h * k), CUDA);
    let inp = Inputs::new(t(), t(), t()).with_bias(AttnBias::LowerTriangular);
    let grad = t();

    let (fw, bw) = f32_ops(ReferenceKernel::new());
    let (_, ctx) = fw.apply(&inp, true).unwrap();
    let expected = bw.apply(ctx.unwrap(), &inp, &grad).unwrap();

    // 分块核函数返回的 lse 行数多于查询数
    let (fw, bw) = f32_ops(ReferenceKernel::with_lse_row_multiple(16));
    let (_, ctx) = fw.apply(&inp, true).unwrap();
    let ctx = ctx.unwrap();
    assert_eq!(ctx.lse.shape(), &[2, 2, 16]);
    let grads = bw.apply(ctx.clone(), &inp, &grad).unwrap();
    assert_close("dq", &grads.dq, &expected.dq.to_f32_vec());
    assert_close("dk", &grads.dk, &expected.dk.to_f32_vec());
    assert_close("dv", &grads.dv, &expected.dv.to_f32_vec());

    let short = Context {
        lse: ctx.lse.slice(2, 0, m - 1).contiguous(),
        ..ctx.clone()
    };
    let err = bw.apply(short, &inp, &grad).err().unwrap();
    assert!(err.is(LaunchErrorKind::ShapeMismatch));

    let strided = Context {
        lse: ctx.lse.permute(&[1, 0, 2]),
        ..ctx
    };
    let err = bw.apply(strided, &inp, &grad).err().unwrap();
    assert!(err.is(LaunchErrorKind::ArgsNotSupport));
}

#[test]
fn test_dropout_context() {
    let (fw, _) = ops();
    let t = || Tensor::from_f32(ty::F16, &[1, 16, 2, 8], &random(16 * 2 * 8), CUDA);
    let inp = Inputs::new(t(), t(), t()).with_dropout(0.3);

    let (out, ctx) = fw.apply(&inp, true).unwrap();
    let ctx = ctx.unwrap();
    assert!(ctx.rng_state.is_some());
    let bw = ctx.op_bw.clone().unwrap();
    assert_eq!(bw.name(), fw.backward().name());

    let grads = bw.apply(ctx.clone(), &inp, &out).unwrap();
    assert_eq!(grads.dq.shape(), inp.query.shape());

    let lost = Context {
        rng_state: None,
        ..ctx
    };
    let err = bw.apply(lost, &inp, &out).err().unwrap();
    assert!(err.is(LaunchErrorKind::ArgsNotSupport));
}

#[test]
fn test_rejections() {
    let (fw, bw) = ops();
    let inputs = |dt, device| {
        let t = || Tensor::zeros(dt, &[1, 4, 2, 8], device);
        Inputs::new(t(), t(), t())
    };

    let err = fw.apply(&inputs(ty::F32, CUDA), false).err().unwrap();
    assert!(err.is(LaunchErrorKind::UnsupportedConfiguration));
    assert_eq!(err.reasons, ["dtype=float32 (supported: [\"float16\", \"bfloat16\"])"]);

    let err = fw.apply(&inputs(ty::F16, Device::cpu()), false).err().unwrap();
    assert!(err.is(LaunchErrorKind::UnsupportedConfiguration));
    assert!(err.reasons[0].starts_with("device=cpu"));

    let old = Device::cuda(0, (7, 5));
    let err = fw.apply(&inputs(ty::BF16, old), false).err().unwrap();
    assert_eq!(err.reasons.len(), 2);

    // 形状错误先于能力检查报告
    let t = || Tensor::zeros(ty::F32, &[4, 2, 8], Device::cpu());
    let err = fw.apply(&Inputs::new(t(), t(), t()), false).err().unwrap();
    assert!(err.is(LaunchErrorKind::RankNotSupport));

    // 梯度类型不同
    let inp = inputs(ty::F16, CUDA);
    let (out, ctx) = fw.apply(&inp, true).unwrap();
    let grad = Tensor::zeros(ty::BF16, out.shape(), CUDA);
    let err = bw.apply(ctx.unwrap(), &inp, &grad).err().unwrap();
    assert!(err.is(LaunchErrorKind::TypeMismatch));
}

#[test]
fn test_operator_flop() {
    let (fw, bw) = ops();
    let t = || Tensor::zeros(ty::F16, &[2, 128, 16, 64], CUDA);
    let inp = Inputs::new(t(), t(), t());
    let flop = fw.operator_flop(&inp);
    assert_eq!(flop, 2 * 2 * 128 * 128 * 64 * 2 * 16);
    assert_eq!(bw.operator_flop(&inp), flop * 5 / 2);
    assert_eq!(fw.operator_flop(&inp.with_bias(AttnBias::LowerTriangular)), flop / 2);

    // 形状不成立时不计数
    let t = || Tensor::zeros(ty::F16, &[128, 16, 64], CUDA);
    let inp = Inputs::new(t(), t(), t());
    assert_eq!(fw.operator_flop(&inp), 0);
    assert_eq!(bw.operator_flop(&inp), 0);
}

#[test]
fn test_zero_length() {
    let (fw, bw) = f32_ops(ReferenceKernel::new());
    let t = |shape: &[usize]| Tensor::zeros(ty::F32, shape, CUDA);

    let shape = [2, 0, 2, 8];
    let inp = Inputs::new(t(&shape), t(&shape), t(&shape));
    let (out, ctx) = fw.apply(&inp, true).unwrap();
    assert_eq!(out.shape(), &shape);
    let ctx = ctx.unwrap();
    assert_eq!(ctx.lse.shape(), &[2, 2, 0]);
    let grads = bw.apply(ctx, &inp, &t(&shape)).unwrap();
    for x in [&grads.dq, &grads.dk, &grads.dv] {
        assert_eq!(x.shape(), &shape);
        assert!(x.to_f32_vec().is_empty());
    }

    // 每个序列都没有查询，键值非空
    let mask = BlockDiagonalMask::from_seqlens(&[0, 0], Some(&[3, 2])).unwrap();
    let kv = |n| Tensor::from_f32(ty::F32, &[1, 5, 2, 8], &random(n), CUDA);
    let inp = Inputs::new(t(&[1, 0, 2, 8]), kv(80), kv(80))
        .with_bias(AttnBias::BlockDiagonal(mask));
    let (out, ctx) = fw.apply(&inp, true).unwrap();
    assert_eq!(out.shape(), &[1, 0, 2, 8]);
    let ctx = ctx.unwrap();
    assert_eq!(ctx.lse.shape(), &[2, 2, 0]);
    let grads = bw.apply(ctx, &inp, &t(&[1, 0, 2, 8])).unwrap();
    assert!(grads.dq.to_f32_vec().is_empty());
    assert_eq!(grads.dk.to_f32_vec(), [0.; 80]);
    assert_eq!(grads.dv.to_f32_vec(), [0.; 80]);
}
