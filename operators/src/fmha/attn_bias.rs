//! 融合核函数支持的注意力掩码。

use crate::{shape_mismatch, Device, LaunchError, Tensor};
use std::fmt;

/// 打包在一个 token 阶上的序列起始偏移。
#[derive(Clone)]
pub struct SeqLenInfo {
    /// `int32`，`len() + 1` 项，从 0 开始单调不减。
    pub seqstart: Tensor,
    pub seqstart_py: Vec<usize>,
    pub max_seqlen: usize,
    pub min_seqlen: usize,
}

impl SeqLenInfo {
    pub fn from_seqlens(seqlens: &[usize]) -> Self {
        let mut seqstart_py = Vec::with_capacity(seqlens.len() + 1);
        seqstart_py.push(0);
        for &len in seqlens {
            seqstart_py.push(seqstart_py[seqstart_py.len() - 1] + len);
        }
        Self {
            seqstart: offsets_tensor(&seqstart_py),
            max_seqlen: seqlens.iter().copied().max().unwrap_or(0),
            min_seqlen: seqlens.iter().copied().min().unwrap_or(0),
            seqstart_py,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.seqstart_py.len() - 1
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn intervals(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.seqstart_py.windows(2).map(|w| (w[0], w[1]))
    }

    pub(crate) fn seqstart_on(&self, device: Device) -> Tensor {
        self.seqstart.to_device(device)
    }
}

/// 每个序列的键填充到固定长度，只使用前缀。
#[derive(Clone)]
pub struct PaddedSeqLenInfo {
    pub seqstart: Tensor,
    pub seqstart_py: Vec<usize>,
    /// `int32`，每个序列实际使用的长度。
    pub seqlen: Tensor,
    pub seqlen_py: Vec<usize>,
    pub padding: usize,
    pub max_seqlen: usize,
    pub min_seqlen: usize,
}

impl PaddedSeqLenInfo {
    pub fn from_seqlens_padded(seqlens: &[usize], padding: usize) -> Result<Self, LaunchError> {
        if let Some(len) = seqlens.iter().find(|&&len| len > padding) {
            return Err(shape_mismatch(format!(
                "sequence length {len} exceeds key padding {padding}"
            )));
        }
        let seqstart_py = (0..=seqlens.len()).map(|i| i * padding).collect::<Vec<_>>();
        let seqlen = seqlens.iter().map(|&len| len as i32).collect::<Vec<_>>();
        Ok(Self {
            seqstart: offsets_tensor(&seqstart_py),
            seqstart_py,
            seqlen: Tensor::from_i32(&seqlen, Device::cpu()),
            seqlen_py: seqlens.to_vec(),
            padding,
            max_seqlen: seqlens.iter().copied().max().unwrap_or(0),
            min_seqlen: seqlens.iter().copied().min().unwrap_or(0),
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.seqlen_py.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.seqlen_py.is_empty()
    }

    pub fn intervals(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.seqstart_py
            .iter()
            .zip(&self.seqlen_py)
            .map(|(&start, &len)| (start, start + len))
    }
}

/// 打包进第 0 个 batch 的变长序列。
#[derive(Clone)]
pub struct BlockDiagonalMask {
    pub q_seqinfo: SeqLenInfo,
    pub k_seqinfo: SeqLenInfo,
}

impl BlockDiagonalMask {
    /// 键长缺省与查询长度相同。
    pub fn from_seqlens(
        q_seqlen: &[usize],
        kv_seqlen: Option<&[usize]>,
    ) -> Result<Self, LaunchError> {
        let kv_seqlen = kv_seqlen.unwrap_or(q_seqlen);
        if kv_seqlen.len() != q_seqlen.len() {
            return Err(shape_mismatch(format!(
                "{} query sequences but {} key sequences",
                q_seqlen.len(),
                kv_seqlen.len()
            )));
        }
        Ok(Self {
            q_seqinfo: SeqLenInfo::from_seqlens(q_seqlen),
            k_seqinfo: SeqLenInfo::from_seqlens(kv_seqlen),
        })
    }

    pub fn make_causal(self) -> AttnBias {
        AttnBias::BlockDiagonalCausal(self)
    }
}

/// 打包的查询对填充的键，每块右下对齐因果。
#[derive(Clone)]
pub struct PaddedKeysMask {
    pub q_seqinfo: SeqLenInfo,
    pub k_seqinfo: PaddedSeqLenInfo,
}

impl PaddedKeysMask {
    pub fn from_seqlens(
        q_seqlen: &[usize],
        kv_padding: usize,
        kv_seqlen: &[usize],
    ) -> Result<Self, LaunchError> {
        if kv_seqlen.len() != q_seqlen.len() {
            return Err(shape_mismatch(format!(
                "{} query sequences but {} key sequences",
                q_seqlen.len(),
                kv_seqlen.len()
            )));
        }
        Ok(Self {
            q_seqinfo: SeqLenInfo::from_seqlens(q_seqlen),
            k_seqinfo: PaddedSeqLenInfo::from_seqlens_padded(kv_seqlen, kv_padding)?,
        })
    }
}

#[derive(Clone, Default)]
pub enum AttnBias {
    #[default]
    None,
    LowerTriangular,
    BlockDiagonal(BlockDiagonalMask),
    BlockDiagonalCausal(BlockDiagonalMask),
    BlockDiagonalCausalWithOffsetPaddedKeys(PaddedKeysMask),
}

/// [`AttnBias`] 的种类，用于能力声明。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum MaskKind {
    None,
    LowerTriangular,
    BlockDiagonal,
    BlockDiagonalCausal,
    BlockDiagonalCausalWithOffsetPaddedKeys,
}

impl MaskKind {
    pub const ALL: [Self; 5] = [
        Self::None,
        Self::LowerTriangular,
        Self::BlockDiagonal,
        Self::BlockDiagonalCausal,
        Self::BlockDiagonalCausalWithOffsetPaddedKeys,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::None => "NoneType",
            Self::LowerTriangular => "LowerTriangularMask",
            Self::BlockDiagonal => "BlockDiagonalMask",
            Self::BlockDiagonalCausal => "BlockDiagonalCausalMask",
            Self::BlockDiagonalCausalWithOffsetPaddedKeys => {
                "BlockDiagonalCausalWithOffsetPaddedKeysMask"
            }
        }
    }
}

impl fmt::Display for MaskKind {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl AttnBias {
    pub fn kind(&self) -> MaskKind {
        match self {
            Self::None => MaskKind::None,
            Self::LowerTriangular => MaskKind::LowerTriangular,
            Self::BlockDiagonal(_) => MaskKind::BlockDiagonal,
            Self::BlockDiagonalCausal(_) => MaskKind::BlockDiagonalCausal,
            Self::BlockDiagonalCausalWithOffsetPaddedKeys(_) => {
                MaskKind::BlockDiagonalCausalWithOffsetPaddedKeys
            }
        }
    }

    pub fn is_causal(&self) -> bool {
        match self {
            Self::None | Self::BlockDiagonal(_) => false,
            Self::LowerTriangular
            | Self::BlockDiagonalCausal(_)
            | Self::BlockDiagonalCausalWithOffsetPaddedKeys(_) => true,
        }
    }

    pub fn make_causal(self) -> Self {
        match self {
            Self::None => Self::LowerTriangular,
            Self::BlockDiagonal(mask) => mask.make_causal(),
            causal => causal,
        }
    }

    /// 注意力所限的块的查询与键 `(start, end)`，单序列掩码为 `None`。
    pub fn blocks(&self) -> Option<Vec<((usize, usize), (usize, usize))>> {
        match self {
            Self::None | Self::LowerTriangular => None,
            Self::BlockDiagonal(m) | Self::BlockDiagonalCausal(m) => {
                Some(m.q_seqinfo.intervals().zip(m.k_seqinfo.intervals()).collect())
            }
            Self::BlockDiagonalCausalWithOffsetPaddedKeys(m) => {
                Some(m.q_seqinfo.intervals().zip(m.k_seqinfo.intervals()).collect())
            }
        }
    }

    /// 稠密的加性偏置 `[mq, mk]`，允许处为 `0`，其余为 `-inf`。
    ///
    /// 因果块右下对齐，等长时即下三角。
    pub fn materialize(&self, mq: usize, mk: usize) -> Vec<f32> {
        let mut bias = vec![f32::NEG_INFINITY; mq * mk];
        let mut allow = |(qs, qe): (usize, usize), (ks, ke): (usize, usize), causal: bool| {
            let (lq, lk) = (qe - qs, ke - ks);
            for i in 0..lq {
                for j in 0..lk {
                    if !causal || j + lq <= i + lk {
                        bias[(qs + i) * mk + ks + j] = 0.;
                    }
                }
            }
        };
        match self.blocks() {
            None => allow((0, mq), (0, mk), self.is_causal()),
            Some(blocks) => {
                for (q, k) in blocks {
                    allow(q, k, self.is_causal())
                }
            }
        }
        bias
    }
}

fn offsets_tensor(offsets: &[usize]) -> Tensor {
    let offsets = offsets.iter().map(|&x| x as i32).collect::<Vec<_>>();
    Tensor::from_i32(&offsets, Device::cpu())
}
