use super::{
    element::{self, element_size},
    Blob, Device,
};
use digit_layout::{types as ty, DigitLayout};
use ndarray_layout::{ArrayLayout, Endian::BigEndian};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use std::{ptr::copy_nonoverlapping, rc::Rc};

/// 共享主机存储上的带步长视图。
///
/// 步长和偏移以元素计，克隆张量只克隆视图。
#[derive(Clone)]
pub struct Tensor {
    dt: DigitLayout,
    layout: ArrayLayout<5>,
    storage: Rc<Blob>,
    device: Device,
}

impl Tensor {
    /// 连续，未初始化。
    pub fn empty(dt: DigitLayout, shape: &[usize], device: Device) -> Self {
        let size = shape.iter().product::<usize>() * element_size(dt);
        Self::contiguous_on(dt, shape, Blob::new(size), device)
    }

    pub fn zeros(dt: DigitLayout, shape: &[usize], device: Device) -> Self {
        let size = shape.iter().product::<usize>() * element_size(dt);
        Self::contiguous_on(dt, shape, Blob::new_zeroed(size), device)
    }

    pub fn from_f32(dt: DigitLayout, shape: &[usize], data: &[f32], device: Device) -> Self {
        assert_eq!(shape.iter().product::<usize>(), data.len());
        let ans = Self::empty(dt, shape, device);
        let ele = element_size(dt);
        let base = ans.storage.as_mut_ptr();
        for (i, &x) in data.iter().enumerate() {
            unsafe { element::store(dt, base.add(i * ele), x) }
        }
        ans
    }

    pub fn from_i32(data: &[i32], device: Device) -> Self {
        let ans = Self::empty(ty::I32, &[data.len()], device);
        unsafe { copy_nonoverlapping(data.as_ptr(), ans.storage.as_mut_ptr().cast(), data.len()) };
        ans
    }

    #[inline]
    pub fn empty_like(&self) -> Self {
        Self::empty(self.dt, self.shape(), self.device)
    }

    fn contiguous_on(dt: DigitLayout, shape: &[usize], blob: Blob, device: Device) -> Self {
        Self {
            dt,
            layout: ArrayLayout::new_contiguous(shape, BigEndian, 1),
            storage: Rc::new(blob),
            device,
        }
    }

    #[inline]
    pub fn dt(&self) -> DigitLayout {
        self.dt
    }

    #[inline]
    pub fn device(&self) -> Device {
        self.device
    }

    #[inline]
    pub fn ndim(&self) -> usize {
        self.layout.ndim()
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        self.layout.shape()
    }

    #[inline]
    pub fn strides(&self) -> &[isize] {
        self.layout.strides()
    }

    #[inline]
    pub fn offset(&self) -> isize {
        self.layout.offset()
    }

    /// 负数阶从后往前数。
    #[inline]
    pub fn stride(&self, axis: isize) -> isize {
        self.strides()[self.axis(axis)]
    }

    #[inline]
    pub fn dim(&self, axis: isize) -> usize {
        self.shape()[self.axis(axis)]
    }

    #[inline]
    fn axis(&self, axis: isize) -> usize {
        if axis < 0 {
            (self.ndim() as isize + axis) as _
        } else {
            axis as _
        }
    }

    #[inline]
    pub fn numel(&self) -> usize {
        self.shape().iter().product()
    }

    /// 两个视图是否来自同一块存储。
    #[inline]
    pub fn same_storage(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.storage, &other.storage)
    }

    #[inline]
    pub fn base_mut(&self) -> *mut u8 {
        let off = self.offset() * element_size(self.dt) as isize;
        unsafe { self.storage.as_mut_ptr().offset(off) }
    }

    pub fn is_contiguous(&self) -> bool {
        let mut expected = 1isize;
        for (&d, &s) in self.shape().iter().zip(self.strides()).rev() {
            if d != 1 && s != expected {
                return false;
            }
            expected *= d as isize;
        }
        true
    }

    pub fn index(&self, axis: usize, index: usize) -> Self {
        self.with_layout(self.layout.index(axis, index))
    }

    pub fn slice(&self, axis: usize, start: usize, len: usize) -> Self {
        self.with_layout(self.layout.slice(axis, start, 1, len))
    }

    /// 将长度为 1 的阶以步长 0 广播为 `times`。
    pub fn expand(&self, axis: usize, times: usize) -> Self {
        assert_eq!(self.shape()[axis], 1);
        self.with_layout(self.layout.broadcast(axis, times))
    }

    pub fn permute(&self, perm: &[usize]) -> Self {
        self.with_layout(self.layout.transpose(perm))
    }

    /// 将 `start..start + len` 阶合并为一阶，步长不允许时返回 `None`。
    pub fn merge(&self, start: usize, len: usize) -> Option<Self> {
        let dims = &self.shape()[start..start + len];
        if dims.contains(&0) || dims.iter().all(|&d| d == 1) {
            // 合并后的阶没有可寻址的跨度，步长任取
            let d = dims.iter().product::<usize>();
            return Some(self.with_layout(self.replace_axes(start, len, &[d])));
        }
        self.layout
            .merge_be(start, len)
            .map(|layout| self.with_layout(layout))
    }

    /// 与 [`Tensor::merge`] 相同，但步长不允许时合并一份连续的拷贝。
    pub fn merge_or_copy(&self, start: usize, len: usize) -> Self {
        self.merge(start, len).unwrap_or_else(|| {
            let mut shape = self.shape().to_vec();
            let d = shape.drain(start..start + len).product::<usize>();
            shape.insert(start, d);
            self.copy_to(self.device)
                .with_layout(ArrayLayout::new_contiguous(&shape, BigEndian, 1))
        })
    }

    /// 将 `axis` 阶分块为 `tiles`，总是视图。
    pub fn tile(&self, axis: usize, tiles: &[usize]) -> Self {
        assert_eq!(self.shape()[axis], tiles.iter().product::<usize>());
        if tiles.contains(&0) {
            return self.with_layout(self.replace_axes(axis, 1, tiles));
        }
        self.with_layout(self.layout.tile_be(axis, tiles))
    }

    /// 以 `dims` 替换 `start..start + len` 阶，新阶步长为 0。
    fn replace_axes(&self, start: usize, len: usize, dims: &[usize]) -> ArrayLayout<5> {
        let (shape, strides) = (self.shape(), self.strides());
        let zeros = vec![0; dims.len()];
        let shape = [&shape[..start], dims, &shape[start + len..]].concat();
        let strides = [&strides[..start], &zeros[..], &strides[start + len..]].concat();
        ArrayLayout::new(&shape, &strides, self.offset())
    }

    pub fn contiguous(&self) -> Self {
        if self.is_contiguous() {
            self.clone()
        } else {
            self.copy_to(self.device)
        }
    }

    /// 已在 `device` 上的张量原样返回。
    pub fn to_device(&self, device: Device) -> Self {
        if self.device == device {
            self.clone()
        } else {
            self.copy_to(device)
        }
    }

    pub fn to_f32_vec(&self) -> Vec<f32> {
        let ele = element_size(self.dt) as isize;
        let base = self.storage.as_ptr();
        self.element_offsets()
            .into_iter()
            .map(|off| unsafe { element::load(self.dt, base.offset(off * ele)) })
            .collect()
    }

    pub fn to_i32_vec(&self) -> Vec<i32> {
        let ele = element_size(self.dt) as isize;
        let base = self.storage.as_ptr();
        self.element_offsets()
            .into_iter()
            .map(|off| unsafe { element::load_int(self.dt, base.offset(off * ele)) as i32 })
            .collect()
    }

    fn with_layout(&self, layout: ArrayLayout<5>) -> Self {
        Self {
            dt: self.dt,
            layout,
            storage: self.storage.clone(),
            device: self.device,
        }
    }

    /// 按行优先顺序列出每个元素的偏移。
    fn element_offsets(&self) -> Vec<isize> {
        let shape = self.shape();
        let strides = self.strides();
        (0..self.numel())
            .map(|i| offset_of(i, shape, strides, self.offset()))
            .collect()
    }

    fn copy_to(&self, device: Device) -> Self {
        let ans = Self::empty(self.dt, self.shape(), device);
        let unit = element_size(self.dt);
        let src = self.storage.as_ptr() as isize;
        let dst = ans.storage.as_mut_ptr() as isize;
        let shape = self.shape();
        let strides = self.strides();
        let offset = self.offset();
        (0..self.numel()).into_par_iter().for_each(|i| {
            let src = src + offset_of(i, shape, strides, offset) * unit as isize;
            let dst = dst + (i * unit) as isize;
            unsafe { copy_nonoverlapping::<u8>(src as _, dst as _, unit) };
        });
        ans
    }
}

#[inline]
fn offset_of(mut rem: usize, shape: &[usize], strides: &[isize], offset: isize) -> isize {
    let mut off = offset;
    for (&d, &s) in shape.iter().zip(strides).rev() {
        off += (rem % d) as isize * s;
        rem /= d;
    }
    off
}
