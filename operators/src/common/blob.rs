use std::{
    alloc::{alloc, alloc_zeroed, dealloc, handle_alloc_error, Layout},
    ptr::NonNull,
};

/// 主机可寻址的存储空间，可被多个张量视图共享。
///
/// 视图只通过 [`Blob::as_mut_ptr`] 写入，不借出切片。
pub struct Blob {
    ptr: NonNull<u8>,
    len: usize,
}

impl Blob {
    /// 未初始化的存储空间。
    #[inline]
    pub fn new(size: usize) -> Self {
        Self::alloc_with(size, alloc)
    }

    #[inline]
    pub fn new_zeroed(size: usize) -> Self {
        Self::alloc_with(size, alloc_zeroed)
    }

    fn alloc_with(size: usize, f: unsafe fn(Layout) -> *mut u8) -> Self {
        if size == 0 {
            return Self {
                ptr: NonNull::<usize>::dangling().cast(),
                len: 0,
            };
        }
        let layout = layout(size);
        let Some(ptr) = NonNull::new(unsafe { f(layout) }) else {
            handle_alloc_error(layout)
        };
        Self { ptr, len: size }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for Blob {
    #[inline]
    fn drop(&mut self) {
        let &mut Blob { ptr, len } = self;
        if len != 0 {
            unsafe { dealloc(ptr.as_ptr(), layout(len)) }
        }
    }
}

#[inline(always)]
const fn layout(size: usize) -> Layout {
    unsafe { Layout::from_size_align_unchecked(size, std::mem::align_of::<usize>()) }
}
