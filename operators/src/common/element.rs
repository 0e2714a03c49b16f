use digit_layout::{types as ty, DigitLayout};
use half::{bf16, f16};

/// 元素字节数。
pub fn element_size(dt: DigitLayout) -> usize {
    match dt {
        ty::F16 | ty::BF16 => 2,
        ty::F32 | ty::I32 => 4,
        ty::F64 | ty::I64 => 8,
        _ => panic!("{} has no host element representation", dtype_name(dt)),
    }
}

pub fn dtype_name(dt: DigitLayout) -> String {
    match dt {
        ty::F16 => "float16".into(),
        ty::BF16 => "bfloat16".into(),
        ty::F32 => "float32".into(),
        ty::F64 => "float64".into(),
        ty::I32 => "int32".into(),
        ty::I64 => "int64".into(),
        _ => format!("{dt:?}"),
    }
}

/// 读取一个元素并转为 `f32`。
///
/// # Safety
///
/// `ptr` 必须指向可读的 `dt` 类型元素。
#[inline]
pub unsafe fn load(dt: DigitLayout, ptr: *const u8) -> f32 {
    match dt {
        ty::F16 => ptr.cast::<f16>().read_unaligned().to_f32(),
        ty::BF16 => ptr.cast::<bf16>().read_unaligned().to_f32(),
        ty::F32 => ptr.cast::<f32>().read_unaligned(),
        ty::F64 => ptr.cast::<f64>().read_unaligned() as _,
        ty::I32 => ptr.cast::<i32>().read_unaligned() as _,
        ty::I64 => ptr.cast::<i64>().read_unaligned() as _,
        _ => unreachable!(),
    }
}

/// 将 `f32` 转换后写入一个元素。
///
/// # Safety
///
/// `ptr` 必须指向可写的 `dt` 类型元素。
#[inline]
pub unsafe fn store(dt: DigitLayout, ptr: *mut u8, val: f32) {
    match dt {
        ty::F16 => ptr.cast::<f16>().write_unaligned(f16::from_f32(val)),
        ty::BF16 => ptr.cast::<bf16>().write_unaligned(bf16::from_f32(val)),
        ty::F32 => ptr.cast::<f32>().write_unaligned(val),
        ty::F64 => ptr.cast::<f64>().write_unaligned(val as _),
        ty::I32 => ptr.cast::<i32>().write_unaligned(val as _),
        ty::I64 => ptr.cast::<i64>().write_unaligned(val as _),
        _ => unreachable!(),
    }
}

/// 读取一个整数元素。
///
/// # Safety
///
/// `ptr` 必须指向可读的 `dt` 类型元素。
#[inline]
pub unsafe fn load_int(dt: DigitLayout, ptr: *const u8) -> i64 {
    match dt {
        ty::I32 => ptr.cast::<i32>().read_unaligned() as _,
        ty::I64 => ptr.cast::<i64>().read_unaligned(),
        _ => load(dt, ptr) as _,
    }
}
