mod blob;
mod device;
mod element;
mod error;
mod tensor;

pub use blob::Blob;
pub use device::{Device, DeviceKind};
pub use element::{dtype_name, element_size};
pub use error::{functions::*, LaunchError, LaunchErrorKind};
pub use tensor::Tensor;

#[cfg(any(use_cpu, test))]
pub(crate) use element::{load, store};

pub mod utils {
    use super::{device_mismatch, dtype_name, rank_not_support, type_mismatch, LaunchError, Tensor};
    use digit_layout::DigitLayout;

    #[inline]
    pub(crate) fn type_distinct(pairs: &[DigitLayout]) -> Result<DigitLayout, LaunchError> {
        let [dt, tail @ ..] = pairs else {
            unreachable!("pairs empty");
        };
        if tail.iter().all(|it| it == dt) {
            Ok(*dt)
        } else {
            let names = pairs.iter().map(|&dt| dtype_name(dt)).collect::<Vec<_>>();
            Err(type_mismatch(format!("{names:?} are not distinct")))
        }
    }

    #[inline]
    pub(crate) fn device_distinct(tensors: &[&Tensor]) -> Result<(), LaunchError> {
        let [first, tail @ ..] = tensors else {
            unreachable!("tensors empty");
        };
        match tail.iter().find(|t| t.device() != first.device()) {
            None => Ok(()),
            Some(t) => Err(device_mismatch(format!(
                "tensors on {} and {}",
                first.device(),
                t.device()
            ))),
        }
    }

    #[inline]
    pub(crate) fn rank_error(arg: &str, expected: &[usize], actual: usize) -> LaunchError {
        rank_not_support(format!("{arg}.ndim = {actual}, {expected:?} expected"))
    }

    #[inline]
    pub(crate) fn dim_distinct(args: &[usize]) -> Option<usize> {
        let (&ans, others) = args.split_first()?;
        others.iter().all(|&x| x == ans).then_some(ans)
    }
}
