mod common;

pub mod fmha;

pub use common::*;
