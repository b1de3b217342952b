//! A small reverse-mode autograd engine over `ndarray`, plus the playground
//! binary that walks through it.

pub mod error;
pub mod tensor;

pub use error::{AutogradError, Result};
pub use tensor::{GradFn, Op, Tensor, TensorData};
