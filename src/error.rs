use thiserror::Error;

/// Failures raised by the autograd engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AutogradError {
    #[error("element 0 of tensors does not require grad and does not have a grad_fn")]
    NoGradFn,

    #[error("grad can be implicitly created only for scalar outputs, got {numel} elements")]
    NonScalarBackward { numel: usize },

    #[error("shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("you can only change requires_grad flags of leaf variables")]
    NonLeafRequiresGrad,

    #[error("can't retain_grad on a tensor that has requires_grad=false")]
    RetainGradWithoutGrad,

    #[error("only one element tensors can be converted to scalars, got {numel} elements")]
    NotAScalar { numel: usize },
}

pub type Result<T> = std::result::Result<T, AutogradError>;
