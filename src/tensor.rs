// use std::borrow::Borrow;
// Bringing Borrow into scope shadows RefCell::borrow() through the Deref below
// and breaks every `tensor.borrow()` in this module.

use crate::error::{AutogradError, Result};
use log::{debug, trace};
use ndarray::{arr0, Array1, ArrayD, Axis, IxDyn};
use rand::Rng;
use rand_distr::StandardNormal;
use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use uuid::Uuid;

// Scalar variants carry their constant
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    Add,
    AddScalar(f32),
    Sub,
    SubScalar(f32),
    Mul,
    MulScalar(f32),
    Div,
    DivScalar(f32),
    Neg,
    Sum,
    Mean,
    Tanh,
    Relu,
}

#[derive(Debug, Clone)]
pub struct GradFn {
    op: Op,
    inputs: Vec<Tensor>,
}

#[derive(Debug)]
pub struct TensorData {
    pub data: ArrayD<f32>,
    pub grad: Option<ArrayD<f32>>,
    pub requires_grad: bool,
    pub retains_grad: bool,
    pub grad_fn: Option<GradFn>,
    pub _uuid: Uuid,
}

// Wrapper around TensorData, access Tensordata content: tensor.borrow()
#[derive(Debug, Clone)]
pub struct Tensor(Rc<RefCell<TensorData>>);

impl TensorData {
    pub fn new(data: ArrayD<f32>) -> TensorData {
        TensorData {
            data,
            grad: None,
            requires_grad: false,
            retains_grad: false,
            grad_fn: None,
            _uuid: Uuid::new_v4(),
        }
    }
}

impl GradFn {
    // 1 marks the tensor-scalar overload
    pub fn name(&self) -> &'static str {
        match self.op {
            Op::Add => "AddBackward0",
            Op::AddScalar(_) => "AddBackward1",
            Op::Sub => "SubBackward0",
            Op::SubScalar(_) => "SubBackward1",
            Op::Mul => "MulBackward0",
            Op::MulScalar(_) => "MulBackward1",
            Op::Div => "DivBackward0",
            Op::DivScalar(_) => "DivBackward1",
            Op::Neg => "NegBackward0",
            Op::Sum => "SumBackward0",
            Op::Mean => "MeanBackward0",
            Op::Tanh => "TanhBackward0",
            Op::Relu => "ReluBackward0",
        }
    }

    pub fn op(&self) -> Op {
        self.op
    }

    pub fn inputs(&self) -> &[Tensor] {
        &self.inputs
    }

    // One gradient per input, shaped like that input
    fn vjp(&self, out: &ArrayD<f32>, grad: &ArrayD<f32>) -> Vec<ArrayD<f32>> {
        match self.op {
            Op::Add => vec![
                unbroadcast(grad.clone(), &self.inputs[0].shape()),
                unbroadcast(grad.clone(), &self.inputs[1].shape()),
            ],
            Op::Sub => vec![
                unbroadcast(grad.clone(), &self.inputs[0].shape()),
                unbroadcast(-grad, &self.inputs[1].shape()),
            ],
            Op::Mul => {
                let lhs = self.inputs[0].borrow();
                let rhs = self.inputs[1].borrow();
                vec![
                    unbroadcast(grad * &rhs.data, lhs.data.shape()),
                    unbroadcast(grad * &lhs.data, rhs.data.shape()),
                ]
            }
            Op::Div => {
                let lhs = self.inputs[0].borrow();
                let rhs = self.inputs[1].borrow();
                // d(a/b)/db = -a / b^2
                let rhs_sq = &rhs.data * &rhs.data;
                vec![
                    unbroadcast(grad / &rhs.data, lhs.data.shape()),
                    unbroadcast(-(grad * &lhs.data) / &rhs_sq, rhs.data.shape()),
                ]
            }
            Op::AddScalar(_) | Op::SubScalar(_) => vec![grad.clone()],
            Op::MulScalar(s) => vec![grad * s],
            Op::DivScalar(s) => vec![grad / s],
            Op::Neg => vec![-grad],
            Op::Sum => {
                let shape = self.inputs[0].shape();
                vec![ArrayD::from_elem(IxDyn(&shape), grad.sum())]
            }
            Op::Mean => {
                let shape = self.inputs[0].shape();
                let n = shape.iter().product::<usize>() as f32;
                vec![ArrayD::from_elem(IxDyn(&shape), grad.sum() / n)]
            }
            // Tanh derivative from the output: (1 - tanh^2) * grad
            Op::Tanh => vec![grad * &out.mapv(|t| 1.0 - t * t)],
            Op::Relu => vec![grad * &out.mapv(|x| if x > 0.0 { 1.0 } else { 0.0 })],
        }
    }
}

// Sums a broadcast gradient back down to `shape`
fn unbroadcast(mut grad: ArrayD<f32>, shape: &[usize]) -> ArrayD<f32> {
    while grad.ndim() > shape.len() {
        grad = grad.sum_axis(Axis(0));
    }
    for (axis, &dim) in shape.iter().enumerate() {
        if dim == 1 && grad.shape()[axis] != 1 {
            grad = grad.sum_axis(Axis(axis)).insert_axis(Axis(axis));
        }
    }
    grad
}

impl Tensor {
    pub fn new(data: TensorData) -> Tensor {
        Tensor(Rc::new(RefCell::new(data)))
    }

    pub fn ones(shape: &[usize]) -> Tensor {
        Tensor::from(ArrayD::ones(IxDyn(shape)))
    }

    pub fn zeros(shape: &[usize]) -> Tensor {
        Tensor::from(ArrayD::zeros(IxDyn(shape)))
    }

    /// Samples from the standard normal distribution.
    pub fn randn<R: Rng>(shape: &[usize], rng: &mut R) -> Tensor {
        let data =
            ArrayD::from_shape_simple_fn(IxDyn(shape), || rng.sample::<f32, _>(StandardNormal));
        Tensor::from(data)
    }

    pub fn from_vec(values: Vec<f32>) -> Tensor {
        Tensor::from(Array1::from(values).into_dyn())
    }

    /// Builder form of [`Tensor::set_requires_grad`] for freshly created leaves.
    pub fn with_requires_grad(self, flag: bool) -> Tensor {
        self.borrow_mut().requires_grad = flag;
        self
    }

    // Result of an operation: only tracked when some input is.
    fn from_op(data: ArrayD<f32>, op: Op, inputs: Vec<Tensor>) -> Tensor {
        let mut node = TensorData::new(data);
        if inputs.iter().any(|t| t.requires_grad()) {
            node.requires_grad = true;
            node.grad_fn = Some(GradFn { op, inputs });
        }
        Tensor::new(node)
    }

    pub fn requires_grad(&self) -> bool {
        self.borrow().requires_grad
    }

    pub fn is_leaf(&self) -> bool {
        self.borrow().grad_fn.is_none()
    }

    pub fn grad_fn(&self) -> Option<GradFn> {
        self.borrow().grad_fn.clone()
    }

    pub fn grad(&self) -> Option<ArrayD<f32>> {
        self.borrow().grad.clone()
    }

    pub fn data(&self) -> ArrayD<f32> {
        self.borrow().data.clone()
    }

    pub fn shape(&self) -> Vec<usize> {
        self.borrow().data.shape().to_vec()
    }

    pub fn numel(&self) -> usize {
        self.borrow().data.len()
    }

    /// Value of a single-element tensor.
    pub fn item(&self) -> Result<f32> {
        let inner = self.borrow();
        match inner.data.len() {
            1 => Ok(inner.data.iter().copied().next().unwrap_or_default()),
            numel => Err(AutogradError::NotAScalar { numel }),
        }
    }

    pub fn set_requires_grad(&self, flag: bool) -> Result<()> {
        let mut inner = self.borrow_mut();
        if inner.grad_fn.is_some() {
            // Non-leaves always require grad; only switching off is an error.
            return if flag {
                Ok(())
            } else {
                Err(AutogradError::NonLeafRequiresGrad)
            };
        }
        inner.requires_grad = flag;
        Ok(())
    }

    /// Keeps the gradient of a non-leaf after backward. No-op on leaves.
    pub fn retain_grad(&self) -> Result<()> {
        let mut inner = self.borrow_mut();
        if !inner.requires_grad {
            return Err(AutogradError::RetainGradWithoutGrad);
        }
        if inner.grad_fn.is_some() {
            inner.retains_grad = true;
        }
        Ok(())
    }

    pub fn detach(&self) -> Tensor {
        Tensor::from(self.data())
    }

    pub fn zero_grad(&self) {
        self.borrow_mut().grad = None;
    }

    pub fn sum(&self) -> Tensor {
        let total = self.borrow().data.sum();
        Tensor::from_op(arr0(total).into_dyn(), Op::Sum, vec![self.clone()])
    }

    pub fn mean(&self) -> Tensor {
        // An empty tensor has no mean.
        let mean = self.borrow().data.mean().unwrap_or(f32::NAN);
        Tensor::from_op(arr0(mean).into_dyn(), Op::Mean, vec![self.clone()])
    }

    pub fn tanh(&self) -> Tensor {
        let data = self.borrow().data.mapv(|x| x.tanh());
        Tensor::from_op(data, Op::Tanh, vec![self.clone()])
    }

    pub fn relu(&self) -> Tensor {
        let data = self.borrow().data.mapv(|x| if x > 0.0 { x } else { 0.0 });
        Tensor::from_op(data, Op::Relu, vec![self.clone()])
    }

    /// Backward pass from a single-element output, seeded with ones.
    pub fn backward(&self) -> Result<()> {
        if !self.requires_grad() {
            return Err(AutogradError::NoGradFn);
        }
        let numel = self.numel();
        if numel != 1 {
            return Err(AutogradError::NonScalarBackward { numel });
        }
        self.run_backward(ArrayD::ones(IxDyn(&self.shape())))
    }

    /// Backward pass seeded with `gradient`, computing the vector-Jacobian
    /// product of every tracked input.
    pub fn backward_with(&self, gradient: &Tensor) -> Result<()> {
        if !self.requires_grad() {
            return Err(AutogradError::NoGradFn);
        }
        let (expected, found) = (self.shape(), gradient.shape());
        if expected != found {
            return Err(AutogradError::ShapeMismatch { expected, found });
        }
        self.run_backward(gradient.data())
    }

    fn run_backward(&self, seed: ArrayD<f32>) -> Result<()> {
        let mut topo = self._build_topo();
        topo.reverse();
        debug!("backward over {} nodes", topo.len());

        // Pending gradients of nodes not yet visited. Every consumer of a node
        // precedes it in `topo`, so its entry is complete once reached.
        let mut pending: HashMap<Uuid, ArrayD<f32>> = HashMap::new();
        pending.insert(self.id(), seed);

        for node in topo {
            let Some(grad) = pending.remove(&node.id()) else {
                continue;
            };
            let grad_fn = match node.grad_fn() {
                Some(grad_fn) => grad_fn,
                None => {
                    node.accumulate_grad(&grad);
                    continue;
                }
            };
            if node.borrow().retains_grad {
                node.accumulate_grad(&grad);
            }

            let input_grads = grad_fn.vjp(&node.borrow().data, &grad);
            for (input, input_grad) in grad_fn.inputs.iter().zip(input_grads) {
                if !input.requires_grad() {
                    continue;
                }
                trace!("{} -> {:?}", grad_fn.name(), input_grad.shape());
                match pending.entry(input.id()) {
                    Entry::Occupied(mut acc) => *acc.get_mut() += &input_grad,
                    Entry::Vacant(slot) => {
                        slot.insert(input_grad);
                    }
                }
            }
        }
        Ok(())
    }

    // Post-order DFS with an explicit stack so deep chains don't overflow.
    // The flag marks an entry whose inputs have already been pushed.
    fn _build_topo(&self) -> Vec<Tensor> {
        let mut topo: Vec<Tensor> = vec![];
        let mut visited: HashSet<Tensor> = HashSet::new();
        let mut stack = vec![(self.clone(), false)];
        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                topo.push(node);
                continue;
            }
            if !visited.insert(node.clone()) {
                continue;
            }
            stack.push((node.clone(), true));
            if let Some(grad_fn) = &node.borrow().grad_fn {
                for input in grad_fn.inputs.iter().rev() {
                    if !visited.contains(input) {
                        stack.push((input.clone(), false));
                    }
                }
            }
        }
        topo
    }

    // "+=" because leaves keep accumulating over repeated backward calls
    fn accumulate_grad(&self, grad: &ArrayD<f32>) {
        let mut inner = self.borrow_mut();
        let updated = match inner.grad.take() {
            Some(acc) => acc + grad,
            None => grad.clone(),
        };
        inner.grad = Some(updated);
    }

    fn id(&self) -> Uuid {
        self.borrow()._uuid
    }
}

// Lets us do `tensor.borrow().data` instead of `tensor.0.borrow().data`
impl std::ops::Deref for Tensor {
    type Target = Rc<RefCell<TensorData>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Hash for Tensor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.borrow()._uuid.hash(state);
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.borrow()._uuid == other.borrow()._uuid
    }
}

impl Eq for Tensor {}

impl From<ArrayD<f32>> for Tensor {
    fn from(item: ArrayD<f32>) -> Self {
        Tensor::new(TensorData::new(item))
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.borrow();
        let dims: Vec<String> = inner.data.shape().iter().map(|d| d.to_string()).collect();
        writeln!(f, "{}", inner.data)?;
        write!(f, "[ CPUFloatType{{{}}} ]", dims.join(","))?;
        if let Some(grad_fn) = &inner.grad_fn {
            write!(f, " grad_fn=<{}>", grad_fn.name())?;
        }
        Ok(())
    }
}

macro_rules! impl_binary_op {
    ($trait:ident, $method:ident, $op:ident, $scalar_op:ident) => {
        impl std::ops::$trait<&Tensor> for &Tensor {
            type Output = Tensor;
            fn $method(self, other: &Tensor) -> Tensor {
                let data = std::ops::$trait::$method(&self.borrow().data, &other.borrow().data);
                // Clone not that expensive because it is a data location/address that we are copying
                Tensor::from_op(data, Op::$op, vec![self.clone(), other.clone()])
            }
        }

        impl std::ops::$trait<f32> for &Tensor {
            type Output = Tensor;
            fn $method(self, other: f32) -> Tensor {
                let data = std::ops::$trait::$method(&self.borrow().data, other);
                Tensor::from_op(data, Op::$scalar_op(other), vec![self.clone()])
            }
        }

        impl std::ops::$trait<&Tensor> for Tensor {
            type Output = Tensor;
            fn $method(self, other: &Tensor) -> Tensor {
                std::ops::$trait::$method(&self, other)
            }
        }

        impl std::ops::$trait<f32> for Tensor {
            type Output = Tensor;
            fn $method(self, other: f32) -> Tensor {
                std::ops::$trait::$method(&self, other)
            }
        }
    };
}

impl_binary_op!(Add, add, Add, AddScalar);
impl_binary_op!(Sub, sub, Sub, SubScalar);
impl_binary_op!(Mul, mul, Mul, MulScalar);
impl_binary_op!(Div, div, Div, DivScalar);

impl std::ops::Neg for &Tensor {
    type Output = Tensor;
    fn neg(self) -> Tensor {
        let data = -&self.borrow().data;
        Tensor::from_op(data, Op::Neg, vec![self.clone()])
    }
}

impl std::ops::Neg for Tensor {
    type Output = Tensor;
    fn neg(self) -> Tensor {
        -&self
    }
}
