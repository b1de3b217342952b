use approx::assert_abs_diff_eq;
use autograd_playground::{AutogradError, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn mean_of_squared_shift() {
    init();
    let x = Tensor::ones(&[2, 2]).with_requires_grad(true);
    let y = &x + 2.0;
    assert_eq!(y.grad_fn().unwrap().name(), "AddBackward1");

    let z = &(&y * &y) * 3.0;
    assert_eq!(z.grad_fn().unwrap().name(), "MulBackward1");
    assert!(z.data().iter().all(|&v| v == 27.0));

    let out = z.mean();
    assert_eq!(out.grad_fn().unwrap().name(), "MeanBackward0");
    assert_abs_diff_eq!(out.item().unwrap(), 27.0);

    out.backward().unwrap();
    // d(out)/dx = 6 * (x + 2) / 4
    let grad = x.grad().unwrap();
    assert_eq!(grad.shape(), &[2, 2]);
    for g in grad.iter() {
        assert_abs_diff_eq!(*g, 4.5, epsilon = 1e-6);
    }
    assert!(y.grad().is_none());
}

#[test]
fn tracking_switched_on_after_the_fact() {
    let mut rng = StdRng::seed_from_u64(7);
    let a = Tensor::randn(&[2, 2], &mut rng);
    let a = &(&a * 3.0) / &(&a - 1.0);
    assert!(!a.requires_grad());
    assert!(a.grad_fn().is_none());

    a.set_requires_grad(true).unwrap();
    assert!(a.requires_grad());

    let b = (&a * &a).sum();
    assert_eq!(b.grad_fn().unwrap().name(), "SumBackward0");

    b.backward().unwrap();
    let expected = a.data() * 2.0;
    for (g, e) in a.grad().unwrap().iter().zip(expected.iter()) {
        assert_abs_diff_eq!(*g, *e, epsilon = 1e-4);
    }
}

#[test]
fn vector_jacobian_product() {
    init();
    let x = Tensor::from_vec(vec![1.0, 2.0, 3.0]).with_requires_grad(true);
    let y = &x * &x;
    let v = Tensor::from_vec(vec![0.1, 1.0, 0.0001]);
    y.retain_grad().unwrap();
    y.backward_with(&v).unwrap();

    assert_eq!(y.grad_fn().unwrap().name(), "MulBackward0");
    for (g, e) in x.grad().unwrap().iter().zip([0.2, 4.0, 0.0006]) {
        assert_abs_diff_eq!(*g, e, epsilon = 1e-6);
    }
    assert_eq!(y.grad().unwrap(), v.data());
    assert!(v.grad().is_none());
}

#[test]
fn backward_on_untracked_output_fails() {
    let a = Tensor::ones(&[2, 2]);
    let b = (&a * &a).sum();
    assert_eq!(b.backward(), Err(AutogradError::NoGradFn));
}

#[test]
fn implicit_seed_needs_scalar_output() {
    let x = Tensor::from_vec(vec![1.0, 2.0, 3.0]).with_requires_grad(true);
    let y = &x * &x;
    assert_eq!(
        y.backward(),
        Err(AutogradError::NonScalarBackward { numel: 3 })
    );
    assert!(x.grad().is_none());
}
