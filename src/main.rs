use anyhow::{Context, Result};
use autograd_playground::Tensor;
use clap::Parser;
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;

#[derive(Parser, Debug)]
#[command(name = "autograd-playground")]
#[command(about = "Walks through gradient tracking and backward propagation on small tensors")]
#[command(version)]
struct Args {
    /// Seed for the random tensor; drawn from the OS when omitted
    #[arg(long)]
    seed: Option<u64>,
}

fn grad_fn_name(tensor: &Tensor) -> &'static str {
    tensor.grad_fn().map_or("None", |grad_fn| grad_fn.name())
}

fn print_grad(label: &str, tensor: &Tensor) {
    match tensor.grad() {
        Some(grad) => println!("{label} = {grad}"),
        None => println!("{label} = None"),
    }
}

fn tracking_and_backward(rng: &mut StdRng) -> Result<()> {
    let x = Tensor::ones(&[2, 2]).with_requires_grad(true);
    println!("{x}");
    let y = &x + 2.0;
    println!("{y}");
    println!("{}", grad_fn_name(&y));
    let z = &(&y * &y) * 3.0;
    let out = z.mean();

    println!("{z}");
    println!("{}", grad_fn_name(&z));
    println!("{out}");
    println!("{}", grad_fn_name(&out));

    let a = Tensor::randn(&[2, 2], rng);
    let a = &(&a * 3.0) / &(&a - 1.0);
    println!("{}", a.requires_grad());

    a.set_requires_grad(true)
        .context("enabling gradient tracking on `a`")?;
    println!("{}", a.requires_grad());

    let b = (&a * &a).sum();
    println!("{}", grad_fn_name(&b));

    out.backward().context("backward from `out`")?;
    print_grad("x.grad()", &x);
    Ok(())
}

fn vector_jacobian_product() -> Result<()> {
    let x = Tensor::from_vec(vec![1.0, 2.0, 3.0]).with_requires_grad(true);
    let y = &x * &x; // y = [1, 4, 9]
    let v = Tensor::from_vec(vec![0.1, 1.0, 0.0001]);
    y.retain_grad().context("retaining the gradient of `y`")?;
    y.backward_with(&v).context("backward from `y` seeded with `v`")?;

    println!("y = {y}");
    println!("y.grad_fn()->name() = {}", grad_fn_name(&y));
    print_grad("x.grad()", &x);
    print_grad("y.grad()", &y);
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    info!("seed: {:?}", args.seed);

    tracking_and_backward(&mut rng)?;
    vector_jacobian_product()?;
    Ok(())
}
