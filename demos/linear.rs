use tgraph::optim::{Optimizer, SGD};
use tgraph::memory::device;
use tgraph::{Config, Graph, Node, Result, RuntimeConfig};

const BATCH: usize = 16;

/// Models a network expressing a * x + b, as `[x, 1] x [a, b]'`
fn model(g: &mut Graph<f32>) -> Result<[Node; 4]> {
    // Params need to be named
    let w = g.param("w", &[2, 1])?;

    let x = g.input(&[BATCH, 2])?;
    let x = g.named("x", x)?;
    let z = g.input(&[BATCH, 1])?;
    let z = g.named("z", z)?;

    let y = g.matmul(x, w)?;
    let y = g.named("y", y)?;

    let loss = g.mse(z, y)?;
    Ok([x, z, y, loss])
}

fn target(x: f32) -> f32 {
    32.0 * x + 10.0
}

fn main() -> Result<()> {
    let rt = device::init(&RuntimeConfig::from_env())?;
    let cfg = Config::from_env();
    println!(
        "Running on {} (device {} of {})",
        cfg.mem_type,
        cfg.device_id,
        rt.num_devices()
    );

    let g = &mut Graph::new(cfg);
    let o = &mut SGD::new(0.5);

    let [t_inputs, t_expect, _t_output, t_loss] = model(g)?;
    let params = g.params();
    let w = g.find("w").expect("w was named in model");

    for epoch in 0..20_000 {
        let input: [f32; BATCH] = rand::random();
        let expect = input.map(target);

        let mut rows = Vec::with_capacity(2 * BATCH);
        for x in input {
            rows.extend([x, 1.0]);
        }
        g.write(t_inputs, &rows)?;
        g.write(t_expect, &expect)?;

        // Inputs changed, the whole tree has to be evaluated again
        let loss = g.eval(t_loss, true)?.get(0)?;
        if loss < 1e-6 {
            println!("Seen:\t{} samples, converged to {loss}", epoch * BATCH);
            break;
        }

        let grads = g.backward(t_loss)?;
        o.optimize(g, &grads, &params)?;

        if epoch % 100 == 0 {
            println!("Epoch\t{epoch}");
            println!("Loss \t{loss}");
            println!("Prm  \t{:?}", g.eval(w, false)?.to_vec()?);
        }
    }
    Ok(())
}
