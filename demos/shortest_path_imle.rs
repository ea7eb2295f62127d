//! End-to-end example: learning edge costs through an exact shortest-path solver.
//!
//! The solver returns a 0/1 edge indicator, so its true gradient is zero almost
//! everywhere. I-MLE supplies a surrogate gradient, and plain gradient descent on the
//! edge costs is enough to make the solver pick the path the loss asks for.

use imle::shortest_path::{DagShortestPath, Edge};
use imle::{ImleConfig, Solver, TargetDistribution};
use ndarray::array;

fn main() {
    // A tiny DAG with two alternative paths from 0 to 3:
    // 0->1->3 (cheap) and 0->2->3 (expensive).
    let edges = vec![
        Edge { from: 0, to: 1 },
        Edge { from: 1, to: 3 },
        Edge { from: 0, to: 2 },
        Edge { from: 2, to: 3 },
    ];
    let solver = DagShortestPath::new(4, edges).unwrap();

    let cfg = ImleConfig::default()
        .with_nb_samples(10)
        .with_input_noise_temperature(0.5)
        .with_target_noise_temperature(0.5)
        .with_target(TargetDistribution::new(0.0, 2.0).unwrap())
        .with_seed(1);
    let mut op = cfg.build(solver).unwrap();

    // The loss wants the expensive path.
    let target = array![[0.0, 0.0, 1.0, 1.0]].into_dyn();
    let mut theta = array![[1.0, 1.0, 2.0, 2.0]].into_dyn();

    for step in 0..30 {
        let (y, mut ctx) = op.apply(theta.view()).unwrap();
        let grad_y = (&y - &target) * 2.0;
        let loss: f64 = grad_y.iter().map(|g| 0.25 * g * g).sum();
        let g = op.backward(&mut ctx, grad_y.view()).unwrap();
        theta = &theta - &(g * 0.2);
        if step % 5 == 0 {
            println!("step {step:2}: loss = {loss:.3}, expected path = {y}");
        }
    }

    println!("learned costs = {theta}");
    println!("MAP path      = {}", op.solver().solve(&theta).unwrap());
}
