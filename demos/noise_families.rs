//! Compare the perturbation noise families.
//!
//! A Gumbel variable splits into `k` i.i.d. sum-of-Gamma variables, so summing `k`
//! sum-of-Gamma draws should look like one Gumbel draw (mean ≈ 0.577).

use imle::{NoiseDistribution, NoiseSampler, NoiseSource};
use ndarray::Axis;

fn main() {
    let n = 20_000;
    let k = 5;

    let mut gumbel = NoiseSampler::new(NoiseDistribution::Gumbel, 0).unwrap();
    let g = gumbel.sample(&[n]).unwrap();
    println!("gumbel: mean = {:.4}", g.sum() / n as f64);

    let mut normal = NoiseSampler::new(NoiseDistribution::Normal, 0).unwrap();
    let x = normal.sample(&[n]).unwrap();
    println!("normal: mean = {:.4}", x.sum() / n as f64);

    let mut sog = NoiseSampler::new(NoiseDistribution::sum_of_gamma(k, 100).unwrap(), 0).unwrap();
    let s = sog.sample(&[n, k as usize]).unwrap();
    let per_row = s.sum_axis(Axis(1));
    println!(
        "sum of {k} sum-of-gamma draws: mean = {:.4} (single draw mean = {:.4})",
        per_row.sum() / n as f64,
        s.sum() / (n * k as usize) as f64
    );
}
