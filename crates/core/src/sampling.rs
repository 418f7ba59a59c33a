//! Distribution sampling over the injected uniform source.
//!
//! The posteriors in this crate are Beta distributions, sampled as ratios
//! of Gamma draws (Marsaglia–Tsang). Normals come from Box–Muller. All
//! three are built on `Rng::uniform` alone so a scripted uniform tape
//! drives fully reproducible decisions.

use crate::runtime::Rng;

/// Standard normal via Box–Muller.
pub fn standard_normal(rng: &mut dyn Rng) -> f64 {
    // log(0) guard
    let u1 = rng.uniform().max(1e-12);
    let u2 = rng.uniform();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// Gamma(shape, 1) via Marsaglia–Tsang squeeze, with the `shape < 1` boost
/// `gamma(shape + 1) * u^(1/shape)`.
pub fn gamma(rng: &mut dyn Rng, shape: f64) -> f64 {
    let shape = shape.max(1e-3);
    if shape < 1.0 {
        let u = rng.uniform().max(1e-12);
        return gamma(rng, shape + 1.0) * u.powf(1.0 / shape);
    }

    let d = shape - 1.0 / 3.0;
    let c = 1.0 / (9.0 * d).sqrt();
    loop {
        let x = standard_normal(rng);
        let v = (1.0 + c * x).powi(3);
        if v <= 0.0 {
            continue;
        }
        let u = rng.uniform().max(1e-300);
        if u < 1.0 - 0.0331 * x.powi(4) {
            return d * v;
        }
        if u.ln() < 0.5 * x * x + d * (1.0 - v + v.ln()) {
            return d * v;
        }
    }
}

/// Beta(alpha, beta) as `X / (X + Y)` with independent Gamma draws.
pub fn beta(rng: &mut dyn Rng, alpha: f64, beta: f64) -> f64 {
    let x = gamma(rng, alpha);
    let y = gamma(rng, beta);
    if x + y <= 0.0 {
        return 0.5;
    }
    x / (x + y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::SeededRng;

    #[test]
    fn normal_mean_and_variance_are_plausible() {
        let mut rng = SeededRng::new(11);
        let n = 20_000;
        let draws: Vec<f64> = (0..n).map(|_| standard_normal(&mut rng)).collect();
        let mean = draws.iter().sum::<f64>() / n as f64;
        let var = draws.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;
        assert!(mean.abs() < 0.05, "mean {mean}");
        assert!((var - 1.0).abs() < 0.1, "variance {var}");
    }

    #[test]
    fn gamma_matches_expected_mean() {
        // Gamma(k, 1) has mean k
        let mut rng = SeededRng::new(12);
        for &k in &[0.5, 1.0, 2.5, 9.0] {
            let n = 20_000;
            let mean = (0..n).map(|_| gamma(&mut rng, k)).sum::<f64>() / n as f64;
            assert!((mean - k).abs() < 0.15 * k.max(1.0), "k={k} mean={mean}");
        }
    }

    #[test]
    fn gamma_is_positive() {
        let mut rng = SeededRng::new(13);
        for _ in 0..5_000 {
            assert!(gamma(&mut rng, 0.7) > 0.0);
            assert!(gamma(&mut rng, 3.0) > 0.0);
        }
    }

    #[test]
    fn beta_stays_in_unit_interval_and_centers() {
        let mut rng = SeededRng::new(14);
        let n = 20_000;
        let mut sum = 0.0;
        for _ in 0..n {
            let b = beta(&mut rng, 2.0, 2.0);
            assert!((0.0..=1.0).contains(&b));
            sum += b;
        }
        let mean = sum / n as f64;
        assert!((mean - 0.5).abs() < 0.02, "mean {mean}");
    }

    #[test]
    fn beta_skews_toward_heavier_evidence() {
        let mut rng = SeededRng::new(15);
        let n = 10_000;
        let mean = (0..n).map(|_| beta(&mut rng, 9.0, 1.0)).sum::<f64>() / n as f64;
        assert!(mean > 0.85, "mean {mean}");
    }
}
