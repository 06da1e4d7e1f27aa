//! Non-parametric bootstrap confidence intervals

use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;

/// Default resample count
pub const DEFAULT_RESAMPLES: usize = 1000;

/// Percentile-method 95% bootstrap interval over the sample mean
///
/// Uses the provided RNG so callers control determinism; see
/// [`bootstrap_ci`] for the seeded convenience wrapper.
pub fn bootstrap_ci_with_rng(samples: &[f64], resamples: usize, rng: &mut impl Rng) -> (f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0);
    }
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    if samples.len() == 1 {
        return (mean, mean);
    }

    let mut means = Vec::with_capacity(resamples);
    for _ in 0..resamples.max(1) {
        let mut total = 0.0;
        for _ in 0..samples.len() {
            total += samples[rng.random_range(0..samples.len())];
        }
        means.push(total / samples.len() as f64);
    }
    means.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let lower_index = ((means.len() - 1) as f64 * 0.025).floor() as usize;
    let upper_index = ((means.len() - 1) as f64 * 0.975).ceil() as usize;
    (means[lower_index], means[upper_index.min(means.len() - 1)])
}

/// Deterministic bootstrap interval (fixed seed, reproducible reports)
pub fn bootstrap_ci(samples: &[f64], resamples: usize) -> (f64, f64) {
    let mut rng = StdRng::seed_from_u64(0x0ed1_50da);
    bootstrap_ci_with_rng(samples, resamples, &mut rng)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_and_singleton() {
        assert_eq!(bootstrap_ci(&[], 100), (0.0, 0.0));
        assert_eq!(bootstrap_ci(&[4.2], 100), (4.2, 4.2));
    }

    #[test]
    fn test_interval_brackets_the_mean() {
        let samples: Vec<f64> = (0..50).map(|n| (n % 10) as f64).collect();
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        let (lower, upper) = bootstrap_ci(&samples, 1000);
        assert!(lower <= mean, "lower {lower} should be <= mean {mean}");
        assert!(upper >= mean, "upper {upper} should be >= mean {mean}");
        assert!(lower < upper);
    }

    #[test]
    fn test_deterministic() {
        let samples = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(bootstrap_ci(&samples, 500), bootstrap_ci(&samples, 500));
    }

    #[test]
    fn test_coverage_on_synthetic_data() {
        // Known mean 4.5 over uniform 0..=9; the 95% interval should contain
        // it in at least 93% of trials
        let mut rng = StdRng::seed_from_u64(7);
        let mut covered = 0;
        let trials = 200;
        for _ in 0..trials {
            let samples: Vec<f64> = (0..30).map(|_| rng.random_range(0..10) as f64).collect();
            let (lower, upper) = bootstrap_ci_with_rng(&samples, 300, &mut rng);
            if lower <= 4.5 && 4.5 <= upper {
                covered += 1;
            }
        }
        let coverage = covered as f64 / trials as f64;
        assert!(coverage >= 0.93, "coverage {coverage} below 0.93");
    }

    #[test]
    fn test_tight_samples_give_tight_interval() {
        let samples = vec![5.0; 40];
        let (lower, upper) = bootstrap_ci(&samples, 500);
        assert_eq!(lower, 5.0);
        assert_eq!(upper, 5.0);
    }
}
