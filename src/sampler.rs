//! Random variate generation for Normal, Gamma and Beta distributions over an injectable RNG.
//!
//! All parameters are sanitized before sampling: NaN maps to [`PARAM_FLOOR`] and other values are
//! clamped to `[PARAM_FLOOR, PARAM_CEILING]`, so non-finite numbers never escape.
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Upper bound on Marsaglia–Tsang rejection rounds for a single gamma draw.
pub const MAX_REJECTION_ATTEMPTS: usize = 1000;

/// Smallest value a shape (or Beta) parameter is allowed to take.
pub const PARAM_FLOOR: f64 = 1e-3;
/// Largest value a shape (or Beta) parameter is allowed to take.
pub const PARAM_CEILING: f64 = 1e12;

/// Pluggable-RNG sampler.
#[derive(Debug, Clone)]
pub struct Sampler<R = StdRng> {
    rng: R,
}

impl Sampler<StdRng> {
    /// Create a sampler seeded from system entropy.
    pub fn from_entropy() -> Sampler<StdRng> {
        Sampler::new(StdRng::from_entropy())
    }

    /// Create a reproducible sampler.
    pub fn seeded(seed: u64) -> Sampler<StdRng> {
        Sampler::new(StdRng::seed_from_u64(seed))
    }
}

impl<R: Rng> Sampler<R> {
    /// Wrap an existing RNG.
    pub fn new(rng: R) -> Sampler<R> {
        Sampler { rng }
    }

    /// Uniform draw in `(0, 1]`. Never returns zero, so `ln` and `1/x` stay finite.
    fn uniform(&mut self) -> f64 {
        1.0 - self.rng.gen::<f64>()
    }

    /// Normal variate via the Box–Muller transform.
    ///
    /// A negative or non-finite `stddev` is treated as zero, a non-finite `mean` as zero.
    pub fn normal(&mut self, mean: f64, stddev: f64) -> f64 {
        let mean = if mean.is_finite() { mean } else { 0.0 };
        let stddev = if stddev.is_finite() { stddev.max(0.0) } else { 0.0 };

        let u1 = self.uniform();
        let u2 = self.uniform();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        mean + stddev * z
    }

    /// Gamma variate using the Marsaglia–Tsang method.
    pub fn gamma(&mut self, shape: f64, scale: f64) -> f64 {
        let shape = sanitize_param(shape);
        let scale = sanitize_param(scale);

        if shape < 1.0 {
            // Boost: Gamma(a) = Gamma(a + 1) * U^(1/a).
            let boosted = self.gamma(shape + 1.0, scale);
            return boosted * self.uniform().powf(1.0 / shape);
        }

        let d = shape - 1.0 / 3.0;
        let c = 1.0 / (9.0 * d).sqrt();
        let mut best = None;

        for _ in 0..MAX_REJECTION_ATTEMPTS {
            let x = self.normal(0.0, 1.0);
            let t = 1.0 + c * x;
            if t <= 0.0 {
                continue;
            }
            let v = t * t * t;
            best = Some(v);

            let u = self.uniform();
            let x2 = x * x;
            if u < 1.0 - 0.331 * x2 * x2 || u.ln() < 0.5 * x2 + d * (1.0 - v + v.ln()) {
                return d * v * scale;
            }
        }

        log::warn!(target: "jobrank", shape, scale; "gamma rejection sampling did not converge, using last candidate");
        d * best.unwrap_or(1.0) * scale
    }

    /// Beta variate as `X / (X + Y)` with `X ~ Gamma(alpha, 1)` and `Y ~ Gamma(beta, 1)`.
    ///
    /// When both gamma draws underflow to zero (tiny parameters), the distribution mean is
    /// returned instead of `0/0`.
    pub fn beta(&mut self, alpha: f64, beta: f64) -> f64 {
        let alpha = sanitize_param(alpha);
        let beta = sanitize_param(beta);

        let x = self.gamma(alpha, 1.0);
        let y = self.gamma(beta, 1.0);
        let total = x + y;
        if total > 0.0 && total.is_finite() {
            (x / total).clamp(0.0, 1.0)
        } else {
            alpha / (alpha + beta)
        }
    }
}

/// Clamp a distribution parameter into the supported range, mapping NaN to the floor.
pub(crate) fn sanitize_param(value: f64) -> f64 {
    if value.is_nan() {
        PARAM_FLOOR
    } else {
        value.clamp(PARAM_FLOOR, PARAM_CEILING)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mean_of(n: usize, mut f: impl FnMut() -> f64) -> f64 {
        (0..n).map(|_| f()).sum::<f64>() / n as f64
    }

    /// RNG replaying a fixed cycle of words.
    struct CycleRng {
        words: Vec<u64>,
        next: usize,
    }

    impl rand::RngCore for CycleRng {
        fn next_u32(&mut self) -> u32 {
            self.next_u64() as u32
        }

        fn next_u64(&mut self) -> u64 {
            let word = self.words[self.next % self.words.len()];
            self.next += 1;
            word
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            for chunk in dest.chunks_mut(8) {
                let bytes = self.next_u64().to_le_bytes();
                chunk.copy_from_slice(&bytes[..chunk.len()]);
            }
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> std::result::Result<(), rand::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    #[test]
    fn rejection_loop_gives_up_with_last_candidate() {
        // A zero word makes every uniform 1.0, so x = 0 and v = 1 are never accepted.
        let mut sampler = Sampler::new(rand::rngs::mock::StepRng::new(0, 0));
        let draw = sampler.gamma(2.0, 3.0);
        assert!(draw.is_finite());
        assert!((draw - (2.0 - 1.0 / 3.0) * 3.0).abs() < 1e-12);
    }

    #[test]
    fn rejection_loop_without_candidates_stays_finite() {
        // Uniforms alternate between 2^-53 and 0.5, so every normal draw is about -8.6 and
        // 1 + c·x is never positive.
        let mut sampler = Sampler::new(CycleRng {
            words: vec![u64::MAX, 1 << 63],
            next: 0,
        });
        let draw = sampler.gamma(1.0, 1.0);
        assert!((draw - 2.0 / 3.0).abs() < 1e-12);

        let beta = sampler.beta(1.0, 1.0);
        assert!((0.0..=1.0).contains(&beta));
    }

    #[test]
    fn beta_mean_converges() {
        let mut sampler = Sampler::seeded(42);
        for (a, b) in [(1.0, 1.0), (2.0, 5.0), (30.0, 3.0), (0.5, 0.5)] {
            let mean = mean_of(100_000, || sampler.beta(a, b));
            let expected = a / (a + b);
            assert!(
                (mean - expected).abs() < 0.01,
                "Beta({a}, {b}): expected mean {expected}, got {mean}"
            );
        }
    }

    #[test]
    fn gamma_mean_is_shape_times_scale() {
        let mut sampler = Sampler::seeded(7);
        let mean = mean_of(100_000, || sampler.gamma(3.0, 2.0));
        assert!((mean - 6.0).abs() < 0.1, "got {mean}");

        let mean = mean_of(100_000, || sampler.gamma(0.5, 1.0));
        assert!((mean - 0.5).abs() < 0.02, "got {mean}");
    }

    #[test]
    fn normal_moments() {
        let mut sampler = Sampler::seeded(1);
        let draws = (0..100_000)
            .map(|_| sampler.normal(5.0, 2.0))
            .collect::<Vec<_>>();
        let mean = draws.iter().sum::<f64>() / draws.len() as f64;
        let var = draws.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / draws.len() as f64;
        assert!((mean - 5.0).abs() < 0.05, "got {mean}");
        assert!((var.sqrt() - 2.0).abs() < 0.05, "got {}", var.sqrt());
    }

    #[test]
    fn degenerate_parameters_stay_finite() {
        let mut sampler = Sampler::seeded(3);
        for (a, b) in [
            (0.0, 0.0),
            (-1.0, 2.0),
            (f64::NAN, 1.0),
            (f64::INFINITY, 1.0),
            (1.0, f64::NEG_INFINITY),
            (1e-9, 1e-9),
        ] {
            for _ in 0..1000 {
                let x = sampler.beta(a, b);
                assert!(x.is_finite() && (0.0..=1.0).contains(&x), "Beta({a}, {b}) -> {x}");
            }
        }
        assert!(sampler.gamma(f64::NAN, f64::NAN).is_finite());
        assert!(sampler.normal(f64::NAN, f64::INFINITY).is_finite());
    }

    #[test]
    fn same_seed_same_draws() {
        let mut a = Sampler::seeded(99);
        let mut b = Sampler::seeded(99);
        for _ in 0..100 {
            assert_eq!(a.beta(2.0, 3.0), b.beta(2.0, 3.0));
        }
    }

    #[test]
    fn sanitize_clamps_and_maps_nan() {
        assert_eq!(sanitize_param(f64::NAN), 1e-3);
        assert_eq!(sanitize_param(-5.0), 1e-3);
        assert_eq!(sanitize_param(f64::INFINITY), 1e12);
        assert_eq!(sanitize_param(2.5), 2.5);
    }
}
