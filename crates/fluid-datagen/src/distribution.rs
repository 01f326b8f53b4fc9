//! Integer distributions over the key domain.

use rand::rngs::StdRng;
use rand::Rng;

/// A distribution over `1..=n` sampled with an explicit generator.
pub trait Distribution {
    fn sample(&self, rng: &mut StdRng) -> u64;
}

/// Uniform over the closed range `low..=high`.
#[derive(Debug, Clone)]
pub struct Uniform {
    low: u64,
    high: u64,
}

impl Uniform {
    pub fn new(low: u64, high: u64) -> Self {
        assert!(low <= high);
        Self { low, high }
    }
}

impl Distribution for Uniform {
    fn sample(&self, rng: &mut StdRng) -> u64 {
        rng.gen_range(self.low..=self.high)
    }
}

/// Zipf over `1..=n` with exponent `s`, sampled by rejection-inversion
/// (Hörmann & Derflinger). Constant time per draw, no harmonic table, so it
/// stays cheap even for a domain of 10^9 ranks.
#[derive(Debug, Clone)]
pub struct Zipf {
    n: u64,
    s: f64,
    h_x1: f64,
    h_n: f64,
}

impl Zipf {
    pub fn new(n: u64, s: f64) -> Self {
        assert!(n >= 1);
        assert!(s > 0.0);
        let mut zipf = Self {
            n,
            s,
            h_x1: 0.0,
            h_n: 0.0,
        };
        zipf.h_x1 = zipf.h(1.5) - 1.0;
        zipf.h_n = zipf.h(n as f64 + 0.5);
        zipf
    }

    /// Integral of the density: H(x) = (x^(1-s) - 1) / (1 - s), or ln(x)
    /// in the s → 1 limit.
    fn h(&self, x: f64) -> f64 {
        let one_minus_s = 1.0 - self.s;
        if one_minus_s.abs() < 1e-9 {
            x.ln()
        } else {
            (one_minus_s * x.ln()).exp_m1() / one_minus_s
        }
    }

    fn h_inv(&self, x: f64) -> f64 {
        let one_minus_s = 1.0 - self.s;
        if one_minus_s.abs() < 1e-9 {
            x.exp()
        } else {
            ((x * one_minus_s).ln_1p() / one_minus_s).exp()
        }
    }
}

impl Distribution for Zipf {
    fn sample(&self, rng: &mut StdRng) -> u64 {
        loop {
            let u = self.h_x1 + rng.gen::<f64>() * (self.h_n - self.h_x1);
            let x = self.h_inv(u);
            let k = x.round().clamp(1.0, self.n as f64);
            // Accept iff u falls under the density bar at rank k.
            if u >= self.h(k + 0.5) - (-self.s * k.ln()).exp() {
                return k as u64;
            }
        }
    }
}

/// Zipf-distributed keys over the domain, newest-rank-hottest.
#[derive(Debug)]
pub struct ZipfKeySource {
    rng: StdRng,
    dist: Zipf,
}

impl ZipfKeySource {
    pub fn new(seed: u64, domain: u64, exponent: f64) -> Self {
        use rand::SeedableRng;
        Self {
            rng: StdRng::seed_from_u64(seed),
            dist: Zipf::new(domain, exponent),
        }
    }
}

impl crate::KeySource for ZipfKeySource {
    fn key(&mut self) -> String {
        self.dist.sample(&mut self.rng).to_string()
    }

    fn empty_point_key(&mut self) -> String {
        // Ranks live in 1..=n; shifting past the domain keeps the key
        // parseable while guaranteeing a miss.
        (self.dist.n + self.dist.sample(&mut self.rng)).to_string()
    }
}
