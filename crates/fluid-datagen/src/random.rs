//! Seeded uniform key source with an empty-read guard gap.

use crate::distribution::{Distribution, Uniform};
use crate::{KeySource, KEY_DOMAIN, KEY_MIDDLE_LEFT, KEY_MIDDLE_RIGHT};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Uniform keys over the two flanks of the domain.
///
/// The middle tenth of the domain is never produced by [`KeySource::key`],
/// so [`KeySource::empty_point_key`] can hand out keys that are valid for
/// the key codec but certain to miss the tree.
#[derive(Debug)]
pub struct RandomKeySource {
    rng: StdRng,
    dist_left: Uniform,
    dist_right: Uniform,
    dist_gap: Uniform,
}

impl RandomKeySource {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            dist_left: Uniform::new(0, KEY_MIDDLE_LEFT - 1),
            dist_right: Uniform::new(KEY_MIDDLE_RIGHT + 1, KEY_DOMAIN),
            dist_gap: Uniform::new(KEY_MIDDLE_LEFT, KEY_MIDDLE_RIGHT),
        }
    }
}

impl KeySource for RandomKeySource {
    fn key(&mut self) -> String {
        let key = if self.rng.gen::<bool>() {
            self.dist_left.sample(&mut self.rng)
        } else {
            self.dist_right.sample(&mut self.rng)
        };
        key.to_string()
    }

    fn empty_point_key(&mut self) -> String {
        self.dist_gap.sample(&mut self.rng).to_string()
    }
}
