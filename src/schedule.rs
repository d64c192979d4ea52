//! Variable-ratio schedule generation.
//!
//! Thresholds are drawn uniformly from `[min, max]` (1..=8 by default, mean
//! 4.5). The sequence is sized from an expected four trials per threshold plus
//! a fixed margin so the ledger rarely needs to extend it.

use rand::Rng;

use crate::config::Config;

#[derive(Debug, Clone)]
pub struct ScheduleGenerator {
    pub min: u32,
    pub max: u32,
    pub trials_per_threshold: u32,
    pub margin: usize,
}

impl Default for ScheduleGenerator {
    fn default() -> Self {
        Self { min: 1, max: 8, trials_per_threshold: 4, margin: 50 }
    }
}

impl ScheduleGenerator {
    pub fn from_config(cfg: &Config) -> Self {
        let min = cfg.schedule_min.max(1);
        Self {
            min,
            max: cfg.schedule_max.max(min),
            trials_per_threshold: cfg.schedule_trials_per_threshold.max(1),
            margin: cfg.schedule_margin,
        }
    }

    /// Number of thresholds needed to cover `count_hint` trials.
    pub fn length_for(&self, count_hint: u32) -> usize {
        let per = self.trials_per_threshold.max(1) as u64;
        let base = (count_hint as u64 + per - 1) / per;
        base as usize + self.margin
    }

    pub fn generate<R: Rng + ?Sized>(&self, count_hint: u32, rng: &mut R) -> Vec<u32> {
        (0..self.length_for(count_hint))
            .map(|_| rng.gen_range(self.min..=self.max))
            .collect()
    }

    /// Append a fresh batch to an exhausted schedule.
    pub fn extend<R: Rng + ?Sized>(&self, schedule: &mut Vec<u32>, count_hint: u32, rng: &mut R) {
        let more = self.generate(count_hint, rng);
        schedule.extend(more);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_values_within_range() {
        let generator = ScheduleGenerator::default();
        let mut rng = StdRng::seed_from_u64(7);
        for n in [0u32, 1, 3, 4, 5, 100, 1000] {
            let s = generator.generate(n, &mut rng);
            assert!(s.iter().all(|&t| (1..=8).contains(&t)), "out of range for n={}", n);
        }
    }

    #[test]
    fn test_length_covers_hint_plus_margin() {
        let generator = ScheduleGenerator::default();
        let mut rng = StdRng::seed_from_u64(11);
        for n in 0u32..64 {
            let expected = ((n as f64) / 4.0).ceil() as usize + 50;
            assert_eq!(generator.generate(n, &mut rng).len(), expected);
        }
    }

    #[test]
    fn test_mean_is_four_and_a_half() {
        // Uniform over 1..=8, so the long-run mean is 4.5 rather than 4.
        let generator = ScheduleGenerator::default();
        let mut rng = StdRng::seed_from_u64(42);
        let s = generator.generate(400_000, &mut rng);
        let mean = s.iter().map(|&v| v as f64).sum::<f64>() / s.len() as f64;
        assert!((mean - 4.5).abs() < 0.05, "mean {}", mean);
        assert!(s.contains(&1) && s.contains(&8));
    }

    #[test]
    fn test_same_seed_same_schedule() {
        let generator = ScheduleGenerator::default();
        let a = generator.generate(40, &mut StdRng::seed_from_u64(3));
        let b = generator.generate(40, &mut StdRng::seed_from_u64(3));
        assert_eq!(a, b);
    }

    #[test]
    fn test_extend_appends() {
        let generator = ScheduleGenerator::default();
        let mut rng = StdRng::seed_from_u64(5);
        let mut s = vec![1, 2, 4];
        generator.extend(&mut s, 8, &mut rng);
        assert_eq!(&s[..3], &[1, 2, 4]);
        assert_eq!(s.len(), 3 + 52);
    }

    #[test]
    fn test_from_config_clamps_degenerate_range() {
        let mut cfg = Config::default();
        cfg.schedule_min = 0;
        cfg.schedule_max = 0;
        cfg.schedule_trials_per_threshold = 0;
        let generator = ScheduleGenerator::from_config(&cfg);
        let s = generator.generate(10, &mut StdRng::seed_from_u64(1));
        assert!(s.iter().all(|&t| t == 1));
    }
}
