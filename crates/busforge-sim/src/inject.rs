//! 1553 Fault Injection
//!
//! Probability-driven corruption of generated messages so downstream
//! tooling can exercise its error paths: status-word fault flags,
//! block-status error bits, word-count mismatches and a one-shot bus
//! failover. At most one fault is injected per message. The injector
//! owns its own random stream so fault placement is reproducible and
//! independent of field data.

use busforge_core::encode::StatusFlags;
use busforge_core::packet::block_status;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Injection rates, percentages in `[0, 100]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorInjectionSpec {
    pub parity_error_percent: f64,
    pub no_response_percent: f64,
    pub late_response_percent: f64,
    pub word_count_error_percent: f64,
    /// Switch traffic to the other bus from this time onward
    pub bus_failover_time_s: Option<f64>,
}

impl ErrorInjectionSpec {
    /// Whether any fault kind can ever fire.
    pub fn is_active(&self) -> bool {
        self.parity_error_percent > 0.0
            || self.no_response_percent > 0.0
            || self.late_response_percent > 0.0
            || self.word_count_error_percent > 0.0
            || self.bus_failover_time_s.is_some()
    }
}

/// Counts of injected faults, folded into the run statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InjectionStats {
    pub parity_errors: u64,
    pub no_responses: u64,
    pub late_responses: u64,
    pub word_count_errors: u64,
    pub failed_over: bool,
}

/// Stateful fault injector for one run.
#[derive(Debug)]
pub struct ErrorInjector {
    spec: ErrorInjectionSpec,
    rng: StdRng,
    stats: InjectionStats,
}

impl ErrorInjector {
    pub fn new(spec: ErrorInjectionSpec, seed: u64) -> Self {
        Self {
            spec,
            rng: StdRng::seed_from_u64(seed),
            stats: InjectionStats::default(),
        }
    }

    /// Whether traffic at `time_s` rides the failover bus.
    pub fn on_failover_bus(&mut self, time_s: f64) -> bool {
        match self.spec.bus_failover_time_s {
            Some(at) if time_s >= at => {
                self.stats.failed_over = true;
                true
            }
            _ => false,
        }
    }

    /// Possibly corrupt one message. Mutates the RT status flags, the
    /// data words and the block status word in place.
    pub fn apply(
        &mut self,
        flags: &mut StatusFlags,
        data_words: &mut Vec<u16>,
        bsw: &mut u16,
    ) {
        if self.roll(self.spec.no_response_percent) {
            flags.busy = true;
            *bsw |= block_status::RESPONSE_TIMEOUT;
            self.stats.no_responses += 1;
        } else if self.roll(self.spec.parity_error_percent) {
            flags.parity_error = true;
            self.stats.parity_errors += 1;
        } else if self.roll(self.spec.late_response_percent) {
            flags.instrumentation = true;
            self.stats.late_responses += 1;
        } else if self.roll(self.spec.word_count_error_percent) {
            flags.message_error = true;
            *bsw |= block_status::WORD_COUNT_ERROR;
            if data_words.len() > 1 && self.rng.gen::<bool>() {
                data_words.pop();
            } else {
                let garbage = self.rng.gen::<u16>();
                data_words.push(garbage);
            }
            self.stats.word_count_errors += 1;
        }
    }

    fn roll(&mut self, percent: f64) -> bool {
        percent > 0.0 && self.rng.gen::<f64>() * 100.0 < percent
    }

    pub fn stats(&self) -> &InjectionStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_yaml(yaml: &str) -> ErrorInjectionSpec {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_inactive_by_default() {
        assert!(!ErrorInjectionSpec::default().is_active());
        assert!(spec_yaml("parity_error_percent: 1").is_active());
        assert!(spec_yaml("bus_failover_time_s: 10").is_active());
    }

    #[test]
    fn test_no_faults_at_zero_rates() {
        let mut injector = ErrorInjector::new(ErrorInjectionSpec::default(), 1);
        let mut flags = StatusFlags::default();
        let mut data = vec![1, 2, 3];
        let mut bsw = 0u16;
        for _ in 0..1000 {
            injector.apply(&mut flags, &mut data, &mut bsw);
        }
        assert_eq!(flags, StatusFlags::default());
        assert_eq!(data, vec![1, 2, 3]);
        assert_eq!(bsw, 0);
    }

    #[test]
    fn test_full_rate_always_fires() {
        let spec = spec_yaml("no_response_percent: 100");
        let mut injector = ErrorInjector::new(spec, 1);
        let mut flags = StatusFlags::default();
        let mut data = vec![1];
        let mut bsw = 0u16;
        injector.apply(&mut flags, &mut data, &mut bsw);
        assert!(flags.busy);
        assert_ne!(bsw & block_status::RESPONSE_TIMEOUT, 0);
        assert_eq!(injector.stats().no_responses, 1);
    }

    #[test]
    fn test_word_count_fault_changes_length() {
        let spec = spec_yaml("word_count_error_percent: 100");
        let mut injector = ErrorInjector::new(spec, 7);
        let mut changed = 0;
        for _ in 0..20 {
            let mut flags = StatusFlags::default();
            let mut data = vec![1, 2, 3, 4];
            let mut bsw = 0u16;
            injector.apply(&mut flags, &mut data, &mut bsw);
            assert!(flags.message_error);
            if data.len() != 4 {
                changed += 1;
            }
        }
        assert_eq!(changed, 20, "every injection must change the word count");
    }

    #[test]
    fn test_failover_latches() {
        let spec = spec_yaml("bus_failover_time_s: 5");
        let mut injector = ErrorInjector::new(spec, 1);
        assert!(!injector.on_failover_bus(4.9));
        assert!(injector.on_failover_bus(5.0));
        assert!(injector.on_failover_bus(100.0));
        assert!(injector.stats().failed_over);
    }

    #[test]
    fn test_deterministic_for_seed() {
        let run = |seed: u64| -> Vec<bool> {
            let mut injector = ErrorInjector::new(spec_yaml("parity_error_percent: 10"), seed);
            (0..100)
                .map(|_| {
                    let mut flags = StatusFlags::default();
                    let mut data = vec![0];
                    let mut bsw = 0;
                    injector.apply(&mut flags, &mut data, &mut bsw);
                    flags.parity_error
                })
                .collect()
        };
        assert_eq!(run(3), run(3));
    }
}
