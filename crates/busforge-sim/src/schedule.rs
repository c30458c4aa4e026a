//! Bus Scheduler
//!
//! Expands the ICD's message rates into a finite, time-ordered event
//! stream over `[0, duration)`. Emission times are computed in integer
//! nanoseconds (`round(k * 1e9 / rate)`) so long runs do not drift.
//! Ties are broken by the stable key `(rt, sa, declaration order)`.
//!
//! Optional bounded jitter perturbs each emission by up to +/- J ms; a
//! jittered time is clamped against its immediate predecessor so the
//! global order is preserved (reorder bound 1, surfaced in the report).
//!
//! The minor/major frame figures and per-second wire utilization are
//! advisory: they are reported, never enforced, though utilization above
//! 100% raises a warning.

use busforge_core::icd::Icd;
use rand::rngs::StdRng;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, warn};

/// MIL-STD-1553 line rate in bits per second.
pub const BUS_BITS_PER_SECOND: f64 = 1_000_000.0;

/// One scheduled message emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledEvent {
    /// Emission time in nanoseconds since run start
    pub time_ns: u64,
    /// Index of the message within the ICD
    pub message: usize,
    /// Emission index of this message (0-based)
    pub sequence: u64,
}

/// Advisory timing figures and warnings for one schedule.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleReport {
    pub total_events: usize,
    pub duration_s: f64,
    /// GCD of message periods
    pub minor_frame_ns: u64,
    /// LCM of message periods, capped at the 1 s fallback
    pub major_frame_ns: u64,
    pub peak_utilization_percent: f64,
    pub jitter_clamped_events: u64,
    /// Jitter clamps against the immediate predecessor only
    pub jitter_reorder_bound: u32,
    pub warnings: Vec<String>,
}

/// A complete, time-ordered schedule.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub events: Vec<ScheduledEvent>,
    pub report: ScheduleReport,
}

/// Build the event stream for `[0, duration_s)`.
pub fn build_schedule(icd: &Icd, duration_s: f64, jitter_ms: f64, rng: &mut StdRng) -> Schedule {
    let duration_ns = (duration_s * 1e9).round() as u64;

    let mut events = Vec::new();
    for (mi, msg) in icd.messages.iter().enumerate() {
        let mut k = 0u64;
        loop {
            let time_ns = (k as f64 * 1e9 / msg.rate_hz).round() as u64;
            if time_ns >= duration_ns {
                break;
            }
            events.push(ScheduledEvent {
                time_ns,
                message: mi,
                sequence: k,
            });
            k += 1;
        }
    }
    events.sort_by_key(|e| {
        let msg = &icd.messages[e.message];
        (e.time_ns, msg.rt, msg.sa, e.message)
    });

    let mut warnings = Vec::new();
    let jitter_clamped = apply_jitter(&mut events, jitter_ms, rng);
    if jitter_clamped > 0 {
        warnings.push(format!(
            "jitter clamped {} emission(s) to preserve ordering",
            jitter_clamped
        ));
    }

    let peak = peak_utilization(icd, &events, duration_s);
    if peak > 100.0 {
        let message = format!("bus utilization peaks at {:.1}% of line capacity", peak);
        warn!("{}", message);
        warnings.push(message);
    }

    let (minor, major) = frame_periods(icd);
    debug!(
        events = events.len(),
        minor_frame_ns = minor,
        major_frame_ns = major,
        "schedule built"
    );

    let report = ScheduleReport {
        total_events: events.len(),
        duration_s,
        minor_frame_ns: minor,
        major_frame_ns: major,
        peak_utilization_percent: peak,
        jitter_clamped_events: jitter_clamped,
        jitter_reorder_bound: 1,
        warnings,
    };
    Schedule { events, report }
}

/// Perturb emission times by up to +/- `jitter_ms`, clamping each time
/// to its predecessor so order is preserved. Returns the clamp count.
fn apply_jitter(events: &mut [ScheduledEvent], jitter_ms: f64, rng: &mut StdRng) -> u64 {
    if jitter_ms <= 0.0 || events.is_empty() {
        return 0;
    }
    let jitter_ns = jitter_ms * 1e6;
    let mut clamped = 0u64;
    let mut previous = 0u64;
    for event in events.iter_mut() {
        let offset: f64 = rng.gen_range(-jitter_ns..=jitter_ns);
        let jittered = (event.time_ns as f64 + offset).max(0.0) as u64;
        if jittered < previous {
            event.time_ns = previous;
            clamped += 1;
        } else {
            event.time_ns = jittered;
        }
        previous = event.time_ns;
    }
    clamped
}

/// Highest per-second wire load as a percentage of line capacity.
fn peak_utilization(icd: &Icd, events: &[ScheduledEvent], duration_s: f64) -> f64 {
    let seconds = (duration_s.ceil() as usize).max(1);
    let mut bits = vec![0u64; seconds];
    for event in events {
        let bucket = ((event.time_ns / 1_000_000_000) as usize).min(seconds - 1);
        bits[bucket] += icd.messages[event.message].wire_bits();
    }
    let peak = bits.iter().copied().max().unwrap_or(0);
    peak as f64 / BUS_BITS_PER_SECOND * 100.0
}

/// Minor frame = GCD of message periods; major frame = their LCM, with
/// a 1 s fallback when the LCM is unbounded or exceeds a second.
fn frame_periods(icd: &Icd) -> (u64, u64) {
    const FALLBACK_NS: u64 = 1_000_000_000;
    let periods: Vec<u64> = icd
        .messages
        .iter()
        .map(|m| (1e9 / m.rate_hz).round() as u64)
        .filter(|&p| p > 0)
        .collect();
    if periods.is_empty() {
        return (FALLBACK_NS, FALLBACK_NS);
    }
    let minor = periods.iter().copied().fold(0, gcd);
    let major = periods
        .iter()
        .copied()
        .try_fold(1u64, |acc, p| {
            let g = gcd(acc, p);
            acc.checked_mul(p / g)
        })
        .filter(|&l| l <= FALLBACK_NS)
        .unwrap_or(FALLBACK_NS);
    (minor, major)
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn icd(rates: &[(f64, u8, u8)]) -> Icd {
        let messages = rates
            .iter()
            .enumerate()
            .map(|(i, (rate, rt, sa))| {
                format!(
                    "  - name: M{}\n    rate_hz: {}\n    rt: {}\n    tr: BC2RT\n    sa: {}\n    wc: 1\n    words:\n      - {{ name: data, encode: u16, const: 0 }}\n",
                    i, rate, rt, sa
                )
            })
            .collect::<Vec<_>>()
            .join("");
        Icd::from_yaml(&format!("bus: A\nmessages:\n{}", messages)).unwrap()
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(0)
    }

    #[test]
    fn test_rate_1hz_duration_n() {
        let icd = icd(&[(1.0, 1, 1)]);
        let schedule = build_schedule(&icd, 3.0, 0.0, &mut rng());
        let times: Vec<u64> = schedule.events.iter().map(|e| e.time_ns).collect();
        assert_eq!(times, vec![0, 1_000_000_000, 2_000_000_000]);
        let sequences: Vec<u64> = schedule.events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[test]
    fn test_two_rates_event_union() {
        // 50 Hz + 20 Hz over 1 s: 70 events total
        let icd = icd(&[(50.0, 2, 1), (20.0, 1, 1)]);
        let schedule = build_schedule(&icd, 1.0, 0.0, &mut rng());
        assert_eq!(schedule.events.len(), 70);

        // strictly non-decreasing
        for pair in schedule.events.windows(2) {
            assert!(pair[0].time_ns <= pair[1].time_ns);
        }

        // at t=0 both fire; lower rt (message index 1) precedes
        assert_eq!(schedule.events[0].time_ns, 0);
        assert_eq!(schedule.events[0].message, 1);
        assert_eq!(schedule.events[1].message, 0);
    }

    #[test]
    fn test_no_drift_at_odd_rates() {
        let icd = icd(&[(3.0, 1, 1)]);
        let schedule = build_schedule(&icd, 10.0, 0.0, &mut rng());
        assert_eq!(schedule.events.len(), 30);
        // k=3 lands exactly on 1 s
        assert_eq!(schedule.events[3].time_ns, 1_000_000_000);
    }

    #[test]
    fn test_jitter_preserves_order() {
        let icd = icd(&[(100.0, 1, 1), (50.0, 2, 2)]);
        let schedule = build_schedule(&icd, 2.0, 5.0, &mut rng());
        for pair in schedule.events.windows(2) {
            assert!(pair[0].time_ns <= pair[1].time_ns);
        }
        assert_eq!(schedule.report.jitter_reorder_bound, 1);
    }

    #[test]
    fn test_utilization_below_capacity() {
        // 3 messages * 1000 Hz * 3 wire words * 20 bits = 180 kbit/s
        let icd = icd(&[(1000.0, 1, 1), (1000.0, 2, 1), (1000.0, 3, 1)]);
        let schedule = build_schedule(&icd, 1.0, 0.0, &mut rng());
        assert!((schedule.report.peak_utilization_percent - 18.0).abs() < 0.5);
        assert!(schedule.report.warnings.is_empty());
    }

    #[test]
    fn test_utilization_overload_warns() {
        // 18 single-word messages at 1000 Hz: 18 * 60 kbit/s = 108% load
        let specs: Vec<(f64, u8, u8)> = (0..18).map(|i| (1000.0, i as u8, 1)).collect();
        let icd = icd(&specs);
        let schedule = build_schedule(&icd, 1.0, 0.0, &mut rng());
        assert!(schedule.report.peak_utilization_percent > 100.0);
        assert!(!schedule.report.warnings.is_empty());
    }

    #[test]
    fn test_frame_periods() {
        // 50 Hz and 20 Hz: periods 20 ms and 50 ms, gcd 10 ms, lcm 100 ms
        let icd = icd(&[(50.0, 1, 1), (20.0, 2, 1)]);
        let schedule = build_schedule(&icd, 1.0, 0.0, &mut rng());
        assert_eq!(schedule.report.minor_frame_ns, 10_000_000);
        assert_eq!(schedule.report.major_frame_ns, 100_000_000);
    }

    #[test]
    fn test_major_frame_fallback() {
        // 7 Hz and 0.9 Hz: the lcm blows past a second, fall back
        let icd = icd(&[(7.0, 1, 1), (0.9, 2, 1)]);
        let schedule = build_schedule(&icd, 1.0, 0.0, &mut rng());
        assert_eq!(schedule.report.major_frame_ns, 1_000_000_000);
    }
}
