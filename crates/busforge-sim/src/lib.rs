//! # busforge-sim
//!
//! The generation pipeline that turns an ICD plus a scenario into an
//! IRIG-106 Chapter 10 recording:
//!
//! - **Generators**: per-field data sources (constants, counters,
//!   patterns, random distributions, waveforms and expressions) with
//!   deterministic per-field random streams
//! - **Scenario**: YAML model binding generators to ICD fields, with
//!   defaults resolution and dependency ordering
//! - **Scheduler**: time-ordered emission events with rate, tie-break
//!   and jitter rules, plus bus utilization reporting
//! - **Error injection**: probability-driven 1553 fault simulation
//! - **Writer**: the synchronous [`generate`](writer::generate) entry
//!   point producing TMATS, Time-F1 and MS1553-F1 packets in
//!   chronological order
//!
//! The pipeline is single-threaded and wall-clock free: for a fixed seed
//! the output is byte-for-byte reproducible.

pub mod generator;
pub mod inject;
pub mod scenario;
pub mod schedule;
pub mod writer;

pub use scenario::{Scenario, ScenarioError};
pub use schedule::{build_schedule, Schedule, ScheduleReport};
pub use writer::{generate, CancelToken, GenerateError, GenerateStats, WriterConfig};
