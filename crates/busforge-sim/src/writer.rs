//! Writer / Flush Controller
//!
//! The synchronous pipeline: bind the scenario to the ICD, build the
//! schedule, then walk the event stream evaluating fields, encoding
//! words and accumulating messages into size- and time-bounded
//! MS1553-F1 packets. TMATS opens the file, a Time-F1 packet precedes
//! all data, and further time packets land on every interval boundary
//! with the data belonging to the closed window flushed first, in IPTS
//! order.
//!
//! The whole run is wall-clock free and single-threaded; for a fixed
//! seed the produced file is byte-for-byte reproducible.

use crate::generator::{CrossValues, EvalContext, WarningSink};
use crate::inject::{ErrorInjector, InjectionStats};
use crate::scenario::{bind, Bindings, Scenario, ScenarioError};
use crate::schedule::{build_schedule, ScheduleReport, ScheduledEvent};
use busforge_core::encode::{
    command_word, mode_command_word, status_word, EncodeError, StatusFlags,
};
use busforge_core::icd::{BusId, Icd, IcdError, SlotLayout, TransferType};
use busforge_core::packet::{
    block_status, data_type, ms1553_payload, time_f1_payload, tmats_payload, write_packet,
    Ms1553Message, PacketHeader, TimeFormat, TimeSource, HEADER_BYTES,
};
use busforge_core::timefmt::{default_start_time, ns_to_rtc, TimeOfDay};
use busforge_core::tmats::tmats_for_recording;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::io::{self, BufWriter, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Channel assignments for the produced file.
#[derive(Debug, Clone, Copy)]
pub struct WriterConfig {
    pub tmats_channel_id: u16,
    pub time_channel_id: u16,
    pub bus_a_channel_id: u16,
    pub bus_b_channel_id: u16,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            tmats_channel_id: 0x000,
            time_channel_id: 0x001,
            bus_a_channel_id: 0x002,
            bus_b_channel_id: 0x003,
        }
    }
}

/// Cooperative cancellation handle, checked between messages.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Errors terminating a generation run.
#[derive(Debug, Error)]
pub enum GenerateError {
    #[error(transparent)]
    Icd(#[from] IcdError),

    #[error(transparent)]
    Scenario(#[from] ScenarioError),

    #[error("message '{message}': {source}")]
    Encode {
        message: String,
        #[source]
        source: EncodeError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("generation cancelled")]
    Cancelled,

    #[error("IPTS regression on channel 0x{channel:03X}: {ipts} after {last}")]
    IptsRegression { channel: u16, ipts: u64, last: u64 },
}

/// Run statistics, also rendered as the one-line JSON summary.
#[derive(Debug, Clone, Serialize)]
pub struct GenerateStats {
    pub packets: u64,
    pub data_packets: u64,
    pub time_packets: u64,
    pub messages: u64,
    pub bytes_written: u64,
    pub duration_s: f64,
    pub warnings: BTreeMap<String, u64>,
    pub error_injection: Option<InjectionStats>,
    pub schedule: ScheduleReport,
}

impl GenerateStats {
    pub fn summary_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Generate a complete Chapter 10 file into `sink`.
///
/// Single-threaded and synchronous; runs to completion, early error or
/// cancellation. The sink is flushed and dropped on every exit path.
pub fn generate<W: Write>(
    icd: &Icd,
    scenario: &Scenario,
    config: &WriterConfig,
    sink: W,
    cancel: Option<&CancelToken>,
) -> Result<GenerateStats, GenerateError> {
    scenario.validate()?;
    let layouts = icd.validate()?;
    let bindings = bind(icd, scenario)?;
    let seed = scenario.seed.unwrap_or(0);

    let mut schedule_rng =
        StdRng::seed_from_u64(crate::generator::field_seed(seed, "__schedule__", "jitter"));
    let schedule = build_schedule(icd, scenario.duration_s, scenario.bus.jitter_ms, &mut schedule_rng);
    info!(
        scenario = %scenario.name,
        duration_s = scenario.duration_s,
        events = schedule.events.len(),
        "starting generation"
    );

    let injector = scenario
        .bus
        .errors
        .as_ref()
        .filter(|spec| spec.is_active())
        .map(|spec| {
            ErrorInjector::new(
                spec.clone(),
                crate::generator::field_seed(seed, "__inject__", "faults"),
            )
        });

    let rngs = bindings
        .messages
        .iter()
        .map(|m| m.seeds.iter().map(|&s| StdRng::seed_from_u64(s)).collect())
        .collect();
    let cross = CrossValues::new(&bindings.field_counts());

    let mut pipeline = Pipeline {
        icd,
        layouts,
        bindings,
        config,
        scenario,
        out: BufWriter::new(sink),
        start_time: scenario.start_time_utc.unwrap_or_else(default_start_time),
        sequences: HashMap::new(),
        last_ipts: HashMap::new(),
        accum: BTreeMap::new(),
        rngs,
        cross,
        warnings: WarningSink::default(),
        injector,
        packets: 0,
        data_packets: 0,
        time_packets: 0,
        messages: 0,
        bytes_written: 0,
    };
    pipeline.run(&schedule.events, cancel)?;

    let stats = GenerateStats {
        packets: pipeline.packets,
        data_packets: pipeline.data_packets,
        time_packets: pipeline.time_packets,
        messages: pipeline.messages,
        bytes_written: pipeline.bytes_written,
        duration_s: scenario.duration_s,
        warnings: pipeline
            .warnings
            .counts()
            .iter()
            .map(|(&k, &v)| (k.to_string(), v))
            .collect(),
        error_injection: pipeline.injector.map(|i| i.stats().clone()),
        schedule: schedule.report,
    };
    info!("generation complete: {}", stats.summary_json());
    Ok(stats)
}

#[derive(Debug, Default)]
struct Accumulator {
    messages: Vec<Ms1553Message>,
    bytes: usize,
}

struct Pipeline<'a, W: Write> {
    icd: &'a Icd,
    layouts: Vec<SlotLayout>,
    bindings: Bindings,
    config: &'a WriterConfig,
    scenario: &'a Scenario,
    out: BufWriter<W>,
    start_time: DateTime<Utc>,
    sequences: HashMap<u16, u8>,
    last_ipts: HashMap<u16, u64>,
    accum: BTreeMap<u16, Accumulator>,
    rngs: Vec<Vec<StdRng>>,
    cross: CrossValues,
    warnings: WarningSink,
    injector: Option<ErrorInjector>,
    packets: u64,
    data_packets: u64,
    time_packets: u64,
    messages: u64,
    bytes_written: u64,
}

impl<W: Write> Pipeline<'_, W> {
    fn run(
        &mut self,
        events: &[ScheduledEvent],
        cancel: Option<&CancelToken>,
    ) -> Result<(), GenerateError> {
        let duration_ns = (self.scenario.duration_s * 1e9).round() as u64;
        let interval_ns =
            ((self.scenario.bus.time_packet_interval_s * 1e9).round() as u64).max(1);

        self.write_tmats(events.len() as u64)?;
        self.write_time_packet(0)?;
        let mut next_time_ns = interval_ns;

        for event in events {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                self.flush_all_data()?;
                self.out.flush()?;
                return Err(GenerateError::Cancelled);
            }
            while event.time_ns >= next_time_ns {
                self.flush_all_data()?;
                self.write_time_packet(next_time_ns)?;
                next_time_ns += interval_ns;
            }
            self.emit(event)?;
        }

        while next_time_ns <= duration_ns {
            self.flush_all_data()?;
            self.write_time_packet(next_time_ns)?;
            next_time_ns += interval_ns;
        }
        self.flush_all_data()?;
        self.out.flush()?;
        Ok(())
    }

    /// Evaluate, encode and accumulate one scheduled message.
    fn emit(&mut self, event: &ScheduledEvent) -> Result<(), GenerateError> {
        let icd = self.icd;
        let mi = event.message;
        let msg = &icd.messages[mi];
        let time_s = event.time_ns as f64 / 1e9;

        // independent generators first, then expressions in dependency order
        let mut locals = vec![0.0f64; msg.words.len()];
        {
            let compiled = &self.bindings.messages[mi];
            for &fi in &compiled.eval_order {
                let value = {
                    let mut ctx = EvalContext {
                        time_s,
                        message_count: event.sequence,
                        rng: &mut self.rngs[mi][fi],
                        locals: &locals,
                        cross: &self.cross,
                        warnings: &mut self.warnings,
                    };
                    compiled.fields[fi].generator.evaluate(&mut ctx)
                };
                locals[fi] = value;
            }
        }
        for (fi, &value) in locals.iter().enumerate() {
            self.cross.set(mi, fi, value);
        }

        let encoded = msg
            .encode_data_words(&self.layouts[mi], &locals)
            .map_err(|source| GenerateError::Encode {
                message: msg.name.clone(),
                source,
            })?;
        for &fi in &encoded.clamped {
            self.warnings.record("ENCODE_CLAMP", || {
                format!("{}.{} clamped to its range", msg.name, msg.words[fi].name)
            });
        }
        let mut data_words = encoded.words;

        // bus identity, possibly flipped by a failover fault
        let primary_b = matches!(icd.bus, BusId::B);
        let on_failover = self
            .injector
            .as_mut()
            .map(|i| i.on_failover_bus(time_s))
            .unwrap_or(false);
        let bus_b = primary_b != on_failover;
        let channel = if bus_b {
            self.config.bus_b_channel_id
        } else {
            self.config.bus_a_channel_id
        };

        let mut flags = StatusFlags::default();
        let mut bsw = if bus_b { block_status::BUS_B } else { 0 };
        if msg.tr == TransferType::Rt2Rt {
            bsw |= block_status::RT_TO_RT;
        }
        if let Some(injector) = self.injector.as_mut() {
            injector.apply(&mut flags, &mut data_words, &mut bsw);
        }

        let rx_status = status_word(msg.rt, flags);
        let mut words;
        match msg.tr {
            TransferType::Bc2Rt => {
                words = vec![command_word(msg.rt, true, msg.sa, msg.wc)];
                words.extend_from_slice(&data_words);
                words.push(rx_status);
            }
            TransferType::Rt2Bc => {
                words = vec![command_word(msg.rt, false, msg.sa, msg.wc), rx_status];
                words.extend_from_slice(&data_words);
            }
            TransferType::Rt2Rt => {
                let rt2 = msg.rt2.unwrap_or(msg.rt);
                let sa2 = msg.sa2.unwrap_or(msg.sa);
                words = vec![
                    command_word(msg.rt, true, msg.sa, msg.wc),
                    command_word(rt2, false, sa2, msg.wc),
                    status_word(rt2, StatusFlags::default()),
                ];
                words.extend_from_slice(&data_words);
                words.push(rx_status);
            }
            TransferType::Mode => {
                words = vec![mode_command_word(msg.rt, msg.sa, msg.wc), rx_status];
                words.extend_from_slice(&data_words);
            }
        }

        let ipts = ns_to_rtc(event.time_ns);
        let last = self.last_ipts.get(&channel).copied().unwrap_or(0);
        if ipts < last {
            return Err(GenerateError::IptsRegression {
                channel,
                ipts,
                last,
            });
        }
        self.last_ipts.insert(channel, ipts);

        let message = Ms1553Message {
            ipts,
            status: bsw,
            gap: 0,
            words,
        };
        let size = message.packed_size();
        let target = self.scenario.bus.packet_bytes_target;
        let needs_flush = {
            let accum = self.accum.entry(channel).or_default();
            !accum.messages.is_empty() && HEADER_BYTES + 4 + accum.bytes + size > target
        };
        if needs_flush {
            self.flush_channel(channel)?;
        }
        let accum = self.accum.entry(channel).or_default();
        accum.bytes += size;
        accum.messages.push(message);
        Ok(())
    }

    /// Emit the accumulated packet for one channel.
    fn flush_channel(&mut self, channel: u16) -> Result<(), GenerateError> {
        let (messages, first_ipts) = {
            let Some(accum) = self.accum.get_mut(&channel) else {
                return Ok(());
            };
            if accum.messages.is_empty() {
                return Ok(());
            }
            accum.bytes = 0;
            let messages = std::mem::take(&mut accum.messages);
            let first = messages[0].ipts;
            (messages, first)
        };

        let payload = ms1553_payload(&messages)?;
        let sequence = self.next_sequence(channel);
        let written = write_packet(
            &mut self.out,
            PacketHeader {
                channel_id: channel,
                data_type: data_type::MS1553_F1,
                sequence,
                rtc: first_ipts,
            },
            &payload,
        )?;
        debug!(
            channel,
            messages = messages.len(),
            bytes = written,
            "flushed 1553 packet"
        );
        self.packets += 1;
        self.data_packets += 1;
        self.messages += messages.len() as u64;
        self.bytes_written += written as u64;
        Ok(())
    }

    /// Flush every pending data packet, ordered by first IPTS.
    fn flush_all_data(&mut self) -> Result<(), GenerateError> {
        let mut pending: Vec<(u64, u16)> = self
            .accum
            .iter()
            .filter(|(_, a)| !a.messages.is_empty())
            .map(|(&channel, a)| (a.messages[0].ipts, channel))
            .collect();
        pending.sort_unstable();
        for (_, channel) in pending {
            self.flush_channel(channel)?;
        }
        Ok(())
    }

    fn write_tmats(&mut self, total_messages: u64) -> Result<(), GenerateError> {
        let bus_channel = match self.icd.bus {
            BusId::A => self.config.bus_a_channel_id,
            BusId::B => self.config.bus_b_channel_id,
        };
        let text = tmats_for_recording(
            self.icd,
            &self.scenario.name,
            self.start_time,
            self.config.time_channel_id,
            bus_channel,
            self.scenario.duration_s,
            total_messages,
        );
        let sequence = self.next_sequence(self.config.tmats_channel_id);
        let written = write_packet(
            &mut self.out,
            PacketHeader {
                channel_id: self.config.tmats_channel_id,
                data_type: data_type::TMATS,
                sequence,
                rtc: 0,
            },
            &tmats_payload(&text),
        )?;
        self.packets += 1;
        self.bytes_written += written as u64;
        Ok(())
    }

    fn write_time_packet(&mut self, time_ns: u64) -> Result<(), GenerateError> {
        let tod = TimeOfDay::at(self.start_time, time_ns);
        let payload = time_f1_payload(tod, TimeSource::Internal, TimeFormat::IrigB);
        let sequence = self.next_sequence(self.config.time_channel_id);
        let written = write_packet(
            &mut self.out,
            PacketHeader {
                channel_id: self.config.time_channel_id,
                data_type: data_type::TIME_F1,
                sequence,
                rtc: ns_to_rtc(time_ns),
            },
            &payload,
        )?;
        self.packets += 1;
        self.time_packets += 1;
        self.bytes_written += written as u64;
        Ok(())
    }

    fn next_sequence(&mut self, channel: u16) -> u8 {
        let entry = self.sequences.entry(channel).or_insert(0);
        let current = *entry;
        *entry = entry.wrapping_add(1);
        current
    }
}
