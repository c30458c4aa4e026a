//! Post-Write Validator
//!
//! Streams a produced Chapter 10 file back and checks the structural
//! guarantees the writer is supposed to uphold: header sync/length/
//! checksum discipline, TMATS-first bootstrapping, time before data,
//! CSDW/IPDH arithmetic, per-channel IPTS monotonicity and 1553 word
//! counts. Each violation becomes a [`Finding`] with a severity, a
//! stable code and the byte offset of the offending packet.

use crate::encode::{decode_command_word, status_word_rt};
use crate::packet::{block_status, data_type, HEADER_BYTES, SYNC};
use byteorder::{LittleEndian, ReadBytesExt};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read};
use std::path::Path;
use tracing::debug;

/// Diagnostic severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// One structural diagnostic.
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    pub severity: Severity,
    pub code: &'static str,
    /// Byte offset of the packet the finding refers to
    pub offset: u64,
    pub message: String,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} [{}] at 0x{:08X}: {}",
            self.severity, self.code, self.offset, self.message
        )
    }
}

/// Validation outcome for one file.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub findings: Vec<Finding>,
    pub packets: u64,
    pub messages: u64,
    pub time_packets: u64,
}

impl ValidationReport {
    /// True when no Error-severity findings were recorded.
    pub fn ok(&self) -> bool {
        !self
            .findings
            .iter()
            .any(|f| f.severity == Severity::Error)
    }

    /// Error-severity findings.
    pub fn errors(&self) -> impl Iterator<Item = &Finding> {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::Error)
    }

    fn push(&mut self, severity: Severity, code: &'static str, offset: u64, message: String) {
        self.findings.push(Finding {
            severity,
            code,
            offset,
            message,
        });
    }
}

/// Validate a file on disk.
pub fn validate_file(path: &Path) -> io::Result<ValidationReport> {
    validate_stream(std::fs::File::open(path)?)
}

/// Validate any readable byte stream.
pub fn validate_stream<R: Read>(mut reader: R) -> io::Result<ValidationReport> {
    let mut report = ValidationReport::default();
    let mut offset: u64 = 0;
    let mut tmats_count = 0u64;
    let mut time_seen = false;
    let mut last_ipts: HashMap<u16, u64> = HashMap::new();
    let mut last_sequence: HashMap<u16, u8> = HashMap::new();

    loop {
        let mut head = [0u8; HEADER_BYTES];
        match read_fully(&mut reader, &mut head)? {
            0 => break,
            n if n < HEADER_BYTES => {
                report.push(
                    Severity::Error,
                    "TRUNCATED_HEADER",
                    offset,
                    format!("{} trailing bytes, expected a 24-byte header", n),
                );
                break;
            }
            _ => {}
        }

        let sync = u16::from_le_bytes([head[0], head[1]]);
        let channel_id = u16::from_le_bytes([head[2], head[3]]);
        let packet_length = u32::from_le_bytes([head[4], head[5], head[6], head[7]]) as u64;
        let data_length = u32::from_le_bytes([head[8], head[9], head[10], head[11]]) as u64;
        let sequence = head[13];
        let dt = head[15];

        if sync != SYNC {
            report.push(
                Severity::Error,
                "SYNC",
                offset,
                format!("bad sync pattern 0x{:04X}", sync),
            );
            break;
        }
        if packet_length % 4 != 0 {
            report.push(
                Severity::Error,
                "ALIGNMENT",
                offset,
                format!("packet_length {} not a multiple of 4", packet_length),
            );
        }
        if packet_length < HEADER_BYTES as u64 + data_length
            || packet_length > HEADER_BYTES as u64 + data_length + 3
        {
            report.push(
                Severity::Error,
                "LENGTH",
                offset,
                format!(
                    "packet_length {} inconsistent with data_length {}",
                    packet_length, data_length
                ),
            );
            break;
        }
        let stored_checksum = u16::from_le_bytes([head[22], head[23]]);
        let computed = crate::packet::header_checksum(&head);
        if stored_checksum != computed {
            report.push(
                Severity::Error,
                "CHECKSUM",
                offset,
                format!(
                    "header checksum 0x{:04X}, computed 0x{:04X}",
                    stored_checksum, computed
                ),
            );
        }

        let mut body = vec![0u8; (packet_length - HEADER_BYTES as u64) as usize];
        let got = read_fully(&mut reader, &mut body)?;
        if got < body.len() {
            report.push(
                Severity::Error,
                "TRUNCATED_PACKET",
                offset,
                format!("packet body {} of {} bytes", got, body.len()),
            );
            break;
        }
        let payload = &body[..data_length as usize];

        if report.packets == 0 && dt != data_type::TMATS {
            report.push(
                Severity::Error,
                "TMATS_FIRST",
                offset,
                format!("first packet has data type 0x{:02X}, expected TMATS", dt),
            );
        }

        if let Some(prev) = last_sequence.insert(channel_id, sequence) {
            if sequence != prev.wrapping_add(1) {
                report.push(
                    Severity::Warning,
                    "SEQUENCE_GAP",
                    offset,
                    format!(
                        "channel 0x{:03X} sequence jumped {} -> {}",
                        channel_id, prev, sequence
                    ),
                );
            }
        }

        match dt {
            data_type::TMATS => {
                tmats_count += 1;
                if tmats_count > 1 {
                    report.push(
                        Severity::Error,
                        "TMATS_DUPLICATE",
                        offset,
                        "more than one TMATS packet".into(),
                    );
                }
                check_tmats(payload, offset, &mut report);
            }
            data_type::TIME_F1 => {
                time_seen = true;
                report.time_packets += 1;
                check_time_f1(payload, offset, &mut report);
            }
            data_type::MS1553_F1 => {
                if !time_seen {
                    report.push(
                        Severity::Error,
                        "TIME_BEFORE_DATA",
                        offset,
                        "1553 data packet before any Time-F1 packet".into(),
                    );
                }
                check_ms1553(payload, channel_id, offset, &mut last_ipts, &mut report);
            }
            other => {
                report.push(
                    Severity::Warning,
                    "UNKNOWN_TYPE",
                    offset,
                    format!("unrecognized data type 0x{:02X}", other),
                );
            }
        }

        report.packets += 1;
        offset += packet_length;
    }

    if report.packets == 0 {
        report.push(Severity::Error, "EMPTY", 0, "file contains no packets".into());
    }
    if tmats_count == 0 && report.packets > 0 {
        report.push(Severity::Error, "TMATS_MISSING", 0, "no TMATS packet".into());
    }
    if report.time_packets == 0 && report.packets > 0 {
        report.push(
            Severity::Error,
            "TIME_MISSING",
            0,
            "no Time-F1 packet".into(),
        );
    }
    debug!(
        packets = report.packets,
        messages = report.messages,
        findings = report.findings.len(),
        "validation complete"
    );
    Ok(report)
}

fn check_tmats(payload: &[u8], offset: u64, report: &mut ValidationReport) {
    if payload.len() <= 4 {
        report.push(
            Severity::Warning,
            "TMATS_EMPTY",
            offset,
            "TMATS packet has no body".into(),
        );
        return;
    }
    let text = String::from_utf8_lossy(&payload[4..]);
    for required in ["G\\106", "G\\DSI\\N"] {
        if !text.contains(required) {
            report.push(
                Severity::Warning,
                "TMATS_ATTRIBUTE",
                offset,
                format!("TMATS missing required attribute {}", required),
            );
        }
    }
}

fn check_time_f1(payload: &[u8], offset: u64, report: &mut ValidationReport) {
    if payload.len() < 12 {
        report.push(
            Severity::Error,
            "TIME_BODY",
            offset,
            format!("Time-F1 payload {} bytes, expected 12", payload.len()),
        );
        return;
    }
    let mut words = [0u16; 4];
    for (i, word) in words.iter_mut().enumerate() {
        *word = u16::from_le_bytes([payload[4 + i * 2], payload[5 + i * 2]]);
    }
    let tod = crate::timefmt::TimeOfDay::from_words(words);
    if tod.second > 59 || tod.minute > 59 || tod.hour > 23 {
        report.push(
            Severity::Warning,
            "TIME_FIELDS",
            offset,
            format!(
                "implausible time of day {:02}:{:02}:{:02}",
                tod.hour, tod.minute, tod.second
            ),
        );
    }
    if tod.day_of_year == 0 || tod.day_of_year > 366 {
        report.push(
            Severity::Warning,
            "TIME_FIELDS",
            offset,
            format!("implausible day of year {}", tod.day_of_year),
        );
    }
}

fn check_ms1553(
    payload: &[u8],
    channel_id: u16,
    offset: u64,
    last_ipts: &mut HashMap<u16, u64>,
    report: &mut ValidationReport,
) {
    let mut cursor = payload;
    let Ok(csdw) = cursor.read_u32::<LittleEndian>() else {
        report.push(
            Severity::Error,
            "CSDW",
            offset,
            "MS1553 payload shorter than its CSDW".into(),
        );
        return;
    };
    let declared = csdw & 0x00FF_FFFF;

    let mut parsed = 0u32;
    while !cursor.is_empty() {
        let Ok(ipts) = cursor.read_u64::<LittleEndian>() else {
            report.push(
                Severity::Error,
                "IPDH",
                offset,
                "truncated intra-packet header".into(),
            );
            return;
        };
        let bsw = cursor.read_u16::<LittleEndian>().unwrap_or(0);
        let _gap = cursor.read_u16::<LittleEndian>().unwrap_or(0);
        let length = cursor.read_u16::<LittleEndian>().unwrap_or(0) as usize;
        if length % 2 != 0 || cursor.len() < length {
            report.push(
                Severity::Error,
                "MESSAGE_LENGTH",
                offset,
                format!("message length {} invalid or truncated", length),
            );
            return;
        }
        let mut words = Vec::with_capacity(length / 2);
        for _ in 0..length / 2 {
            words.push(cursor.read_u16::<LittleEndian>().unwrap_or(0));
        }

        let entry = last_ipts.entry(channel_id).or_insert(0);
        if ipts < *entry {
            report.push(
                Severity::Error,
                "IPTS_ORDER",
                offset,
                format!(
                    "channel 0x{:03X} IPTS {} after {}",
                    channel_id, ipts, *entry
                ),
            );
        }
        *entry = (*entry).max(ipts);

        check_1553_words(&words, bsw, offset, report);
        parsed += 1;
        report.messages += 1;
    }

    if parsed != declared {
        report.push(
            Severity::Error,
            "MESSAGE_COUNT",
            offset,
            format!("CSDW declares {} messages, packet holds {}", declared, parsed),
        );
    }
}

fn check_1553_words(words: &[u16], bsw: u16, offset: u64, report: &mut ValidationReport) {
    let Some(&command) = words.first() else {
        report.push(
            Severity::Error,
            "EMPTY_MESSAGE",
            offset,
            "message block carries no 1553 words".into(),
        );
        return;
    };
    let (rt, tr, sa, wc) = decode_command_word(command);

    // Mode codes: the word-count field is the mode code value.
    if sa == 0 || sa == 31 {
        if words.len() > 3 {
            report.push(
                Severity::Warning,
                "MODE_CODE_WORDS",
                offset,
                format!("mode code message with {} words", words.len()),
            );
        }
        return;
    }

    // A flagged word-count fault is deliberate; the length is expected
    // to disagree with the command word.
    if bsw & block_status::WORD_COUNT_ERROR != 0 {
        return;
    }

    if bsw & block_status::RT_TO_RT != 0 {
        // rx-cmd, tx-cmd, tx-status, data..., rx-status
        let expected = 4 + usize::from(wc);
        if words.len() != expected {
            report.push(
                Severity::Error,
                "WORD_COUNT",
                offset,
                format!(
                    "RT2RT message has {} words, command word implies {}",
                    words.len(),
                    expected
                ),
            );
        }
        return;
    }

    let expected = 2 + usize::from(wc);
    if words.len() != expected {
        report.push(
            Severity::Error,
            "WORD_COUNT",
            offset,
            format!(
                "message has {} words, command word implies {}",
                words.len(),
                expected
            ),
        );
        return;
    }

    // T/R bit 1 = BC->RT: status trails the data. 0 = RT->BC: status
    // immediately follows the command.
    let status = if tr { words[expected - 1] } else { words[1] };
    if status_word_rt(status) != rt {
        report.push(
            Severity::Error,
            "STATUS_RT",
            offset,
            format!(
                "status word RT {} does not match command RT {}",
                status_word_rt(status),
                rt
            ),
        );
    }
}

fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{
        ms1553_payload, time_f1_payload, tmats_payload, write_packet, Ms1553Message, PacketHeader,
        TimeFormat, TimeSource,
    };
    use crate::timefmt::TimeOfDay;

    fn tod() -> TimeOfDay {
        TimeOfDay {
            day_of_year: 100,
            hour: 1,
            minute: 2,
            second: 3,
            millisecond: 0,
            microsecond: 0,
        }
    }

    fn message(ipts: u64, words: Vec<u16>) -> Ms1553Message {
        Ms1553Message {
            ipts,
            status: 0,
            gap: 0,
            words,
        }
    }

    /// cmd(rt=1 tr=1 sa=1 wc=1), one data word, status(rt=1)
    fn bc2rt_words(data: u16) -> Vec<u16> {
        vec![crate::encode::command_word(1, true, 1, 1), data, 1 << 11]
    }

    fn good_file() -> Vec<u8> {
        let mut buf = Vec::new();
        let mut seq = [0u8; 4];
        let mut header = |channel: u16, dt: u8, rtc: u64| {
            let idx = (channel & 0x3) as usize;
            let h = PacketHeader {
                channel_id: channel,
                data_type: dt,
                sequence: seq[idx],
                rtc,
            };
            seq[idx] = seq[idx].wrapping_add(1);
            h
        };
        write_packet(
            &mut buf,
            header(0x000, data_type::TMATS, 0),
            &tmats_payload("TMATS\\1.0;\r\nG\\106:11;\r\nG\\DSI\\N:busforge;\r\n"),
        )
        .unwrap();
        write_packet(
            &mut buf,
            header(0x001, data_type::TIME_F1, 0),
            &time_f1_payload(tod(), TimeSource::Internal, TimeFormat::IrigB),
        )
        .unwrap();
        let msgs = vec![message(0, bc2rt_words(42)), message(1000, bc2rt_words(43))];
        write_packet(
            &mut buf,
            header(0x002, data_type::MS1553_F1, 0),
            &ms1553_payload(&msgs).unwrap(),
        )
        .unwrap();
        buf
    }

    #[test]
    fn test_good_file_passes() {
        let report = validate_stream(good_file().as_slice()).unwrap();
        assert!(report.ok(), "unexpected findings: {:?}", report.findings);
        assert_eq!(report.packets, 3);
        assert_eq!(report.messages, 2);
        assert_eq!(report.time_packets, 1);
    }

    #[test]
    fn test_corrupt_checksum() {
        let mut file = good_file();
        file[2] ^= 0xFF; // flip a channel id byte, checksum goes stale
        let report = validate_stream(file.as_slice()).unwrap();
        assert!(report.findings.iter().any(|f| f.code == "CHECKSUM"));
        assert!(!report.ok());
    }

    #[test]
    fn test_missing_tmats() {
        let mut buf = Vec::new();
        write_packet(
            &mut buf,
            PacketHeader {
                channel_id: 0x001,
                data_type: data_type::TIME_F1,
                sequence: 0,
                rtc: 0,
            },
            &time_f1_payload(tod(), TimeSource::Internal, TimeFormat::IrigB),
        )
        .unwrap();
        let report = validate_stream(buf.as_slice()).unwrap();
        assert!(report.findings.iter().any(|f| f.code == "TMATS_FIRST"));
        assert!(report.findings.iter().any(|f| f.code == "TMATS_MISSING"));
    }

    #[test]
    fn test_data_before_time() {
        let mut buf = Vec::new();
        write_packet(
            &mut buf,
            PacketHeader {
                channel_id: 0x000,
                data_type: data_type::TMATS,
                sequence: 0,
                rtc: 0,
            },
            &tmats_payload("TMATS\\1.0;G\\106:11;G\\DSI\\N:x;"),
        )
        .unwrap();
        write_packet(
            &mut buf,
            PacketHeader {
                channel_id: 0x002,
                data_type: data_type::MS1553_F1,
                sequence: 0,
                rtc: 0,
            },
            &ms1553_payload(&[message(0, bc2rt_words(1))]).unwrap(),
        )
        .unwrap();
        let report = validate_stream(buf.as_slice()).unwrap();
        assert!(report.findings.iter().any(|f| f.code == "TIME_BEFORE_DATA"));
    }

    #[test]
    fn test_ipts_regression_detected() {
        let mut buf = good_file();
        let msgs = vec![message(500, bc2rt_words(1)), message(100, bc2rt_words(2))];
        write_packet(
            &mut buf,
            PacketHeader {
                channel_id: 0x002,
                data_type: data_type::MS1553_F1,
                sequence: 1,
                rtc: 0,
            },
            &ms1553_payload(&msgs).unwrap(),
        )
        .unwrap();
        let report = validate_stream(buf.as_slice()).unwrap();
        assert!(report.findings.iter().any(|f| f.code == "IPTS_ORDER"));
    }

    #[test]
    fn test_word_count_mismatch() {
        // command word says wc=2, only one data word present
        let words = vec![crate::encode::command_word(1, true, 1, 2), 42, 1 << 11];
        let mut buf = good_file();
        write_packet(
            &mut buf,
            PacketHeader {
                channel_id: 0x002,
                data_type: data_type::MS1553_F1,
                sequence: 1,
                rtc: 0,
            },
            &ms1553_payload(&[message(5000, words)]).unwrap(),
        )
        .unwrap();
        let report = validate_stream(buf.as_slice()).unwrap();
        assert!(report.findings.iter().any(|f| f.code == "WORD_COUNT"));
    }

    #[test]
    fn test_status_rt_mismatch() {
        let words = vec![crate::encode::command_word(1, true, 1, 1), 42, 7 << 11];
        let mut buf = good_file();
        write_packet(
            &mut buf,
            PacketHeader {
                channel_id: 0x002,
                data_type: data_type::MS1553_F1,
                sequence: 1,
                rtc: 0,
            },
            &ms1553_payload(&[message(5000, words)]).unwrap(),
        )
        .unwrap();
        let report = validate_stream(buf.as_slice()).unwrap();
        assert!(report.findings.iter().any(|f| f.code == "STATUS_RT"));
    }

    #[test]
    fn test_empty_stream() {
        let report = validate_stream([].as_slice()).unwrap();
        assert!(report.findings.iter().any(|f| f.code == "EMPTY"));
        assert!(!report.ok());
    }
}
