//! Recording Time Encoding
//!
//! Helpers shared by the packet builders and the validator: the 10 MHz
//! relative time counter, 48-bit little-endian field I/O, and the BCD
//! time-of-day words carried by Time-F1 packets (IRIG-B day format).

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use std::io::{self, Read, Write};

/// RTC resolution: 100 ns ticks (10 MHz), the common recorder rate.
pub const RTC_TICKS_PER_SECOND: u64 = 10_000_000;

/// Convert virtual nanoseconds since run start to RTC ticks.
pub fn ns_to_rtc(ns: u64) -> u64 {
    ns / 100
}

/// Write a 48-bit little-endian field.
pub fn write_u48_le<W: Write>(w: &mut W, value: u64) -> io::Result<()> {
    w.write_uint::<LittleEndian>(value & 0xFFFF_FFFF_FFFF, 6)
}

/// Read a 48-bit little-endian field.
pub fn read_u48_le<R: Read>(r: &mut R) -> io::Result<u64> {
    r.read_uint::<LittleEndian>(6)
}

/// Fallback recording start when the scenario gives none. A fixed epoch
/// keeps output byte-deterministic; the wall clock is never consulted.
pub fn default_start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap()
}

/// Calendar time of day for one Time-F1 packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeOfDay {
    pub day_of_year: u16,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub millisecond: u16,
    pub microsecond: u16,
}

impl TimeOfDay {
    /// Time of day at `start + offset_ns`.
    pub fn at(start: DateTime<Utc>, offset_ns: u64) -> Self {
        let t = start + Duration::nanoseconds(offset_ns as i64);
        Self {
            day_of_year: t.ordinal() as u16,
            hour: t.hour() as u8,
            minute: t.minute() as u8,
            second: t.second() as u8,
            millisecond: t.timestamp_subsec_millis() as u16,
            microsecond: (t.timestamp_subsec_micros() % 1000) as u16,
        }
    }

    /// Pack into the four BCD words of the Time-F1 body.
    ///
    /// Words 1-3 are the IRIG-B day format (tens/hundreds of
    /// milliseconds, seconds, minutes, hours, day-of-year); word 4
    /// carries units of milliseconds in bits 3-0 and three BCD
    /// microsecond digits in bits 15-4.
    pub fn to_words(self) -> [u16; 4] {
        let ms = self.millisecond;
        let us = self.microsecond;
        let w1 = u16::from(ms / 10 % 10)
            | u16::from(ms / 100) << 4
            | u16::from(self.second % 10) << 8
            | u16::from(self.second / 10) << 12;
        let w2 = u16::from(self.minute % 10)
            | u16::from(self.minute / 10) << 4
            | u16::from(self.hour % 10) << 8
            | u16::from(self.hour / 10) << 12;
        let w3 = self.day_of_year % 10
            | (self.day_of_year / 10 % 10) << 4
            | (self.day_of_year / 100) << 8;
        let w4 = ms % 10 | (us % 10) << 4 | (us / 10 % 10) << 8 | (us / 100) << 12;
        [w1, w2, w3, w4]
    }

    /// Decode the four BCD words back (validator support).
    pub fn from_words(words: [u16; 4]) -> Self {
        let [w1, w2, w3, w4] = words;
        let second = (w1 >> 8 & 0xF) as u8 + 10 * (w1 >> 12 & 0x7) as u8;
        let minute = (w2 & 0xF) as u8 + 10 * (w2 >> 4 & 0x7) as u8;
        let hour = (w2 >> 8 & 0xF) as u8 + 10 * (w2 >> 12 & 0x3) as u8;
        let day_of_year = (w3 & 0xF) + 10 * (w3 >> 4 & 0xF) + 100 * (w3 >> 8 & 0x3);
        let millisecond = (w4 & 0xF) + 10 * (w1 & 0xF) + 100 * (w1 >> 4 & 0xF);
        let microsecond = (w4 >> 4 & 0xF) + 10 * (w4 >> 8 & 0xF) + 100 * (w4 >> 12 & 0xF);
        Self {
            day_of_year,
            hour,
            minute,
            second,
            millisecond,
            microsecond,
        }
    }
}
