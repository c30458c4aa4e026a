//! 1553 Word Codec
//!
//! Encodes engineering values into 16-bit MIL-STD-1553 data words and
//! back: unsigned/signed integers, BNR fixed-point, BCD, IEEE-754 split
//! floats and bitfield packing, plus the protocol command and status
//! words.
//!
//! Data words recorded in a Chapter 10 file are the raw 16 bits; the
//! line-level odd-parity bit is never stored. Parity faults are reported
//! through status-word flags instead.
//!
//! ## Example
//!
//! ```rust
//! use busforge_core::encode::{encode_u16, float32_split, float32_combine, WordOrder};
//!
//! assert_eq!(encode_u16(42.0, 1.0, 0.0), 42);
//!
//! let (lo, hi) = float32_split(37.7749, WordOrder::LswMsw);
//! assert_eq!(float32_combine(lo, hi, WordOrder::LswMsw), 37.7749f32);
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Data word encoding variants (closed set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    /// Unsigned 16-bit integer
    U16,
    /// Signed 16-bit integer, two's complement
    I16,
    /// Binary Natural Representation: signed fixed-point with scale/offset
    Bnr16,
    /// Binary Coded Decimal, 4 bits per digit, MSB-first
    Bcd,
    /// IEEE-754 single precision split across two adjacent words
    Float32Split,
}

impl Encoding {
    /// Number of 16-bit words this encoding occupies.
    pub fn word_count(self) -> usize {
        match self {
            Encoding::Float32Split => 2,
            _ => 1,
        }
    }

    /// Natural engineering range of the raw encoding (before scale/offset).
    pub fn natural_range(self, digits: u8) -> (f64, f64) {
        match self {
            Encoding::U16 => (0.0, 65535.0),
            Encoding::I16 | Encoding::Bnr16 => (-32768.0, 32767.0),
            Encoding::Bcd => (0.0, 10f64.powi(i32::from(digits)) - 1.0),
            Encoding::Float32Split => (f64::from(f32::MIN), f64::from(f32::MAX)),
        }
    }
}

/// Word order for split-float encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WordOrder {
    /// Least significant word first (default)
    LswMsw,
    /// Most significant word first
    MswLsw,
}

impl Default for WordOrder {
    fn default() -> Self {
        WordOrder::LswMsw
    }
}

/// Recovery policy when a value cannot be represented by its encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Fail the run
    Strict,
    /// Clamp to the representable range and record a warning
    Clamp,
    /// Wrap modularly and record a warning
    Wrap,
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        OverflowPolicy::Clamp
    }
}

/// Errors from the word codec.
#[derive(Debug, Clone, Error)]
pub enum EncodeError {
    #[error("value {value} out of range for {encoding} encoding")]
    OutOfRange { value: f64, encoding: &'static str },

    #[error("value {value} does not fit bitfield mask 0x{mask:04X}")]
    BitfieldOverflow { value: i64, mask: u16 },

    #[error("mask 0x{mask:04X} shifted by {shift} exceeds 16 bits")]
    BitfieldPlacement { mask: u16, shift: u8 },

    #[error("BCD value {value} outside 0..=10^{digits}-1")]
    BcdRange { value: i64, digits: u8 },
}

/// Scale an engineering value to raw counts and round half away from zero.
fn scale_round(value: f64, scale: f64, offset: f64) -> f64 {
    ((value - offset) / scale).round()
}

/// Encode as unsigned 16-bit, clamping to [0, 65535].
pub fn encode_u16(value: f64, scale: f64, offset: f64) -> u16 {
    scale_round(value, scale, offset).clamp(0.0, 65535.0) as u16
}

/// Encode as signed 16-bit two's complement, clamping to [-32768, 32767].
pub fn encode_i16(value: f64, scale: f64, offset: f64) -> u16 {
    (scale_round(value, scale, offset).clamp(-32768.0, 32767.0) as i16) as u16
}

/// Encode as BNR 16-bit fixed-point. Numerically identical to [`encode_i16`];
/// BNR differs only in the slot rules (must occupy a full word).
pub fn encode_bnr16(value: f64, scale: f64, offset: f64) -> u16 {
    encode_i16(value, scale, offset)
}

/// Checked variant used for the strict/wrap overflow policies.
///
/// Returns the encoded word and whether the raw value was out of range
/// before the policy was applied.
pub fn encode_int_checked(
    value: f64,
    encoding: Encoding,
    scale: f64,
    offset: f64,
    policy: OverflowPolicy,
) -> Result<(u16, bool), EncodeError> {
    let raw = scale_round(value, scale, offset);
    let (lo, hi, name) = match encoding {
        Encoding::U16 => (0.0, 65535.0, "u16"),
        Encoding::I16 => (-32768.0, 32767.0, "i16"),
        Encoding::Bnr16 => (-32768.0, 32767.0, "bnr16"),
        _ => unreachable!("integer encodings only"),
    };
    let out_of_range = !raw.is_finite() || raw < lo || raw > hi;
    if out_of_range && policy == OverflowPolicy::Strict {
        return Err(EncodeError::OutOfRange {
            value,
            encoding: name,
        });
    }
    let word = if out_of_range && policy == OverflowPolicy::Wrap && raw.is_finite() {
        // Modular wrap into the 16-bit space
        (raw as i64 & 0xFFFF) as u16
    } else {
        match encoding {
            Encoding::U16 => raw.clamp(lo, hi) as u16,
            _ => (raw.clamp(lo, hi) as i16) as u16,
        }
    };
    Ok((word, out_of_range))
}

/// Encode a non-negative integer as BCD, 4 bits per decimal digit.
///
/// `digits` selects the field width (default 4 -> values 0..=9999). The
/// least significant digit lands in bits 3..0.
pub fn encode_bcd(value: f64, digits: u8) -> Result<u16, EncodeError> {
    let v = value.round();
    let limit = 10f64.powi(i32::from(digits)) - 1.0;
    if !v.is_finite() || v < 0.0 || v > limit {
        return Err(EncodeError::BcdRange {
            value: v as i64,
            digits,
        });
    }
    let mut rest = v as u32;
    let mut word = 0u16;
    let mut shift = 0u32;
    while rest > 0 && shift < 16 {
        word |= ((rest % 10) as u16) << shift;
        rest /= 10;
        shift += 4;
    }
    Ok(word)
}

/// Decode a BCD word back to an integer.
pub fn decode_bcd(word: u16, digits: u8) -> u32 {
    let mut value = 0u32;
    for d in (0..u32::from(digits).min(4)).rev() {
        value = value * 10 + u32::from((word >> (d * 4)) & 0xF);
    }
    value
}

/// Split an IEEE-754 single into two 16-bit words.
pub fn float32_split(value: f64, order: WordOrder) -> (u16, u16) {
    let bits = (value as f32).to_bits();
    let lsw = (bits & 0xFFFF) as u16;
    let msw = (bits >> 16) as u16;
    match order {
        WordOrder::LswMsw => (lsw, msw),
        WordOrder::MswLsw => (msw, lsw),
    }
}

/// Recombine two 16-bit words into an IEEE-754 single.
pub fn float32_combine(first: u16, second: u16, order: WordOrder) -> f32 {
    let (lsw, msw) = match order {
        WordOrder::LswMsw => (first, second),
        WordOrder::MswLsw => (second, first),
    };
    f32::from_bits(u32::from(msw) << 16 | u32::from(lsw))
}

/// Encode a value into a bitfield, returning the placed (shifted) bits.
///
/// The raw value must fit the mask; the shifted mask must stay within
/// 16 bits. With the clamp policy an overflowing value saturates at the
/// mask, with wrap it is masked down; both report the overflow.
pub fn encode_bitfield(
    value: f64,
    mask: u16,
    shift: u8,
    scale: f64,
    offset: f64,
    policy: OverflowPolicy,
) -> Result<(u16, bool), EncodeError> {
    check_bitfield_placement(mask, shift)?;
    let raw = scale_round(value, scale, offset);
    let overflow = !raw.is_finite() || raw < 0.0 || raw > f64::from(mask);
    if overflow && policy == OverflowPolicy::Strict {
        return Err(EncodeError::BitfieldOverflow {
            value: raw as i64,
            mask,
        });
    }
    let raw = if overflow {
        match policy {
            OverflowPolicy::Wrap if raw.is_finite() => (raw as i64 as u16) & mask,
            _ => mask,
        }
    } else {
        (raw as u16) & mask
    };
    Ok((raw << shift, overflow))
}

/// Extract a bitfield from a word and scale back to engineering units.
pub fn decode_bitfield(word: u16, mask: u16, shift: u8, scale: f64, offset: f64) -> f64 {
    f64::from((word >> shift) & mask) * scale + offset
}

/// Reject masks that are zero or would shift out of the 16-bit word.
pub fn check_bitfield_placement(mask: u16, shift: u8) -> Result<(), EncodeError> {
    if mask == 0 || shift > 15 || (u32::from(mask) << shift) > 0xFFFF {
        return Err(EncodeError::BitfieldPlacement { mask, shift });
    }
    Ok(())
}

/// Build a 1553 command word.
///
/// Layout: bits 15-11 RT address, bit 10 T/R, bits 9-5 subaddress,
/// bits 4-0 word count (32 encodes as 0). `tr` is true for BC->RT
/// transfers.
pub fn command_word(rt: u8, tr: bool, sa: u8, wc: u8) -> u16 {
    debug_assert!(rt <= 31 && sa <= 31 && (1..=32).contains(&wc));
    let wc_field = if wc == 32 { 0 } else { u16::from(wc) };
    u16::from(rt) << 11 | u16::from(tr) << 10 | u16::from(sa) << 5 | wc_field
}

/// Build a mode-code command word: the word-count field carries the
/// mode code value and `sa` must be 0 or 31.
pub fn mode_command_word(rt: u8, sa: u8, mode_code: u8) -> u16 {
    debug_assert!(rt <= 31 && (sa == 0 || sa == 31) && mode_code <= 31);
    u16::from(rt) << 11 | 1 << 10 | u16::from(sa) << 5 | u16::from(mode_code)
}

/// Decode a command word into `(rt, tr, sa, wc)` with the 0 -> 32 rule.
pub fn decode_command_word(word: u16) -> (u8, bool, u8, u8) {
    let rt = (word >> 11) as u8 & 0x1F;
    let tr = word & (1 << 10) != 0;
    let sa = (word >> 5) as u8 & 0x1F;
    let wc_field = word as u8 & 0x1F;
    let wc = if wc_field == 0 { 32 } else { wc_field };
    (rt, tr, sa, wc)
}

/// RT status word flags.
///
/// The eight standard MIL-STD-1553 flags occupy their fixed positions;
/// acceptance-error and parity-error use two of the reserved bits (6, 5)
/// so injected faults stay visible in the recorded word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusFlags {
    pub message_error: bool,
    pub instrumentation: bool,
    pub service_request: bool,
    pub acceptance_error: bool,
    pub parity_error: bool,
    pub broadcast_received: bool,
    pub busy: bool,
    pub subsystem_flag: bool,
    pub dynamic_bus_control: bool,
    pub terminal_flag: bool,
}

/// Build a 1553 status word. Bits 15-11 carry the RT address.
pub fn status_word(rt: u8, flags: StatusFlags) -> u16 {
    debug_assert!(rt <= 31);
    let mut word = u16::from(rt) << 11;
    if flags.message_error {
        word |= 1 << 10;
    }
    if flags.instrumentation {
        word |= 1 << 9;
    }
    if flags.service_request {
        word |= 1 << 8;
    }
    if flags.acceptance_error {
        word |= 1 << 6;
    }
    if flags.parity_error {
        word |= 1 << 5;
    }
    if flags.broadcast_received {
        word |= 1 << 4;
    }
    if flags.busy {
        word |= 1 << 3;
    }
    if flags.subsystem_flag {
        word |= 1 << 2;
    }
    if flags.dynamic_bus_control {
        word |= 1 << 1;
    }
    if flags.terminal_flag {
        word |= 1;
    }
    word
}

/// RT address carried in a status word.
pub fn status_word_rt(word: u16) -> u8 {
    (word >> 11) as u8 & 0x1F
}

/// Line-level odd parity of a 16-bit word. Informational only; never
/// stored in Chapter 10 data words.
pub fn odd_parity(word: u16) -> bool {
    word.count_ones() % 2 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u16_round_trip() {
        for v in [0u16, 1, 255, 32767, 65535] {
            assert_eq!(encode_u16(f64::from(v), 1.0, 0.0), v);
        }
    }

    #[test]
    fn test_u16_clamps() {
        assert_eq!(encode_u16(-5.0, 1.0, 0.0), 0);
        assert_eq!(encode_u16(70000.0, 1.0, 0.0), 65535);
    }

    #[test]
    fn test_u16_rounds_half_away_from_zero() {
        assert_eq!(encode_u16(2.5, 1.0, 0.0), 3);
        assert_eq!(encode_u16(2.4, 1.0, 0.0), 2);
    }

    #[test]
    fn test_i16_round_trip() {
        for v in [-32768i16, -1, 0, 1, 32767] {
            let word = encode_i16(f64::from(v), 1.0, 0.0);
            assert_eq!(word as i16, v);
        }
    }

    #[test]
    fn test_bnr16_scale_offset() {
        // altitude in feet at 0.25 ft resolution
        let word = encode_bnr16(1000.0, 0.25, 0.0);
        assert_eq!(word as i16, 4000);
        // round trip within scale/2
        let back = f64::from(word as i16) * 0.25;
        assert!((back - 1000.0).abs() <= 0.125);
    }

    #[test]
    fn test_strict_policy_rejects_overflow() {
        let err = encode_int_checked(70000.0, Encoding::U16, 1.0, 0.0, OverflowPolicy::Strict);
        assert!(matches!(err, Err(EncodeError::OutOfRange { .. })));
    }

    #[test]
    fn test_clamp_policy_flags_overflow() {
        let (word, clipped) =
            encode_int_checked(70000.0, Encoding::U16, 1.0, 0.0, OverflowPolicy::Clamp).unwrap();
        assert_eq!(word, 65535);
        assert!(clipped);
        // exact boundary is not an overflow
        let (word, clipped) =
            encode_int_checked(65535.0, Encoding::U16, 1.0, 0.0, OverflowPolicy::Clamp).unwrap();
        assert_eq!(word, 65535);
        assert!(!clipped);
    }

    #[test]
    fn test_wrap_policy() {
        let (word, clipped) =
            encode_int_checked(65536.0, Encoding::U16, 1.0, 0.0, OverflowPolicy::Wrap).unwrap();
        assert_eq!(word, 0);
        assert!(clipped);
    }

    #[test]
    fn test_bcd() {
        assert_eq!(encode_bcd(1234.0, 4).unwrap(), 0x1234);
        assert_eq!(encode_bcd(0.0, 4).unwrap(), 0x0000);
        assert_eq!(encode_bcd(9999.0, 4).unwrap(), 0x9999);
        assert!(encode_bcd(10000.0, 4).is_err());
        assert!(encode_bcd(-1.0, 4).is_err());
        assert_eq!(decode_bcd(0x1234, 4), 1234);
    }

    #[test]
    fn test_float32_split_round_trip() {
        for v in [0.0f32, 1.0, -1.0, 37.7749, f32::MAX, f32::MIN_POSITIVE] {
            let (a, b) = float32_split(f64::from(v), WordOrder::LswMsw);
            assert_eq!(float32_combine(a, b, WordOrder::LswMsw), v);
            let (a, b) = float32_split(f64::from(v), WordOrder::MswLsw);
            assert_eq!(float32_combine(a, b, WordOrder::MswLsw), v);
        }
    }

    #[test]
    fn test_float32_split_bit_pattern() {
        let bits = 37.7749f32.to_bits();
        let (lsw, msw) = float32_split(37.7749, WordOrder::LswMsw);
        assert_eq!(u32::from(msw) << 16 | u32::from(lsw), bits);
    }

    #[test]
    fn test_bitfield_basic() {
        let (placed, ovf) =
            encode_bitfield(0xAA as f64, 0x00FF, 0, 1.0, 0.0, OverflowPolicy::Clamp).unwrap();
        assert_eq!(placed, 0x00AA);
        assert!(!ovf);
        let (placed, ovf) =
            encode_bitfield(0x55 as f64, 0x00FF, 8, 1.0, 0.0, OverflowPolicy::Clamp).unwrap();
        assert_eq!(placed, 0x5500);
        assert!(!ovf);
    }

    #[test]
    fn test_bitfield_full_word_is_scalar() {
        let (placed, ovf) =
            encode_bitfield(54321.0, 0xFFFF, 0, 1.0, 0.0, OverflowPolicy::Clamp).unwrap();
        assert_eq!(placed, 54321);
        assert!(!ovf);
    }

    #[test]
    fn test_bitfield_overflow() {
        let err = encode_bitfield(256.0, 0x00FF, 0, 1.0, 0.0, OverflowPolicy::Strict);
        assert!(matches!(err, Err(EncodeError::BitfieldOverflow { .. })));
        let (placed, ovf) =
            encode_bitfield(256.0, 0x00FF, 0, 1.0, 0.0, OverflowPolicy::Clamp).unwrap();
        assert_eq!(placed, 0x00FF);
        assert!(ovf);
    }

    #[test]
    fn test_bitfield_placement() {
        assert!(check_bitfield_placement(0x00FF, 8).is_ok());
        assert!(check_bitfield_placement(0x00FF, 9).is_err());
        assert!(check_bitfield_placement(0, 0).is_err());
        assert!(check_bitfield_placement(0xFFFF, 1).is_err());
    }

    #[test]
    fn test_bitfield_decode() {
        let word = 0x55AA;
        assert_eq!(decode_bitfield(word, 0x00FF, 0, 1.0, 0.0), 0xAA as f64);
        assert_eq!(decode_bitfield(word, 0x00FF, 8, 1.0, 0.0), 0x55 as f64);
    }

    #[test]
    fn test_command_word() {
        // rt=1 tr=1 sa=1 wc=1 -> 00001 1 00001 00001
        assert_eq!(command_word(1, true, 1, 1), 0b00001_1_00001_00001);
        assert_eq!(decode_command_word(command_word(1, true, 1, 1)), (1, true, 1, 1));
    }

    #[test]
    fn test_command_word_wc32_encodes_as_zero() {
        let cmd = command_word(5, false, 2, 32);
        assert_eq!(cmd & 0x1F, 0);
        assert_eq!(decode_command_word(cmd), (5, false, 2, 32));
    }

    #[test]
    fn test_mode_command_word() {
        let cmd = mode_command_word(3, 31, 17);
        let (rt, _tr, sa, _) = decode_command_word(cmd);
        assert_eq!(rt, 3);
        assert_eq!(sa, 31);
        assert_eq!(cmd & 0x1F, 17);
    }

    #[test]
    fn test_status_word() {
        let clean = status_word(9, StatusFlags::default());
        assert_eq!(clean, 9 << 11);
        assert_eq!(status_word_rt(clean), 9);

        let flagged = status_word(
            9,
            StatusFlags {
                busy: true,
                message_error: true,
                ..Default::default()
            },
        );
        assert_ne!(flagged & (1 << 3), 0);
        assert_ne!(flagged & (1 << 10), 0);
    }

    #[test]
    fn test_odd_parity() {
        // 0x0000 has zero ones: parity bit must be set
        assert!(odd_parity(0x0000));
        // 0x0001 has one: already odd
        assert!(!odd_parity(0x0001));
    }
}
