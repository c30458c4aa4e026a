//! ICD Model & Loader
//!
//! An Interface Control Document names a bus and a set of 1553 message
//! definitions down to the word/bit level. Loading parses the YAML
//! document, validates addressing and field placement, and resolves a
//! **slot layout** per message: which field (or bitfield group) owns each
//! of the `wc` data word positions.
//!
//! ## Example ICD
//!
//! ```yaml
//! bus: A
//! messages:
//!   - name: NAV_DATA
//!     rate_hz: 20
//!     rt: 5
//!     tr: RT2BC
//!     sa: 1
//!     wc: 3
//!     words:
//!       - { name: altitude, encode: bnr16, src: nav.altitude, scale: 0.25 }
//!       - { name: latitude, encode: float32_split, src: nav.lat, word_order: lsw_msw }
//! ```

use crate::encode::{
    check_bitfield_placement, encode_bcd, encode_bitfield, encode_int_checked, float32_split,
    EncodeError, Encoding, OverflowPolicy, WordOrder,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

/// Which physical 1553 bus the ICD describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusId {
    A,
    B,
}

impl Default for BusId {
    fn default() -> Self {
        BusId::A
    }
}

/// 1553 transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferType {
    /// Bus controller to remote terminal (receive command)
    #[serde(rename = "BC2RT")]
    Bc2Rt,
    /// Remote terminal to bus controller (transmit command)
    #[serde(rename = "RT2BC")]
    Rt2Bc,
    /// Remote terminal to remote terminal
    #[serde(rename = "RT2RT")]
    Rt2Rt,
    /// Mode code (subaddress 0 or 31, word count field carries the code)
    #[serde(rename = "MODE")]
    Mode,
}

/// One field of a message: a scalar word, half of a split float, or a
/// bitfield sharing a packed word.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WordDef {
    /// Field name, unique within its message
    pub name: String,
    /// Encoding variant
    pub encode: Encoding,
    /// Semantic source path bound by the scenario
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    /// Constant value; mutually exclusive with `src`
    #[serde(rename = "const", default, skip_serializing_if = "Option::is_none")]
    pub const_value: Option<f64>,
    /// Scale factor applied as (value - offset) / scale
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Offset applied before scaling
    #[serde(default)]
    pub offset: f64,
    /// Engineering clip lower bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_value: Option<f64>,
    /// Engineering clip upper bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,
    /// Bitfield mask, pre-shift; u16/i16 fields only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<u16>,
    /// Bitfield left shift
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shift: Option<u8>,
    /// Explicit 0-based word position; required for bitfields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub word_index: Option<usize>,
    /// Split-float word order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub word_order: Option<WordOrder>,
    /// BCD digit count
    #[serde(default = "default_digits")]
    pub digits: u8,
    /// Recovery policy on encoding overflow
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

fn default_scale() -> f64 {
    1.0
}

fn default_digits() -> u8 {
    4
}

impl WordDef {
    /// Whether this field packs into a shared word.
    pub fn is_bitfield(&self) -> bool {
        self.mask.is_some() || self.shift.is_some()
    }

    /// Number of 16-bit slots this field occupies.
    pub fn slot_width(&self) -> usize {
        self.encode.word_count()
    }
}

/// One 1553 message definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDef {
    pub name: String,
    /// Transmission rate in Hz
    pub rate_hz: f64,
    /// Remote terminal address (receiving terminal for RT2RT)
    pub rt: u8,
    /// Transfer direction
    pub tr: TransferType,
    /// Subaddress (receiving terminal for RT2RT)
    pub sa: u8,
    /// Word count 1-32; for mode codes this is the mode code value
    pub wc: u8,
    /// Transmitting terminal address, RT2RT only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rt2: Option<u8>,
    /// Transmitting terminal subaddress, RT2RT only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sa2: Option<u8>,
    #[serde(default)]
    pub words: Vec<WordDef>,
}

impl MessageDef {
    /// Number of data words carried on the wire.
    pub fn data_word_count(&self) -> usize {
        match self.tr {
            TransferType::Mode => self.words.iter().map(|w| w.slot_width()).sum(),
            _ => usize::from(self.wc),
        }
    }

    /// Total 16-bit words on the wire including command and status words.
    pub fn wire_word_count(&self) -> usize {
        let data = self.data_word_count();
        match self.tr {
            TransferType::Rt2Rt => 4 + data,
            _ => 2 + data,
        }
    }

    /// Wire cost in bits: 20 bits per word including sync and parity.
    pub fn wire_bits(&self) -> u64 {
        self.wire_word_count() as u64 * 20
    }

    /// Resolve the slot layout: which field owns each data word position.
    pub fn slot_layout(&self) -> Result<SlotLayout, IcdError> {
        let width = self.data_word_count();
        let mut slots: Vec<Option<Slot>> = vec![None; width];

        let err_slot = |reason: String| IcdError::SlotCountMismatch {
            message: self.name.clone(),
            reason,
        };

        // Pass 1: fields with an explicit word_index stay where they are.
        for (i, word) in self.words.iter().enumerate() {
            let Some(idx) = word.word_index else {
                continue;
            };
            if idx >= width {
                return Err(err_slot(format!(
                    "field '{}' word_index {} outside 0..{}",
                    word.name, idx, width
                )));
            }
            if word.is_bitfield() {
                match &mut slots[idx] {
                    None => slots[idx] = Some(Slot::Packed(vec![i])),
                    Some(Slot::Packed(group)) => group.push(i),
                    Some(_) => {
                        return Err(err_slot(format!(
                            "field '{}' packs into word {} already owned by a scalar",
                            word.name, idx
                        )))
                    }
                }
            } else if word.encode == Encoding::Float32Split {
                if idx + 1 >= width || slots[idx].is_some() || slots[idx + 1].is_some() {
                    return Err(err_slot(format!(
                        "field '{}' needs two free adjacent words at {}",
                        word.name, idx
                    )));
                }
                slots[idx] = Some(Slot::SplitLo(i));
                slots[idx + 1] = Some(Slot::SplitHi(i));
            } else {
                if slots[idx].is_some() {
                    return Err(err_slot(format!(
                        "field '{}' collides at word {}",
                        word.name, idx
                    )));
                }
                slots[idx] = Some(Slot::Scalar(i));
            }
        }

        // Pass 2: remaining fields fill the next free slot(s) in
        // declaration order.
        for (i, word) in self.words.iter().enumerate() {
            if word.word_index.is_some() {
                continue;
            }
            if word.is_bitfield() {
                return Err(IcdError::InvalidField {
                    message: self.name.clone(),
                    field: word.name.clone(),
                    reason: "bitfields require an explicit word_index".into(),
                });
            }
            if word.encode == Encoding::Float32Split {
                let idx = (0..width.saturating_sub(1))
                    .find(|&k| slots[k].is_none() && slots[k + 1].is_none())
                    .ok_or_else(|| {
                        err_slot(format!("no adjacent free words for field '{}'", word.name))
                    })?;
                slots[idx] = Some(Slot::SplitLo(i));
                slots[idx + 1] = Some(Slot::SplitHi(i));
            } else {
                let idx = (0..width).find(|&k| slots[k].is_none()).ok_or_else(|| {
                    err_slot(format!("no free word for field '{}'", word.name))
                })?;
                slots[idx] = Some(Slot::Scalar(i));
            }
        }

        // Every slot must be covered so the layout width equals wc.
        let mut resolved = Vec::with_capacity(width);
        for (idx, slot) in slots.into_iter().enumerate() {
            resolved.push(slot.ok_or_else(|| err_slot(format!("word {} unassigned", idx)))?);
        }

        let layout = SlotLayout { slots: resolved };
        self.check_packed_groups(&layout)?;
        Ok(layout)
    }

    /// Validate bitfield groups: placement in range and no overlapping
    /// placed masks within a shared word.
    fn check_packed_groups(&self, layout: &SlotLayout) -> Result<(), IcdError> {
        for (word_idx, slot) in layout.slots.iter().enumerate() {
            let Slot::Packed(group) = slot else { continue };
            let mut used: u16 = 0;
            let mut owners: Vec<&str> = Vec::new();
            for &i in group {
                let word = &self.words[i];
                let (mask, shift) = (word.mask.unwrap_or(0), word.shift.unwrap_or(0));
                check_bitfield_placement(mask, shift).map_err(|source| IcdError::Encode {
                    message: self.name.clone(),
                    field: word.name.clone(),
                    source,
                })?;
                let placed = mask << shift;
                if used & placed != 0 {
                    let first = owners
                        .iter()
                        .zip(group.iter())
                        .find(|(_, &j)| {
                            let other = &self.words[j];
                            (other.mask.unwrap_or(0) << other.shift.unwrap_or(0)) & placed != 0
                        })
                        .map(|(n, _)| (*n).to_string())
                        .unwrap_or_default();
                    return Err(IcdError::BitfieldOverlap {
                        message: self.name.clone(),
                        first,
                        second: word.name.clone(),
                        word: word_idx,
                    });
                }
                used |= placed;
                owners.push(&word.name);
            }
        }
        Ok(())
    }

    /// Validate addressing, field attributes and slot coverage.
    pub fn validate(&self) -> Result<SlotLayout, IcdError> {
        let addressing = |reason: String| IcdError::InvalidAddressing {
            message: self.name.clone(),
            reason,
        };

        if !(self.rate_hz > 0.0 && self.rate_hz <= 1000.0) {
            return Err(IcdError::InvalidRate {
                message: self.name.clone(),
                rate: self.rate_hz,
            });
        }
        if self.rt > 31 {
            return Err(addressing(format!("rt {} outside 0..=31", self.rt)));
        }
        if self.sa > 31 {
            return Err(addressing(format!("sa {} outside 0..=31", self.sa)));
        }
        match self.tr {
            TransferType::Mode => {
                if self.sa != 0 && self.sa != 31 {
                    return Err(addressing(format!(
                        "mode code requires sa 0 or 31, got {}",
                        self.sa
                    )));
                }
                if self.wc > 31 {
                    return Err(addressing(format!("mode code {} outside 0..=31", self.wc)));
                }
                if self.data_word_count() > 1 {
                    return Err(addressing("mode code carries at most one data word".into()));
                }
            }
            TransferType::Rt2Rt => {
                let rt2 = self
                    .rt2
                    .ok_or_else(|| addressing("RT2RT requires rt2".into()))?;
                let sa2 = self
                    .sa2
                    .ok_or_else(|| addressing("RT2RT requires sa2".into()))?;
                if rt2 > 31 || sa2 > 31 {
                    return Err(addressing(format!("rt2 {}/sa2 {} outside 0..=31", rt2, sa2)));
                }
                if !(1..=32).contains(&self.wc) {
                    return Err(addressing(format!("wc {} outside 1..=32", self.wc)));
                }
            }
            _ => {
                if !(1..=32).contains(&self.wc) {
                    return Err(addressing(format!("wc {} outside 1..=32", self.wc)));
                }
            }
        }

        let mut seen = HashSet::new();
        for word in &self.words {
            if !seen.insert(word.name.as_str()) {
                return Err(IcdError::DuplicateFieldName {
                    message: self.name.clone(),
                    field: word.name.clone(),
                });
            }
            self.validate_word(word)?;
        }

        self.slot_layout()
    }

    fn validate_word(&self, word: &WordDef) -> Result<(), IcdError> {
        let invalid = |reason: &str| IcdError::InvalidField {
            message: self.name.clone(),
            field: word.name.clone(),
            reason: reason.into(),
        };

        if word.const_value.is_some() && word.src.is_some() {
            return Err(IcdError::ConstAndSource {
                message: self.name.clone(),
                field: word.name.clone(),
            });
        }
        if word.scale == 0.0 {
            return Err(invalid("scale must be nonzero"));
        }
        if word.mask.is_some() != word.shift.is_some() {
            return Err(invalid("bitfields require both mask and shift"));
        }
        if word.is_bitfield() && !matches!(word.encode, Encoding::U16 | Encoding::I16) {
            return Err(invalid("only u16/i16 fields may pack as bitfields"));
        }
        if word.encode == Encoding::Bcd && !(1..=4).contains(&word.digits) {
            return Err(invalid("bcd digits must be 1..=4"));
        }
        if word.encode != Encoding::Float32Split && word.word_order.is_some() {
            return Err(invalid("word_order applies to float32_split only"));
        }
        Ok(())
    }

    /// Encode one emission's engineering values into data words.
    ///
    /// `values` is indexed by field declaration order. Returns the data
    /// words plus the indices of fields that were clipped under a
    /// non-strict overflow policy.
    pub fn encode_data_words(
        &self,
        layout: &SlotLayout,
        values: &[f64],
    ) -> Result<EncodedData, EncodeError> {
        debug_assert_eq!(values.len(), self.words.len());
        let mut words = Vec::with_capacity(layout.slots.len());
        let mut clamped = Vec::new();

        fn clip(w: &WordDef, i: usize, value: f64, clamped: &mut Vec<usize>) -> f64 {
            let mut v = value;
            if let Some(min) = w.min_value {
                v = v.max(min);
            }
            if let Some(max) = w.max_value {
                v = v.min(max);
            }
            if v != value {
                clamped.push(i);
            }
            v
        }

        for slot in &layout.slots {
            match slot {
                Slot::Scalar(i) => {
                    let w = &self.words[*i];
                    let value = clip(w, *i, values[*i], &mut clamped);
                    let (word, clipped) = match w.encode {
                        Encoding::U16 | Encoding::I16 | Encoding::Bnr16 => {
                            encode_int_checked(value, w.encode, w.scale, w.offset, w.overflow)?
                        }
                        Encoding::Bcd => encode_bcd_policy(value, w.digits, w.overflow)?,
                        Encoding::Float32Split => unreachable!("split handled by SplitLo/SplitHi"),
                    };
                    if clipped {
                        clamped.push(*i);
                    }
                    words.push(word);
                }
                Slot::SplitLo(i) => {
                    let w = &self.words[*i];
                    let value = clip(w, *i, values[*i], &mut clamped);
                    let (first, _) = float32_split(value, w.word_order.unwrap_or_default());
                    words.push(first);
                }
                Slot::SplitHi(i) => {
                    let w = &self.words[*i];
                    let value = clip(w, *i, values[*i], &mut clamped);
                    let (_, second) = float32_split(value, w.word_order.unwrap_or_default());
                    words.push(second);
                }
                Slot::Packed(group) => {
                    let mut acc = 0u16;
                    for &i in group {
                        let w = &self.words[i];
                        let value = clip(w, i, values[i], &mut clamped);
                        let (placed, clipped) = encode_bitfield(
                            value,
                            w.mask.unwrap_or(0),
                            w.shift.unwrap_or(0),
                            w.scale,
                            w.offset,
                            w.overflow,
                        )?;
                        if clipped {
                            clamped.push(i);
                        }
                        acc |= placed;
                    }
                    words.push(acc);
                }
            }
        }

        clamped.dedup();
        Ok(EncodedData { words, clamped })
    }

    /// Find a field by name.
    pub fn field(&self, name: &str) -> Option<(usize, &WordDef)> {
        self.words
            .iter()
            .enumerate()
            .find(|(_, w)| w.name == name)
    }
}

fn encode_bcd_policy(
    value: f64,
    digits: u8,
    policy: OverflowPolicy,
) -> Result<(u16, bool), EncodeError> {
    let limit = 10f64.powi(i32::from(digits)) - 1.0;
    let rounded = value.round();
    if rounded.is_finite() && (0.0..=limit).contains(&rounded) {
        return Ok((encode_bcd(rounded, digits)?, false));
    }
    match policy {
        OverflowPolicy::Strict => Err(EncodeError::BcdRange {
            value: rounded as i64,
            digits,
        }),
        OverflowPolicy::Clamp => Ok((encode_bcd(rounded.clamp(0.0, limit), digits)?, true)),
        OverflowPolicy::Wrap => {
            let wrapped = if rounded.is_finite() {
                rounded.rem_euclid(limit + 1.0)
            } else {
                0.0
            };
            Ok((encode_bcd(wrapped, digits)?, true))
        }
    }
}

/// Data words for one message emission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedData {
    /// One 16-bit word per slot, in word-index order
    pub words: Vec<u16>,
    /// Indices of fields clipped or clamped during encoding
    pub clamped: Vec<usize>,
}

/// Owner of one data word position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    /// A single scalar field
    Scalar(usize),
    /// Low half of a 32-bit split field
    SplitLo(usize),
    /// High half of a 32-bit split field
    SplitHi(usize),
    /// One or more bitfields sharing the word
    Packed(Vec<usize>),
}

/// Resolved word-position ownership for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotLayout {
    pub slots: Vec<Slot>,
}

impl SlotLayout {
    /// Layout width in 16-bit words.
    pub fn width(&self) -> usize {
        self.slots.len()
    }
}

/// A validated Interface Control Document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Icd {
    #[serde(default)]
    pub bus: BusId,
    pub messages: Vec<MessageDef>,
}

impl Icd {
    /// Parse and validate from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self, IcdError> {
        let icd: Icd = serde_yaml::from_str(text)?;
        icd.validate()?;
        Ok(icd)
    }

    /// Load and validate from a file.
    pub fn from_file(path: &Path) -> Result<Self, IcdError> {
        Self::from_yaml(&std::fs::read_to_string(path)?)
    }

    /// Serialize the canonical YAML form.
    pub fn to_yaml(&self) -> Result<String, IcdError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate all messages and return their slot layouts, indexed the
    /// same as `messages`.
    pub fn validate(&self) -> Result<Vec<SlotLayout>, IcdError> {
        let mut seen = HashSet::new();
        for msg in &self.messages {
            if !seen.insert(msg.name.as_str()) {
                return Err(IcdError::DuplicateMessageName(msg.name.clone()));
            }
        }
        self.messages.iter().map(MessageDef::validate).collect()
    }

    /// Find a message by name.
    pub fn message(&self, name: &str) -> Option<(usize, &MessageDef)> {
        self.messages
            .iter()
            .enumerate()
            .find(|(_, m)| m.name == name)
    }

    /// Aggregate wire bandwidth in data words per second.
    pub fn total_word_rate(&self) -> f64 {
        self.messages
            .iter()
            .map(|m| m.rate_hz * m.data_word_count() as f64)
            .sum()
    }
}

/// Errors raised while loading or validating an ICD.
#[derive(Debug, Error)]
pub enum IcdError {
    #[error("failed to read ICD: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse ICD: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("duplicate message name '{0}'")]
    DuplicateMessageName(String),

    #[error("message '{message}': duplicate field name '{field}'")]
    DuplicateFieldName { message: String, field: String },

    #[error("message '{message}': {reason}")]
    InvalidAddressing { message: String, reason: String },

    #[error("message '{message}': rate {rate} Hz outside (0, 1000]")]
    InvalidRate { message: String, rate: f64 },

    #[error("message '{message}' field '{field}': 'const' and 'src' are mutually exclusive")]
    ConstAndSource { message: String, field: String },

    #[error("message '{message}': {reason}")]
    SlotCountMismatch { message: String, reason: String },

    #[error("message '{message}': bitfields '{first}' and '{second}' overlap in word {word}")]
    BitfieldOverlap {
        message: String,
        first: String,
        second: String,
        word: usize,
    },

    #[error("message '{message}' field '{field}': {reason}")]
    InvalidField {
        message: String,
        field: String,
        reason: String,
    },

    #[error("message '{message}' field '{field}': {source}")]
    Encode {
        message: String,
        field: String,
        #[source]
        source: EncodeError,
    },
}
