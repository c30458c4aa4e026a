//! # busforge-core
//!
//! Format primitives for generating IRIG-106 Chapter 10 recordings of
//! MIL-STD-1553B bus traffic:
//!
//! - **Word codec**: BNR, BCD, signed/unsigned integer, split-float and
//!   bitfield encodings to 16-bit data words, plus command/status words
//! - **ICD model**: message and word definitions with per-message slot
//!   layout resolution and load-time validation
//! - **TMATS**: minimal attribute builder for the metadata packet
//! - **Packet builders**: byte-exact TMATS, Time-F1 and MS1553-F1 packets
//!   with headers, CSDWs and intra-packet headers
//! - **Validator**: post-write structural checks over a produced file
//!
//! This crate knows nothing about scenarios, schedules or data generation;
//! that lives in `busforge-sim`.
//!
//! ## Example
//!
//! ```rust
//! use busforge_core::encode::{command_word, decode_command_word};
//!
//! // BC->RT command to RT 1, subaddress 1, one data word
//! let cmd = command_word(1, true, 1, 1);
//! assert_eq!(cmd, 0b00001_1_00001_00001);
//! assert_eq!(decode_command_word(cmd), (1, true, 1, 1));
//! ```

pub mod encode;
pub mod icd;
pub mod packet;
pub mod timefmt;
pub mod tmats;
pub mod validate;

pub use encode::{EncodeError, Encoding, OverflowPolicy, WordOrder};
pub use icd::{BusId, Icd, IcdError, MessageDef, TransferType, WordDef};
pub use validate::{Finding, Severity, ValidationReport};
