//! Chapter 10 Packet Builders
//!
//! Byte-exact assembly of IRIG-106 Chapter 10 packets: the common 24-byte
//! header with its word-sum checksum, the TMATS setup record, Time-F1
//! packets and MS1553-F1 data packets with per-message intra-packet
//! headers. Every integer is written little-endian; packets are padded
//! with zeros to a 4-byte boundary, with padding counted in
//! `packet_length` but not `data_length`.

use crate::timefmt::{write_u48_le, TimeOfDay};
use byteorder::{LittleEndian, WriteBytesExt};
use std::io::{self, Write};

/// Packet sync pattern.
pub const SYNC: u16 = 0xEB25;

/// Common header size in bytes.
pub const HEADER_BYTES: usize = 24;

/// Data type codes used by this recorder.
pub mod data_type {
    /// TMATS setup record (computer-generated data, format 1)
    pub const TMATS: u8 = 0x01;
    /// Time data, format 1
    pub const TIME_F1: u8 = 0x11;
    /// MIL-STD-1553 data, format 1
    pub const MS1553_F1: u8 = 0x19;
}

/// Header fields supplied by the writer; lengths and checksum are
/// computed here.
#[derive(Debug, Clone, Copy)]
pub struct PacketHeader {
    pub channel_id: u16,
    pub data_type: u8,
    pub sequence: u8,
    /// Relative time counter, 48 bits of 100 ns ticks
    pub rtc: u64,
}

/// Serialize one packet: header, payload, zero padding to a 4-byte
/// boundary. Returns the total bytes written.
pub fn write_packet<W: Write>(
    w: &mut W,
    header: PacketHeader,
    payload: &[u8],
) -> io::Result<usize> {
    let data_length = payload.len() as u32;
    let padding = (4 - (HEADER_BYTES + payload.len()) % 4) % 4;
    let packet_length = (HEADER_BYTES + payload.len() + padding) as u32;

    let mut head = [0u8; HEADER_BYTES];
    {
        let mut cursor = &mut head[..];
        cursor.write_u16::<LittleEndian>(SYNC)?;
        cursor.write_u16::<LittleEndian>(header.channel_id)?;
        cursor.write_u32::<LittleEndian>(packet_length)?;
        cursor.write_u32::<LittleEndian>(data_length)?;
        cursor.write_u8(0x06)?; // data type version, IRIG-106 release
        cursor.write_u8(header.sequence)?;
        cursor.write_u8(0)?; // packet flags: no secondary header
        cursor.write_u8(header.data_type)?;
        write_u48_le(&mut cursor, header.rtc)?;
    }
    let checksum = header_checksum(&head);
    head[22] = (checksum & 0xFF) as u8;
    head[23] = (checksum >> 8) as u8;

    w.write_all(&head)?;
    w.write_all(payload)?;
    w.write_all(&[0u8; 3][..padding])?;
    Ok(HEADER_BYTES + payload.len() + padding)
}

/// Header checksum: arithmetic sum of the first eleven little-endian
/// 16-bit words, modulo 2^16.
pub fn header_checksum(head: &[u8; HEADER_BYTES]) -> u16 {
    head[..22]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .fold(0u16, u16::wrapping_add)
}

/// TMATS payload: 4-byte channel-specific data word (zeroed) followed by
/// the ASCII setup record.
pub fn tmats_payload(tmats_text: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + tmats_text.len());
    payload.extend_from_slice(&0u32.to_le_bytes());
    payload.extend_from_slice(tmats_text.as_bytes());
    payload
}

/// Time source field of the Time-F1 CSDW.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSource {
    Internal = 0,
    External = 1,
    InternalFromRmm = 2,
    ExternalFromRmm = 3,
}

/// Time format field of the Time-F1 CSDW.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeFormat {
    IrigB = 0,
    IrigA = 1,
    IrigG = 2,
    RealTimeClock = 3,
    GpsUtc = 4,
}

/// Time-F1 payload: CSDW (source in bits 3-0, format in bits 7-4) plus
/// the 8-byte BCD time body.
pub fn time_f1_payload(tod: TimeOfDay, source: TimeSource, format: TimeFormat) -> Vec<u8> {
    let csdw = source as u32 | (format as u32) << 4;
    let mut payload = Vec::with_capacity(12);
    payload.extend_from_slice(&csdw.to_le_bytes());
    for word in tod.to_words() {
        payload.extend_from_slice(&word.to_le_bytes());
    }
    payload
}

/// Block status word bits of the 1553 intra-packet header.
pub mod block_status {
    /// Bus identity: clear = bus A, set = bus B
    pub const BUS_B: u16 = 1 << 0;
    pub const WORD_COUNT_ERROR: u16 = 1 << 1;
    pub const SYNC_ERROR: u16 = 1 << 2;
    pub const WORD_COUNT_ERROR_IN_GAP: u16 = 1 << 3;
    pub const RESPONSE_TIMEOUT: u16 = 1 << 4;
    pub const FORMAT_ERROR: u16 = 1 << 5;
    pub const RT_TO_RT: u16 = 1 << 6;
    pub const MESSAGE_ERROR: u16 = 1 << 7;
    pub const BROADCAST_RECEIVED: u16 = 1 << 8;
}

/// One 1553 message ready for packetization.
#[derive(Debug, Clone)]
pub struct Ms1553Message {
    /// Intra-packet time stamp in RTC ticks
    pub ipts: u64,
    /// Block status word
    pub status: u16,
    /// Gap times, half-microseconds (gap1 low byte, gap2 high byte)
    pub gap: u16,
    /// Raw 1553 words: command(s), status word(s) and data in wire order
    pub words: Vec<u16>,
}

/// Size of the intra-packet data header in bytes.
pub const IPDH_BYTES: usize = 14;

impl Ms1553Message {
    /// Bytes this message contributes to a packet payload.
    pub fn packed_size(&self) -> usize {
        IPDH_BYTES + self.words.len() * 2
    }
}

/// MS1553-F1 payload: CSDW (message count in bits 0-23, time tag bits
/// 31-30 zero) followed by an IPDH and the raw words per message.
pub fn ms1553_payload(messages: &[Ms1553Message]) -> io::Result<Vec<u8>> {
    let body: usize = messages.iter().map(Ms1553Message::packed_size).sum();
    let mut payload = Vec::with_capacity(4 + body);
    let csdw = messages.len() as u32 & 0x00FF_FFFF;
    payload.extend_from_slice(&csdw.to_le_bytes());
    for msg in messages {
        payload.write_u64::<LittleEndian>(msg.ipts)?;
        payload.write_u16::<LittleEndian>(msg.status)?;
        payload.write_u16::<LittleEndian>(msg.gap)?;
        payload.write_u16::<LittleEndian>((msg.words.len() * 2) as u16)?;
        for &word in &msg.words {
            payload.write_u16::<LittleEndian>(word)?;
        }
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::ReadBytesExt;

    fn header(data_type: u8) -> PacketHeader {
        PacketHeader {
            channel_id: 2,
            data_type,
            sequence: 0,
            rtc: 12345,
        }
    }

    #[test]
    fn test_header_layout() {
        let mut buf = Vec::new();
        write_packet(&mut buf, header(data_type::MS1553_F1), &[1, 2, 3, 4]).unwrap();

        assert_eq!(u16::from_le_bytes([buf[0], buf[1]]), SYNC);
        assert_eq!(u16::from_le_bytes([buf[2], buf[3]]), 2);
        // packet length includes header, data length excludes it
        let packet_length = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let data_length = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        assert_eq!(packet_length, 28);
        assert_eq!(data_length, 4);
        assert_eq!(buf[15], data_type::MS1553_F1);
        assert_eq!(buf.len(), 28);
    }

    #[test]
    fn test_header_checksum_verifies() {
        let mut buf = Vec::new();
        write_packet(&mut buf, header(data_type::TIME_F1), &[0; 12]).unwrap();
        let head: [u8; HEADER_BYTES] = buf[..HEADER_BYTES].try_into().unwrap();
        let stored = u16::from_le_bytes([head[22], head[23]]);
        assert_eq!(stored, header_checksum(&head));
    }

    #[test]
    fn test_padding_to_four_bytes() {
        for payload_len in 0..8 {
            let payload = vec![0xAA; payload_len];
            let mut buf = Vec::new();
            let written = write_packet(&mut buf, header(0x01), &payload).unwrap();
            assert_eq!(written % 4, 0, "payload {} not padded", payload_len);
            let packet_length = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
            let data_length = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
            assert_eq!(packet_length, written);
            assert_eq!(data_length, payload_len);
        }
    }

    #[test]
    fn test_rtc_48_bits() {
        let mut buf = Vec::new();
        let mut h = header(data_type::TIME_F1);
        h.rtc = 0x0000_1234_5678_9ABC;
        write_packet(&mut buf, h, &[]).unwrap();
        let rtc = crate::timefmt::read_u48_le(&mut &buf[16..22]).unwrap();
        assert_eq!(rtc, 0x1234_5678_9ABC);
    }

    #[test]
    fn test_tmats_payload() {
        let payload = tmats_payload("TMATS\\1.0;");
        assert_eq!(&payload[..4], &[0, 0, 0, 0]);
        assert_eq!(&payload[4..], b"TMATS\\1.0;");
    }

    #[test]
    fn test_time_f1_payload() {
        let tod = TimeOfDay {
            day_of_year: 1,
            hour: 0,
            minute: 0,
            second: 0,
            millisecond: 0,
            microsecond: 0,
        };
        let payload = time_f1_payload(tod, TimeSource::Internal, TimeFormat::IrigB);
        assert_eq!(payload.len(), 12);
        // internal source, IRIG-B format
        assert_eq!(u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]), 0);
        // day word
        assert_eq!(u16::from_le_bytes([payload[8], payload[9]]), 0x0001);
    }

    #[test]
    fn test_ms1553_payload_arithmetic() {
        let messages = vec![
            Ms1553Message {
                ipts: 100,
                status: 0,
                gap: 0,
                words: vec![0xAAAA, 0xBBBB, 0xCCCC],
            },
            Ms1553Message {
                ipts: 200,
                status: block_status::BUS_B,
                gap: 0,
                words: vec![0x1111, 0x2222],
            },
        ];
        let payload = ms1553_payload(&messages).unwrap();
        let expected: usize = 4 + messages.iter().map(Ms1553Message::packed_size).sum::<usize>();
        assert_eq!(payload.len(), expected);

        // CSDW message count
        let csdw = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        assert_eq!(csdw & 0x00FF_FFFF, 2);

        // first IPDH: ipts then status/gap/length
        let mut cursor = &payload[4..];
        assert_eq!(cursor.read_u64::<LittleEndian>().unwrap(), 100);
        assert_eq!(cursor.read_u16::<LittleEndian>().unwrap(), 0);
        assert_eq!(cursor.read_u16::<LittleEndian>().unwrap(), 0);
        assert_eq!(cursor.read_u16::<LittleEndian>().unwrap(), 6);
        assert_eq!(cursor.read_u16::<LittleEndian>().unwrap(), 0xAAAA);
    }
}
