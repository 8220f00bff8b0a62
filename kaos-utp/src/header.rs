//! uTP wire header.
//!
//! Layout (big-endian multi-byte fields):
//! ```text
//! Offset  Size  Field
//! 0       1     type << 4 | version
//! 1       1     first extension type (0 = none)
//! 2       2     conn_id
//! 4       4     timestamp (us)
//! 8       4     timestamp_diff (us)
//! 12      4     wnd_size
//! 16      2     seq_nr
//! 18      2     ack_nr
//! 20      ..    extension chain: [next type][len][len bytes]...
//! ```

use crate::error::{Result, UtpError};
use bytemuck::{Pod, Zeroable};
use std::time::{SystemTime, UNIX_EPOCH};

/// Only protocol version on the wire.
pub const VERSION: u8 = 1;

/// Fixed part of the header.
pub const MIN_HEADER_SIZE: usize = 20;

/// Base header plus one selective-ack extension, which is what a Conn sends.
pub const MAX_HEADER_SIZE: usize = MIN_HEADER_SIZE + 2 + SELECTIVE_ACK_LEN;

/// Extension type carrying the selective-ack bitmask.
pub const EXTENSION_SELECTIVE_ACK: u8 = 1;

/// Bytes in the selective-ack bitmask we produce (64 bits).
pub const SELECTIVE_ACK_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Data = 0,
    Fin = 1,
    State = 2,
    Reset = 3,
    Syn = 4,
}

impl PacketType {
    pub const MAX: u8 = PacketType::Syn as u8;
}

impl TryFrom<u8> for PacketType {
    type Error = UtpError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PacketType::Data),
            1 => Ok(PacketType::Fin),
            2 => Ok(PacketType::State),
            3 => Ok(PacketType::Reset),
            4 => Ok(PacketType::Syn),
            _ => Err(UtpError::MalformedHeader("unknown packet type")),
        }
    }
}

/// One entry of the extension chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    pub kind: u8,
    pub bytes: Vec<u8>,
}

/// Bitmask view over a selective-ack extension. Bit `i` (LSB first within
/// each byte) reports sequence number `ack_nr + 2 + i`. Only the bits the
/// extension actually carried report anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectiveAck {
    bits: [u8; SELECTIVE_ACK_LEN],
    len: usize,
}

impl Default for SelectiveAck {
    fn default() -> Self {
        Self {
            bits: [0; SELECTIVE_ACK_LEN],
            len: Self::BITS,
        }
    }
}

impl SelectiveAck {
    pub const BITS: usize = SELECTIVE_ACK_LEN * 8;

    /// Masks longer than [`SELECTIVE_ACK_LEN`] bytes are cut to it.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut bits = [0u8; SELECTIVE_ACK_LEN];
        let n = bytes.len().min(SELECTIVE_ACK_LEN);
        bits[..n].copy_from_slice(&bytes[..n]);
        Self { bits, len: n * 8 }
    }

    /// Number of sequence numbers the mask reports on.
    pub fn bit_len(&self) -> usize {
        self.len
    }

    pub fn set(&mut self, i: usize) {
        if i < self.len {
            self.bits[i / 8] |= 1 << (i % 8);
        }
    }

    pub fn is_set(&self, i: usize) -> bool {
        i < self.len && self.bits[i / 8] & (1 << (i % 8)) != 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits[..self.len / 8]
    }

    pub fn into_extension(self) -> Extension {
        Extension {
            kind: EXTENSION_SELECTIVE_ACK,
            bytes: self.as_bytes().to_vec(),
        }
    }
}

/// Fixed 20 bytes as they appear on the wire.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct RawHeader {
    type_version: u8,
    extension: u8,
    conn_id: [u8; 2],
    timestamp: [u8; 4],
    timestamp_diff: [u8; 4],
    wnd_size: [u8; 4],
    seq_nr: [u8; 2],
    ack_nr: [u8; 2],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub packet_type: PacketType,
    pub version: u8,
    pub conn_id: u16,
    pub timestamp: u32,
    pub timestamp_diff: u32,
    pub wnd_size: u32,
    pub seq_nr: u16,
    pub ack_nr: u16,
    pub extensions: Vec<Extension>,
}

impl Header {
    pub fn new(packet_type: PacketType, conn_id: u16, seq_nr: u16, ack_nr: u16) -> Self {
        Self {
            packet_type,
            version: VERSION,
            conn_id,
            timestamp: 0,
            timestamp_diff: 0,
            wnd_size: 0,
            seq_nr,
            ack_nr,
            extensions: Vec::new(),
        }
    }

    /// Parses a header from the front of `buf`, returning it with the number
    /// of bytes consumed (where the payload starts).
    pub fn unmarshal(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < MIN_HEADER_SIZE {
            return Err(UtpError::MalformedHeader("buffer too short"));
        }
        let raw: &RawHeader = bytemuck::from_bytes(&buf[..MIN_HEADER_SIZE]);
        let kind = raw.type_version >> 4;
        let version = raw.type_version & 0x0f;
        if kind > PacketType::MAX {
            return Err(UtpError::MalformedHeader("unknown packet type"));
        }
        if version != VERSION {
            return Err(UtpError::MalformedHeader("bad version"));
        }

        let mut extensions = Vec::new();
        let mut next = raw.extension;
        let mut n = MIN_HEADER_SIZE;
        while next != 0 {
            if buf.len() < n + 2 {
                return Err(UtpError::MalformedHeader("extension chain truncated"));
            }
            let kind = next;
            next = buf[n];
            let len = buf[n + 1] as usize;
            n += 2;
            if buf.len() < n + len {
                return Err(UtpError::MalformedHeader("extension overruns buffer"));
            }
            extensions.push(Extension {
                kind,
                bytes: buf[n..n + len].to_vec(),
            });
            n += len;
        }

        Ok((
            Self {
                packet_type: PacketType::try_from(kind)?,
                version,
                conn_id: u16::from_be_bytes(raw.conn_id),
                timestamp: u32::from_be_bytes(raw.timestamp),
                timestamp_diff: u32::from_be_bytes(raw.timestamp_diff),
                wnd_size: u32::from_be_bytes(raw.wnd_size),
                seq_nr: u16::from_be_bytes(raw.seq_nr),
                ack_nr: u16::from_be_bytes(raw.ack_nr),
                extensions,
            },
            n,
        ))
    }

    /// Encoded size including the extension chain.
    pub fn encoded_len(&self) -> usize {
        MIN_HEADER_SIZE
            + self
                .extensions
                .iter()
                .map(|ext| 2 + ext.bytes.len())
                .sum::<usize>()
    }

    /// Writes the header into the front of `buf`, returning bytes written.
    /// `buf` must hold at least [`Header::encoded_len`] bytes. Fails without
    /// writing when an extension is too long for its one-byte length field.
    pub fn marshal_into(&self, buf: &mut [u8]) -> Result<usize> {
        if self.extensions.iter().any(|ext| ext.bytes.len() > u8::MAX as usize) {
            return Err(UtpError::MalformedHeader("extension longer than 255 bytes"));
        }
        let raw = RawHeader {
            type_version: ((self.packet_type as u8) << 4) | (self.version & 0x0f),
            extension: self.extensions.first().map_or(0, |ext| ext.kind),
            conn_id: self.conn_id.to_be_bytes(),
            timestamp: self.timestamp.to_be_bytes(),
            timestamp_diff: self.timestamp_diff.to_be_bytes(),
            wnd_size: self.wnd_size.to_be_bytes(),
            seq_nr: self.seq_nr.to_be_bytes(),
            ack_nr: self.ack_nr.to_be_bytes(),
        };
        buf[..MIN_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&raw));

        let mut n = MIN_HEADER_SIZE;
        for (i, ext) in self.extensions.iter().enumerate() {
            buf[n] = self.extensions.get(i + 1).map_or(0, |next| next.kind);
            buf[n + 1] = ext.bytes.len() as u8;
            n += 2;
            buf[n..n + ext.bytes.len()].copy_from_slice(&ext.bytes);
            n += ext.bytes.len();
        }
        Ok(n)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.encoded_len()];
        self.marshal_into(&mut buf)?;
        Ok(buf)
    }

    /// The selective-ack bitmask, if the chain carries one.
    pub fn selective_ack(&self) -> Option<SelectiveAck> {
        self.extensions
            .iter()
            .find(|ext| ext.kind == EXTENSION_SELECTIVE_ACK)
            .map(|ext| SelectiveAck::from_bytes(&ext.bytes))
    }
}

/// Current wall clock in microseconds, truncated to 32 bits.
pub fn now_timestamp() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u32)
        .unwrap_or(0)
}
