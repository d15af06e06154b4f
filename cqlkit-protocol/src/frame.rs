//! `frame` module contains envelope framing and the message model.
use bytemuck::NoUninit;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;

use crate::error;

pub mod events;
pub mod message_error;
pub mod message_request;
pub mod message_response;
pub mod message_result;

/// Length of an envelope header: version, flags, stream id (2), opcode, body length (4).
pub const HEADER_LEN: usize = 9;

/// Upper bound of a body length accepted when parsing a header.
pub const MAX_BODY_LEN: usize = 256 * 1024 * 1024;

/// Stream id reserved for server-pushed events.
pub const EVENT_STREAM_ID: StreamId = -1;

pub type StreamId = i16;

/// Native protocol version.
#[derive(
    Debug,
    PartialEq,
    Copy,
    Clone,
    Ord,
    PartialOrd,
    Eq,
    Hash,
    Display,
    NoUninit,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
pub enum Version {
    V1 = 1,
    V2 = 2,
    V3 = 3,
    V4 = 4,
    V5 = 5,
}

impl Default for Version {
    #[inline]
    fn default() -> Self {
        Version::V4
    }
}

impl From<Version> for u8 {
    #[inline]
    fn from(value: Version) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for Version {
    type Error = error::Error;

    fn try_from(version: u8) -> Result<Self, Self::Error> {
        match version & 0x7F {
            1 => Ok(Version::V1),
            2 => Ok(Version::V2),
            3 => Ok(Version::V3),
            4 => Ok(Version::V4),
            5 => Ok(Version::V5),
            v => Err(error::Error::UnknownVersion(v)),
        }
    }
}

impl Version {
    /// Highest version known to the driver.
    pub const HIGHEST: Version = Version::V5;

    /// Next lower version to try after this one has been rejected. `None` for `V1`.
    pub fn downgrade(self) -> Option<Version> {
        match self {
            Version::V1 => None,
            Version::V2 => Some(Version::V1),
            Version::V3 => Some(Version::V2),
            Version::V4 => Some(Version::V3),
            Version::V5 => Some(Version::V4),
        }
    }
}

#[derive(Debug, PartialEq, Copy, Clone, Ord, PartialOrd, Eq, Hash, Display)]
pub enum Direction {
    Request,
    Response,
}

impl From<Direction> for u8 {
    fn from(value: Direction) -> u8 {
        match value {
            Direction::Request => 0x00,
            Direction::Response => 0x80,
        }
    }
}

impl From<u8> for Direction {
    fn from(value: u8) -> Self {
        match value & 0x80 {
            0 => Direction::Request,
            _ => Direction::Response,
        }
    }
}

/// Envelope flags. Only passed through, since body handling belongs to the codec.
#[derive(Debug, Default, PartialEq, Copy, Clone, Eq, Hash)]
pub struct Flags(u8);

impl Flags {
    pub const COMPRESSION: Flags = Flags(0x01);
    pub const TRACING: Flags = Flags(0x02);
    pub const CUSTOM_PAYLOAD: Flags = Flags(0x04);
    pub const WARNING: Flags = Flags(0x08);

    #[inline]
    pub fn empty() -> Self {
        Flags(0)
    }

    #[inline]
    pub fn from_bits(bits: u8) -> Self {
        Flags(bits)
    }

    #[inline]
    pub fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }
}

#[derive(Debug, PartialEq, Copy, Clone, Ord, PartialOrd, Eq, Hash, Display)]
pub enum Opcode {
    Error,
    Startup,
    Ready,
    Authenticate,
    Options,
    Supported,
    Query,
    Result,
    Prepare,
    Execute,
    Register,
    Event,
    Batch,
    AuthChallenge,
    AuthResponse,
    AuthSuccess,
}

impl From<Opcode> for u8 {
    fn from(value: Opcode) -> Self {
        match value {
            Opcode::Error => 0x00,
            Opcode::Startup => 0x01,
            Opcode::Ready => 0x02,
            Opcode::Authenticate => 0x03,
            Opcode::Options => 0x05,
            Opcode::Supported => 0x06,
            Opcode::Query => 0x07,
            Opcode::Result => 0x08,
            Opcode::Prepare => 0x09,
            Opcode::Execute => 0x0A,
            Opcode::Register => 0x0B,
            Opcode::Event => 0x0C,
            Opcode::Batch => 0x0D,
            Opcode::AuthChallenge => 0x0E,
            Opcode::AuthResponse => 0x0F,
            Opcode::AuthSuccess => 0x10,
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = error::Error;

    fn try_from(value: u8) -> Result<Self, <Opcode as TryFrom<u8>>::Error> {
        match value {
            0x00 => Ok(Opcode::Error),
            0x01 => Ok(Opcode::Startup),
            0x02 => Ok(Opcode::Ready),
            0x03 => Ok(Opcode::Authenticate),
            0x05 => Ok(Opcode::Options),
            0x06 => Ok(Opcode::Supported),
            0x07 => Ok(Opcode::Query),
            0x08 => Ok(Opcode::Result),
            0x09 => Ok(Opcode::Prepare),
            0x0A => Ok(Opcode::Execute),
            0x0B => Ok(Opcode::Register),
            0x0C => Ok(Opcode::Event),
            0x0D => Ok(Opcode::Batch),
            0x0E => Ok(Opcode::AuthChallenge),
            0x0F => Ok(Opcode::AuthResponse),
            0x10 => Ok(Opcode::AuthSuccess),
            _ => Err(error::Error::UnknownOpcode(value)),
        }
    }
}

/// Parsed envelope header, used to find out how many body bytes follow.
#[derive(Debug, PartialEq, Copy, Clone, Eq, Hash)]
pub struct EnvelopeHeader {
    pub version: Version,
    pub direction: Direction,
    pub flags: Flags,
    pub stream_id: StreamId,
    pub opcode: Opcode,
    pub body_len: usize,
}

impl EnvelopeHeader {
    pub fn parse(bytes: &[u8; HEADER_LEN]) -> error::Result<Self> {
        let version = Version::try_from(bytes[0])?;
        let direction = Direction::from(bytes[0]);
        let flags = Flags::from_bits(bytes[1]);
        let stream_id = StreamId::from_be_bytes([bytes[2], bytes[3]]);
        let opcode = Opcode::try_from(bytes[4])?;
        let body_len = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) as usize;

        if body_len > MAX_BODY_LEN {
            return Err(error::Error::General(format!(
                "Envelope body length {body_len} exceeds maximum of {MAX_BODY_LEN}"
            )));
        }

        Ok(EnvelopeHeader {
            version,
            direction,
            flags,
            stream_id,
            opcode,
            body_len,
        })
    }
}

/// A single protocol message: header fields and an opaque, codec-encoded body.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Envelope {
    pub version: Version,
    pub direction: Direction,
    pub flags: Flags,
    pub opcode: Opcode,
    pub stream_id: StreamId,
    pub body: Vec<u8>,
}

impl Envelope {
    #[inline]
    pub fn new_request(version: Version, opcode: Opcode, body: Vec<u8>) -> Self {
        Envelope {
            version,
            direction: Direction::Request,
            flags: Flags::empty(),
            opcode,
            stream_id: 0,
            body,
        }
    }

    #[inline]
    pub fn new_response(
        version: Version,
        opcode: Opcode,
        stream_id: StreamId,
        body: Vec<u8>,
    ) -> Self {
        Envelope {
            version,
            direction: Direction::Response,
            flags: Flags::empty(),
            opcode,
            stream_id,
            body,
        }
    }

    #[inline]
    pub fn from_parts(header: EnvelopeHeader, body: Vec<u8>) -> Self {
        Envelope {
            version: header.version,
            direction: header.direction,
            flags: header.flags,
            opcode: header.opcode,
            stream_id: header.stream_id,
            body,
        }
    }

    pub fn encode(&self) -> error::Result<Vec<u8>> {
        if self.body.len() > MAX_BODY_LEN {
            return Err(error::Error::General(format!(
                "Envelope body length {} exceeds maximum of {MAX_BODY_LEN}",
                self.body.len()
            )));
        }

        let mut v = Vec::with_capacity(HEADER_LEN + self.body.len());

        v.push(u8::from(self.version) | u8::from(self.direction));
        v.push(self.flags.bits());
        v.extend_from_slice(&self.stream_id.to_be_bytes());
        v.push(u8::from(self.opcode));
        v.extend_from_slice(&(self.body.len() as u32).to_be_bytes());
        v.extend_from_slice(&self.body);

        Ok(v)
    }
}
