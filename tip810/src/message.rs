//! CAN messages as exchanged with the engine

use crate::error::{Error, Result};
use embedded_can::{Frame, Id, StandardId};

/// Number of distinct 11-bit identifiers
pub const CAN_IDENTIFIERS: usize = 2048;
/// Payload capacity of a classic CAN frame
pub const CAN_DATA_SIZE: usize = 8;

/// Whether a frame carries data or asks for it
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Data frame
    Data,
    /// Remote Transmission Request
    Remote,
}

/// A classic CAN frame with an 11-bit identifier.
///
/// Fields are public so callers can build and inspect messages freely;
/// [`Message::validate`] is applied at every entry point that reaches the
/// hardware.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// 11-bit identifier
    pub identifier: u16,
    /// Data or remote frame
    pub kind: FrameKind,
    /// Number of payload bytes, or the requested length for a remote frame
    pub length: u8,
    /// Payload; bytes past `length` are ignored
    pub data: [u8; CAN_DATA_SIZE],
}

impl Message {
    /// Data frame carrying `payload`
    pub fn new(identifier: u16, payload: &[u8]) -> Result<Self> {
        if payload.len() > CAN_DATA_SIZE {
            return Err(Error::BadMessage);
        }
        let mut data = [0; CAN_DATA_SIZE];
        data[..payload.len()].copy_from_slice(payload);
        let message = Self {
            identifier,
            kind: FrameKind::Data,
            length: payload.len() as u8,
            data,
        };
        message.validate()?;
        Ok(message)
    }

    /// Remote frame requesting `length` bytes
    pub fn remote(identifier: u16, length: u8) -> Result<Self> {
        let message = Self {
            identifier,
            kind: FrameKind::Remote,
            length,
            data: [0; CAN_DATA_SIZE],
        };
        message.validate()?;
        Ok(message)
    }

    /// Reject identifiers and lengths the hardware cannot represent.
    pub fn validate(&self) -> Result<()> {
        if usize::from(self.identifier) >= CAN_IDENTIFIERS
            || usize::from(self.length) > CAN_DATA_SIZE
        {
            return Err(Error::BadMessage);
        }
        Ok(())
    }

    /// Payload bytes, up to the declared length
    pub fn payload(&self) -> &[u8] {
        let len = usize::from(self.length).min(CAN_DATA_SIZE);
        &self.data[..len]
    }

    /// Is this a remote frame
    pub fn is_remote(&self) -> bool {
        self.kind == FrameKind::Remote
    }
}

impl Frame for Message {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        match id.into() {
            Id::Standard(id) => Message::new(id.as_raw(), data).ok(),
            Id::Extended(_) => None,
        }
    }

    fn new_remote(id: impl Into<Id>, dlc: usize) -> Option<Self> {
        let length = u8::try_from(dlc).ok()?;
        match id.into() {
            Id::Standard(id) => Message::remote(id.as_raw(), length).ok(),
            Id::Extended(_) => None,
        }
    }

    fn is_extended(&self) -> bool {
        false
    }

    fn is_remote_frame(&self) -> bool {
        self.is_remote()
    }

    fn id(&self) -> Id {
        // Safety: The mask ensures the ID is in range for a standard ID.
        Id::Standard(unsafe { StandardId::new_unchecked(self.identifier & 0x7ff) })
    }

    fn dlc(&self) -> usize {
        usize::from(self.length)
    }

    fn data(&self) -> &[u8] {
        if self.is_remote() {
            &[]
        } else {
            self.payload()
        }
    }
}
