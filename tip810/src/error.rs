//! Errors of the CAN engine

use thiserror::Error;
use tip810_core::CarrierError;

/// Errors returned by the CAN engine
#[derive(Error, Debug)]
pub enum Error {
    /// Identifier, length or frame kind out of range
    #[error("bad CAN message")]
    BadMessage,
    /// The address string does not follow `bus{/timeout}:id{+n}*{.offset} parameter`
    #[error("bad CAN address")]
    BadAddress,
    /// No bus with this name has been created
    #[error("no such CAN bus: {0}")]
    NoSuchDevice(String),
    /// The bit rate has no entry in the timing table
    #[error("unsupported bus rate: {0}")]
    BadBusRate(i32),
    /// Name or carrier slot is already taken
    #[error("duplicate CAN device: {0}")]
    DuplicateDevice(String),
    /// The transmit slot or reply did not become available in time
    #[error("timeout")]
    Timeout,
    /// The transmit signal and the chip's transmit buffer status disagreed
    #[error("transmitter busy")]
    TransmitterBusy,
    /// Another synchronous read is outstanding on this bus
    #[error("device busy with another read")]
    DeviceBusy,
    /// No matching message callback is registered
    #[error("no matching message callback")]
    NoMessage,
    /// The registry has not been initialised
    #[error("CAN engine not initialised")]
    NotInitialised,
    /// The registry has already been initialised
    #[error("CAN engine already initialised")]
    AlreadyInitialised,
    /// The receive task could not be started
    #[error("cannot start receive task: {0}")]
    Spawn(#[from] std::io::Error),
    /// Carrier board driver error
    #[error("carrier: {0}")]
    Carrier(#[from] CarrierError),
}

/// Result type of the CAN engine
pub type Result<T> = std::result::Result<T, Error>;
