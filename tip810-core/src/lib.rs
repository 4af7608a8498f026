#![warn(missing_docs)]

//! `tip810-core` provides the set of abstractions that serve as a thin
//! integration layer between the [`tip810`] CAN driver and the Industry-Pack
//! carrier board drivers (in documentation also referred to as _carriers_).
//!
//! A carrier board hosts up to a handful of IP modules in numbered slots. It
//! knows where each slot's register spaces are mapped, can read the module's
//! identification PROM, and routes the module's interrupt request lines to the
//! CPU. None of that is specific to CAN, so the [`tip810`] crate only talks to
//! it through the [`Carrier`] trait defined here.
//!
//! Traits from this crate are not supposed to be implemented by the
//! application developer; implementations should be provided by carrier
//! drivers.
//!
//! [`tip810`]: <https://docs.rs/crate/tip810/>

use core::fmt;
use core::ptr::NonNull;
use std::sync::Arc;

pub use fugit;

/// Location of an IP module: carrier board number and slot on that carrier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Site {
    /// Carrier board number, in registration order
    pub carrier: u16,
    /// Slot on the carrier, `0` is slot A
    pub slot: u16,
}

impl Site {
    /// Create an instance
    pub const fn new(carrier: u16, slot: u16) -> Self {
        Self { carrier, slot }
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IP Carrier {} Slot {}", self.carrier, self.slot)
    }
}

/// Address spaces an IP module exposes through its carrier.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AddressSpace {
    /// Identification PROM
    Id,
    /// Registers (8/16-bit wide)
    Io,
    /// Registers of a 32-bit dual-slot module
    Io32,
    /// Memory space
    Mem,
}

/// Commands understood by a carrier's interrupt request line control.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IrqCommand {
    /// Pass the module's interrupts through to the CPU. Implies
    /// [`IrqCommand::StatActive`].
    Enable,
    /// Stop passing interrupts through. Not every carrier supports this.
    Disable,
    /// Report whether the request line is currently asserted
    Poll,
    /// Acknowledge an edge-triggered request
    Clear,
    /// Mark the slot as unused (front-panel indicator, where fitted)
    StatUnused,
    /// Mark the slot as in use (front-panel indicator, where fitted)
    StatActive,
}

/// Errors reported by a carrier driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CarrierError {
    /// No carrier is registered with the given number
    NoCarrier(u16),
    /// The slot does not exist on this carrier or holds no module
    NoModule(Site),
    /// Identification PROM is missing or its header is corrupt
    BadProm(Site),
    /// The module was made by someone else
    WrongManufacturer {
        /// Module location
        site: Site,
        /// Manufacturer code the driver supports
        expected: u8,
        /// Manufacturer code read from the PROM
        found: u8,
    },
    /// The module is not the expected model
    WrongModel {
        /// Module location
        site: Site,
        /// Model code the driver supports
        expected: u8,
        /// Model code read from the PROM
        found: u8,
    },
    /// The carrier cannot perform the requested interrupt command
    Unsupported(IrqCommand),
    /// The interrupt vector could not be connected
    VectorInUse(u8),
}

impl fmt::Display for CarrierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCarrier(carrier) => write!(f, "no IP carrier {carrier}"),
            Self::NoModule(site) => write!(f, "no IP module at {site}"),
            Self::BadProm(site) => write!(f, "bad ID PROM on module at {site}"),
            Self::WrongManufacturer {
                site,
                expected,
                found,
            } => write!(
                f,
                "module at {site} has manufacturer {found:#04x}, expected {expected:#04x}"
            ),
            Self::WrongModel {
                site,
                expected,
                found,
            } => write!(
                f,
                "module at {site} is model {found:#04x}, expected {expected:#04x}"
            ),
            Self::Unsupported(command) => write!(f, "carrier does not support {command:?}"),
            Self::VectorInUse(vector) => write!(f, "interrupt vector {vector:#04x} in use"),
        }
    }
}

impl std::error::Error for CarrierError {}

/// Routine run by the carrier when a module asserts its interrupt request.
///
/// Implementations execute in interrupt context: they must not block, and
/// they are never run concurrently with themselves for the same module.
pub trait InterruptService: Send + Sync {
    /// Service every pending interrupt condition of the module.
    fn service(&self);
}

/// Trait representing the carrier board driver that hosts the CAN module.
///
/// The CAN driver uses it to check that a slot really holds the expected
/// module, to find the module's registers and to wire up its interrupt.
///
/// # Safety
/// - [`Carrier::base_address`] must return a pointer to the start of the
///   requested address space of the module, mapped and accessible for the
///   remaining lifetime of the process.
/// - The I/O space of a module handed to the CAN driver must not be accessed
///   by any other code afterwards; the driver assumes it is the sole owner of
///   the registers.
/// - A handler passed to [`Carrier::connect_interrupt`] must only be invoked
///   from one context at a time per module.
///
/// # Examples
/// ```no_run
/// use std::ptr::NonNull;
/// use std::sync::Arc;
/// use tip810_core::{AddressSpace, Carrier, CarrierError, InterruptService, IrqCommand, Site};
///
/// struct SingleSlot {
///     base: NonNull<u8>,
/// }
///
/// // Safety: the board maps slot A at a fixed address nobody else uses.
/// unsafe impl Send for SingleSlot {}
/// unsafe impl Sync for SingleSlot {}
///
/// unsafe impl Carrier for SingleSlot {
///     fn validate(&self, site: Site, _manufacturer: u8, _model: u8) -> Result<(), CarrierError> {
///         if site == Site::new(0, 0) {
///             Ok(())
///         } else {
///             Err(CarrierError::NoModule(site))
///         }
///     }
///
///     fn base_address(&self, _site: Site, _space: AddressSpace) -> Result<NonNull<u8>, CarrierError> {
///         Ok(self.base)
///     }
///
///     fn irq_command(&self, _site: Site, _line: u8, command: IrqCommand) -> Result<bool, CarrierError> {
///         match command {
///             IrqCommand::Disable => Err(CarrierError::Unsupported(command)),
///             _ => Ok(false),
///         }
///     }
///
///     fn connect_interrupt(
///         &self,
///         _site: Site,
///         _vector: u8,
///         _handler: Arc<dyn InterruptService>,
///     ) -> Result<(), CarrierError> {
///         Ok(())
///     }
/// }
/// ```
pub unsafe trait Carrier: Send + Sync {
    /// Check the identification PROM of the module at `site` against the
    /// expected manufacturer and model codes.
    fn validate(&self, site: Site, manufacturer: u8, model: u8) -> Result<(), CarrierError>;

    /// Start of the given address space of the module at `site`.
    fn base_address(&self, site: Site, space: AddressSpace) -> Result<NonNull<u8>, CarrierError>;

    /// Perform `command` on interrupt request `line` of the module at `site`.
    ///
    /// For [`IrqCommand::Poll`] the returned flag tells whether the line is
    /// asserted; other commands return `false`.
    fn irq_command(&self, site: Site, line: u8, command: IrqCommand)
        -> Result<bool, CarrierError>;

    /// Arrange for `handler` to be serviced whenever the module at `site`
    /// interrupts with `vector`.
    fn connect_interrupt(
        &self,
        site: Site,
        vector: u8,
        handler: Arc<dyn InterruptService>,
    ) -> Result<(), CarrierError>;
}
