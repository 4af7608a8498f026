//! Interrupt sources and the per-bus interrupt service routine

use bitfield::bitfield;
use std::sync::Arc;
use tip810_core::InterruptService;

use crate::device::{Counters, Device};
use crate::queue::{Producer, Receipt};
use crate::reg::{Command, Status};

bitfield! {
    /// A set of chip interrupt sources, as found in the interrupt register.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct InterruptSet(u8);

    /// Wake-Up Interrupt
    pub wake_up, set_wake_up: 4;
    /// Overrun Interrupt
    pub overrun, set_overrun: 3;
    /// Error Interrupt; the error or bus status changed
    pub error, set_error: 2;
    /// Transmit Interrupt
    pub transmit, set_transmit: 1;
    /// Receive Interrupt
    pub receive, set_receive: 0;
}

impl InterruptSet {
    /// No interrupt pending
    pub const NONE: Self = Self(0);
    /// Receive Interrupt only
    pub const RECEIVE: Self = Self(0x01);
    /// Transmit Interrupt only
    pub const TRANSMIT: Self = Self(0x02);
    /// Error Interrupt only
    pub const ERROR: Self = Self(0x04);
    /// Overrun Interrupt only
    pub const OVERRUN: Self = Self(0x08);
    /// Wake-Up Interrupt only
    pub const WAKE_UP: Self = Self(0x10);

    /// An iterator visiting all elements in ascending bit order.
    pub fn iter(&self) -> Iter {
        Iter {
            flags: *self,
            index: 0,
        }
    }
}

impl From<u8> for InterruptSet {
    fn from(bits: u8) -> Self {
        Self(bits)
    }
}

impl From<InterruptSet> for u8 {
    fn from(set: InterruptSet) -> Self {
        set.0
    }
}

impl core::fmt::Debug for InterruptSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "InterruptSet {{ ")?;
        for int in self.iter() {
            write!(f, "{} ", int.mnemonic())?;
        }
        write!(f, "}}")
    }
}

/// A single interrupt source.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Interrupt {
    /// RI
    Receive = 0,
    /// TI
    Transmit = 1,
    /// EI
    ErrorStatus = 2,
    /// OI
    Overrun = 3,
    /// WUI
    WakeUp = 4,
}

impl Interrupt {
    fn mnemonic(self) -> &'static str {
        match self {
            Interrupt::Receive => "RI",
            Interrupt::Transmit => "TI",
            Interrupt::ErrorStatus => "EI",
            Interrupt::Overrun => "OI",
            Interrupt::WakeUp => "WUI",
        }
    }
}

impl From<Interrupt> for u8 {
    fn from(x: Interrupt) -> Self {
        1 << x as u8
    }
}

/// The value is not the bit number of any interrupt source
#[derive(Debug)]
pub struct InvalidInterruptNumber;

impl TryFrom<u8> for Interrupt {
    type Error = InvalidInterruptNumber;

    fn try_from(value: u8) -> Result<Self, InvalidInterruptNumber> {
        use Interrupt::*;
        let ret = match value {
            0 => Receive,
            1 => Transmit,
            2 => ErrorStatus,
            3 => Overrun,
            4 => WakeUp,
            5.. => Err(InvalidInterruptNumber)?,
        };
        Ok(ret)
    }
}

/// An iterator over the items of an [`InterruptSet`].
///
/// This `struct` is created by [`InterruptSet::iter`].
pub struct Iter {
    flags: InterruptSet,
    index: u8,
}

impl Iterator for Iter {
    type Item = Interrupt;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let i = self.index;
            self.index = self.index.saturating_add(1);
            // The interrupt bits have no gaps, so the first invalid index
            // ends the iteration.
            let int = Interrupt::try_from(i).ok()?;
            if self.flags.0 & u8::from(int) != 0 {
                return Some(int);
            }
        }
    }
}

/// State of the bus as reported to status callbacks
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BusStatus {
    /// Error counters are below the warning limit
    Ok,
    /// An error counter reached the warning limit
    BusError,
    /// The chip has left the bus
    BusOff,
}

impl From<Status> for BusStatus {
    fn from(status: Status) -> Self {
        if status.bus_off() {
            BusStatus::BusOff
        } else if status.error() {
            BusStatus::BusError
        } else {
            BusStatus::Ok
        }
    }
}

/// Interrupt service routine of one bus.
///
/// Runs in interrupt context: it never blocks, and it is the only code that
/// reads the receive buffer or pushes onto the receive queue.
pub(crate) struct InterruptHandler {
    device: Arc<Device>,
    queue: Producer<Receipt>,
}

impl InterruptHandler {
    pub(crate) fn new(device: Arc<Device>, queue: Producer<Receipt>) -> Self {
        Self { device, queue }
    }

    fn notice(&self, args: core::fmt::Arguments<'_>) {
        if !self.device.silence_errors {
            log::warn!("{}: {}", self.device.name(), args);
        }
    }

    fn receive(&self) {
        let chip = &self.device.chip;
        let message = chip.rx_buffer.load();
        chip.command.write(Command::RELEASE_RECEIVE_BUFFER);

        let receipt = Receipt {
            device: self.device.clone(),
            message,
        };
        match self.queue.try_push(receipt) {
            Ok(()) => {}
            Err(nb::Error::WouldBlock) => {
                self.notice(format_args!("receive queue overflow"));
            }
            Err(nb::Error::Other(_)) => {
                self.notice(format_args!("receive task gone, message dropped"));
            }
        }
    }

    fn error(&self) {
        let device = &self.device;
        let status = BusStatus::from(device.chip.status.read());
        match status {
            BusStatus::BusError => {
                Counters::bump(&device.counters.errors);
                self.notice(format_args!("bus error"));
            }
            BusStatus::BusOff => {
                Counters::bump(&device.counters.bus_off);
                device.tx_ready.signal();
                device.chip.control.modify(|mut c| {
                    c.set_reset_request(false);
                    c
                });
                self.notice(format_args!("bus off"));
            }
            BusStatus::Ok => {
                if !device.silence_errors {
                    log::info!("{}: bus ok", device.name());
                }
            }
        }
        device.notify_status(status);
    }
}

impl InterruptService for InterruptHandler {
    fn service(&self) {
        let device = &self.device;
        let mut pending = device.chip.interrupt.read();
        log::trace!("{}: {:?}", device.name(), pending);

        if pending.overrun() {
            Counters::bump(&device.counters.overruns);
            // Stopping resets the chip, which may discard other pending
            // sources, so rescan afterwards.
            device.stop();
            device.resume();
            pending = device.chip.interrupt.read();
            log::trace!("{}: after overrun {:?}", device.name(), pending);
        }

        if pending.receive() {
            self.receive();
        }

        if pending.error() {
            self.error();
        }

        if pending.transmit() {
            Counters::bump(&device.counters.transmitted);
            device.tx_ready.signal();
        }

        if pending.wake_up() && !device.silence_errors {
            log::info!("{}: wake-up interrupt", device.name());
        }
    }
}
