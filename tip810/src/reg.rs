//! PCA82C200 register block as seen through the TIP810 module's I/O space
//!
//! The controller is an 8-bit part on a 16-bit Industry-Pack bus, so every
//! register occupies the odd byte of a 16-bit word. The message buffer data
//! bytes are read and written as whole words.

use bitfield::bitfield;
use core::fmt;
use core::marker::PhantomData;
use core::ptr::NonNull;
use vcell::VolatileCell;

use crate::message::{FrameKind, Message, CAN_DATA_SIZE};

/// A single 8-bit register, interpreted as `T`.
#[repr(transparent)]
pub struct Reg<T> {
    cell: VolatileCell<u8>,
    _marker: PhantomData<T>,
}

impl<T: From<u8> + Into<u8>> Reg<T> {
    /// Read the register
    #[inline(always)]
    pub fn read(&self) -> T {
        T::from(self.cell.get())
    }

    /// Write the register
    #[inline(always)]
    pub fn write(&self, value: T) {
        self.cell.set(value.into())
    }

    /// Read, change and write back the register
    #[inline(always)]
    pub fn modify(&self, f: impl FnOnce(T) -> T) {
        self.write(f(self.read()))
    }

    /// Raw bit pattern
    #[inline(always)]
    pub fn bits(&self) -> u8 {
        self.cell.get()
    }
}

macro_rules! byte_conversions {
    ($($name:ident),*) => {
        $(
            impl From<u8> for $name {
                fn from(bits: u8) -> Self {
                    Self(bits)
                }
            }

            impl From<$name> for u8 {
                fn from(value: $name) -> Self {
                    value.0
                }
            }
        )*
    };
}

bitfield! {
    /// Control register
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Control(u8);

    /// Test Mode
    pub test_mode, set_test_mode: 7;
    /// Synch
    pub synch, set_synch: 6;
    /// Overrun Interrupt Enable
    pub overrun_ie, set_overrun_ie: 4;
    /// Error Interrupt Enable
    pub error_ie, set_error_ie: 3;
    /// Transmit Interrupt Enable
    pub transmit_ie, set_transmit_ie: 2;
    /// Receive Interrupt Enable
    pub receive_ie, set_receive_ie: 1;
    /// Reset Request; the chip is held off the bus while set
    pub reset_request, set_reset_request: 0;
}

impl Control {
    /// Held in reset with every interrupt source disabled
    pub const RESET: Self = Self(0x01);
    /// Operating on the bus with the overrun, error, transmit and receive
    /// interrupts enabled
    pub const RUNNING: Self = Self(0x10 | 0x08 | 0x04 | 0x02);
}

bitfield! {
    /// Command register
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Command(u8);

    /// Goto Sleep
    pub goto_sleep, set_goto_sleep: 4;
    /// Clear Overrun Status
    pub clear_overrun, set_clear_overrun: 3;
    /// Release Receive Buffer
    pub release_receive_buffer, set_release_receive_buffer: 2;
    /// Abort Transmission
    pub abort_transmission, set_abort_transmission: 1;
    /// Transmission Request
    pub transmission_request, set_transmission_request: 0;
}

impl Command {
    /// Hand the receive buffer back to the chip
    pub const RELEASE_RECEIVE_BUFFER: Self = Self(0x04);
    /// Send the contents of the transmit buffer
    pub const TRANSMISSION_REQUEST: Self = Self(0x01);
}

bitfield! {
    /// Status register
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Status(u8);

    /// Bus Status; set while the controller is bus-off
    pub bus_off, _: 7;
    /// Error Status; an error counter reached the warning limit
    pub error, _: 6;
    /// Transmit Status
    pub transmitting, _: 5;
    /// Receive Status
    pub receiving, _: 4;
    /// Transmission Complete Status
    pub transmission_complete, _: 3;
    /// Transmit Buffer Status; set while the CPU may write the buffer
    pub transmit_buffer_released, _: 2;
    /// Data Overrun
    pub data_overrun, _: 1;
    /// Receive Buffer Status; set while a message is waiting
    pub receive_buffer_full, _: 0;
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Status")
            .field("bus", &if self.bus_off() { "Bus-Off" } else { "Bus-On" })
            .field("error", &if self.error() { "Error" } else { "Ok" })
            .field("overrun", &if self.data_overrun() { "Overrun" } else { "Ok" })
            .field("rx", &if self.receiving() { "Receiving" } else { "Idle" })
            .field(
                "rx_buffer",
                &if self.receive_buffer_full() { "Full" } else { "Empty" },
            )
            .field("tx", &if self.transmitting() { "Transmitting" } else { "Idle" })
            .field(
                "tx_complete",
                &if self.transmission_complete() { "Complete" } else { "Incomplete" },
            )
            .field(
                "tx_buffer",
                &if self.transmit_buffer_released() { "Released" } else { "Locked" },
            )
            .finish()
    }
}

bitfield! {
    /// Output control register
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct OutputControl(u8);

    /// Output driver 1 transistor configuration
    pub u8, oct1, set_oct1: 7, 6;
    /// Invert output 1
    pub ocp1, set_ocp1: 5;
    /// Output driver 0 transistor configuration
    pub u8, oct0, set_oct0: 4, 3;
    /// Invert output 0
    pub ocp0, set_ocp0: 2;
    /// Output mode
    pub u8, mode, set_mode: 1, 0;
}

impl OutputControl {
    /// Output mode: normal
    pub const MODE_NORMAL: u8 = 0b10;
    /// Transistor configuration: both transistors driven
    pub const PUSH_PULL: u8 = 0b11;

    /// Normal output mode with both drivers push-pull; how the TIP810 board
    /// is wired to its transceiver
    pub fn tip810() -> Self {
        let mut ocr = Self(0);
        ocr.set_mode(Self::MODE_NORMAL);
        ocr.set_oct0(Self::PUSH_PULL);
        ocr.set_oct1(Self::PUSH_PULL);
        ocr
    }
}

byte_conversions!(Control, Command, Status, OutputControl);

bitfield! {
    /// The two descriptor bytes of a message buffer, `descriptor0` in the
    /// high byte
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Descriptor(u16);
    impl Debug;

    /// 11-bit identifier
    pub u16, identifier, set_identifier: 15, 5;
    /// Remote Transmission Request
    pub rtr, set_rtr: 4;
    /// Data Length Code
    pub u8, dlc, set_dlc: 3, 0;
}

/// Transmit or receive message buffer
#[repr(C)]
pub struct MessageBuffer {
    _pad0: u8,
    descriptor0: VolatileCell<u8>,
    _pad1: u8,
    descriptor1: VolatileCell<u8>,
    data: [VolatileCell<u16>; CAN_DATA_SIZE],
}

impl MessageBuffer {
    /// Read both descriptor bytes
    pub fn descriptor(&self) -> Descriptor {
        Descriptor(u16::from_be_bytes([
            self.descriptor0.get(),
            self.descriptor1.get(),
        ]))
    }

    /// Write both descriptor bytes
    pub fn set_descriptor(&self, descriptor: Descriptor) {
        let [d0, d1] = descriptor.0.to_be_bytes();
        self.descriptor0.set(d0);
        self.descriptor1.set(d1);
    }

    /// Decode the buffer contents. The payload is only copied for data
    /// frames; a data length code above 8 is treated as 8.
    pub fn load(&self) -> Message {
        let descriptor = self.descriptor();
        let length = descriptor.dlc().min(CAN_DATA_SIZE as u8);
        let mut message = Message {
            identifier: descriptor.identifier(),
            kind: FrameKind::Data,
            length,
            data: [0; CAN_DATA_SIZE],
        };
        if descriptor.rtr() {
            message.kind = FrameKind::Remote;
        } else {
            for (byte, cell) in message.data.iter_mut().zip(&self.data[..length as usize]) {
                *byte = cell.get() as u8;
            }
        }
        message
    }

    /// Fill the buffer from `message`. The payload is only copied for data
    /// frames. The caller is responsible for range checking.
    pub fn store(&self, message: &Message) {
        let mut descriptor = Descriptor(0);
        descriptor.set_identifier(message.identifier);
        descriptor.set_dlc(message.length);
        match message.kind {
            FrameKind::Data => {
                for (cell, byte) in self.data.iter().zip(message.payload()) {
                    cell.set(u16::from(*byte));
                }
            }
            FrameKind::Remote => descriptor.set_rtr(true),
        }
        self.set_descriptor(descriptor);
    }
}

/// Register block of the TIP810 module: the PCA82C200 followed by the
/// module's interrupt vector register.
#[repr(C)]
pub struct RegisterBlock {
    _pad00: u8,
    /// Control register
    pub control: Reg<Control>,
    _pad01: u8,
    /// Command register (write only)
    pub command: Reg<Command>,
    _pad02: u8,
    /// Status register (read only)
    pub status: Reg<Status>,
    _pad03: u8,
    /// Interrupt register, cleared by reading
    pub interrupt: Reg<crate::interrupt::InterruptSet>,
    _pad04: u8,
    /// Acceptance code (reset mode only)
    pub acceptance_code: Reg<u8>,
    _pad05: u8,
    /// Acceptance mask (reset mode only)
    pub acceptance_mask: Reg<u8>,
    _pad06: u8,
    /// Bus timing register 0 (reset mode only)
    pub bus_timing_0: Reg<u8>,
    _pad07: u8,
    /// Bus timing register 1 (reset mode only)
    pub bus_timing_1: Reg<u8>,
    _pad08: u8,
    /// Output control (reset mode only)
    pub output_control: Reg<OutputControl>,
    _pad09: u8,
    /// Test register
    pub test: Reg<u8>,
    /// Transmit buffer
    pub tx_buffer: MessageBuffer,
    /// Receive buffer
    pub rx_buffer: MessageBuffer,
    _pad30: u8,
    _not_implemented: u8,
    _pad31: u8,
    /// Clock divider
    pub clock_divider: Reg<u8>,
    _pad40: u8,
    /// Interrupt vector presented by the module; external to the controller
    /// chip
    pub vector: Reg<u8>,
}

const _: () = assert!(core::mem::size_of::<MessageBuffer>() == 0x14);
const _: () = assert!(core::mem::size_of::<RegisterBlock>() == 0x42);

/// Owned handle to the register block of one module.
pub struct Chip {
    block: NonNull<RegisterBlock>,
}

// Safety: The registers are memory-mapped hardware. Each `Chip` is the only
// handle to its block, and access is split between the interrupt handler and
// the transmit path as the hardware protocol requires.
unsafe impl Send for Chip {}
unsafe impl Sync for Chip {}

impl Chip {
    /// # Safety
    /// `base` must point to the I/O space of a TIP810 module, mapped for the
    /// rest of the process lifetime, and no other code may access it.
    pub(crate) unsafe fn new(base: NonNull<u8>) -> Self {
        Self { block: base.cast() }
    }

    /// Hold the chip in reset with the given bit timing and the board's
    /// output configuration. Acceptance filtering is opened up completely.
    pub(crate) fn hold(&self, bus_timing_0: u8, bus_timing_1: u8) {
        self.control.write(Control::RESET);
        self.acceptance_code.write(0);
        self.acceptance_mask.write(0xff);
        self.bus_timing_0.write(bus_timing_0);
        self.bus_timing_1.write(bus_timing_1);
        self.output_control.write(OutputControl::tip810());
    }
}

impl core::ops::Deref for Chip {
    type Target = RegisterBlock;

    fn deref(&self) -> &RegisterBlock {
        // Safety: Validity of the pointer is a requirement of `Chip::new`.
        unsafe { self.block.as_ref() }
    }
}
