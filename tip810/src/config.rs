//! Bus rate selection and engine configuration

use crate::error::{Error, Result};
use fugit::{KilohertzU32, RateExtU32};

/// Which sample-point convention the timing values follow
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TimingStandard {
    /// Timing recommended by the chip vendor
    Philips,
    /// Timing used by Kvaser interfaces; needed to share a bus with them
    Kvaser,
}

/// Requested bit rate of a bus
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BusRate {
    /// Bit rate; 1 kHz is 1 kbit/s
    pub rate: KilohertzU32,
    /// Timing convention
    pub timing: TimingStandard,
}

impl BusRate {
    /// Rate with the standard timing
    pub fn new(rate: KilohertzU32) -> Self {
        Self {
            rate,
            timing: TimingStandard::Philips,
        }
    }

    /// Rate with the Kvaser timing
    pub fn kvaser(rate: KilohertzU32) -> Self {
        Self {
            rate,
            timing: TimingStandard::Kvaser,
        }
    }

    /// Bus timing register values for this rate
    pub fn timing(&self) -> Result<BusTiming> {
        BusTiming::lookup(*self)
    }

    fn as_kbits(&self) -> i32 {
        let kbits = i32::try_from(self.rate.to_kHz()).unwrap_or(i32::MAX);
        match self.timing {
            TimingStandard::Philips => kbits,
            TimingStandard::Kvaser => -kbits,
        }
    }
}

/// Start-up scripts give the rate in kbit/s; negative values select the
/// Kvaser timing.
impl TryFrom<i32> for BusRate {
    type Error = Error;

    fn try_from(kbits: i32) -> Result<Self> {
        let rate = kbits.unsigned_abs().kHz();
        let rate = match kbits {
            0 => return Err(Error::BadBusRate(kbits)),
            1.. => Self::new(rate),
            _ => Self::kvaser(rate),
        };
        rate.timing()?;
        Ok(rate)
    }
}

impl core::fmt::Display for BusRate {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} kbit/s", self.rate.to_kHz())?;
        if self.timing == TimingStandard::Kvaser {
            write!(f, " (Kvaser)")?;
        }
        Ok(())
    }
}

/// Values for the two bus timing registers
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BusTiming {
    /// Baud rate prescaler and synchronisation jump width
    pub btr0: u8,
    /// Segment lengths and sampling mode
    pub btr1: u8,
}

const TIMING_TABLE: [(i32, BusTiming); 14] = [
    (5, BusTiming { btr0: 0x7f, btr1: 0x7f }),
    (10, BusTiming { btr0: 0x67, btr1: 0x2f }),
    (20, BusTiming { btr0: 0x53, btr1: 0x2f }),
    (50, BusTiming { btr0: 0x47, btr1: 0x2f }),
    (100, BusTiming { btr0: 0x43, btr1: 0x2f }),
    (125, BusTiming { btr0: 0x03, btr1: 0x1c }),
    (250, BusTiming { btr0: 0x01, btr1: 0x1c }),
    (500, BusTiming { btr0: 0x00, btr1: 0x1c }),
    (1000, BusTiming { btr0: 0x00, btr1: 0x14 }),
    (1600, BusTiming { btr0: 0x00, btr1: 0x11 }),
    (-125, BusTiming { btr0: 0x07, btr1: 0x23 }),
    (-250, BusTiming { btr0: 0x03, btr1: 0x23 }),
    (-500, BusTiming { btr0: 0x01, btr1: 0x23 }),
    (-1000, BusTiming { btr0: 0x00, btr1: 0x23 }),
];

impl BusTiming {
    /// Find the register values for `rate`. Only the rates of the 16 MHz
    /// TIP810 oscillator table are supported.
    pub fn lookup(rate: BusRate) -> Result<Self> {
        let kbits = rate.as_kbits();
        TIMING_TABLE
            .iter()
            .find(|(r, _)| *r == kbits)
            .map(|(_, timing)| *timing)
            .ok_or(Error::BadBusRate(kbits))
    }
}

/// Engine-wide settings
#[derive(Copy, Clone, Debug)]
pub struct EngineConfig {
    /// Number of received messages buffered between the interrupt handler
    /// and the receive task
    pub receive_queue_capacity: usize,
    /// Suppress interrupt-context log notices about bus errors and queue
    /// overflows
    pub silence_errors: bool,
}

impl EngineConfig {
    /// Create an instance with the default settings
    pub fn new() -> Self {
        Self {
            receive_queue_capacity: 1000,
            silence_errors: false,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}
