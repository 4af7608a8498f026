#![warn(missing_docs)]
//! # TIP810
//!
//! ## Overview
//! This crate drives CAN buses built on the TEWS TIP810 Industry-Pack
//! module, which carries a Philips PCA82C200 CAN controller.
//!
//! It provides the following features:
//!
//! - interrupt-driven reception through a bounded queue drained by a single
//!   receive task
//! - per-identifier message callbacks and bus status callbacks
//! - blocking transmission with timeouts
//! - a request/reply helper built on remote transmission requests
//! - automatic recovery from receive overruns and bus-off
//! - parsing of textual `bus/timeout:identifier+n.offset parameter`
//!   addresses
//!
//! The module sits in a slot of an IP carrier board. Everything specific to
//! the carrier, such as mapping the module's registers and routing its
//! interrupt, is reached through the [`Carrier`] trait of
//! [`tip810_core`], which carrier drivers implement.
//!
//! ## Usage
//!
//! All buses are registered with a [`Registry`] during start-up. Once the
//! last bus is created, [`Registry::initialise`] connects the interrupts and
//! starts the receive task, after which the buses carry traffic.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use std::time::Duration;
//! # fn carrier() -> Arc<dyn tip810::carrier::Carrier> { unimplemented!() }
//! use tip810::carrier::Site;
//! use tip810::prelude::*;
//! use tip810::{BusRate, BusStatus, EngineConfig, Message, Registry};
//!
//! let mut registry = Registry::new(carrier(), EngineConfig::new());
//! let bus = registry.create("CAN1", Site::new(0, 0), 0x60, BusRate::try_from(500)?)?;
//!
//! bus.register_message_callback(
//!     0x126,
//!     Arc::new(|message: &Message| log::info!("got {:?}", message.payload())),
//! )?;
//! bus.register_status_callback(Arc::new(|status: BusStatus| {
//!     if status == BusStatus::BusOff {
//!         log::warn!("CAN1 went bus-off");
//!     }
//! }));
//!
//! registry.initialise()?;
//!
//! bus.write(&Message::new(0x100, &[1, 2, 3])?, Some(Duration::from_millis(10)))?;
//! let reply = bus.read(Message::remote(0x126, 8)?, Some(Duration::from_millis(100)))?;
//! println!("{:?}", reply.data());
//! # Ok::<(), tip810::Error>(())
//! ```
//!
//! [`Carrier`]: tip810_core::Carrier

pub mod address;
pub mod config;
pub mod device;
pub mod error;
pub mod interrupt;
pub mod message;
pub mod prelude;
pub mod queue;
pub mod reg;
pub mod registry;
pub mod sync;

#[cfg(test)]
pub(crate) mod sim;

pub use embedded_can;
pub use tip810_core as carrier;

pub use address::{Address, AddressDescriptor};
pub use config::{BusRate, EngineConfig, TimingStandard};
pub use device::{Device, Statistics};
pub use error::{Error, Result};
pub use interrupt::BusStatus;
pub use message::{FrameKind, Message};
pub use registry::Registry;
