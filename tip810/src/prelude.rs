//! Traits needed to register callbacks and to use [`Message`] as a generic
//! CAN frame.
//!
//! [`Message`]: crate::message::Message

pub use crate::device::{MessageHandler, StatusHandler};
pub use embedded_can::Frame as _;
