//! Textual CAN addresses
//!
//! Device support layers name a value on a bus with a string of the form
//!
//! ```text
//! busname{/timeout}:identifier{+n}*{.offset} parameter
//! ```
//!
//! The bus name is alphanumeric; every number is a C-style integer literal
//! (`0x` prefix for hexadecimal, a leading `0` for octal, decimal
//! otherwise). The timeout is in milliseconds, the `+n` terms are added to
//! the identifier, and the offset indexes the payload. The parameter is left
//! for the caller to interpret, either as an integer or as a string.

use std::sync::Arc;
use std::time::Duration;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::message::{CAN_DATA_SIZE, CAN_IDENTIFIERS};

/// Address parsed from its textual form, before the bus name is resolved
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Address {
    /// Bus name
    pub bus_name: String,
    /// Timeout for transfers; `None` when none was given or it was negative
    pub timeout: Option<Duration>,
    /// Identifier, including every `+n` term
    pub identifier: u16,
    /// Byte offset into the payload
    pub offset: usize,
    /// Parameter read as an integer, `0` if it does not start with one
    pub parameter: i32,
    /// Whatever follows the integer parameter, or the whole parameter if it
    /// is not numeric
    pub parameter_str: String,
}

/// An [`Address`] together with the bus it names
#[derive(Clone, Debug)]
pub struct AddressDescriptor {
    /// Parsed address
    pub address: Address,
    /// The named bus
    pub device: Arc<Device>,
}

/// Parse a C integer literal at the start of `s` the way `strtol` with base
/// 0 does: leading whitespace and a sign are accepted, overflow saturates.
/// Returns the value and the number of bytes consumed, or `None` if `s` does
/// not start with a number.
fn c_integer(s: &str) -> Option<(i64, usize)> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while bytes.get(i).map_or(false, |b| b.is_ascii_whitespace()) {
        i += 1;
    }
    let negative = match bytes.get(i) {
        Some(b'-') => {
            i += 1;
            true
        }
        Some(b'+') => {
            i += 1;
            false
        }
        _ => false,
    };

    let hex_prefix = bytes.get(i) == Some(&b'0')
        && matches!(bytes.get(i + 1), Some(b'x' | b'X'))
        && bytes.get(i + 2).map_or(false, |b| b.is_ascii_hexdigit());
    let (radix, start) = match bytes.get(i) {
        _ if hex_prefix => (16, i + 2),
        Some(b'0') => (8, i),
        _ => (10, i),
    };

    let mut end = start;
    let mut value: i64 = 0;
    while let Some(digit) = bytes.get(end).and_then(|b| char::from(*b).to_digit(radix)) {
        value = value
            .saturating_mul(i64::from(radix))
            .saturating_add(i64::from(digit));
        end += 1;
    }
    if end == start {
        return None;
    }
    Some((if negative { -value } else { value }, end))
}

struct Cursor<'a> {
    rest: &'a str,
}

impl<'a> Cursor<'a> {
    fn number(&mut self) -> Option<i64> {
        let (value, used) = c_integer(self.rest)?;
        self.rest = &self.rest[used..];
        Some(value)
    }

    /// Take the next character; `None` at the end of the string
    fn separator(&mut self) -> Option<char> {
        let mut chars = self.rest.chars();
        let c = chars.next()?;
        self.rest = chars.as_str();
        Some(c)
    }
}

/// Parse `text` without resolving the bus name.
pub fn parse(text: &str) -> Result<Address> {
    let start = text
        .find(|c: char| c.is_ascii_alphanumeric())
        .ok_or(Error::BadAddress)?;
    let text = &text[start..];

    let name_end = text.find(['/', ':']).ok_or(Error::BadAddress)?;
    let bus_name = text[..name_end].to_owned();
    let mut cursor = Cursor {
        rest: &text[name_end..],
    };
    let mut separator = cursor.separator();

    let mut timeout = None;
    if separator == Some('/') {
        let ms = cursor.number().unwrap_or(0);
        timeout = u64::try_from(ms).ok().map(Duration::from_millis);
        separator = cursor.separator();
    }

    if separator != Some(':') {
        return Err(Error::BadAddress);
    }
    let mut identifier = cursor.number().ok_or(Error::BadAddress)?;
    separator = cursor.separator();

    while separator == Some('+') {
        identifier = identifier.saturating_add(cursor.number().unwrap_or(0));
        separator = cursor.separator();
    }
    let identifier = u16::try_from(identifier)
        .ok()
        .filter(|id| usize::from(*id) < CAN_IDENTIFIERS)
        .ok_or(Error::BadAddress)?;

    let mut offset = 0;
    if separator == Some('.') {
        offset = cursor
            .number()
            .and_then(|o| usize::try_from(o).ok())
            .filter(|o| *o < CAN_DATA_SIZE)
            .ok_or(Error::BadAddress)?;
        separator = cursor.separator();
    }

    let (parameter, parameter_str) = match separator {
        None => (0, String::new()),
        Some(' ' | '\t') => {
            let whole = cursor.rest;
            match cursor.number() {
                Some(value) => {
                    let clamped = value.clamp(i64::from(i32::MIN), i64::from(i32::MAX));
                    (clamped as i32, cursor.rest.to_owned())
                }
                None => (0, whole.to_owned()),
            }
        }
        Some(_) => return Err(Error::BadAddress),
    };

    Ok(Address {
        bus_name,
        timeout,
        identifier,
        offset,
        parameter,
        parameter_str,
    })
}
