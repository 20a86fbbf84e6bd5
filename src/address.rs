//! Structured PCI bus addressing
//!
//! Every PCI address in the crate is a [BusAddress], parsed once at the edge
//! and carried in structured form. Slicing the `bb:ss.f` text on `:` and `.`
//! breaks on multi-digit bus numbers, so nothing else in the crate touches the
//! textual form directly.

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum AddressError {
    #[error("PCI address '{0}' does not match the bb:ss.f form")]
    Malformed(String),
    #[error("PCI address '{0}' contains a non-hexadecimal component")]
    NotHex(String),
}

/// A PCI `(bus, slot, function)` triple within domain 0000.
///
/// Parses from and formats to the canonical `bb:ss.f` text form, e.g.
/// `01:00.0` or `0a:00.1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BusAddress {
    pub bus: u8,
    pub slot: u8,
    pub function: u8,
}

impl BusAddress {
    pub fn new(bus: u8, slot: u8, function: u8) -> BusAddress {
        BusAddress {
            bus,
            slot,
            function,
        }
    }

    /// The libvirt node-device name for this address, e.g. `pci_0000_01_00_0`.
    pub fn nodedev_id(&self) -> String {
        format!(
            "pci_0000_{:02x}_{:02x}_{:x}",
            self.bus, self.slot, self.function
        )
    }

    /// Hex attribute values as libvirt expects them in a `<address/>` element.
    pub fn xml_attributes(&self) -> (String, String, String) {
        (
            format!("0x{:02x}", self.bus),
            format!("0x{:02x}", self.slot),
            format!("0x{:x}", self.function),
        )
    }

    /// Whether two addresses are functions of the same physical device.
    pub fn same_device(&self, other: &BusAddress) -> bool {
        self.bus == other.bus && self.slot == other.slot
    }
}

impl FromStr for BusAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<BusAddress, AddressError> {
        let malformed = || AddressError::Malformed(s.to_string());
        let (bus, rest) = s.split_once(':').ok_or_else(malformed)?;
        let (slot, function) = rest.split_once('.').ok_or_else(malformed)?;
        if bus.is_empty() || slot.is_empty() || function.is_empty() {
            return Err(malformed());
        }
        let parse = |part: &str| {
            u8::from_str_radix(part, 16).map_err(|_| AddressError::NotHex(s.to_string()))
        };
        Ok(BusAddress {
            bus: parse(bus)?,
            slot: parse(slot)?,
            function: parse(function)?,
        })
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{:x}", self.bus, self.slot, self.function)
    }
}

impl Serialize for BusAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BusAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<BusAddress, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}
