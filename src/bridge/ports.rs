//! Port-mask protection for the generic port I/O command.
//!
//! A host-issued port write must never alter pins that are statically
//! reserved for JTAG on the configured port. The reserved bits of the
//! request are replaced with the pins' current hardware state before the
//! request is applied.

use std::fmt;
use std::str::FromStr;

use crate::hal::{Hal, Port};

/// Which port, if any, carries the reserved JTAG pins.
///
/// Resolved once at startup from configuration. Ports A and B never carry
/// host-maskable JTAG pins and need no protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MaskPort {
    None,
    PortC,
    PortD,
}

impl fmt::Display for MaskPort {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MaskPort::None => f.write_str("none"),
            MaskPort::PortC => f.write_str("C"),
            MaskPort::PortD => f.write_str("D"),
        }
    }
}

impl FromStr for MaskPort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match &s.to_ascii_lowercase()[..] {
            "none" => Ok(MaskPort::None),
            "c" => Ok(MaskPort::PortC),
            "d" => Ok(MaskPort::PortD),
            _ => Err(format!("'{s}' is not a valid mask port. Choose from [none, c, d].")),
        }
    }
}

/// Replace the `reserved` bits of `requested` with their `current` hardware
/// state, leaving every other bit of the request untouched.
pub fn mask(requested: u8, current: u8, reserved: u8) -> u8 {
    (requested & !reserved) | (current & reserved)
}

/// One port I/O request: pin values and direction bytes for ports D and C.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRequest {
    pub pd_pins: u8,
    pub pc_pins: u8,
    pub pd_dir: u8,
    pub pc_dir: u8,
}

impl MaskPort {
    /// Rewrite `req` so the reserved JTAG pins of the protected port keep
    /// their current state regardless of what the host asked for.
    pub fn protect(self, req: &mut PortRequest, hal: &impl Hal, reserved: u8) {
        match self {
            MaskPort::None => {}
            MaskPort::PortC => {
                req.pc_dir = mask(req.pc_dir, hal.dir(Port::C), reserved);
                req.pc_pins = mask(req.pc_pins, hal.pins(Port::C), reserved);
            }
            MaskPort::PortD => {
                req.pd_dir = mask(req.pd_dir, hal.dir(Port::D), reserved);
                req.pd_pins = mask(req.pd_pins, hal.pins(Port::D), reserved);
            }
        }
    }
}
