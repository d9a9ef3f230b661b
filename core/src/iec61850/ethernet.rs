// MAC addressing and IEEE 802.1Q tagging for Layer-2 frame assembly.
//
// SV and GOOSE frames are built directly at the Ethernet layer: destination
// and source MAC, an optional VLAN tag, then the application EtherType.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 802.1Q tag protocol identifier.
pub const ETHERTYPE_VLAN: u16 = 0x8100;
/// IEC 61850-9-2 Sampled Values.
pub const ETHERTYPE_SV: u16 = 0x88BA;
/// IEC 61850-8-1 GOOSE.
pub const ETHERTYPE_GOOSE: u16 = 0x88B8;

/// Errors raised while assembling Layer-2 header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameFieldError {
    InvalidMac(String),
    VlanIdOutOfRange(u16),
    VlanPriorityOutOfRange(u8),
}

impl fmt::Display for FrameFieldError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FrameFieldError::InvalidMac(s) => {
                write!(f, "invalid MAC address {:?}: expected XX:XX:XX:XX:XX:XX", s)
            }
            FrameFieldError::VlanIdOutOfRange(id) => {
                write!(f, "VLAN ID must be 0-4095, got {}", id)
            }
            FrameFieldError::VlanPriorityOutOfRange(p) => {
                write!(f, "VLAN priority must be 0-7, got {}", p)
            }
        }
    }
}

impl std::error::Error for FrameFieldError {}

/// A 6-byte Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const ZERO: MacAddr = MacAddr([0; 6]);

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }

    /// Parse the colon-separated `XX:XX:XX:XX:XX:XX` form.
    pub fn parse(s: &str) -> Result<MacAddr, FrameFieldError> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(FrameFieldError::InvalidMac(s.to_string()));
        }
        let mut octets = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 {
                return Err(FrameFieldError::InvalidMac(s.to_string()));
            }
            octets[i] = u8::from_str_radix(part, 16)
                .map_err(|_| FrameFieldError::InvalidMac(s.to_string()))?;
        }
        Ok(MacAddr(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = FrameFieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MacAddr::parse(s)
    }
}

/// An 802.1Q tag: TPID 0x8100 plus the 16-bit TCI.
///
/// TCI layout: priority (3 bits) | DEI (1 bit) | VLAN ID (12 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlanTag {
    pub priority: u8,
    pub dei: bool,
    pub id: u16,
}

impl VlanTag {
    pub fn new(priority: u8, dei: bool, id: u16) -> Result<VlanTag, FrameFieldError> {
        if priority > 7 {
            return Err(FrameFieldError::VlanPriorityOutOfRange(priority));
        }
        if id > 4095 {
            return Err(FrameFieldError::VlanIdOutOfRange(id));
        }
        Ok(VlanTag { priority, dei, id })
    }

    /// Encode the 4-byte tag, TCI big-endian.
    pub fn encode(&self) -> [u8; 4] {
        let tci = ((self.priority as u16) << 13) | ((self.dei as u16) << 12) | self.id;
        let tpid = ETHERTYPE_VLAN.to_be_bytes();
        let tci = tci.to_be_bytes();
        [tpid[0], tpid[1], tci[0], tci[1]]
    }
}
