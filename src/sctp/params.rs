//! INIT / INIT_ACK parameter lists.

use super::{pad4, DecodeError};

const PARAM_HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parameter<'a> {
    /// Offset of the parameter header within the parameter list.
    pub offset: usize,
    pub param_type: u16,
    pub value: &'a [u8],
}

impl Parameter<'_> {
    pub fn name(&self) -> &'static str {
        param_name(self.param_type)
    }
}

pub fn param_name(param_type: u16) -> &'static str {
    match param_type {
        0x0001 => "HEARTBEAT_INFO",
        0x0005 => "IPV4_ADDRESS",
        0x0006 => "IPV6_ADDRESS",
        0x0007 => "STATE_COOKIE",
        0x0008 => "UNRECOGNIZED_PARAMETER",
        0x0009 => "COOKIE_PRESERVATIVE",
        0x000b => "HOSTNAME_ADDRESS",
        0x000c => "SUPPORTED_ADDRESS_TYPES",
        0x8000 => "ECN",
        0x8001 => "ZERO_CHECKSUM_ACCEPTABLE",
        0x8002 => "RANDOM",
        0x8003 => "CHUNKS",
        0x8004 => "HMAC_ALGORITHMS",
        0x8005 => "PADDING",
        0x8008 => "SUPPORTED_EXTENSIONS",
        0xc000 => "FORWARD_TSN_SUPPORTED",
        0xc001 => "ADD_IP_ADDRESS",
        0xc002 => "DELETE_IP_ADDRESS",
        0xc003 => "ERROR_CAUSE_INDICATION",
        0xc004 => "SET_PRIMARY_ADDRESS",
        0xc005 => "SUCCESS_REPORT",
        0xc006 => "ADAPTATION_LAYER_INDICATION",
        _ => "UNKNOWN",
    }
}

/// Iterator over a TLV parameter list. A malformed length yields one error
/// and ends the walk.
pub struct Parameters<'a> {
    bytes: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> Parameters<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Parameters {
            bytes,
            offset: 0,
            done: false,
        }
    }
}

impl<'a> Iterator for Parameters<'a> {
    type Item = Result<Parameter<'a>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.bytes.len() - self.offset < PARAM_HEADER_LEN {
            return None;
        }
        let at = self.offset;
        let remaining = self.bytes.len() - at;
        let param_type = u16::from_be_bytes([self.bytes[at], self.bytes[at + 1]]);
        let declared = u16::from_be_bytes([self.bytes[at + 2], self.bytes[at + 3]]);

        if (declared as usize) < PARAM_HEADER_LEN {
            self.done = true;
            return Some(Err(DecodeError::ParameterLengthTooSmall {
                offset: at,
                declared,
            }));
        }
        if declared as usize > remaining {
            self.done = true;
            return Some(Err(DecodeError::ParameterOverrun {
                offset: at,
                declared,
                remaining,
            }));
        }

        self.offset = (at + pad4(declared as usize)).min(self.bytes.len());
        Some(Ok(Parameter {
            offset: at,
            param_type,
            value: &self.bytes[at + PARAM_HEADER_LEN..at + declared as usize],
        }))
    }
}
