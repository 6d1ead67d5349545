//! ARP frames for IPv4 link-local probing (RFC 3927).

use std::net::Ipv4Addr;

use miracle_shared::CoreError;

/// Wire size of an Ethernet/IPv4 ARP frame body.
pub const FRAME_LEN: usize = 28;

pub const OP_REQUEST: u16 = 1;
pub const OP_REPLY: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpFrame {
    pub op: u16,
    pub sha: [u8; 6],
    pub spa: Ipv4Addr,
    pub tha: [u8; 6],
    pub tpa: Ipv4Addr,
}

impl ArpFrame {
    /// An address probe: sender protocol address zero, target = candidate.
    pub fn probe(mac: [u8; 6], candidate: Ipv4Addr) -> Self {
        Self {
            op: OP_REQUEST,
            sha: mac,
            spa: Ipv4Addr::UNSPECIFIED,
            tha: [0; 6],
            tpa: candidate,
        }
    }

    /// An announcement (and defence): sender == target == claimed address.
    pub fn announce(mac: [u8; 6], addr: Ipv4Addr) -> Self {
        Self {
            op: OP_REQUEST,
            sha: mac,
            spa: addr,
            tha: [0; 6],
            tpa: addr,
        }
    }

    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut b = [0u8; FRAME_LEN];
        b[0..2].copy_from_slice(&1u16.to_be_bytes()); // ARPHRD_ETHER
        b[2..4].copy_from_slice(&0x0800u16.to_be_bytes()); // IPv4
        b[4] = 6;
        b[5] = 4;
        b[6..8].copy_from_slice(&self.op.to_be_bytes());
        b[8..14].copy_from_slice(&self.sha);
        b[14..18].copy_from_slice(&self.spa.octets());
        b[18..24].copy_from_slice(&self.tha);
        b[24..28].copy_from_slice(&self.tpa.octets());
        b
    }

    pub fn decode(data: &[u8]) -> Result<Self, CoreError> {
        if data.len() < FRAME_LEN {
            return Err(CoreError::protocol("short ARP frame"));
        }
        if data[0..2] != 1u16.to_be_bytes()
            || data[2..4] != 0x0800u16.to_be_bytes()
            || data[4] != 6
            || data[5] != 4
        {
            return Err(CoreError::protocol("not an Ethernet/IPv4 ARP frame"));
        }
        let op = u16::from_be_bytes([data[6], data[7]]);
        if op != OP_REQUEST && op != OP_REPLY {
            return Err(CoreError::protocol("unhandled ARP opcode"));
        }
        let mut sha = [0u8; 6];
        sha.copy_from_slice(&data[8..14]);
        let mut tha = [0u8; 6];
        tha.copy_from_slice(&data[18..24]);
        Ok(Self {
            op,
            sha,
            spa: Ipv4Addr::new(data[14], data[15], data[16], data[17]),
            tha,
            tpa: Ipv4Addr::new(data[24], data[25], data[26], data[27]),
        })
    }
}

/// How a received ARP frame clashes with the address we hold or probe for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conflict {
    /// Someone else is using the address (`spa` matches).
    Source,
    /// Someone else is probing for the address (`tpa` matches).
    Target,
}

/// Classify `frame` against our candidate address.
pub fn conflict(frame: &ArpFrame, candidate: Ipv4Addr) -> Option<Conflict> {
    if frame.spa == candidate {
        Some(Conflict::Source)
    } else if frame.tpa == candidate {
        Some(Conflict::Target)
    } else {
        None
    }
}
