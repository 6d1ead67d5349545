//! DHCPv6 wire format (RFC 3315/3633).
//!
//! Messages are a 4-byte header (type + 24-bit transaction id) followed by
//! TLV options with 16-bit code and length. Identity associations carry
//! sub-options in the same TLV format.

use std::net::Ipv6Addr;

use miracle_shared::{CoreError, ErrorKind};

pub const MAX_PKT_SIZE: usize = 1500;

/// Seconds between the unix epoch and 2000-01-01, the DUID time base.
pub const DUID_TIME_EPOCH: u64 = 946_684_800;

/// Option codes.
pub mod opt {
    pub const CLIENTID: u16 = 1;
    pub const SERVERID: u16 = 2;
    pub const IA_NA: u16 = 3;
    pub const IA_TA: u16 = 4;
    pub const IAADDR: u16 = 5;
    pub const ORO: u16 = 6;
    pub const PREFERENCE: u16 = 7;
    pub const ELAPSED_TIME: u16 = 8;
    pub const STATUS_CODE: u16 = 13;
    pub const RAPID_COMMIT: u16 = 14;
    pub const DNS_SERVERS: u16 = 23;
    pub const DOMAIN_LIST: u16 = 24;
    pub const IA_PD: u16 = 25;
    pub const IA_PREFIX: u16 = 26;
    pub const SNTP_SERVERS: u16 = 31;
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum V6MessageType {
    Solicit = 1,
    Advertise = 2,
    Request = 3,
    Confirm = 4,
    Renew = 5,
    Rebind = 6,
    Reply = 7,
    Release = 8,
    Decline = 9,
    Reconfigure = 10,
    InformationReq = 11,
}

impl From<V6MessageType> for u8 {
    fn from(val: V6MessageType) -> u8 {
        val as u8
    }
}

impl TryFrom<u8> for V6MessageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        Ok(match value {
            1 => Self::Solicit,
            2 => Self::Advertise,
            3 => Self::Request,
            4 => Self::Confirm,
            5 => Self::Renew,
            6 => Self::Rebind,
            7 => Self::Reply,
            8 => Self::Release,
            9 => Self::Decline,
            10 => Self::Reconfigure,
            11 => Self::InformationReq,
            x => return Err(x),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuidType {
    /// Link-layer plus time (type 1).
    Llt,
    /// Vendor enterprise number (type 2), not supported.
    En,
    /// Link-layer only (type 3).
    Ll,
}

/// Build a client DUID from the hardware address.
pub fn create_duid(
    duid_type: DuidType,
    mac: &[u8; 6],
    hw_type: u8,
    now_unix: u64,
) -> Result<Vec<u8>, CoreError> {
    match duid_type {
        DuidType::Llt => {
            let mut duid = Vec::with_capacity(2 + 2 + 4 + 6);
            duid.extend_from_slice(&[0, 1, 0, hw_type]);
            let duid_time = now_unix.saturating_sub(DUID_TIME_EPOCH) as u32;
            duid.extend_from_slice(&duid_time.to_be_bytes());
            duid.extend_from_slice(mac);
            Ok(duid)
        }
        DuidType::Ll => {
            let mut duid = Vec::with_capacity(2 + 2 + 6);
            duid.extend_from_slice(&[0, 3, 0, hw_type]);
            duid.extend_from_slice(mac);
            Ok(duid)
        }
        DuidType::En => Err(CoreError::new(
            ErrorKind::InvalidArgument,
            "enterprise DUIDs are not supported",
        )),
    }
}

/// Identity association id derived from the hardware address: its last
/// four bytes.
pub fn iaid_from_mac(mac: &[u8; 6]) -> u32 {
    u32::from_be_bytes([mac[2], mac[3], mac[4], mac[5]])
}

/// Outgoing message under assembly.
#[derive(Debug)]
pub struct MessageBuf {
    buf: Vec<u8>,
}

impl MessageBuf {
    pub fn new(mtype: V6MessageType, xid: u32) -> Self {
        let mut buf = Vec::with_capacity(128);
        buf.push(mtype.into());
        buf.push((xid >> 16) as u8);
        buf.push((xid >> 8) as u8);
        buf.push(xid as u8);
        Self { buf }
    }

    pub fn append_option(&mut self, code: u16, data: &[u8]) -> Result<(), CoreError> {
        if self.buf.len() + 4 + data.len() > MAX_PKT_SIZE {
            return Err(CoreError::protocol("DHCPv6 message too long"));
        }
        self.buf.extend_from_slice(&code.to_be_bytes());
        self.buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Append a pre-assembled TLV (4-byte header included).
    pub fn append_raw(&mut self, tlv: &[u8]) -> Result<(), CoreError> {
        if self.buf.len() + tlv.len() > MAX_PKT_SIZE {
            return Err(CoreError::protocol("DHCPv6 message too long"));
        }
        self.buf.extend_from_slice(tlv);
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

/// Assemble one TLV.
pub fn make_option(code: u16, data: &[u8]) -> Vec<u8> {
    let mut tlv = Vec::with_capacity(4 + data.len());
    tlv.extend_from_slice(&code.to_be_bytes());
    tlv.extend_from_slice(&(data.len() as u16).to_be_bytes());
    tlv.extend_from_slice(data);
    tlv
}

/// Parsed view over a received message.
#[derive(Debug, Clone, Copy)]
pub struct Message<'a> {
    data: &'a [u8],
}

impl<'a> Message<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, CoreError> {
        if data.len() < 4 {
            return Err(CoreError::protocol("short DHCPv6 packet"));
        }
        Ok(Self { data })
    }

    pub fn msg_type(&self) -> Option<V6MessageType> {
        V6MessageType::try_from(self.data[0]).ok()
    }

    /// 24-bit transaction id.
    pub fn xid(&self) -> u32 {
        u32::from(self.data[1]) << 16 | u32::from(self.data[2]) << 8 | u32::from(self.data[3])
    }

    /// First occurrence of `code` plus the number of occurrences.
    pub fn option_with_count(&self, code: u16) -> (Option<&'a [u8]>, usize) {
        let mut found = None;
        let mut count = 0;
        for (c, data) in OptionIter::new(&self.data[4..]) {
            if c == code {
                if found.is_none() {
                    found = Some(data);
                }
                count += 1;
            }
        }
        (found, count)
    }

    pub fn option(&self, code: u16) -> Option<&'a [u8]> {
        self.option_with_count(code).0
    }
}

/// TLV walk; stops at the first malformed header.
pub struct OptionIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> OptionIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl<'a> Iterator for OptionIter<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos + 4 > self.data.len() {
            return None;
        }
        let code = u16::from_be_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        let len = usize::from(u16::from_be_bytes([
            self.data[self.pos + 2],
            self.data[self.pos + 3],
        ]));
        let start = self.pos + 4;
        if start + len > self.data.len() {
            return None;
        }
        self.pos = start + len;
        Some((code, &self.data[start..start + len]))
    }
}

/// Iterate sub-options inside an IA body starting at `offset`.
pub fn sub_options(body: &[u8], offset: usize) -> OptionIter<'_> {
    OptionIter::new(body.get(offset..).unwrap_or(&[]))
}

// --- identity association bodies ---

pub fn iaaddr_body(addr: Ipv6Addr, preferred: u32, valid: u32) -> Vec<u8> {
    let mut b = Vec::with_capacity(24);
    b.extend_from_slice(&addr.octets());
    b.extend_from_slice(&preferred.to_be_bytes());
    b.extend_from_slice(&valid.to_be_bytes());
    b
}

pub fn ia_prefix_body(prefix: Ipv6Addr, prefixlen: u8, preferred: u32, valid: u32) -> Vec<u8> {
    let mut b = Vec::with_capacity(25);
    b.extend_from_slice(&preferred.to_be_bytes());
    b.extend_from_slice(&valid.to_be_bytes());
    b.push(prefixlen);
    b.extend_from_slice(&prefix.octets());
    b
}

/// IA_NA body: iaid, T1, T2, optionally one IAADDR sub-option.
pub fn ia_na_body(iaid: u32, t1: u32, t2: u32, addr: Option<Ipv6Addr>) -> Vec<u8> {
    let mut b = Vec::with_capacity(40);
    b.extend_from_slice(&iaid.to_be_bytes());
    b.extend_from_slice(&t1.to_be_bytes());
    b.extend_from_slice(&t2.to_be_bytes());
    if let Some(addr) = addr {
        b.extend_from_slice(&make_option(opt::IAADDR, &iaaddr_body(addr, 0, 0)));
    }
    b
}

/// IA_TA body: just the iaid.
pub fn ia_ta_body(iaid: u32) -> Vec<u8> {
    iaid.to_be_bytes().to_vec()
}

/// IA_PD body: iaid, T1, T2 and one IA_PREFIX per requested prefix.
pub fn ia_pd_body(iaid: u32, t1: u32, t2: u32, prefixes: &[(Ipv6Addr, u8)]) -> Vec<u8> {
    let mut b = Vec::with_capacity(12 + prefixes.len() * 29);
    b.extend_from_slice(&iaid.to_be_bytes());
    b.extend_from_slice(&t1.to_be_bytes());
    b.extend_from_slice(&t2.to_be_bytes());
    for &(prefix, prefixlen) in prefixes {
        // preferred and valid lifetimes stay zero on request
        b.extend_from_slice(&make_option(opt::IA_PREFIX, &ia_prefix_body(prefix, prefixlen, 0, 0)));
    }
    b
}

pub fn oro_body(codes: &[u16]) -> Vec<u8> {
    let mut b = Vec::with_capacity(codes.len() * 2);
    for code in codes {
        b.extend_from_slice(&code.to_be_bytes());
    }
    b
}

/// A delegated prefix extracted from an IA_PD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixLease {
    pub prefix: Ipv6Addr,
    pub prefixlen: u8,
    pub preferred: u32,
    pub valid: u32,
    /// Unix seconds.
    pub expire: u64,
}

/// Decode an RFC 1035 domain list into dotted names.
pub fn decode_domain_list(data: &[u8]) -> Vec<String> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let mut name = String::new();
        loop {
            let Some(&len) = data.get(pos) else {
                return out;
            };
            pos += 1;
            if len == 0 {
                break;
            }
            let end = pos + usize::from(len);
            let Some(label) = data.get(pos..end) else {
                return out;
            };
            if !name.is_empty() {
                name.push('.');
            }
            name.push_str(&String::from_utf8_lossy(label));
            pos = end;
        }
        if !name.is_empty() {
            out.push(name);
        }
    }
    out
}
