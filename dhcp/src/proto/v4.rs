//! BOOTP/DHCPv4 packet format (RFC 2131/2132).

use std::net::Ipv4Addr;

use miracle_shared::{CoreError, ErrorKind};

/// Size of the regular options area.
pub const OPTIONS_BUFSIZE: usize = 308;
/// Extra tail tolerated on receive, for servers that overrun the RFC size.
pub const EXTEND_FOR_BUGGY_SERVERS: usize = 80;
/// Fixed BOOTP header size up to (excluding) the cookie.
pub const HEADER_SIZE: usize = 236;
/// Wire size of an outgoing packet: header, cookie, options.
pub const WIRE_SIZE: usize = HEADER_SIZE + 4 + OPTIONS_BUFSIZE;

pub const MAGIC: u32 = 0x6382_5363;

pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;

pub const BROADCAST_FLAG: u16 = 0x8000;

/// Option codes (RFC 2132).
pub mod opt {
    pub const PADDING: u8 = 0x00;
    pub const SUBNET: u8 = 0x01;
    pub const ROUTER: u8 = 0x03;
    pub const TIME_SERVER: u8 = 0x04;
    pub const NAME_SERVER: u8 = 0x05;
    pub const DNS_SERVER: u8 = 0x06;
    pub const HOST_NAME: u8 = 0x0c;
    pub const DOMAIN_NAME: u8 = 0x0f;
    pub const NTP_SERVER: u8 = 0x2a;
    pub const REQUESTED_IP: u8 = 0x32;
    pub const LEASE_TIME: u8 = 0x33;
    pub const OPTION_OVERLOAD: u8 = 0x34;
    pub const MESSAGE_TYPE: u8 = 0x35;
    pub const SERVER_ID: u8 = 0x36;
    pub const PARAM_REQ: u8 = 0x37;
    pub const ERR_MESSAGE: u8 = 0x38;
    pub const MAX_SIZE: u8 = 0x39;
    pub const VENDOR: u8 = 0x3c;
    pub const CLIENT_ID: u8 = 0x3d;
    pub const END: u8 = 0xff;
}

const OVERLOAD_FILE: u8 = 1;
const OVERLOAD_SNAME: u8 = 2;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl From<MessageType> for u8 {
    fn from(val: MessageType) -> u8 {
        val as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        Ok(match value {
            1 => Self::Discover,
            2 => Self::Offer,
            3 => Self::Request,
            4 => Self::Decline,
            5 => Self::Ack,
            6 => Self::Nak,
            7 => Self::Release,
            8 => Self::Inform,
            x => return Err(x),
        })
    }
}

/// Value layout of a known option.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum OptionType {
    Ip,
    IpList,
    Str,
    U8,
    U16,
    U32,
}

impl OptionType {
    /// Size of one element in binary form.
    pub fn unit_len(self) -> usize {
        match self {
            Self::Ip | Self::IpList | Self::U32 => 4,
            Self::Str | Self::U8 => 1,
            Self::U16 => 2,
        }
    }
}

/// Layouts of the options this stack produces or decodes for callers.
pub fn code_type(code: u8) -> Option<OptionType> {
    Some(match code {
        opt::SUBNET => OptionType::Ip,
        opt::ROUTER | opt::DNS_SERVER | opt::NTP_SERVER => OptionType::IpList,
        opt::HOST_NAME | opt::DOMAIN_NAME | opt::VENDOR | opt::CLIENT_ID => OptionType::Str,
        opt::REQUESTED_IP => OptionType::Ip,
        opt::LEASE_TIME | opt::SERVER_ID => OptionType::U32,
        opt::MESSAGE_TYPE => OptionType::U8,
        opt::MAX_SIZE => OptionType::U16,
        _ => return None,
    })
}

/// A BOOTP packet with its options area, in host representation.
#[derive(Clone)]
pub struct DhcpPacket {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub sname: [u8; 64],
    pub file: [u8; 128],
    pub options: [u8; OPTIONS_BUFSIZE + EXTEND_FOR_BUGGY_SERVERS],
}

impl Default for DhcpPacket {
    fn default() -> Self {
        Self {
            op: 0,
            htype: 0,
            hlen: 0,
            hops: 0,
            xid: 0,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr: [0; 16],
            sname: [0; 64],
            file: [0; 128],
            options: [0; OPTIONS_BUFSIZE + EXTEND_FOR_BUGGY_SERVERS],
        }
    }
}

impl PartialEq for DhcpPacket {
    fn eq(&self, other: &Self) -> bool {
        self.op == other.op
            && self.htype == other.htype
            && self.hlen == other.hlen
            && self.hops == other.hops
            && self.xid == other.xid
            && self.secs == other.secs
            && self.flags == other.flags
            && self.ciaddr == other.ciaddr
            && self.yiaddr == other.yiaddr
            && self.siaddr == other.siaddr
            && self.giaddr == other.giaddr
            && self.chaddr == other.chaddr
            && self.sname[..] == other.sname[..]
            && self.file[..] == other.file[..]
            && self.options[..] == other.options[..]
    }
}

impl Eq for DhcpPacket {}

impl std::fmt::Debug for DhcpPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhcpPacket")
            .field("op", &self.op)
            .field("xid", &format_args!("{:#010x}", self.xid))
            .field("ciaddr", &self.ciaddr)
            .field("yiaddr", &self.yiaddr)
            .finish_non_exhaustive()
    }
}

impl DhcpPacket {
    /// A packet with header defaults and the message-type option installed.
    pub fn new(mtype: MessageType) -> Self {
        let mut p = Self::default();
        p.init_header(mtype);
        p
    }

    /// Reset header fields for a fresh message of the given type.
    pub fn init_header(&mut self, mtype: MessageType) {
        *self = Self::default();
        self.op = match mtype {
            MessageType::Offer | MessageType::Ack | MessageType::Nak => BOOTREPLY,
            _ => BOOTREQUEST,
        };
        self.htype = 1;
        self.hlen = 6;
        self.options[0] = opt::END;
        self.add_option_u8(opt::MESSAGE_TYPE, mtype.into());
    }

    pub fn set_broadcast(&mut self) {
        self.flags |= BROADCAST_FLAG;
    }

    pub fn broadcast(&self) -> bool {
        self.flags & BROADCAST_FLAG != 0
    }

    /// Offset of the END marker in the options area.
    pub fn end_option(&self) -> usize {
        let mut i = 0;
        while self.options[i] != opt::END {
            if self.options[i] != opt::PADDING {
                i += usize::from(self.options[i + 1]) + 1;
            }
            i += 1;
        }
        i
    }

    /// Append a pre-assembled `[code, len, data...]` option.
    pub fn add_binary_option(&mut self, option: &[u8]) {
        let len = 2 + usize::from(option[1]);
        let end = self.end_option();
        if end + len + 1 >= OPTIONS_BUFSIZE {
            // did not fit
            return;
        }
        self.options[end..end + len].copy_from_slice(&option[..len]);
        self.options[end + len] = opt::END;
    }

    pub fn add_option_u8(&mut self, code: u8, data: u8) {
        if code_type(code).map(OptionType::unit_len) != Some(1) {
            return;
        }
        self.add_binary_option(&[code, 1, data]);
    }

    pub fn add_option_u16(&mut self, code: u8, data: u16) {
        if code_type(code).map(OptionType::unit_len) != Some(2) {
            return;
        }
        let b = data.to_be_bytes();
        self.add_binary_option(&[code, 2, b[0], b[1]]);
    }

    pub fn add_option_u32(&mut self, code: u8, data: u32) {
        if code_type(code).map(OptionType::unit_len) != Some(4) {
            return;
        }
        let b = data.to_be_bytes();
        self.add_binary_option(&[code, 4, b[0], b[1], b[2], b[3]]);
    }

    /// Append a variably-sized option.
    pub fn add_option_bytes(&mut self, code: u8, data: &[u8]) {
        let len = data.len().min(255);
        let mut buf = Vec::with_capacity(2 + len);
        buf.push(code);
        buf.push(len as u8);
        buf.extend_from_slice(&data[..len]);
        self.add_binary_option(&buf);
    }

    /// Find an option, following the overload option (52) into `file` and
    /// `sname` when present.
    pub fn get_option(&self, code: u8) -> Option<&[u8]> {
        let mut area: &[u8] = &self.options;
        let mut overload: u8 = 0;
        let mut idx = 0;

        loop {
            if idx >= area.len() {
                // malformed option field
                return None;
            }
            let c = area[idx];
            if c == opt::PADDING {
                idx += 1;
                continue;
            }
            if c == opt::END {
                if overload & OVERLOAD_FILE != 0 {
                    overload &= !OVERLOAD_FILE;
                    area = &self.file;
                    idx = 0;
                    continue;
                }
                if overload & OVERLOAD_SNAME != 0 {
                    overload &= !OVERLOAD_SNAME;
                    area = &self.sname;
                    idx = 0;
                    continue;
                }
                return None;
            }
            if idx + 1 >= area.len() {
                return None;
            }
            let len = usize::from(area[idx + 1]);
            if idx + 2 + len > area.len() {
                return None;
            }
            if c == code {
                return Some(&area[idx + 2..idx + 2 + len]);
            }
            if c == opt::OPTION_OVERLOAD && len >= 1 {
                overload |= area[idx + 2];
            }
            idx += 2 + len;
        }
    }

    pub fn get_option_u32(&self, code: u8) -> Option<u32> {
        let v = self.get_option(code)?;
        (v.len() == 4).then(|| u32::from_be_bytes([v[0], v[1], v[2], v[3]]))
    }

    pub fn message_type(&self) -> Option<MessageType> {
        let v = self.get_option(opt::MESSAGE_TYPE)?;
        MessageType::try_from(*v.first()?).ok()
    }

    /// Decode an option into the space-joined string list the callers of
    /// this stack consume (IPs dotted, integers decimal, strings raw).
    pub fn option_value_strings(&self, code: u8) -> Option<Vec<String>> {
        let ty = code_type(code)?;
        let data = self.get_option(code)?;
        let unit = ty.unit_len();

        if ty == OptionType::Str {
            return Some(vec![String::from_utf8_lossy(data).into_owned()]);
        }

        let mut out = Vec::new();
        for chunk in data.chunks_exact(unit) {
            out.push(match ty {
                OptionType::Ip | OptionType::IpList => {
                    Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]).to_string()
                }
                OptionType::U8 => chunk[0].to_string(),
                OptionType::U16 => u16::from_be_bytes([chunk[0], chunk[1]]).to_string(),
                OptionType::U32 => {
                    u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]).to_string()
                }
                OptionType::Str => unreachable!(),
            });
        }
        (!out.is_empty()).then_some(out)
    }

    /// Serialize to the fixed 548-byte BOOTP wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(WIRE_SIZE);
        buf.push(self.op);
        buf.push(self.htype);
        buf.push(self.hlen);
        buf.push(self.hops);
        buf.extend_from_slice(&self.xid.to_be_bytes());
        buf.extend_from_slice(&self.secs.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.ciaddr.octets());
        buf.extend_from_slice(&self.yiaddr.octets());
        buf.extend_from_slice(&self.siaddr.octets());
        buf.extend_from_slice(&self.giaddr.octets());
        buf.extend_from_slice(&self.chaddr);
        buf.extend_from_slice(&self.sname);
        buf.extend_from_slice(&self.file);
        buf.extend_from_slice(&MAGIC.to_be_bytes());
        buf.extend_from_slice(&self.options[..OPTIONS_BUFSIZE]);
        buf
    }

    /// Parse a BOOTP wire packet. Verifies the magic cookie; tolerates
    /// options areas up to 80 bytes longer than the RFC size.
    pub fn decode(data: &[u8]) -> Result<Self, CoreError> {
        if data.len() < HEADER_SIZE + 4 {
            return Err(CoreError::protocol("short BOOTP packet"));
        }
        let cookie = u32::from_be_bytes([
            data[HEADER_SIZE],
            data[HEADER_SIZE + 1],
            data[HEADER_SIZE + 2],
            data[HEADER_SIZE + 3],
        ]);
        if cookie != MAGIC {
            return Err(CoreError::new(ErrorKind::Protocol, "bad magic cookie"));
        }

        let mut p = Self::default();
        p.op = data[0];
        p.htype = data[1];
        p.hlen = data[2];
        p.hops = data[3];
        p.xid = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        p.secs = u16::from_be_bytes([data[8], data[9]]);
        p.flags = u16::from_be_bytes([data[10], data[11]]);
        p.ciaddr = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
        p.yiaddr = Ipv4Addr::new(data[16], data[17], data[18], data[19]);
        p.siaddr = Ipv4Addr::new(data[20], data[21], data[22], data[23]);
        p.giaddr = Ipv4Addr::new(data[24], data[25], data[26], data[27]);
        p.chaddr.copy_from_slice(&data[28..44]);
        p.sname.copy_from_slice(&data[44..108]);
        p.file.copy_from_slice(&data[108..HEADER_SIZE]);

        let opts = &data[HEADER_SIZE + 4..];
        let take = opts.len().min(p.options.len());
        p.options[..take].copy_from_slice(&opts[..take]);
        Ok(p)
    }
}

/// Classify an inbound packet for the server side: BOOTREQUEST from an
/// Ethernet client with a valid message-type option.
pub fn check_packet_type(packet: &DhcpPacket) -> Option<MessageType> {
    if packet.hlen != 6 || packet.op != BOOTREQUEST {
        return None;
    }
    packet.message_type()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DhcpPacket {
        let mut p = DhcpPacket::new(MessageType::Discover);
        p.xid = 0xdead_beef;
        p.secs = 7;
        p.set_broadcast();
        p.chaddr[..6].copy_from_slice(&[2, 0x11, 0x22, 0x33, 0x44, 0x55]);
        p.add_option_u32(opt::REQUESTED_IP, u32::from(Ipv4Addr::new(192, 168, 77, 100)));
        p.add_option_u16(opt::MAX_SIZE, 576);
        p
    }

    #[test]
    fn round_trip() {
        let p = sample();
        let wire = p.encode();
        assert_eq!(wire.len(), WIRE_SIZE);
        let q = DhcpPacket::decode(&wire).unwrap();
        assert_eq!(p, q);
        assert_eq!(
            q.option_value_strings(opt::REQUESTED_IP).unwrap(),
            vec!["192.168.77.100".to_string()]
        );
    }

    #[test]
    fn rejects_bad_cookie() {
        let mut wire = sample().encode();
        wire[HEADER_SIZE] ^= 0xff;
        assert!(DhcpPacket::decode(&wire).is_err());
    }

    #[test]
    fn option_walk_skips_padding() {
        let mut p = DhcpPacket::new(MessageType::Offer);
        // shift the area: padding, then a fresh END and an option after it
        let end = p.end_option();
        p.options.copy_within(0..end + 1, 3);
        p.options[0] = opt::PADDING;
        p.options[1] = opt::PADDING;
        p.options[2] = opt::PADDING;
        p.add_option_u32(opt::LEASE_TIME, 3600);
        assert_eq!(p.get_option_u32(opt::LEASE_TIME), Some(3600));
    }

    #[test]
    fn overload_continues_into_file_and_sname() {
        let mut p = DhcpPacket::new(MessageType::Ack);
        // overload = 3: options continue in file, then sname
        p.add_binary_option(&[opt::OPTION_OVERLOAD, 1, 3]);
        p.file[0] = opt::LEASE_TIME;
        p.file[1] = 4;
        p.file[2..6].copy_from_slice(&3600u32.to_be_bytes());
        p.file[6] = opt::END;
        p.sname[0] = opt::SUBNET;
        p.sname[1] = 4;
        p.sname[2..6].copy_from_slice(&Ipv4Addr::new(255, 255, 255, 0).octets());
        p.sname[6] = opt::END;

        assert_eq!(p.get_option_u32(opt::LEASE_TIME), Some(3600));
        assert_eq!(
            p.option_value_strings(opt::SUBNET).unwrap(),
            vec!["255.255.255.0".to_string()]
        );
    }

    #[test]
    fn overload_file_only() {
        let mut p = DhcpPacket::new(MessageType::Ack);
        p.add_binary_option(&[opt::OPTION_OVERLOAD, 1, 1]);
        p.file[0] = opt::LEASE_TIME;
        p.file[1] = 4;
        p.file[2..6].copy_from_slice(&60u32.to_be_bytes());
        p.file[6] = opt::END;
        // sname must NOT be scanned
        p.sname[0] = opt::SUBNET;
        p.sname[1] = 4;
        p.sname[6] = opt::END;

        assert_eq!(p.get_option_u32(opt::LEASE_TIME), Some(60));
        assert_eq!(p.get_option(opt::SUBNET), None);
    }

    #[test]
    fn multi_value_lists_decode() {
        let mut p = DhcpPacket::new(MessageType::Ack);
        let mut dns = Vec::new();
        dns.extend_from_slice(&Ipv4Addr::new(8, 8, 8, 8).octets());
        dns.extend_from_slice(&Ipv4Addr::new(9, 9, 9, 9).octets());
        p.add_option_bytes(opt::DNS_SERVER, &dns);
        assert_eq!(
            p.option_value_strings(opt::DNS_SERVER).unwrap(),
            vec!["8.8.8.8".to_string(), "9.9.9.9".to_string()]
        );
    }

    #[test]
    fn oversize_option_is_dropped() {
        let mut p = DhcpPacket::new(MessageType::Discover);
        let big = vec![0u8; 255];
        // fill until nothing fits any more; END must survive
        for _ in 0..3 {
            p.add_option_bytes(opt::VENDOR, &big);
        }
        let end = p.end_option();
        assert!(end < OPTIONS_BUFSIZE);
        assert_eq!(p.options[end], opt::END);
    }
}
