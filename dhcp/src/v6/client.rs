//! DHCPv6 client (RFC 3315, prefix delegation per RFC 3633).
//!
//! Transactions run over UDP 546/547 to the well-known relay/server
//! multicast group. Retransmission uses the standard randomized exponential
//! backoff; the elapsed-time option is zero on the first transmission of a
//! transaction and the real elapsed time on retransmits.

use std::net::Ipv6Addr;
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant, SystemTime};

use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};

use miracle_shared::{CoreError, EventPool, HTable};

use crate::io::{LinkIo, ListenMode};
use crate::proto::v6::{
    self, decode_domain_list, opt, sub_options, Message, MessageBuf, PrefixLease, V6MessageType,
};
use crate::V6_CLIENT_PORT;

/// Initial retransmission timeout.
const IRT: Duration = Duration::from_secs(1);
/// Retransmission ceiling.
const MRT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum V6State {
    Idle,
    InformationReq,
    Solicitation,
    Request,
    Confirm,
    Renew,
    Rebind,
    Release,
    Decline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum V6Event {
    PacketIn,
    Resend,
}

/// Address state extracted from a successful reply.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct V6Lease {
    pub address: Option<Ipv6Addr>,
    pub t1: u32,
    pub t2: u32,
    /// Longest valid lifetime seen, in seconds.
    pub expire: u32,
    pub dns: Vec<String>,
    pub prefixes: Vec<PrefixLease>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpV6Event {
    /// An ADVERTISE answered our SOLICIT.
    Advertised,
    /// A REPLY completed an address transaction.
    LeaseAvailable(V6Lease),
    /// A REPLY answered an information request.
    InfoReceived,
    /// A REPLY completed release/decline/confirm.
    Completed(V6State),
}

pub struct DhcpV6Client<L: LinkIo> {
    #[allow(dead_code)]
    ifindex: u32,
    mac: [u8; 6],
    link: L,
    pool: EventPool<V6Event>,
    state: V6State,
    /// 24 bits.
    xid: u32,
    duid: Vec<u8>,
    server_duid: Option<Vec<u8>>,
    iaid: u32,
    ia_na: Option<Ipv6Addr>,
    ia_ta: Option<Ipv6Addr>,
    t1: u32,
    t2: u32,
    expire: u32,
    status_code: u16,
    request_codes: Vec<u16>,
    code_values: HTable<u16, Vec<String>>,
    send_options: HTable<u16, Vec<u8>>,
    prefixes: Vec<PrefixLease>,
    retransmit: bool,
    start_time: Instant,
    last_request: u64,
    rt: Duration,
    rng: SmallRng,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl<L: LinkIo> DhcpV6Client<L> {
    pub fn new(ifindex: u32, mac: [u8; 6], link: L, seed: u64) -> Result<Self, CoreError> {
        Ok(Self {
            ifindex,
            mac,
            link,
            pool: EventPool::new()?,
            state: V6State::Idle,
            xid: 0,
            duid: Vec::new(),
            server_duid: None,
            iaid: 0,
            ia_na: None,
            ia_ta: None,
            t1: 0,
            t2: 0,
            expire: 0,
            status_code: 0,
            request_codes: Vec::new(),
            code_values: HTable::new(),
            send_options: HTable::new(),
            prefixes: Vec::new(),
            retransmit: false,
            start_time: Instant::now(),
            last_request: unix_now(),
            rt: IRT,
            rng: SmallRng::seed_from_u64(seed),
        })
    }

    pub fn set_duid(&mut self, duid: Vec<u8>) {
        self.duid = duid;
    }

    pub fn duid(&self) -> &[u8] {
        &self.duid
    }

    pub fn server_duid(&self) -> Option<&[u8]> {
        self.server_duid.as_deref()
    }

    pub fn set_iaid(&mut self, iaid: u32) {
        self.iaid = iaid;
    }

    /// Derive the IAID from the interface hardware address.
    pub fn create_iaid(&mut self) {
        self.iaid = v6::iaid_from_mac(&self.mac);
    }

    pub fn iaid(&self) -> u32 {
        self.iaid
    }

    pub fn state(&self) -> V6State {
        self.state
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn t1(&self) -> u32 {
        self.t1
    }

    pub fn t2(&self) -> u32 {
        self.t2
    }

    /// Longest valid lifetime of the binding, relative seconds.
    pub fn expire(&self) -> u32 {
        self.expire
    }

    /// Unix time of the last transaction start and the absolute expiry.
    pub fn timeouts(&self) -> (u64, u64) {
        (self.last_request, self.last_request + u64::from(self.expire))
    }

    pub fn address(&self) -> Option<Ipv6Addr> {
        self.ia_na.or(self.ia_ta)
    }

    pub fn prefixes(&self) -> &[PrefixLease] {
        &self.prefixes
    }

    pub fn option_values(&self, code: u16) -> Option<&Vec<String>> {
        self.code_values.get(&code)
    }

    #[doc(hidden)]
    pub fn xid(&self) -> u32 {
        self.xid
    }

    #[doc(hidden)]
    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn set_request(&mut self, code: u16) {
        if !self.request_codes.contains(&code) {
            self.request_codes.push(code);
        }
    }

    /// Carry a raw option (without TLV header) on outgoing messages.
    pub fn set_send(&mut self, code: u16, data: &[u8]) {
        self.send_options.insert(code, v6::make_option(code, data));
    }

    pub fn clear_send(&mut self, code: u16) -> bool {
        self.send_options.remove(&code).is_some()
    }

    /// Arm an option-request option listing `codes`; the decoded values of
    /// each land in [`option_values`](Self::option_values) on replies.
    pub fn set_oro(&mut self, codes: &[u16]) {
        for &code in codes {
            self.set_request(code);
        }
        self.set_send(opt::ORO, &v6::oro_body(codes));
    }

    /// Arm an IA_NA or IA_TA on outgoing messages.
    pub fn set_ia(
        &mut self,
        code: u16,
        t1: u32,
        t2: u32,
        addr: Option<Ipv6Addr>,
    ) -> Result<(), CoreError> {
        if self.iaid == 0 {
            self.create_iaid();
        }
        match code {
            opt::IA_NA => {
                if let Some(addr) = addr {
                    self.ia_na = Some(addr);
                }
                let body = v6::ia_na_body(self.iaid, t1, t2, addr.or(self.ia_na));
                self.set_request(opt::IA_NA);
                self.set_send(opt::IA_NA, &body);
            }
            opt::IA_TA => {
                self.set_request(opt::IA_TA);
                self.set_send(opt::IA_TA, &v6::ia_ta_body(self.iaid));
            }
            _ => {
                return Err(CoreError::invalid_arg(
                    "identity association must be IA_NA or IA_TA",
                ))
            }
        }
        Ok(())
    }

    /// Arm an IA_PD requesting the given prefixes.
    pub fn set_pd(&mut self, t1: u32, t2: u32, prefixes: &[(Ipv6Addr, u8)]) {
        if self.iaid == 0 {
            self.create_iaid();
        }
        self.set_request(opt::IA_PD);
        self.set_send(opt::IA_PD, &v6::ia_pd_body(self.iaid, t1, t2, prefixes));
    }

    #[doc(hidden)]
    pub fn set_retransmit(&mut self) {
        self.retransmit = true;
    }

    #[doc(hidden)]
    pub fn clear_retransmit(&mut self) {
        self.retransmit = false;
    }

    /// Reset the transaction clock (wall time base for expiry reporting).
    pub fn reset_request_time(&mut self) {
        self.last_request = unix_now();
    }

    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<V6Event>, CoreError> {
        self.pool.poll(timeout)
    }

    pub fn stop(&mut self) {
        let _ = self.switch_listen(ListenMode::None);
        self.pool.del_timer(V6Event::Resend);
        self.retransmit = false;
        self.state = V6State::Idle;
    }

    // --- operations ---

    pub fn solicit(&mut self, rapid_commit: bool) -> Result<(), CoreError> {
        self.set_request(opt::CLIENTID);
        if rapid_commit {
            self.set_request(opt::RAPID_COMMIT);
        }
        self.begin(V6State::Solicitation, V6MessageType::Solicit)
    }

    pub fn request(&mut self) -> Result<(), CoreError> {
        self.set_request(opt::CLIENTID);
        self.set_request(opt::SERVERID);
        self.begin(V6State::Request, V6MessageType::Request)
    }

    pub fn confirm(&mut self) -> Result<(), CoreError> {
        self.set_request(opt::CLIENTID);
        self.begin(V6State::Confirm, V6MessageType::Confirm)
    }

    pub fn renew(&mut self) -> Result<(), CoreError> {
        self.set_request(opt::CLIENTID);
        self.set_request(opt::SERVERID);
        self.begin(V6State::Renew, V6MessageType::Renew)
    }

    pub fn rebind(&mut self) -> Result<(), CoreError> {
        self.set_request(opt::CLIENTID);
        self.begin(V6State::Rebind, V6MessageType::Rebind)
    }

    pub fn release(&mut self) -> Result<(), CoreError> {
        self.set_request(opt::CLIENTID);
        self.set_request(opt::SERVERID);
        self.begin(V6State::Release, V6MessageType::Release)
    }

    pub fn decline(&mut self) -> Result<(), CoreError> {
        self.set_request(opt::CLIENTID);
        self.set_request(opt::SERVERID);
        self.begin(V6State::Decline, V6MessageType::Decline)
    }

    pub fn information_request(&mut self) -> Result<(), CoreError> {
        self.set_request(opt::CLIENTID);
        self.begin(V6State::InformationReq, V6MessageType::InformationReq)
    }

    fn begin(&mut self, state: V6State, mtype: V6MessageType) -> Result<(), CoreError> {
        self.state = state;
        self.retransmit = false;
        if let Err(e) = self.switch_listen(ListenMode::L3V6(V6_CLIENT_PORT)) {
            let _ = self.switch_listen(ListenMode::None);
            self.state = V6State::Idle;
            return Err(e);
        }
        self.send_current()?;
        self.rt = self.jittered(IRT);
        self.pool.add_timer(self.rt, V6Event::Resend)
    }

    fn jittered(&mut self, base: Duration) -> Duration {
        // +/- 10%, RFC 3315 section 14
        let ms = base.as_millis() as i64;
        let jitter = self.rng.gen_range(-(ms / 10)..=ms / 10);
        Duration::from_millis((ms + jitter).max(1) as u64)
    }

    fn message_type_for_state(&self) -> Option<V6MessageType> {
        Some(match self.state {
            V6State::Idle => return None,
            V6State::InformationReq => V6MessageType::InformationReq,
            V6State::Solicitation => V6MessageType::Solicit,
            V6State::Request => V6MessageType::Request,
            V6State::Confirm => V6MessageType::Confirm,
            V6State::Renew => V6MessageType::Renew,
            V6State::Rebind => V6MessageType::Rebind,
            V6State::Release => V6MessageType::Release,
            V6State::Decline => V6MessageType::Decline,
        })
    }

    fn send_current(&mut self) -> Result<(), CoreError> {
        let Some(mtype) = self.message_type_for_state() else {
            return Ok(());
        };
        if !self.retransmit {
            self.xid = self.rng.next_u32() & 0x00ff_ffff;
            self.start_time = Instant::now();
        }
        log::debug!("sending DHCPv6 {:?} xid={:#08x}", mtype, self.xid);

        let mut m = MessageBuf::new(mtype, self.xid);
        self.set_request(opt::ELAPSED_TIME);
        for i in 0..self.request_codes.len() {
            let code = self.request_codes[i];
            match code {
                opt::CLIENTID => {
                    if self.duid.is_empty() {
                        return Err(CoreError::invalid_arg("no DUID configured"));
                    }
                    let duid = self.duid.clone();
                    m.append_option(opt::CLIENTID, &duid)?;
                }
                opt::SERVERID => {
                    if let Some(duid) = self.server_duid.clone() {
                        m.append_option(opt::SERVERID, &duid)?;
                    }
                }
                opt::RAPID_COMMIT => m.append_option(opt::RAPID_COMMIT, &[])?,
                opt::ELAPSED_TIME => {
                    let diff: u16 = if self.retransmit {
                        (self.start_time.elapsed().as_millis() / 10).min(0xffff) as u16
                    } else {
                        // initial message, elapsed time is 0
                        0
                    };
                    m.append_option(opt::ELAPSED_TIME, &diff.to_be_bytes())?;
                }
                _ => {}
            }
        }
        for tlv in self.send_options.values() {
            m.append_raw(tlv)?;
        }
        self.link.send_udp6_multicast(m.as_bytes())
    }

    pub fn process(&mut self, event: V6Event) -> Result<Vec<DhcpV6Event>, CoreError> {
        let mut out = Vec::new();
        match event {
            V6Event::PacketIn => self.drain_packets(&mut out)?,
            V6Event::Resend => {
                self.retransmit = true;
                self.send_current()?;
                let doubled = self.rt.saturating_mul(2);
                self.rt = self.jittered(doubled.min(MRT));
                self.pool.add_timer(self.rt, V6Event::Resend)?;
            }
        }
        Ok(out)
    }

    fn drain_packets(&mut self, out: &mut Vec<DhcpV6Event>) -> Result<(), CoreError> {
        let mut buf = [0u8; v6::MAX_PKT_SIZE];
        loop {
            let Some(n) = self.link.recv(&mut buf)? else {
                return Ok(());
            };
            let data = buf[..n].to_vec();
            if let Err(e) = self.handle_reply(&data, out) {
                log::debug!("dropping DHCPv6 packet: {e}");
            }
        }
    }

    /// Switch the listener and keep the event pool's watch in sync.
    fn switch_listen(&mut self, mode: ListenMode) -> Result<(), CoreError> {
        if let Some(fd) = self.link.listener_fd() {
            self.pool.del_fd(fd);
        }
        self.link.set_listen(mode)?;
        if let Some(fd) = self.link.listener_fd() {
            self.pool.add_fd(fd, V6Event::PacketIn)?;
        }
        Ok(())
    }

    fn finish_transaction(&mut self) -> Result<(), CoreError> {
        self.switch_listen(ListenMode::None)?;
        self.pool.del_timer(V6Event::Resend);
        self.retransmit = false;
        Ok(())
    }

    fn handle_reply(&mut self, data: &[u8], out: &mut Vec<DhcpV6Event>) -> Result<(), CoreError> {
        let msg = Message::parse(data)?;
        if msg.xid() != self.xid {
            return Ok(());
        }

        // RFC 3315 section 15: the reply must carry our client id
        let (client_id, count) = msg.option_with_count(opt::CLIENTID);
        match client_id {
            Some(id) if count == 1 && id == self.duid.as_slice() => {}
            _ => {
                log::debug!("client DUID mismatch, discarding");
                return Ok(());
            }
        }

        self.status_code = 0;
        if let Some(status) = msg.option(opt::STATUS_CODE) {
            if status.len() >= 2 {
                self.status_code = u16::from_be_bytes([status[0], status[1]]);
                if self.status_code != 0 {
                    let text = String::from_utf8_lossy(&status[2..]);
                    log::debug!("status code {}: {}", self.status_code, text);
                }
            }
        }

        let mtype = msg.msg_type();
        match self.state {
            V6State::Solicitation => {
                if mtype != Some(V6MessageType::Reply) && mtype != Some(V6MessageType::Advertise) {
                    return Ok(());
                }
                let (server_id, count) = msg.option_with_count(opt::SERVERID);
                let Some(server_id) = server_id.filter(|s| count == 1 && !s.is_empty()) else {
                    // RFC 3315, 15.10
                    log::debug!("server DUID error, discarding");
                    return Ok(());
                };
                if mtype == Some(V6MessageType::Reply) {
                    // RFC 3315, 17.1.4: a direct reply needs rapid commit
                    let (rc, rc_count) = msg.option_with_count(opt::RAPID_COMMIT);
                    if rc.is_none() || rc_count != 1 {
                        return Ok(());
                    }
                }
                self.server_duid = Some(server_id.to_vec());
                self.finish_transaction()?;
                if self.status_code == 0 {
                    self.capture(&msg);
                }
                if mtype == Some(V6MessageType::Advertise) {
                    out.push(DhcpV6Event::Advertised);
                } else {
                    out.push(DhcpV6Event::LeaseAvailable(self.lease()));
                }
            }
            V6State::InformationReq
            | V6State::Request
            | V6State::Confirm
            | V6State::Renew
            | V6State::Rebind
            | V6State::Release
            | V6State::Decline => {
                if self.state == V6State::Rebind && self.server_duid.is_none() {
                    // rebind may reach a different server; latch its DUID so
                    // a later renew can unicast the right one
                    let (server_id, count) = msg.option_with_count(opt::SERVERID);
                    if let Some(sid) = server_id.filter(|_| count == 1) {
                        self.server_duid = Some(sid.to_vec());
                    }
                }
                if mtype != Some(V6MessageType::Reply) {
                    return Ok(());
                }
                let (server_id, count) = msg.option_with_count(opt::SERVERID);
                let valid = match server_id {
                    Some(sid) if count == 1 && !sid.is_empty() => match &self.server_duid {
                        Some(stored) => stored.as_slice() == sid,
                        None => true,
                    },
                    _ => false,
                };
                if !valid {
                    // RFC 3315, 15.10
                    log::debug!("server DUID error, discarding");
                    return Ok(());
                }
                if self.state == V6State::Confirm {
                    if let (Some(sid), 1) = msg.option_with_count(opt::SERVERID) {
                        self.server_duid = Some(sid.to_vec());
                    }
                }
                self.finish_transaction()?;
                self.capture(&msg);
                match self.state {
                    V6State::InformationReq => out.push(DhcpV6Event::InfoReceived),
                    V6State::Request | V6State::Renew | V6State::Rebind => {
                        out.push(DhcpV6Event::LeaseAvailable(self.lease()))
                    }
                    s => out.push(DhcpV6Event::Completed(s)),
                }
            }
            V6State::Idle => {}
        }
        Ok(())
    }

    fn lease(&self) -> V6Lease {
        V6Lease {
            address: self.address(),
            t1: self.t1,
            t2: self.t2,
            expire: self.expire,
            dns: self
                .code_values
                .get(&opt::DNS_SERVERS)
                .cloned()
                .unwrap_or_default(),
            prefixes: self.prefixes.clone(),
        }
    }

    fn capture(&mut self, msg: &Message<'_>) {
        for i in 0..self.request_codes.len() {
            let code = self.request_codes[i];
            let values = match code {
                opt::DNS_SERVERS | opt::SNTP_SERVERS => {
                    msg.option(code).and_then(|data| self.decode_addr_list(code, data))
                }
                opt::DOMAIN_LIST => msg.option(code).map(|data| decode_domain_list(data)),
                opt::IA_NA | opt::IA_TA | opt::IA_PD => {
                    msg.option(code).and_then(|data| self.decode_ia(code, data))
                }
                _ => None,
            };
            match values.filter(|v| !v.is_empty()) {
                Some(v) => {
                    self.code_values.insert(code, v);
                }
                None => {
                    self.code_values.remove(&code);
                }
            }
        }
    }

    fn decode_addr_list(&self, code: u16, data: &[u8]) -> Option<Vec<String>> {
        if data.len() % 16 != 0 {
            log::debug!("option {code} has invalid address-list length {}", data.len());
            return None;
        }
        Some(
            data.chunks_exact(16)
                .map(|c| {
                    let mut o = [0u8; 16];
                    o.copy_from_slice(c);
                    Ipv6Addr::from(o).to_string()
                })
                .collect(),
        )
    }

    /// Pull addresses/prefixes out of an identity association and update the
    /// binding timers.
    fn decode_ia(&mut self, code: u16, data: &[u8]) -> Option<Vec<String>> {
        if data.len() < 4 {
            return None;
        }
        let iaid = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        if iaid != self.iaid {
            return None;
        }

        let (t1, t2, offset) = if code == opt::IA_NA || code == opt::IA_PD {
            if data.len() < 12 {
                return None;
            }
            let t1 = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
            let t2 = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
            if t1 > t2 {
                // RFC 3315 22.4 / RFC 3633 ch 9
                return None;
            }
            (t1, t2, 12)
        } else {
            (0, 0, 4)
        };

        let mut addr: Option<(Ipv6Addr, u32, u32)> = None;
        let mut status: u16 = 0;
        let mut new_prefixes: Vec<PrefixLease> = Vec::new();
        let now = unix_now();

        for (sub_code, sub) in sub_options(data, offset) {
            match sub_code {
                opt::IAADDR if sub.len() >= 24 => {
                    let mut o = [0u8; 16];
                    o.copy_from_slice(&sub[..16]);
                    let preferred = u32::from_be_bytes([sub[16], sub[17], sub[18], sub[19]]);
                    let valid = u32::from_be_bytes([sub[20], sub[21], sub[22], sub[23]]);
                    addr = Some((Ipv6Addr::from(o), preferred, valid));
                }
                opt::STATUS_CODE if sub.len() >= 2 => {
                    status = u16::from_be_bytes([sub[0], sub[1]]);
                    if status != 0 {
                        log::debug!("IA status code {status}");
                    }
                }
                opt::IA_PREFIX if sub.len() >= 25 => {
                    let preferred = u32::from_be_bytes([sub[0], sub[1], sub[2], sub[3]]);
                    let valid = u32::from_be_bytes([sub[4], sub[5], sub[6], sub[7]]);
                    let prefixlen = sub[8];
                    let mut o = [0u8; 16];
                    o.copy_from_slice(&sub[9..25]);
                    if preferred < valid {
                        // RFC 3633, ch 10
                        new_prefixes.push(PrefixLease {
                            prefix: Ipv6Addr::from(o),
                            prefixlen,
                            preferred,
                            valid,
                            expire: now + u64::from(valid),
                        });
                    }
                }
                _ => {}
            }
        }

        let mut values = Vec::new();

        if let Some((address, preferred, valid)) = addr {
            if status != 0 {
                self.status_code = status;
                return None;
            }
            if preferred > valid {
                // RFC 3315, 22.6
                return None;
            }
            self.t1 = t1;
            self.t2 = t2;
            if code == opt::IA_NA {
                self.ia_na = Some(address);
            } else {
                self.ia_ta = Some(address);
            }
            if valid > self.expire {
                self.expire = valid;
            }
            values.push(address.to_string());
        }

        if !new_prefixes.is_empty() {
            self.t1 = t1;
            self.t2 = t2;
            self.expire = new_prefixes.iter().map(|p| p.valid).min().unwrap_or(0);
            for p in &new_prefixes {
                values.push(format!("{}/{}", p.prefix, p.prefixlen));
            }
            self.prefixes = new_prefixes;
        }

        (!values.is_empty()).then_some(values)
    }
}

impl<L: LinkIo> AsRawFd for DhcpV6Client<L> {
    fn as_raw_fd(&self) -> RawFd {
        self.pool.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::mock::{MockLink, Sent};
    use crate::proto::v6::{create_duid, DuidType};

    const MAC: [u8; 6] = [0x02, 0x11, 0x22, 0x33, 0x44, 0x55];

    fn client() -> DhcpV6Client<MockLink> {
        let mut c = DhcpV6Client::new(5, MAC, MockLink::new(), 0x77).unwrap();
        c.set_duid(create_duid(DuidType::Ll, &MAC, 1, 0).unwrap());
        c.create_iaid();
        c.set_oro(&[opt::DNS_SERVERS, opt::DOMAIN_LIST, opt::SNTP_SERVERS]);
        c.set_ia(opt::IA_NA, 0, 0, None).unwrap();
        c
    }

    fn sent_msg(c: &mut DhcpV6Client<MockLink>) -> Vec<u8> {
        let sent = c.link_mut().take_sent();
        assert_eq!(sent.len(), 1, "expected one message: {sent:?}");
        match &sent[0] {
            Sent::Udp6(payload) => payload.clone(),
            other => panic!("unexpected send: {other:?}"),
        }
    }

    fn server_duid() -> Vec<u8> {
        create_duid(DuidType::Ll, &[0xde, 0xad, 0xbe, 0xef, 0, 1], 1, 0).unwrap()
    }

    fn rapid_reply(c: &DhcpV6Client<MockLink>) -> Vec<u8> {
        let mut m = MessageBuf::new(V6MessageType::Reply, c.xid());
        m.append_option(opt::CLIENTID, c.duid()).unwrap();
        m.append_option(opt::SERVERID, &server_duid()).unwrap();
        m.append_option(opt::RAPID_COMMIT, &[]).unwrap();
        let addr: Ipv6Addr = "fe80::1".parse().unwrap();
        let mut ia = Vec::new();
        ia.extend_from_slice(&c.iaid().to_be_bytes());
        ia.extend_from_slice(&900u32.to_be_bytes());
        ia.extend_from_slice(&1440u32.to_be_bytes());
        ia.extend_from_slice(&v6::make_option(
            opt::IAADDR,
            &v6::iaaddr_body(addr, 1800, 3600),
        ));
        m.append_option(opt::IA_NA, &ia).unwrap();
        m.as_bytes().to_vec()
    }

    #[test]
    fn solicit_message_layout() {
        let mut c = client();
        c.solicit(true).unwrap();
        assert_eq!(c.state(), V6State::Solicitation);
        assert_eq!(c.link_mut().listen_mode(), ListenMode::L3V6(V6_CLIENT_PORT));

        let payload = sent_msg(&mut c);
        let msg = Message::parse(&payload).unwrap();
        assert_eq!(msg.msg_type(), Some(V6MessageType::Solicit));
        assert!(msg.xid() <= 0x00ff_ffff);
        assert_eq!(msg.option(opt::CLIENTID), Some(c.duid()));
        assert_eq!(msg.option(opt::RAPID_COMMIT), Some(&[][..]));
        // first transmission carries elapsed time zero
        assert_eq!(msg.option(opt::ELAPSED_TIME), Some(&[0u8, 0][..]));
        let ia = msg.option(opt::IA_NA).unwrap();
        assert_eq!(&ia[..4], &c.iaid().to_be_bytes());
        assert!(msg.option(opt::ORO).is_some());
    }

    #[test]
    fn solicit_rapid_commit_full_path() {
        let mut c = client();
        c.solicit(true).unwrap();
        sent_msg(&mut c);

        let reply = rapid_reply(&c);
        c.link_mut().push_inbound(reply);
        let evs = c.process(V6Event::PacketIn).unwrap();
        match &evs[..] {
            [DhcpV6Event::LeaseAvailable(lease)] => {
                assert_eq!(lease.address, Some("fe80::1".parse().unwrap()));
                assert_eq!(lease.t1, 900);
                assert_eq!(lease.t2, 1440);
                assert_eq!(lease.expire, 3600);
            }
            other => panic!("unexpected events: {other:?}"),
        }
        assert_eq!(c.server_duid(), Some(server_duid().as_slice()));
        assert_eq!(c.t1(), 900);
        assert_eq!(c.t2(), 1440);
        assert_eq!(c.expire(), 3600);
        assert_eq!(c.link_mut().listen_mode(), ListenMode::None);
    }

    #[test]
    fn reply_without_rapid_commit_is_discarded_on_solicit() {
        let mut c = client();
        c.solicit(true).unwrap();
        sent_msg(&mut c);

        let mut m = MessageBuf::new(V6MessageType::Reply, c.xid());
        m.append_option(opt::CLIENTID, c.duid()).unwrap();
        m.append_option(opt::SERVERID, &server_duid()).unwrap();
        c.link_mut().push_inbound(m.as_bytes().to_vec());
        let evs = c.process(V6Event::PacketIn).unwrap();
        assert!(evs.is_empty());
        assert_eq!(c.server_duid(), None);
    }

    #[test]
    fn advertise_latches_server_and_reports() {
        let mut c = client();
        c.solicit(false).unwrap();
        sent_msg(&mut c);

        let mut m = MessageBuf::new(V6MessageType::Advertise, c.xid());
        m.append_option(opt::CLIENTID, c.duid()).unwrap();
        m.append_option(opt::SERVERID, &server_duid()).unwrap();
        c.link_mut().push_inbound(m.as_bytes().to_vec());
        let evs = c.process(V6Event::PacketIn).unwrap();
        assert_eq!(evs, vec![DhcpV6Event::Advertised]);
        assert_eq!(c.server_duid(), Some(server_duid().as_slice()));
    }

    #[test]
    fn mismatched_client_id_or_duplicate_server_id_is_dropped() {
        let mut c = client();
        c.solicit(true).unwrap();
        sent_msg(&mut c);

        // missing client id
        let mut m = MessageBuf::new(V6MessageType::Reply, c.xid());
        m.append_option(opt::SERVERID, &server_duid()).unwrap();
        m.append_option(opt::RAPID_COMMIT, &[]).unwrap();
        c.link_mut().push_inbound(m.as_bytes().to_vec());

        // repeated server id
        let mut m = MessageBuf::new(V6MessageType::Reply, c.xid());
        m.append_option(opt::CLIENTID, c.duid()).unwrap();
        m.append_option(opt::SERVERID, &server_duid()).unwrap();
        m.append_option(opt::SERVERID, &server_duid()).unwrap();
        m.append_option(opt::RAPID_COMMIT, &[]).unwrap();
        c.link_mut().push_inbound(m.as_bytes().to_vec());

        let evs = c.process(V6Event::PacketIn).unwrap();
        assert!(evs.is_empty());
        assert_eq!(c.server_duid(), None);
    }

    #[test]
    fn reply_from_different_server_is_dropped_after_latch() {
        let mut c = client();
        c.solicit(true).unwrap();
        sent_msg(&mut c);
        let reply = rapid_reply(&c);
        c.link_mut().push_inbound(reply);
        c.process(V6Event::PacketIn).unwrap();

        c.renew().unwrap();
        sent_msg(&mut c);
        let other_duid = create_duid(DuidType::Ll, &[1, 2, 3, 4, 5, 6], 1, 0).unwrap();
        let mut m = MessageBuf::new(V6MessageType::Reply, c.xid());
        m.append_option(opt::CLIENTID, c.duid()).unwrap();
        m.append_option(opt::SERVERID, &other_duid).unwrap();
        c.link_mut().push_inbound(m.as_bytes().to_vec());
        let evs = c.process(V6Event::PacketIn).unwrap();
        assert!(evs.is_empty());
    }

    #[test]
    fn renew_carries_server_id() {
        let mut c = client();
        c.solicit(true).unwrap();
        sent_msg(&mut c);
        let reply = rapid_reply(&c);
        c.link_mut().push_inbound(reply);
        c.process(V6Event::PacketIn).unwrap();

        c.renew().unwrap();
        let payload = sent_msg(&mut c);
        let msg = Message::parse(&payload).unwrap();
        assert_eq!(msg.msg_type(), Some(V6MessageType::Renew));
        assert_eq!(msg.option(opt::SERVERID), Some(server_duid().as_slice()));
    }

    #[test]
    fn retransmit_keeps_xid_and_reports_elapsed_time() {
        let mut c = client();
        c.solicit(true).unwrap();
        let first = sent_msg(&mut c);
        let xid = Message::parse(&first).unwrap().xid();

        c.process(V6Event::Resend).unwrap();
        let second = sent_msg(&mut c);
        let msg = Message::parse(&second).unwrap();
        assert_eq!(msg.xid(), xid);
        // elapsed time is present; the value is time-dependent
        assert!(msg.option(opt::ELAPSED_TIME).is_some());
    }

    #[test]
    fn release_completes() {
        let mut c = client();
        c.solicit(true).unwrap();
        sent_msg(&mut c);
        let reply = rapid_reply(&c);
        c.link_mut().push_inbound(reply);
        c.process(V6Event::PacketIn).unwrap();

        c.release().unwrap();
        sent_msg(&mut c);
        let mut m = MessageBuf::new(V6MessageType::Reply, c.xid());
        m.append_option(opt::CLIENTID, c.duid()).unwrap();
        m.append_option(opt::SERVERID, &server_duid()).unwrap();
        c.link_mut().push_inbound(m.as_bytes().to_vec());
        let evs = c.process(V6Event::PacketIn).unwrap();
        assert_eq!(evs, vec![DhcpV6Event::Completed(V6State::Release)]);
    }

    #[test]
    fn prefix_delegation_reply_fills_prefixes() {
        let mut c = DhcpV6Client::new(5, MAC, MockLink::new(), 0x77).unwrap();
        c.set_duid(create_duid(DuidType::Ll, &MAC, 1, 0).unwrap());
        c.create_iaid();
        c.set_pd(0, 0, &[("2001:db8::".parse().unwrap(), 56)]);
        c.solicit(true).unwrap();
        sent_msg(&mut c);

        let mut m = MessageBuf::new(V6MessageType::Reply, c.xid());
        m.append_option(opt::CLIENTID, c.duid()).unwrap();
        m.append_option(opt::SERVERID, &server_duid()).unwrap();
        m.append_option(opt::RAPID_COMMIT, &[]).unwrap();
        let mut ia = Vec::new();
        ia.extend_from_slice(&c.iaid().to_be_bytes());
        ia.extend_from_slice(&600u32.to_be_bytes());
        ia.extend_from_slice(&960u32.to_be_bytes());
        ia.extend_from_slice(&v6::make_option(
            opt::IA_PREFIX,
            &v6::ia_prefix_body("2001:db8:1::".parse().unwrap(), 56, 1800, 3600),
        ));
        m.append_option(opt::IA_PD, &ia).unwrap();
        c.link_mut().push_inbound(m.as_bytes().to_vec());

        let evs = c.process(V6Event::PacketIn).unwrap();
        match &evs[..] {
            [DhcpV6Event::LeaseAvailable(lease)] => {
                assert_eq!(lease.prefixes.len(), 1);
                assert_eq!(lease.prefixes[0].prefixlen, 56);
                assert_eq!(lease.prefixes[0].valid, 3600);
                assert_eq!(lease.expire, 3600);
            }
            other => panic!("unexpected events: {other:?}"),
        }
        assert_eq!(c.t1(), 600);
        assert_eq!(c.t2(), 960);
    }
}
