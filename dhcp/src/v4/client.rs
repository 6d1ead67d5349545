//! DHCPv4 client state machine (RFC 2131) with IPv4 link-local fallback
//! (RFC 3927).

use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant, SystemTime};

use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};

use miracle_shared::{CoreError, EventPool, HTable};

use crate::io::{LinkIo, ListenMode};
use crate::pktbuild;
use crate::proto::v4::{opt, DhcpPacket, MessageType};
use crate::{arp, CLIENT_PORT, MAC_BCAST, SERVER_PORT};

const DISCOVER_TIMEOUT: Duration = Duration::from_secs(5);
const DISCOVER_RETRIES: u8 = 6;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_RETRIES: u8 = 3;
const NAK_RESTART_DELAY: Duration = Duration::from_secs(3);

// RFC 3927 constants, in seconds unless noted
const PROBE_WAIT: u64 = 1;
const PROBE_NUM: u8 = 3;
const PROBE_MIN: u64 = 1;
const PROBE_MAX: u64 = 2;
const ANNOUNCE_WAIT: u64 = 2;
const ANNOUNCE_NUM: u8 = 2;
const ANNOUNCE_INTERVAL: u64 = 2;
const MAX_CONFLICTS: u8 = 10;
const DEFEND_INTERVAL: u64 = 10;

/// 169.254.0.0
const LINKLOCAL_ADDR: u32 = 0xa9fe_0000;

/// Which protocol the client speaks from the start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    /// Regular DHCPv4.
    Dhcp,
    /// IPv4 link-local only, no server involved.
    Ipv4ll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum V4State {
    InitSelecting,
    Rebooting,
    Requesting,
    Bound,
    Renewing,
    Rebinding,
    Released,
    Ipv4llProbe,
    Ipv4llAnnounce,
    Ipv4llMonitor,
    Ipv4llDefend,
}

/// Timer slots; at most one timer is pending per slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerSlot {
    /// Discover/request retries, NAK restarts and the IPv4LL cadence.
    Resend,
    T1,
    T2,
    Expire,
}

/// Events delivered by [`DhcpV4Client::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum V4Event {
    PacketIn,
    Timer(TimerSlot),
}

/// What the Resend slot does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Idle,
    Discover,
    Request,
    Reboot,
    NakRestart,
    Ipv4llSendProbe,
    Ipv4llProbeWait,
    Ipv4llAnnounceWait,
    Ipv4llDefendWait,
}

/// Snapshot of an acquired lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub address: Ipv4Addr,
    pub subnet: Option<Ipv4Addr>,
    pub routers: Vec<Ipv4Addr>,
    pub dns: Vec<Ipv4Addr>,
    pub server: Ipv4Addr,
    pub lease_seconds: u32,
    pub t1: u32,
    pub t2: u32,
}

/// Externally visible client events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpEvent {
    LeaseAvailable(Lease),
    Ipv4llAvailable(Ipv4Addr),
    NoLease,
    LeaseLost,
    Ipv4llLost,
}

pub struct DhcpV4Client<L: LinkIo> {
    kind: ClientKind,
    #[allow(dead_code)]
    ifindex: u32,
    mac: [u8; 6],
    link: L,
    pool: EventPool<V4Event>,
    state: V4State,
    pending: Pending,
    xid: u32,
    server: Ipv4Addr,
    /// Host order, like the wire helpers expect.
    requested_ip: u32,
    assigned: Option<Ipv4Addr>,
    last_address: Option<Ipv4Addr>,
    start_time: Instant,
    lease_seconds: u32,
    t1: u32,
    t2: u32,
    expire: u32,
    retry: u8,
    ack_retry: u8,
    conflicts: u8,
    ipv4ll_fallback: bool,
    request_codes: Vec<u8>,
    code_values: HTable<u8, Vec<String>>,
    send_options: HTable<u8, Vec<u8>>,
    rng: SmallRng,
}

fn clamp_lease(value: Option<u32>) -> u32 {
    // must not be prone to overflows
    let v = value.unwrap_or(3600) & 0x0fff_ffff;
    v.max(10)
}

/// Pick a random link-local address (host order) within
/// `169.254.1.0 .. 169.254.254.255`. A zero seed falls back to the wall
/// clock microseconds.
pub fn ipv4ll_random_ip(seed: u32) -> u32 {
    let seed = if seed != 0 {
        u64::from(seed)
    } else {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| u64::from(d.subsec_micros()) | 1)
            .unwrap_or(1)
    };
    let mut rng = SmallRng::seed_from_u64(seed);
    loop {
        let tmp = rng.next_u32() & 0xffff;
        if tmp <= 0xffff - 0x0200 {
            return LINKLOCAL_ADDR + 0x100 + tmp;
        }
    }
}

impl<L: LinkIo> DhcpV4Client<L> {
    pub fn new(kind: ClientKind, ifindex: u32, mac: [u8; 6], link: L, seed: u64) -> Result<Self, CoreError> {
        let mut rng = SmallRng::seed_from_u64(seed);
        let xid = rng.next_u32();
        Ok(Self {
            kind,
            ifindex,
            mac,
            link,
            pool: EventPool::new()?,
            state: V4State::InitSelecting,
            pending: Pending::Idle,
            xid,
            server: Ipv4Addr::UNSPECIFIED,
            requested_ip: 0,
            assigned: None,
            last_address: None,
            start_time: Instant::now(),
            lease_seconds: 0,
            t1: 0,
            t2: 0,
            expire: 0,
            retry: 0,
            ack_retry: 0,
            conflicts: 0,
            ipv4ll_fallback: false,
            request_codes: Vec::new(),
            code_values: HTable::new(),
            send_options: HTable::new(),
            rng,
        })
    }

    /// Ask the server for `code` in replies; its decoded values appear in
    /// [`option_values`](Self::option_values) after a lease.
    pub fn set_request(&mut self, code: u8) {
        if !self.request_codes.contains(&code) {
            self.request_codes.push(code);
        }
    }

    /// Carry a raw option on outgoing messages.
    pub fn set_send_bytes(&mut self, code: u8, data: &[u8]) {
        let len = data.len().min(255);
        let mut raw = Vec::with_capacity(2 + len);
        raw.push(code);
        raw.push(len as u8);
        raw.extend_from_slice(&data[..len]);
        self.send_options.insert(code, raw);
    }

    pub fn set_hostname(&mut self, name: &str) {
        self.set_send_bytes(opt::HOST_NAME, name.as_bytes());
    }

    /// Arm the client-identifier option: hardware type byte plus MAC.
    pub fn set_client_id(&mut self) {
        let mut id = [0u8; 7];
        id[0] = 1; // ARPHRD_ETHER
        id[1..].copy_from_slice(&self.mac);
        self.set_send_bytes(opt::CLIENT_ID, &id);
    }

    /// Fall back to IPv4LL instead of reporting `NoLease` when the
    /// discover/request retries are exhausted.
    pub fn set_ipv4ll_fallback(&mut self, on: bool) {
        self.ipv4ll_fallback = on;
    }

    pub fn state(&self) -> V4State {
        self.state
    }

    #[doc(hidden)]
    pub fn xid(&self) -> u32 {
        self.xid
    }

    pub fn assigned_address(&self) -> Option<Ipv4Addr> {
        self.assigned
    }

    /// Decoded values of a requested option from the last reply.
    pub fn option_values(&self, code: u8) -> Option<&Vec<String>> {
        self.code_values.get(&code)
    }

    /// The netmask matching the current state: the link-local /16 in the
    /// IPv4LL states, the subnet option once bound.
    pub fn netmask(&self) -> Option<String> {
        match self.state {
            V4State::Ipv4llMonitor | V4State::Ipv4llDefend => Some("255.255.0.0".to_string()),
            V4State::Bound | V4State::Renewing | V4State::Rebinding => self
                .code_values
                .get(&opt::SUBNET)
                .and_then(|v| v.first())
                .cloned(),
            _ => None,
        }
    }

    pub fn t1(&self) -> Option<u32> {
        self.has_lease().then_some(self.t1)
    }

    pub fn t2(&self) -> Option<u32> {
        self.has_lease().then_some(self.t2)
    }

    pub fn lease_expire(&self) -> Option<u32> {
        self.has_lease().then_some(self.expire)
    }

    fn has_lease(&self) -> bool {
        matches!(
            self.state,
            V4State::Bound | V4State::Renewing | V4State::Rebinding
        )
    }

    /// Wait for client events; dispatch each through
    /// [`process`](Self::process).
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<V4Event>, CoreError> {
        self.pool.poll(timeout)
    }

    /// Kick off address acquisition. With a known previous address the
    /// client starts in init-reboot and asks for it back.
    pub fn start(&mut self, last_address: Option<Ipv4Addr>) -> Result<Vec<DhcpEvent>, CoreError> {
        let mut out = Vec::new();
        self.start_cycle(last_address, &mut out)?;
        Ok(out)
    }

    /// Stop the client, releasing the lease if one is held.
    pub fn stop(&mut self) {
        let _ = self.switch_listen(ListenMode::None);
        if self.has_lease() {
            if let Err(e) = self.send_release() {
                log::debug!("release failed: {e}");
            }
        }
        self.remove_timeouts();
        self.retry = 0;
        self.ack_retry = 0;
        self.requested_ip = 0;
        self.state = V4State::Released;
        self.lease_seconds = 0;
    }

    pub fn process(&mut self, event: V4Event) -> Result<Vec<DhcpEvent>, CoreError> {
        let mut out = Vec::new();
        match event {
            V4Event::PacketIn => self.drain_packets(&mut out)?,
            V4Event::Timer(slot) => self.handle_timer(slot, &mut out)?,
        }
        Ok(out)
    }

    /// Switch the listener and keep the event pool's watch in sync.
    fn switch_listen(&mut self, mode: ListenMode) -> Result<(), CoreError> {
        if let Some(fd) = self.link.listener_fd() {
            self.pool.del_fd(fd);
        }
        self.link.set_listen(mode)?;
        if let Some(fd) = self.link.listener_fd() {
            self.pool.add_fd(fd, V4Event::PacketIn)?;
        }
        Ok(())
    }

    fn remove_timeouts(&mut self) {
        self.pending = Pending::Idle;
        self.pool.del_timer(V4Event::Timer(TimerSlot::Resend));
        self.pool.del_timer(V4Event::Timer(TimerSlot::T1));
        self.pool.del_timer(V4Event::Timer(TimerSlot::T2));
        self.pool.del_timer(V4Event::Timer(TimerSlot::Expire));
    }

    fn arm_resend(&mut self, after: Duration, pending: Pending) -> Result<(), CoreError> {
        self.pending = pending;
        self.pool.add_timer(after, V4Event::Timer(TimerSlot::Resend))
    }

    fn attempt_secs(&self) -> u16 {
        self.start_time.elapsed().as_secs().min(0xffff) as u16
    }

    fn make_packet(&self, mtype: MessageType) -> DhcpPacket {
        let mut p = DhcpPacket::new(mtype);
        p.chaddr[..6].copy_from_slice(&self.mac);
        p
    }

    fn add_request_options(&self, p: &mut DhcpPacket) {
        if !self.request_codes.is_empty() {
            p.add_option_bytes(opt::PARAM_REQ, &self.request_codes);
        }
    }

    fn add_send_options(&self, p: &mut DhcpPacket) {
        for raw in self.send_options.values() {
            p.add_binary_option(raw);
        }
    }

    fn send_raw(&mut self, p: &mut DhcpPacket) -> Result<(), CoreError> {
        p.set_broadcast();
        let frame = pktbuild::udp4_frame(
            Ipv4Addr::UNSPECIFIED,
            CLIENT_PORT,
            Ipv4Addr::BROADCAST,
            SERVER_PORT,
            &p.encode(),
        );
        self.link.send_ip(&frame, &MAC_BCAST)
    }

    fn send_discover(&mut self, requested: Option<u32>) -> Result<(), CoreError> {
        log::debug!("sending DHCPDISCOVER xid={:#010x}", self.xid);
        let mut p = self.make_packet(MessageType::Discover);
        p.xid = self.xid;
        p.secs = self.attempt_secs();
        if let Some(requested) = requested.filter(|&r| r != 0) {
            p.add_option_u32(opt::REQUESTED_IP, requested);
        }
        // an explicit RFC-compliant max size keeps buggy servers from
        // sending bigger packets
        p.add_option_u16(opt::MAX_SIZE, 576);
        self.add_request_options(&mut p);
        self.add_send_options(&mut p);
        self.send_raw(&mut p)
    }

    fn send_request(&mut self) -> Result<(), CoreError> {
        log::debug!("sending DHCPREQUEST xid={:#010x} in {:?}", self.xid, self.state);
        let mut p = self.make_packet(MessageType::Request);
        p.xid = self.xid;
        p.secs = self.attempt_secs();

        if matches!(self.state, V4State::Requesting | V4State::Rebooting) {
            p.add_option_u32(opt::REQUESTED_IP, self.requested_ip);
        }
        if self.state == V4State::Requesting {
            p.add_option_u32(opt::SERVER_ID, u32::from(self.server));
        }
        p.add_option_u16(opt::MAX_SIZE, 576);
        self.add_request_options(&mut p);
        self.add_send_options(&mut p);

        if matches!(self.state, V4State::Renewing | V4State::Rebinding) {
            p.ciaddr = Ipv4Addr::from(self.requested_ip);
        }
        if self.state == V4State::Renewing {
            let src = Ipv4Addr::from(self.requested_ip);
            let server = self.server;
            return self
                .link
                .send_udp(src, CLIENT_PORT, server, SERVER_PORT, &p.encode());
        }
        self.send_raw(&mut p)
    }

    fn send_release(&mut self) -> Result<(), CoreError> {
        log::debug!("sending DHCPRELEASE");
        let mut p = self.make_packet(MessageType::Release);
        p.xid = self.rng.next_u32();
        p.ciaddr = Ipv4Addr::from(self.requested_ip);
        p.add_option_u32(opt::SERVER_ID, u32::from(self.server));
        let src = Ipv4Addr::from(self.requested_ip);
        let server = self.server;
        self.link
            .send_udp(src, CLIENT_PORT, server, SERVER_PORT, &p.encode())
    }

    fn emit_no_lease(&mut self, out: &mut Vec<DhcpEvent>) -> Result<(), CoreError> {
        if self.kind == ClientKind::Dhcp && self.ipv4ll_fallback {
            log::info!("no DHCP lease, falling back to IPv4LL");
            return self.ipv4ll_start(out);
        }
        out.push(DhcpEvent::NoLease);
        Ok(())
    }

    fn start_cycle(
        &mut self,
        last_address: Option<Ipv4Addr>,
        out: &mut Vec<DhcpEvent>,
    ) -> Result<(), CoreError> {
        if self.kind == ClientKind::Ipv4ll {
            self.state = V4State::InitSelecting;
            return self.ipv4ll_start(out);
        }

        if self.retry == DISCOVER_RETRIES {
            self.retry = 0;
            return self.emit_no_lease(out);
        }

        if self.retry == 0 {
            self.assigned = None;
            self.state = V4State::InitSelecting;
            self.switch_listen(ListenMode::L2)?;
            self.xid = self.rng.next_u32();
            self.start_time = Instant::now();
        }

        let addr = match last_address {
            Some(a) if a != Ipv4Addr::BROADCAST => {
                self.last_address = Some(a);
                u32::from(a)
            }
            _ => 0,
        };

        if addr != 0 {
            log::debug!("starting in init-reboot for {}", Ipv4Addr::from(addr));
            self.requested_ip = addr;
            self.state = V4State::Rebooting;
            self.send_request()?;
            return self.arm_resend(REQUEST_TIMEOUT, Pending::Reboot);
        }

        self.send_discover(None)?;
        self.arm_resend(DISCOVER_TIMEOUT, Pending::Discover)
    }

    fn start_request(&mut self, out: &mut Vec<DhcpEvent>) -> Result<(), CoreError> {
        if self.retry == REQUEST_RETRIES {
            return self.emit_no_lease(out);
        }
        if self.retry == 0 {
            self.state = V4State::Requesting;
            self.switch_listen(ListenMode::L2)?;
        }
        self.send_request()?;
        self.arm_resend(REQUEST_TIMEOUT, Pending::Request)
    }

    fn restart(&mut self, retries: u8, out: &mut Vec<DhcpEvent>) -> Result<(), CoreError> {
        log::debug!("restarting DHCP (retries {retries})");
        self.remove_timeouts();
        self.retry = retries;
        self.requested_ip = 0;
        self.state = V4State::InitSelecting;
        self.switch_listen(ListenMode::L2)?;
        self.start_cycle(self.last_address, out)
    }

    fn capture_options(&mut self, pkt: &DhcpPacket) {
        for code in self.request_codes.clone() {
            match pkt.option_value_strings(code) {
                Some(values) => {
                    self.code_values.insert(code, values);
                }
                None => {
                    self.code_values.remove(&code);
                }
            }
        }
    }

    fn lease_snapshot(&self, address: Ipv4Addr) -> Lease {
        let parse_list = |code: u8| -> Vec<Ipv4Addr> {
            self.code_values
                .get(&code)
                .map(|v| v.iter().filter_map(|s| s.parse().ok()).collect())
                .unwrap_or_default()
        };
        Lease {
            address,
            subnet: self
                .code_values
                .get(&opt::SUBNET)
                .and_then(|v| v.first())
                .and_then(|s| s.parse().ok()),
            routers: parse_list(opt::ROUTER),
            dns: parse_list(opt::DNS_SERVER),
            server: self.server,
            lease_seconds: self.lease_seconds,
            t1: self.t1,
            t2: self.t2,
        }
    }

    fn start_bound(&mut self) -> Result<(), CoreError> {
        log::debug!(
            "bound: lease {}s t1 {}s t2 {}s",
            self.lease_seconds,
            self.t1,
            self.t2
        );
        self.state = V4State::Bound;
        self.pool
            .add_timer(Duration::from_secs(self.t1.into()), V4Event::Timer(TimerSlot::T1))?;
        self.pool
            .add_timer(Duration::from_secs(self.t2.into()), V4Event::Timer(TimerSlot::T2))?;
        self.pool.add_timer(
            Duration::from_secs(self.expire.into()),
            V4Event::Timer(TimerSlot::Expire),
        )
    }

    fn drain_packets(&mut self, out: &mut Vec<DhcpEvent>) -> Result<(), CoreError> {
        let mut buf = [0u8; 1536];
        loop {
            let Some(n) = self.link.recv(&mut buf)? else {
                return Ok(());
            };
            let mode = self.link.listen_mode();
            let r = match mode {
                ListenMode::L2 => pktbuild::verify_udp4(&buf[..n], CLIENT_PORT)
                    .and_then(DhcpPacket::decode)
                    .and_then(|pkt| self.handle_dhcp(pkt, out)),
                ListenMode::L3(_) => {
                    DhcpPacket::decode(&buf[..n]).and_then(|pkt| self.handle_dhcp(pkt, out))
                }
                ListenMode::Arp => self.handle_arp(&buf[..n], out),
                _ => return Ok(()),
            };
            if let Err(e) = r {
                // transient protocol noise is dropped without side effects
                log::debug!("dropping packet: {e}");
            }
        }
    }

    fn accepts(&self, pkt: &DhcpPacket) -> bool {
        pkt.xid == self.xid && pkt.hlen == 6 && pkt.chaddr[..6] == self.mac
    }

    fn handle_dhcp(
        &mut self,
        pkt: DhcpPacket,
        out: &mut Vec<DhcpEvent>,
    ) -> Result<(), CoreError> {
        if !self.accepts(&pkt) {
            log::debug!(
                "dropping DHCP packet: xid {:#010x} (ours {:#010x})",
                pkt.xid,
                self.xid
            );
            return Ok(());
        }
        let Some(mtype) = pkt.message_type() else {
            return Ok(());
        };

        match self.state {
            V4State::InitSelecting => {
                if mtype != MessageType::Offer {
                    return Ok(());
                }
                let Some(server) = pkt.get_option_u32(opt::SERVER_ID) else {
                    return Err(CoreError::protocol("OFFER without server id"));
                };
                self.remove_timeouts();
                self.retry = 0;
                self.server = Ipv4Addr::from(server);
                self.requested_ip = u32::from(pkt.yiaddr);
                self.start_request(out)?;
            }
            V4State::Rebooting | V4State::Requesting | V4State::Renewing | V4State::Rebinding => {
                match mtype {
                    MessageType::Ack => {
                        self.retry = 0;
                        self.remove_timeouts();
                        self.lease_seconds = clamp_lease(pkt.get_option_u32(opt::LEASE_TIME));
                        self.capture_options(&pkt);
                        self.switch_listen(ListenMode::None)?;
                        self.assigned = Some(pkt.yiaddr);
                        if self.state == V4State::Rebooting {
                            if let Some(server) = pkt.get_option_u32(opt::SERVER_ID) {
                                self.server = Ipv4Addr::from(server);
                            }
                        }
                        self.t1 = self.lease_seconds >> 1;
                        self.t2 = (u64::from(self.lease_seconds) * 7 / 8) as u32;
                        self.expire = self.lease_seconds;
                        out.push(DhcpEvent::LeaseAvailable(self.lease_snapshot(pkt.yiaddr)));
                        self.start_bound()?;
                    }
                    MessageType::Nak => {
                        log::debug!("request was NAK'd, restarting in 3s");
                        self.retry = 0;
                        self.remove_timeouts();
                        self.arm_resend(NAK_RESTART_DELAY, Pending::NakRestart)?;
                    }
                    _ => {}
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn handle_timer(&mut self, slot: TimerSlot, out: &mut Vec<DhcpEvent>) -> Result<(), CoreError> {
        match slot {
            TimerSlot::Resend => {
                let pending = std::mem::replace(&mut self.pending, Pending::Idle);
                match pending {
                    Pending::Idle => {}
                    Pending::Discover => {
                        self.retry += 1;
                        // retries leave out the requested-ip option so
                        // non-authoritative servers still answer
                        self.start_cycle(None, out)?;
                    }
                    Pending::Request => {
                        self.retry += 1;
                        self.start_request(out)?;
                    }
                    Pending::Reboot => {
                        self.retry = 0;
                        self.requested_ip = 0;
                        self.state = V4State::InitSelecting;
                        self.start_cycle(None, out)?;
                    }
                    Pending::NakRestart => {
                        if self.state == V4State::Rebooting {
                            self.last_address = None;
                            self.restart(0, out)?;
                        } else {
                            self.ack_retry += 1;
                            let retries = self.ack_retry;
                            self.restart(retries, out)?;
                        }
                    }
                    Pending::Ipv4llSendProbe => self.ipv4ll_send_probe(out)?,
                    Pending::Ipv4llProbeWait => self.ipv4ll_probe_timeout(out)?,
                    Pending::Ipv4llAnnounceWait => self.ipv4ll_announce_timeout(out)?,
                    Pending::Ipv4llDefendWait => {
                        log::debug!("back to IPv4LL monitor");
                        self.conflicts = 0;
                        self.state = V4State::Ipv4llMonitor;
                    }
                }
            }
            TimerSlot::T1 => match self.state {
                V4State::Bound => {
                    log::debug!("t1 expired, renewing");
                    self.state = V4State::Renewing;
                    self.t1 = self.t2 - self.t1;
                    self.continue_renew()?;
                }
                V4State::Renewing => self.continue_renew()?,
                _ => {}
            },
            TimerSlot::T2 => match self.state {
                V4State::Bound | V4State::Renewing => {
                    log::debug!("t2 expired, rebinding");
                    self.pool.del_timer(V4Event::Timer(TimerSlot::T1));
                    self.state = V4State::Rebinding;
                    self.t2 = self.expire - self.t2;
                    self.continue_rebind()?;
                }
                V4State::Rebinding => self.continue_rebind()?,
                _ => {}
            },
            TimerSlot::Expire => {
                log::info!("lease expired");
                self.remove_timeouts();
                self.restart(0, out)?;
                out.push(DhcpEvent::LeaseLost);
            }
        }
        Ok(())
    }

    fn halved_retry(&mut self, secs: u32, slot: TimerSlot) -> Result<(), CoreError> {
        if secs > 60 {
            let jitter: i64 = i64::from(self.rng.gen_range(0..2000u32)) - 1000;
            let ms = (i64::from(secs) * 1000 + jitter).max(0) as u64;
            self.pool
                .add_timer(Duration::from_millis(ms), V4Event::Timer(slot))?;
        }
        Ok(())
    }

    fn continue_renew(&mut self) -> Result<(), CoreError> {
        self.switch_listen(ListenMode::L3(CLIENT_PORT))?;
        self.send_request()?;
        self.pool.del_timer(V4Event::Timer(TimerSlot::T1));
        self.t1 >>= 1;
        let t1 = self.t1;
        self.halved_retry(t1, TimerSlot::T1)
    }

    fn continue_rebind(&mut self) -> Result<(), CoreError> {
        self.switch_listen(ListenMode::L2)?;
        self.send_request()?;
        self.pool.del_timer(V4Event::Timer(TimerSlot::T2));
        self.t2 >>= 1;
        let t2 = self.t2;
        self.halved_retry(t2, TimerSlot::T2)
    }

    // --- IPv4LL ---

    fn ipv4ll_start(&mut self, _out: &mut Vec<DhcpEvent>) -> Result<(), CoreError> {
        self.remove_timeouts();
        self.switch_listen(ListenMode::None)?;
        self.retry = 0;

        // start from a MAC-derived address so reboots converge on the same
        // candidate
        let seed = u32::from(self.mac[4]) << 8 | u32::from(self.mac[5]);
        self.requested_ip = ipv4ll_random_ip(seed);

        // random start delay avoids probe storms after boot
        let delay = Duration::from_millis(self.rng.gen_range(0..PROBE_WAIT * 1000));
        self.retry += 1;
        self.arm_resend(delay, Pending::Ipv4llSendProbe)
    }

    fn ipv4ll_stop(&mut self) -> Result<(), CoreError> {
        self.switch_listen(ListenMode::None)?;
        self.remove_timeouts();
        self.state = V4State::Ipv4llProbe;
        self.retry = 0;
        self.requested_ip = 0;
        self.assigned = None;
        Ok(())
    }

    fn ipv4ll_send_probe(&mut self, _out: &mut Vec<DhcpEvent>) -> Result<(), CoreError> {
        if self.requested_ip == 0 {
            log::debug!("picking a new IPv4LL candidate");
            self.requested_ip = ipv4ll_random_ip(0);
        }
        if self.retry == 1 {
            self.state = V4State::Ipv4llProbe;
            self.switch_listen(ListenMode::Arp)?;
        }
        let frame = arp::ArpFrame::probe(self.mac, Ipv4Addr::from(self.requested_ip)).encode();
        self.link.send_arp(&frame)?;

        let timeout = if self.retry < PROBE_NUM {
            Duration::from_millis(PROBE_MIN * 1000 + self.rng.gen_range(0..(PROBE_MAX - PROBE_MIN) * 1000))
        } else {
            Duration::from_secs(ANNOUNCE_WAIT)
        };
        self.arm_resend(timeout, Pending::Ipv4llProbeWait)
    }

    fn ipv4ll_probe_timeout(&mut self, out: &mut Vec<DhcpEvent>) -> Result<(), CoreError> {
        if self.retry == PROBE_NUM {
            self.state = V4State::Ipv4llAnnounce;
            self.retry = 1;
            return self.ipv4ll_send_announce(out);
        }
        self.retry += 1;
        self.ipv4ll_send_probe(out)
    }

    fn ipv4ll_send_announce(&mut self, _out: &mut Vec<DhcpEvent>) -> Result<(), CoreError> {
        let addr = Ipv4Addr::from(self.requested_ip);
        let frame = arp::ArpFrame::announce(self.mac, addr).encode();
        self.link.send_arp(&frame)?;
        self.remove_timeouts();
        if self.state == V4State::Ipv4llDefend {
            self.arm_resend(Duration::from_secs(DEFEND_INTERVAL), Pending::Ipv4llDefendWait)
        } else {
            self.arm_resend(
                Duration::from_secs(ANNOUNCE_INTERVAL),
                Pending::Ipv4llAnnounceWait,
            )
        }
    }

    fn ipv4ll_announce_timeout(&mut self, out: &mut Vec<DhcpEvent>) -> Result<(), CoreError> {
        if self.retry != ANNOUNCE_NUM {
            self.retry += 1;
            return self.ipv4ll_send_announce(out);
        }
        let addr = Ipv4Addr::from(self.requested_ip);
        log::debug!("IPv4LL {addr} claimed, monitoring");
        self.state = V4State::Ipv4llMonitor;
        self.assigned = Some(addr);
        self.conflicts = 0;
        out.push(DhcpEvent::Ipv4llAvailable(addr));
        Ok(())
    }

    fn handle_arp(&mut self, frame: &[u8], out: &mut Vec<DhcpEvent>) -> Result<(), CoreError> {
        let f = arp::ArpFrame::decode(frame)?;
        let candidate = Ipv4Addr::from(self.requested_ip);
        let Some(conflict) = arp::conflict(&f, candidate) else {
            return Ok(());
        };
        self.conflicts += 1;
        log::debug!("IPv4LL conflict {} on {candidate}", self.conflicts);

        if self.state == V4State::Ipv4llMonitor {
            if conflict != arp::Conflict::Source {
                return Ok(());
            }
            // defend with a single announcement
            self.state = V4State::Ipv4llDefend;
            return self.ipv4ll_send_announce(out);
        }

        if self.state == V4State::Ipv4llDefend {
            if conflict != arp::Conflict::Source {
                return Ok(());
            }
            out.push(DhcpEvent::Ipv4llLost);
        }

        self.ipv4ll_stop()?;

        if self.conflicts < MAX_CONFLICTS {
            self.retry += 1;
            let delay = Duration::from_millis(self.rng.gen_range(0..PROBE_WAIT * 1000));
            self.arm_resend(delay, Pending::Ipv4llSendProbe)
        } else {
            // RFC 3927 wants a RATE_LIMIT_INTERVAL wait here; we report
            // failure instead and let the owner decide
            out.push(DhcpEvent::NoLease);
            Ok(())
        }
    }
}

impl<L: LinkIo> DhcpV4Client<L> {
    #[doc(hidden)]
    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }
}

impl<L: LinkIo> AsRawFd for DhcpV4Client<L> {
    fn as_raw_fd(&self) -> RawFd {
        self.pool.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::mock::{MockLink, Sent};

    const MAC: [u8; 6] = [0x02, 0x11, 0x22, 0x33, 0x44, 0x55];
    const SERVER: Ipv4Addr = Ipv4Addr::new(192, 168, 77, 1);
    const YIADDR: Ipv4Addr = Ipv4Addr::new(192, 168, 77, 100);

    fn client(kind: ClientKind) -> DhcpV4Client<MockLink> {
        let mut c = DhcpV4Client::new(kind, 3, MAC, MockLink::new(), 0x1234).unwrap();
        c.set_request(opt::SUBNET);
        c.set_request(opt::DNS_SERVER);
        c.set_request(opt::ROUTER);
        c
    }

    /// Decode the BOOTP payload of the only frame sent since the last take.
    fn sent_dhcp(c: &mut DhcpV4Client<MockLink>) -> DhcpPacket {
        let sent = c.link_mut().take_sent();
        assert_eq!(sent.len(), 1, "expected exactly one frame: {sent:?}");
        match &sent[0] {
            Sent::Ip { frame, dst_mac } => {
                assert_eq!(*dst_mac, MAC_BCAST);
                let payload = pktbuild::verify_udp4(frame, SERVER_PORT).unwrap();
                DhcpPacket::decode(payload).unwrap()
            }
            Sent::Udp { payload, .. } => DhcpPacket::decode(payload).unwrap(),
            other => panic!("unexpected send: {other:?}"),
        }
    }

    fn reply_frame(c: &DhcpV4Client<MockLink>, pkt: &DhcpPacket) -> Vec<u8> {
        let _ = c;
        pktbuild::udp4_frame(SERVER, SERVER_PORT, Ipv4Addr::BROADCAST, CLIENT_PORT, &pkt.encode())
    }

    fn reply(c: &DhcpV4Client<MockLink>, mtype: MessageType, with_lease: bool) -> DhcpPacket {
        let mut p = DhcpPacket::new(mtype);
        p.xid = c.xid();
        p.chaddr[..6].copy_from_slice(&MAC);
        p.yiaddr = YIADDR;
        p.add_option_u32(opt::SERVER_ID, u32::from(SERVER));
        if with_lease {
            p.add_option_u32(opt::LEASE_TIME, 3600);
            p.add_option_bytes(opt::SUBNET, &Ipv4Addr::new(255, 255, 255, 0).octets());
            p.add_option_bytes(opt::ROUTER, &SERVER.octets());
        }
        p
    }

    #[test]
    fn discover_offer_request_ack() {
        let mut c = client(ClientKind::Dhcp);
        assert!(c.start(None).unwrap().is_empty());
        assert_eq!(c.state(), V4State::InitSelecting);
        assert_eq!(c.link_mut().listen_mode(), ListenMode::L2);

        let discover = sent_dhcp(&mut c);
        assert_eq!(discover.message_type(), Some(MessageType::Discover));
        assert_eq!(discover.chaddr[..6], MAC);
        assert!(discover.broadcast());
        assert_eq!(discover.get_option(opt::REQUESTED_IP), None);

        let offer = reply(&c, MessageType::Offer, false);
        let frame = reply_frame(&c, &offer);
        c.link_mut().push_inbound(frame);
        let evs = c.process(V4Event::PacketIn).unwrap();
        assert!(evs.is_empty());
        assert_eq!(c.state(), V4State::Requesting);

        let request = sent_dhcp(&mut c);
        assert_eq!(request.message_type(), Some(MessageType::Request));
        assert_eq!(
            request.get_option_u32(opt::REQUESTED_IP),
            Some(u32::from(YIADDR))
        );
        assert_eq!(request.get_option_u32(opt::SERVER_ID), Some(u32::from(SERVER)));

        let ack = reply(&c, MessageType::Ack, true);
        let frame = reply_frame(&c, &ack);
        c.link_mut().push_inbound(frame);
        let evs = c.process(V4Event::PacketIn).unwrap();
        assert_eq!(c.state(), V4State::Bound);
        assert_eq!(c.t1(), Some(1800));
        assert_eq!(c.t2(), Some(3150));
        assert_eq!(c.lease_expire(), Some(3600));
        assert_eq!(c.assigned_address(), Some(YIADDR));
        assert_eq!(c.netmask().as_deref(), Some("255.255.255.0"));

        match &evs[..] {
            [DhcpEvent::LeaseAvailable(lease)] => {
                assert_eq!(lease.address, YIADDR);
                assert_eq!(lease.subnet, Some(Ipv4Addr::new(255, 255, 255, 0)));
                assert_eq!(lease.routers, vec![SERVER]);
                assert_eq!(lease.server, SERVER);
                assert_eq!(lease.lease_seconds, 3600);
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn drops_mismatched_replies_without_side_effects() {
        let mut c = client(ClientKind::Dhcp);
        c.start(None).unwrap();
        c.link_mut().take_sent();

        // wrong xid
        let mut offer = reply(&c, MessageType::Offer, false);
        offer.xid ^= 1;
        let f = reply_frame(&c, &offer);
        c.link_mut().push_inbound(f);
        // wrong chaddr
        let mut offer = reply(&c, MessageType::Offer, false);
        offer.chaddr[0] ^= 0xff;
        let f = reply_frame(&c, &offer);
        c.link_mut().push_inbound(f);
        // wrong hlen
        let mut offer = reply(&c, MessageType::Offer, false);
        offer.hlen = 11;
        let f = reply_frame(&c, &offer);
        c.link_mut().push_inbound(f);

        let evs = c.process(V4Event::PacketIn).unwrap();
        assert!(evs.is_empty());
        assert_eq!(c.state(), V4State::InitSelecting);
        assert!(c.link_mut().take_sent().is_empty());
    }

    #[test]
    fn lease_time_is_masked_and_clamped() {
        assert_eq!(clamp_lease(Some(0xffff_ffff)), 0x0fff_ffff);
        assert_eq!(clamp_lease(Some(3)), 10);
        assert_eq!(clamp_lease(Some(0)), 10);
        assert_eq!(clamp_lease(None), 3600);

        let mut c = client(ClientKind::Dhcp);
        c.start(None).unwrap();
        c.link_mut().take_sent();
        let f = reply_frame(&c, &reply(&c, MessageType::Offer, false));
        c.link_mut().push_inbound(f);
        c.process(V4Event::PacketIn).unwrap();
        c.link_mut().take_sent();

        let mut ack = reply(&c, MessageType::Ack, false);
        ack.add_option_u32(opt::LEASE_TIME, 0xffff_ffff);
        let f = reply_frame(&c, &ack);
        c.link_mut().push_inbound(f);
        c.process(V4Event::PacketIn).unwrap();
        assert_eq!(c.lease_expire(), Some(0x0fff_ffff));
    }

    #[test]
    fn nak_restarts_discovery_after_delay() {
        let mut c = client(ClientKind::Dhcp);
        c.start(None).unwrap();
        c.link_mut().take_sent();
        let f = reply_frame(&c, &reply(&c, MessageType::Offer, false));
        c.link_mut().push_inbound(f);
        c.process(V4Event::PacketIn).unwrap();
        c.link_mut().take_sent();
        assert_eq!(c.state(), V4State::Requesting);

        let f = reply_frame(&c, &reply(&c, MessageType::Nak, false));
        c.link_mut().push_inbound(f);
        let evs = c.process(V4Event::PacketIn).unwrap();
        assert!(evs.is_empty());
        // restart happens when the 3s timer fires
        c.process(V4Event::Timer(TimerSlot::Resend)).unwrap();
        assert_eq!(c.state(), V4State::InitSelecting);
        let discover = sent_dhcp(&mut c);
        assert_eq!(discover.message_type(), Some(MessageType::Discover));
    }

    #[test]
    fn discover_retries_exhaust_to_no_lease() {
        let mut c = client(ClientKind::Dhcp);
        c.start(None).unwrap();
        for _ in 0..DISCOVER_RETRIES - 1 {
            let evs = c.process(V4Event::Timer(TimerSlot::Resend)).unwrap();
            assert!(evs.is_empty());
        }
        let evs = c.process(V4Event::Timer(TimerSlot::Resend)).unwrap();
        assert_eq!(evs, vec![DhcpEvent::NoLease]);
    }

    #[test]
    fn discover_exhaustion_can_fall_back_to_ipv4ll() {
        let mut c = client(ClientKind::Dhcp);
        c.set_ipv4ll_fallback(true);
        c.start(None).unwrap();
        for _ in 0..DISCOVER_RETRIES {
            c.process(V4Event::Timer(TimerSlot::Resend)).unwrap();
        }
        // fallback armed the probe delay instead of reporting failure
        c.process(V4Event::Timer(TimerSlot::Resend)).unwrap();
        assert_eq!(c.state(), V4State::Ipv4llProbe);
        assert_eq!(c.link_mut().listen_mode(), ListenMode::Arp);
    }

    fn arp_sent(c: &mut DhcpV4Client<MockLink>) -> Vec<arp::ArpFrame> {
        c.link_mut()
            .take_sent()
            .into_iter()
            .map(|s| match s {
                Sent::Arp(f) => arp::ArpFrame::decode(&f).unwrap(),
                other => panic!("unexpected send: {other:?}"),
            })
            .collect()
    }

    #[test]
    fn ipv4ll_probe_announce_monitor_defend_lost() {
        let mut c = client(ClientKind::Ipv4ll);
        c.start(None).unwrap();
        assert!(c.link_mut().take_sent().is_empty());

        // three probes
        for i in 0..3 {
            c.process(V4Event::Timer(TimerSlot::Resend)).unwrap();
            let frames = arp_sent(&mut c);
            assert_eq!(frames.len(), 1, "probe {i}");
            assert_eq!(frames[0].spa, Ipv4Addr::UNSPECIFIED);
            assert_eq!(frames[0].sha, MAC);
            let [a, b, ..] = frames[0].tpa.octets();
            assert_eq!((a, b), (169, 254));
        }
        assert_eq!(c.state(), V4State::Ipv4llProbe);

        // two announcements
        c.process(V4Event::Timer(TimerSlot::Resend)).unwrap();
        let frames = arp_sent(&mut c);
        assert_eq!(frames[0].spa, frames[0].tpa);
        let candidate = frames[0].spa;
        assert_eq!(c.state(), V4State::Ipv4llAnnounce);

        c.process(V4Event::Timer(TimerSlot::Resend)).unwrap();
        assert_eq!(arp_sent(&mut c).len(), 1);

        let evs = c.process(V4Event::Timer(TimerSlot::Resend)).unwrap();
        assert_eq!(evs, vec![DhcpEvent::Ipv4llAvailable(candidate)]);
        assert_eq!(c.state(), V4State::Ipv4llMonitor);
        assert_eq!(c.netmask().as_deref(), Some("255.255.0.0"));

        // a competitor claims the address: one defence announcement
        let intruder = arp::ArpFrame::announce([0xde, 0xad, 0, 0, 0, 1], candidate);
        c.link_mut().push_inbound(intruder.encode().to_vec());
        let evs = c.process(V4Event::PacketIn).unwrap();
        assert!(evs.is_empty());
        assert_eq!(c.state(), V4State::Ipv4llDefend);
        assert_eq!(arp_sent(&mut c).len(), 1);

        // second conflict within the defend window loses the address
        c.link_mut().push_inbound(intruder.encode().to_vec());
        let evs = c.process(V4Event::PacketIn).unwrap();
        assert_eq!(evs, vec![DhcpEvent::Ipv4llLost]);
        assert_eq!(c.state(), V4State::Ipv4llProbe);
        assert_eq!(c.assigned_address(), None);
    }

    #[test]
    fn ipv4ll_target_conflict_during_probe_picks_new_address() {
        let mut c = client(ClientKind::Ipv4ll);
        c.start(None).unwrap();
        c.process(V4Event::Timer(TimerSlot::Resend)).unwrap();
        let candidate = arp_sent(&mut c)[0].tpa;

        // another host probing for the same candidate
        let rival = arp::ArpFrame::probe([0xde, 0xad, 0, 0, 0, 2], candidate);
        c.link_mut().push_inbound(rival.encode().to_vec());
        let evs = c.process(V4Event::PacketIn).unwrap();
        assert!(evs.is_empty());
        // restarts probing; a fresh candidate is chosen on the next probe
        c.process(V4Event::Timer(TimerSlot::Resend)).unwrap();
        let next = arp_sent(&mut c)[0].tpa;
        assert_ne!(next, Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn ipv4ll_addresses_stay_in_range() {
        for seed in 0..2000u32 {
            let ip = Ipv4Addr::from(ipv4ll_random_ip(seed + 1));
            let [a, b, host, _] = ip.octets();
            assert_eq!((a, b), (169, 254));
            assert!((1..=254).contains(&host), "host part out of range: {ip}");
        }
    }

    #[test]
    fn stop_sends_release_when_bound() {
        let mut c = client(ClientKind::Dhcp);
        c.start(None).unwrap();
        c.link_mut().take_sent();
        let f = reply_frame(&c, &reply(&c, MessageType::Offer, false));
        c.link_mut().push_inbound(f);
        c.process(V4Event::PacketIn).unwrap();
        c.link_mut().take_sent();
        let f = reply_frame(&c, &reply(&c, MessageType::Ack, true));
        c.link_mut().push_inbound(f);
        c.process(V4Event::PacketIn).unwrap();
        assert_eq!(c.state(), V4State::Bound);

        c.stop();
        assert_eq!(c.state(), V4State::Released);
        let sent = c.link_mut().take_sent();
        match &sent[..] {
            [Sent::Udp { dst, dst_port, payload, .. }] => {
                assert_eq!(*dst, SERVER);
                assert_eq!(*dst_port, SERVER_PORT);
                let rel = DhcpPacket::decode(payload).unwrap();
                assert_eq!(rel.message_type(), Some(MessageType::Release));
                assert_eq!(rel.ciaddr, YIADDR);
            }
            other => panic!("unexpected sends: {other:?}"),
        }
    }

    #[test]
    fn renew_unicasts_through_the_kernel() {
        let mut c = client(ClientKind::Dhcp);
        c.start(None).unwrap();
        c.link_mut().take_sent();
        let f = reply_frame(&c, &reply(&c, MessageType::Offer, false));
        c.link_mut().push_inbound(f);
        c.process(V4Event::PacketIn).unwrap();
        c.link_mut().take_sent();
        let f = reply_frame(&c, &reply(&c, MessageType::Ack, true));
        c.link_mut().push_inbound(f);
        c.process(V4Event::PacketIn).unwrap();
        c.link_mut().take_sent();

        c.process(V4Event::Timer(TimerSlot::T1)).unwrap();
        assert_eq!(c.state(), V4State::Renewing);
        let sent = c.link_mut().take_sent();
        match &sent[..] {
            [Sent::Udp { src, dst, payload, .. }] => {
                assert_eq!(*src, YIADDR);
                assert_eq!(*dst, SERVER);
                let req = DhcpPacket::decode(payload).unwrap();
                assert_eq!(req.message_type(), Some(MessageType::Request));
                assert_eq!(req.ciaddr, YIADDR);
                // renew carries no server-id and no requested-ip
                assert_eq!(req.get_option(opt::SERVER_ID), None);
                assert_eq!(req.get_option(opt::REQUESTED_IP), None);
            }
            other => panic!("unexpected sends: {other:?}"),
        }

        // t2 moves to rebinding over raw broadcast
        c.process(V4Event::Timer(TimerSlot::T2)).unwrap();
        assert_eq!(c.state(), V4State::Rebinding);
        let sent = c.link_mut().take_sent();
        assert!(matches!(&sent[..], [Sent::Ip { .. }]));
    }

    #[test]
    fn lease_expiry_restarts_and_reports_loss() {
        let mut c = client(ClientKind::Dhcp);
        c.start(None).unwrap();
        c.link_mut().take_sent();
        let f = reply_frame(&c, &reply(&c, MessageType::Offer, false));
        c.link_mut().push_inbound(f);
        c.process(V4Event::PacketIn).unwrap();
        c.link_mut().take_sent();
        let f = reply_frame(&c, &reply(&c, MessageType::Ack, true));
        c.link_mut().push_inbound(f);
        c.process(V4Event::PacketIn).unwrap();
        c.link_mut().take_sent();

        let evs = c.process(V4Event::Timer(TimerSlot::Expire)).unwrap();
        assert!(evs.contains(&DhcpEvent::LeaseLost));
        assert_eq!(c.state(), V4State::InitSelecting);
    }
}
