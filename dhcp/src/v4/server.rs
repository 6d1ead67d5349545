//! Minimal DHCPv4 server for the two-peer P2P link.
//!
//! Listens on kernel UDP port 67 and answers over the raw socket so replies
//! reach clients that do not have an address yet. Leases are held in a list
//! sorted by descending expiry (the tail is always the oldest) with a hash
//! keyed by address for O(1) lookup.

use std::net::Ipv4Addr;
use std::os::fd::RawFd;

use miracle_shared::{CoreError, ErrorKind, HTable};

use crate::io::{LinkIo, ListenMode};
use crate::pktbuild;
use crate::proto::v4::{check_packet_type, opt, DhcpPacket, MessageType};
use crate::{CLIENT_PORT, MAC_ANY, MAC_BCAST, SERVER_PORT};

/// 8 hours.
pub const DEFAULT_LEASE_SECS: u32 = 8 * 60 * 60;

/// How long an un-acked OFFER reserves its address.
const OFFER_TIME: u64 = 5 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseEntry {
    /// Unix seconds.
    pub expire: u64,
    /// Host order.
    pub ip: u32,
    pub mac: [u8; 6],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A lease was handed to a peer.
    RemoteLease { mac: [u8; 6], address: Ipv4Addr },
}

type SaveLeaseFn = Box<dyn FnMut(&LeaseEntry)>;

pub struct DhcpV4Server<L: LinkIo> {
    #[allow(dead_code)]
    ifindex: u32,
    server_ip: Ipv4Addr,
    started: bool,
    start_ip: u32,
    end_ip: u32,
    lease_seconds: u32,
    link: L,
    /// Sorted by descending `expire`; the tail is the oldest.
    leases: Vec<LeaseEntry>,
    by_ip: HTable<u32, LeaseEntry>,
    options: HTable<u8, String>,
    save_lease: Option<SaveLeaseFn>,
}

impl<L: LinkIo> DhcpV4Server<L> {
    /// `server_ip` is the address configured on the interface; it becomes
    /// the server identifier in every reply.
    pub fn new(ifindex: u32, server_ip: Ipv4Addr, link: L) -> Result<Self, CoreError> {
        if server_ip == Ipv4Addr::UNSPECIFIED {
            return Err(CoreError::new(
                ErrorKind::InvalidArgument,
                "server interface has no address",
            ));
        }
        Ok(Self {
            ifindex,
            server_ip,
            started: false,
            start_ip: 0,
            end_ip: 0,
            lease_seconds: DEFAULT_LEASE_SECS,
            link,
            leases: Vec::new(),
            by_ip: HTable::new(),
            options: HTable::new(),
            save_lease: None,
        })
    }

    pub fn set_ip_range(&mut self, start: &str, end: &str) -> Result<(), CoreError> {
        let s: Ipv4Addr = start
            .parse()
            .map_err(|_| CoreError::invalid_arg(format!("bad range start: {start}")))?;
        let e: Ipv4Addr = end
            .parse()
            .map_err(|_| CoreError::invalid_arg(format!("bad range end: {end}")))?;
        self.start_ip = u32::from(s);
        self.end_ip = u32::from(e);
        Ok(())
    }

    pub fn set_lease_time(&mut self, seconds: u32) {
        self.lease_seconds = seconds;
    }

    /// Configure an option sent to clients. Only the subnet mask, router
    /// and DNS server are understood.
    pub fn set_option(&mut self, code: u8, value: &str) -> Result<(), CoreError> {
        match code {
            opt::SUBNET | opt::ROUTER | opt::DNS_SERVER => {}
            _ => {
                return Err(CoreError::invalid_arg(format!(
                    "unsupported server option {code}"
                )))
            }
        }
        let _: Ipv4Addr = value
            .parse()
            .map_err(|_| CoreError::invalid_arg(format!("bad option value: {value}")))?;
        self.options.insert(code, value.to_string());
        Ok(())
    }

    /// Called for every lease on [`stop`](Self::stop); load leases with
    /// [`insert_lease`](Self::insert_lease) before starting.
    pub fn set_save_lease<F: FnMut(&LeaseEntry) + 'static>(&mut self, f: F) {
        self.save_lease = Some(Box::new(f));
    }

    pub fn start(&mut self) -> Result<(), CoreError> {
        if self.started {
            return Ok(());
        }
        self.link.set_listen(ListenMode::L3(SERVER_PORT))?;
        self.started = true;
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(mut save) = self.save_lease.take() {
            for lease in &self.leases {
                save(lease);
            }
            self.save_lease = Some(save);
        }
        let _ = self.link.set_listen(ListenMode::None);
        self.started = false;
    }

    pub fn listener_fd(&self) -> Option<RawFd> {
        self.link.listener_fd()
    }

    /// Current lease table, newest expiry first.
    pub fn leases(&self) -> &[LeaseEntry] {
        &self.leases
    }

    /// Pre-load a saved lease.
    pub fn insert_lease(&mut self, lease: LeaseEntry) {
        self.detach_ip(lease.ip);
        self.attach(lease);
    }

    #[doc(hidden)]
    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Drain the listener; `now` is the current unix time in seconds.
    pub fn process_io(&mut self, now: u64) -> Result<Vec<ServerEvent>, CoreError> {
        let mut out = Vec::new();
        let mut buf = [0u8; 1536];
        loop {
            let Some(n) = self.link.recv(&mut buf)? else {
                return Ok(out);
            };
            let data = buf[..n].to_vec();
            if let Err(e) = self.handle_packet(&data, now, &mut out) {
                log::debug!("dropping packet: {e}");
            }
        }
    }

    fn handle_packet(
        &mut self,
        data: &[u8],
        now: u64,
        out: &mut Vec<ServerEvent>,
    ) -> Result<(), CoreError> {
        let pkt = DhcpPacket::decode(data)?;
        let Some(mtype) = check_packet_type(&pkt) else {
            return Ok(());
        };

        // addressed to another server
        let server_id = pkt.get_option_u32(opt::SERVER_ID);
        if let Some(sid) = server_id {
            if Ipv4Addr::from(sid) != self.server_ip {
                return Ok(());
            }
        }

        let requested = pkt.get_option_u32(opt::REQUESTED_IP);
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&pkt.chaddr[..6]);
        let lease = self.find_by_mac(&mac).cloned();

        match mtype {
            MessageType::Discover => {
                log::debug!("received DISCOVER from {mac:02x?}");
                self.send_offer(&pkt, lease.as_ref(), requested, now)?;
            }
            MessageType::Request => {
                let requested = match requested {
                    Some(r) => r,
                    None => {
                        let ci = u32::from(pkt.ciaddr);
                        if ci == 0 {
                            return Ok(());
                        }
                        ci
                    }
                };
                log::debug!(
                    "received REQUEST for {} from {mac:02x?}",
                    Ipv4Addr::from(requested)
                );
                if let Some(lease) = lease.as_ref().filter(|l| l.ip == requested) {
                    let dest = lease.ip;
                    self.send_ack(&pkt, dest, now)?;
                    out.push(ServerEvent::RemoteLease {
                        mac,
                        address: Ipv4Addr::from(dest),
                    });
                } else if server_id.is_some() || lease.is_none() {
                    self.send_nak(&pkt)?;
                }
            }
            MessageType::Decline => {
                log::debug!("received DECLINE from {mac:02x?}");
                if server_id.is_some() {
                    if let (Some(requested), Some(lease)) = (requested, lease) {
                        if requested == lease.ip {
                            self.detach_ip(lease.ip);
                        }
                    }
                }
            }
            MessageType::Release => {
                log::debug!("received RELEASE from {mac:02x?}");
                if server_id.is_some() {
                    if let Some(lease) = lease {
                        if u32::from(pkt.ciaddr) == lease.ip {
                            self.set_expire(lease.ip, now);
                        }
                    }
                }
            }
            MessageType::Inform => {
                log::debug!("received INFORM from {mac:02x?}");
                self.send_inform(&pkt)?;
            }
            _ => {}
        }
        Ok(())
    }

    // --- lease table ---

    fn find_by_mac(&self, mac: &[u8; 6]) -> Option<&LeaseEntry> {
        self.leases.iter().find(|l| l.mac == *mac)
    }

    fn detach_ip(&mut self, ip: u32) -> Option<LeaseEntry> {
        let removed = self.by_ip.remove(&ip);
        if removed.is_some() {
            self.leases.retain(|l| l.ip != ip);
        }
        removed
    }

    fn attach(&mut self, lease: LeaseEntry) {
        let at = self
            .leases
            .partition_point(|l| l.expire >= lease.expire);
        self.by_ip.insert(lease.ip, lease.clone());
        self.leases.insert(at, lease);
    }

    fn set_expire(&mut self, ip: u32, expire: u64) {
        if let Some(mut lease) = self.detach_ip(ip) {
            lease.expire = expire;
            self.attach(lease);
        }
    }

    fn is_expired(lease: &LeaseEntry, now: u64) -> bool {
        lease.expire < now
    }

    /// Install a lease for `mac`/`ip`, replacing whatever held the address
    /// or the hardware address before. `None` means a full lease term.
    fn add_lease(&mut self, expire: Option<u64>, mac: [u8; 6], ip: u32, now: u64) -> bool {
        if ip == 0 || ip < self.start_ip || ip > self.end_ip {
            return false;
        }
        if mac == MAC_BCAST || mac == MAC_ANY {
            return false;
        }
        self.detach_ip(ip);
        if let Some(old) = self.find_by_mac(&mac).map(|l| l.ip) {
            self.detach_ip(old);
        }
        let expire = expire.unwrap_or(now + u64::from(self.lease_seconds));
        self.attach(LeaseEntry { expire, ip, mac });
        true
    }

    fn requested_is_usable(&self, requested: u32, now: u64) -> bool {
        if requested == 0 || requested < self.start_ip || requested > self.end_ip {
            return false;
        }
        match self.by_ip.get(&requested) {
            None => true,
            Some(lease) => Self::is_expired(lease, now),
        }
    }

    fn find_free_or_expired(&self, now: u64) -> u32 {
        for ip in self.start_ip..=self.end_ip {
            // skip the .0 and .255 host parts
            if ip & 0xff == 0 || ip & 0xff == 0xff {
                continue;
            }
            if self.by_ip.get(&ip).is_none() {
                return ip;
            }
        }
        // the tail lease is the oldest one
        match self.leases.last() {
            Some(lease) if Self::is_expired(lease, now) => lease.ip,
            _ => 0,
        }
    }

    // --- wire ---

    fn init_reply(&self, client: &DhcpPacket, mtype: MessageType) -> DhcpPacket {
        let mut p = DhcpPacket::new(mtype);
        p.xid = client.xid;
        p.chaddr = client.chaddr;
        p.flags = client.flags;
        p.giaddr = client.giaddr;
        p.ciaddr = client.ciaddr;
        p.add_option_u32(opt::SERVER_ID, u32::from(self.server_ip));
        p
    }

    fn add_server_options(&self, p: &mut DhcpPacket) {
        for (&code, value) in self.options.iter() {
            if let Ok(addr) = value.parse::<Ipv4Addr>() {
                p.add_option_u32(code, u32::from(addr));
            }
        }
    }

    fn send_to_client(&mut self, p: &DhcpPacket) -> Result<(), CoreError> {
        let (dst, mac) = if p.broadcast() || p.ciaddr == Ipv4Addr::UNSPECIFIED {
            (Ipv4Addr::BROADCAST, MAC_BCAST)
        } else {
            let mut mac = [0u8; 6];
            mac.copy_from_slice(&p.chaddr[..6]);
            (p.ciaddr, mac)
        };
        let frame = pktbuild::udp4_frame(self.server_ip, SERVER_PORT, dst, CLIENT_PORT, &p.encode());
        self.link.send_ip(&frame, &mac)
    }

    fn send_offer(
        &mut self,
        client: &DhcpPacket,
        lease: Option<&LeaseEntry>,
        requested: Option<u32>,
        now: u64,
    ) -> Result<(), CoreError> {
        let yiaddr = if let Some(lease) = lease {
            lease.ip
        } else if requested.is_some_and(|r| self.requested_is_usable(r, now)) {
            requested.unwrap_or(0)
        } else {
            self.find_free_or_expired(now)
        };
        if yiaddr == 0 {
            log::warn!("no address left to offer");
            return Ok(());
        }

        let mut p = self.init_reply(client, MessageType::Offer);
        p.yiaddr = Ipv4Addr::from(yiaddr);
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&client.chaddr[..6]);
        if !self.add_lease(Some(now + OFFER_TIME), mac, yiaddr, now) {
            log::warn!("no free addresses, OFFER abandoned");
            return Ok(());
        }
        p.add_option_u32(opt::LEASE_TIME, self.lease_seconds);
        self.add_server_options(&mut p);
        log::debug!("sending OFFER of {}", Ipv4Addr::from(yiaddr));
        self.send_to_client(&p)
    }

    fn send_ack(&mut self, client: &DhcpPacket, dest: u32, now: u64) -> Result<(), CoreError> {
        let mut p = self.init_reply(client, MessageType::Ack);
        p.yiaddr = Ipv4Addr::from(dest);
        p.add_option_u32(opt::LEASE_TIME, self.lease_seconds);
        self.add_server_options(&mut p);
        log::debug!("sending ACK to {}", Ipv4Addr::from(dest));
        self.send_to_client(&p)?;
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&client.chaddr[..6]);
        self.add_lease(None, mac, dest, now);
        Ok(())
    }

    fn send_nak(&mut self, client: &DhcpPacket) -> Result<(), CoreError> {
        let p = self.init_reply(client, MessageType::Nak);
        log::debug!("sending NAK");
        let frame = pktbuild::udp4_frame(
            self.server_ip,
            SERVER_PORT,
            Ipv4Addr::BROADCAST,
            CLIENT_PORT,
            &p.encode(),
        );
        self.link.send_ip(&frame, &MAC_BCAST)
    }

    fn send_inform(&mut self, client: &DhcpPacket) -> Result<(), CoreError> {
        let mut p = self.init_reply(client, MessageType::Ack);
        self.add_server_options(&mut p);
        self.send_to_client(&p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::mock::{MockLink, Sent};

    const SERVER: Ipv4Addr = Ipv4Addr::new(192, 168, 77, 1);
    const MAC_A: [u8; 6] = [0, 0, 0, 0, 0, 1];
    const MAC_B: [u8; 6] = [0, 0, 0, 0, 0, 2];
    const NOW: u64 = 1_700_000_000;

    fn server(from: &str, to: &str) -> DhcpV4Server<MockLink> {
        let mut s = DhcpV4Server::new(4, SERVER, MockLink::new()).unwrap();
        s.set_ip_range(from, to).unwrap();
        s.set_lease_time(3600);
        s.set_option(opt::SUBNET, "255.255.255.0").unwrap();
        s.set_option(opt::ROUTER, "192.168.77.1").unwrap();
        s.start().unwrap();
        s
    }

    fn request_pkt(mac: [u8; 6], mtype: MessageType) -> DhcpPacket {
        let mut p = DhcpPacket::new(mtype);
        p.xid = 0x42;
        p.chaddr[..6].copy_from_slice(&mac);
        p.set_broadcast();
        p
    }

    fn feed(s: &mut DhcpV4Server<MockLink>, p: &DhcpPacket, now: u64) -> Vec<ServerEvent> {
        s.link.push_inbound(p.encode());
        s.process_io(now).unwrap()
    }

    fn sent_reply(s: &mut DhcpV4Server<MockLink>) -> DhcpPacket {
        let sent = s.link.take_sent();
        assert_eq!(sent.len(), 1, "expected one reply: {sent:?}");
        match &sent[0] {
            Sent::Ip { frame, .. } => {
                let payload = pktbuild::verify_udp4(frame, CLIENT_PORT).unwrap();
                DhcpPacket::decode(payload).unwrap()
            }
            other => panic!("unexpected send: {other:?}"),
        }
    }

    fn discover_request(
        s: &mut DhcpV4Server<MockLink>,
        mac: [u8; 6],
        now: u64,
    ) -> (Ipv4Addr, Vec<ServerEvent>) {
        feed(s, &request_pkt(mac, MessageType::Discover), now);
        let offer = sent_reply(s);
        assert_eq!(offer.message_type(), Some(MessageType::Offer));
        let mut req = request_pkt(mac, MessageType::Request);
        req.add_option_u32(opt::REQUESTED_IP, u32::from(offer.yiaddr));
        let evs = feed(s, &req, now);
        let ack = sent_reply(s);
        assert_eq!(ack.message_type(), Some(MessageType::Ack));
        assert_eq!(ack.yiaddr, offer.yiaddr);
        (ack.yiaddr, evs)
    }

    #[test]
    fn discover_offer_request_ack_then_nak_for_foreign_ip() {
        let mut s = server("192.168.77.100", "192.168.77.102");

        let (addr_a, evs) = discover_request(&mut s, MAC_A, NOW);
        assert_eq!(addr_a, Ipv4Addr::new(192, 168, 77, 100));
        assert_eq!(
            evs,
            vec![ServerEvent::RemoteLease {
                mac: MAC_A,
                address: addr_a
            }]
        );

        // B discovers and is offered the next address
        feed(&mut s, &request_pkt(MAC_B, MessageType::Discover), NOW);
        let offer_b = sent_reply(&mut s);
        assert_eq!(offer_b.yiaddr, Ipv4Addr::new(192, 168, 77, 101));

        // A asks for B's address with our server id: NAK
        let mut rogue = request_pkt(MAC_A, MessageType::Request);
        rogue.add_option_u32(opt::REQUESTED_IP, u32::from(offer_b.yiaddr));
        rogue.add_option_u32(opt::SERVER_ID, u32::from(SERVER));
        let evs = feed(&mut s, &rogue, NOW);
        assert!(evs.is_empty());
        let nak = sent_reply(&mut s);
        assert_eq!(nak.message_type(), Some(MessageType::Nak));
    }

    #[test]
    fn offer_carries_lease_and_configured_options() {
        let mut s = server("192.168.77.100", "192.168.77.102");
        feed(&mut s, &request_pkt(MAC_A, MessageType::Discover), NOW);
        let offer = sent_reply(&mut s);
        assert_eq!(offer.get_option_u32(opt::LEASE_TIME), Some(3600));
        assert_eq!(
            offer.get_option_u32(opt::SERVER_ID),
            Some(u32::from(SERVER))
        );
        assert_eq!(
            offer.option_value_strings(opt::SUBNET).unwrap(),
            vec!["255.255.255.0".to_string()]
        );
        assert_eq!(
            offer.option_value_strings(opt::ROUTER).unwrap(),
            vec!["192.168.77.1".to_string()]
        );
    }

    #[test]
    fn allocations_are_distinct_and_skip_boundary_hosts() {
        // range crosses a .255/.0 boundary
        let mut s = server("192.168.77.253", "192.168.78.2");
        let mut seen = Vec::new();
        for i in 1..=4u8 {
            let mac = [0, 0, 0, 0, 1, i];
            let (addr, _) = discover_request(&mut s, mac, NOW);
            let host = u32::from(addr) & 0xff;
            assert_ne!(host, 0, "allocated a .0 address");
            assert_ne!(host, 0xff, "allocated a .255 address");
            assert!(u32::from(addr) >= u32::from(Ipv4Addr::new(192, 168, 77, 253)));
            assert!(u32::from(addr) <= u32::from(Ipv4Addr::new(192, 168, 78, 2)));
            assert!(!seen.contains(&addr), "duplicate allocation: {addr}");
            seen.push(addr);
        }
        // range exhausted (4 usable hosts): no further offer
        feed(&mut s, &request_pkt([0, 0, 0, 0, 2, 0], MessageType::Discover), NOW);
        assert!(s.link.take_sent().is_empty());
    }

    #[test]
    fn lease_list_stays_sorted_by_descending_expire() {
        let mut s = server("192.168.77.100", "192.168.77.120");
        for i in 1..=8u8 {
            // interleave full leases and short offer holds
            let mac = [0, 0, 0, 0, 3, i];
            if i % 2 == 0 {
                discover_request(&mut s, mac, NOW + u64::from(i) * 7);
            } else {
                feed(&mut s, &request_pkt(mac, MessageType::Discover), NOW + u64::from(i));
                s.link.take_sent();
            }
            assert!(
                s.leases().windows(2).all(|w| w[0].expire >= w[1].expire),
                "lease list out of order: {:?}",
                s.leases()
            );
        }
    }

    #[test]
    fn oldest_expired_lease_is_recycled() {
        let mut s = server("192.168.77.100", "192.168.77.101");
        let (addr_a, _) = discover_request(&mut s, MAC_A, NOW);
        let (addr_b, _) = discover_request(&mut s, MAC_B, NOW + 10);
        assert_ne!(addr_a, addr_b);

        // both leased; a third discover inside the lease time gets nothing
        feed(&mut s, &request_pkt([9; 6], MessageType::Discover), NOW + 20);
        assert!(s.link.take_sent().is_empty());

        // after A's lease expired its address is reused
        let late = NOW + 3700;
        feed(&mut s, &request_pkt([0, 0, 0, 0, 0, 9], MessageType::Discover), late);
        let offer = sent_reply(&mut s);
        assert_eq!(offer.yiaddr, addr_a);
    }

    #[test]
    fn decline_removes_and_release_expires() {
        let mut s = server("192.168.77.100", "192.168.77.102");
        let (addr_a, _) = discover_request(&mut s, MAC_A, NOW);

        // release: lease stays but expires now
        let mut rel = request_pkt(MAC_A, MessageType::Release);
        rel.ciaddr = addr_a;
        rel.add_option_u32(opt::SERVER_ID, u32::from(SERVER));
        feed(&mut s, &rel, NOW + 5);
        assert_eq!(s.leases().len(), 1);
        assert_eq!(s.leases()[0].expire, NOW + 5);

        // re-acquire, then decline: lease is dropped entirely
        let (addr_a2, _) = discover_request(&mut s, MAC_A, NOW + 10);
        assert_eq!(addr_a2, addr_a);
        let mut dec = request_pkt(MAC_A, MessageType::Decline);
        dec.add_option_u32(opt::REQUESTED_IP, u32::from(addr_a));
        dec.add_option_u32(opt::SERVER_ID, u32::from(SERVER));
        feed(&mut s, &dec, NOW + 11);
        assert!(s.leases().is_empty());
    }

    #[test]
    fn inform_answers_options_without_allocating() {
        let mut s = server("192.168.77.100", "192.168.77.102");
        let mut inf = request_pkt(MAC_A, MessageType::Inform);
        inf.ciaddr = Ipv4Addr::new(192, 168, 77, 50);
        feed(&mut s, &inf, NOW);
        let reply = sent_reply(&mut s);
        assert_eq!(reply.message_type(), Some(MessageType::Ack));
        assert_eq!(reply.yiaddr, Ipv4Addr::UNSPECIFIED);
        assert_eq!(reply.get_option(opt::LEASE_TIME), None);
        assert!(reply.get_option(opt::SUBNET).is_some());
        assert!(s.leases().is_empty());
    }

    #[test]
    fn foreign_server_id_is_ignored() {
        let mut s = server("192.168.77.100", "192.168.77.102");
        let mut p = request_pkt(MAC_A, MessageType::Discover);
        p.add_option_u32(opt::SERVER_ID, u32::from(Ipv4Addr::new(10, 0, 0, 1)));
        feed(&mut s, &p, NOW);
        assert!(s.link.take_sent().is_empty());
    }

    #[test]
    fn unsupported_option_is_rejected_at_configure_time() {
        let mut s = DhcpV4Server::new(4, SERVER, MockLink::new()).unwrap();
        assert!(s.set_option(opt::HOST_NAME, "peer").is_err());
        assert!(s.set_option(opt::SUBNET, "not-an-ip").is_err());
    }

    #[test]
    fn stop_saves_leases() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let mut s = server("192.168.77.100", "192.168.77.102");
        discover_request(&mut s, MAC_A, NOW);
        let saved: Rc<RefCell<Vec<LeaseEntry>>> = Rc::default();
        let sink = Rc::clone(&saved);
        s.set_save_lease(move |l| sink.borrow_mut().push(l.clone()));
        s.stop();
        assert_eq!(saved.borrow().len(), 1);
        assert_eq!(saved.borrow()[0].mac, MAC_A);
    }
}
