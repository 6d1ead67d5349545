//! Link-level I/O.
//!
//! The state machines never touch sockets directly; they drive a [`LinkIo`]
//! implementation. [`LinuxLink`] is the production one: an `AF_PACKET`
//! listener with a classic BPF filter for the raw paths, plain UDP for the
//! kernel paths, ephemeral send sockets like the reference implementation.
//! [`mock::MockLink`] records outbound frames and replays queued inbound
//! ones, so every FSM transition runs in tests without privileges.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use libc::c_int;
use miracle_shared::{CoreError, ErrorKind};

use crate::{CLIENT_PORT, MAC_BCAST, SERVER_PORT, V6_SERVER_PORT};

/// What the single listener socket of a client or server is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenMode {
    None,
    /// `AF_PACKET`/`ETH_P_IP` with the BPF filter of §BPF.
    L2,
    /// Kernel UDP on the given port, bound to the device.
    L3(u16),
    /// Kernel UDPv6 on the given port, bound to the device.
    L3V6(u16),
    /// `AF_PACKET`/`ETH_P_ARP`.
    Arp,
}

pub trait LinkIo {
    /// Switch the listener. Releases the previous socket and installs the
    /// new one; `ListenMode::None` just closes.
    fn set_listen(&mut self, mode: ListenMode) -> Result<(), CoreError>;

    fn listen_mode(&self) -> ListenMode;

    /// Descriptor of the active listener for event-loop registration.
    fn listener_fd(&self) -> Option<RawFd>;

    /// Nonblocking read of one frame from the listener.
    fn recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, CoreError>;

    /// Send a raw IP datagram (IP header included) to `dst_mac`.
    fn send_ip(&mut self, frame: &[u8], dst_mac: &[u8; 6]) -> Result<(), CoreError>;

    /// Send a UDP datagram through the kernel stack.
    fn send_udp(
        &mut self,
        src: Ipv4Addr,
        src_port: u16,
        dst: Ipv4Addr,
        dst_port: u16,
        payload: &[u8],
    ) -> Result<(), CoreError>;

    /// Broadcast an ARP frame.
    fn send_arp(&mut self, frame: &[u8]) -> Result<(), CoreError>;

    /// Send a DHCPv6 message to `ff02::1:2` port 547 out of this interface.
    fn send_udp6_multicast(&mut self, payload: &[u8]) -> Result<(), CoreError>;
}

const ETH_P_IP: u16 = 0x0800;
const ETH_P_ARP: u16 = 0x0806;

fn os_err(ctx: &str) -> CoreError {
    CoreError::last_os(ctx)
}

fn socket_fd(domain: c_int, ty: c_int, proto: c_int) -> Result<OwnedFd, CoreError> {
    let fd = unsafe { libc::socket(domain, ty | libc::SOCK_CLOEXEC, proto) };
    if fd < 0 {
        return Err(os_err("socket"));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn sockaddr_ll(ifindex: u32, protocol: u16, dst_mac: Option<&[u8; 6]>) -> libc::sockaddr_ll {
    let mut sa: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    sa.sll_family = libc::AF_PACKET as libc::sa_family_t;
    sa.sll_protocol = protocol.to_be();
    sa.sll_ifindex = ifindex as c_int;
    if let Some(mac) = dst_mac {
        sa.sll_halen = 6;
        sa.sll_addr[..6].copy_from_slice(mac);
    }
    sa
}

fn bind_ll(fd: RawFd, sa: &libc::sockaddr_ll) -> Result<(), CoreError> {
    let r = unsafe {
        libc::bind(
            fd,
            (sa as *const libc::sockaddr_ll).cast(),
            std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if r < 0 {
        return Err(os_err("bind packet socket"));
    }
    Ok(())
}

/// The classic BPF program of the raw DHCP listener: accept UDP with the
/// 67/68 port pair, or ARP over Ethernet/IPv4; drop everything else.
fn attach_dhcp_filter(fd: RawFd) -> Result<(), CoreError> {
    const BPF_LD: u16 = 0x00;
    const BPF_LDX: u16 = 0x01;
    const BPF_JMP: u16 = 0x05;
    const BPF_RET: u16 = 0x06;
    const BPF_W: u16 = 0x00;
    const BPF_B: u16 = 0x10;
    const BPF_ABS: u16 = 0x20;
    const BPF_IND: u16 = 0x40;
    const BPF_MSH: u16 = 0xa0;
    const BPF_JEQ: u16 = 0x10;
    const BPF_K: u16 = 0x00;

    const SERVER_AND_CLIENT_PORTS: u32 = ((SERVER_PORT as u32) << 16) + CLIENT_PORT as u32;

    let mut filter = [
        // check for udp
        libc::sock_filter { code: BPF_LD | BPF_B | BPF_ABS, jt: 0, jf: 0, k: 9 },
        libc::sock_filter {
            code: BPF_JMP | BPF_JEQ | BPF_K,
            jt: 2,
            jf: 0,
            k: libc::IPPROTO_UDP as u32,
        },
        // check for arp on ethernet-like and IPv4
        libc::sock_filter { code: BPF_LD | BPF_W | BPF_ABS, jt: 0, jf: 0, k: 2 },
        libc::sock_filter { code: BPF_JMP | BPF_JEQ | BPF_K, jt: 3, jf: 4, k: 0x0800_0604 },
        // skip the IP header
        libc::sock_filter { code: BPF_LDX | BPF_B | BPF_MSH, jt: 0, jf: 0, k: 0 },
        // check udp source and destination ports
        libc::sock_filter { code: BPF_LD | BPF_W | BPF_IND, jt: 0, jf: 0, k: 0 },
        libc::sock_filter {
            code: BPF_JMP | BPF_JEQ | BPF_K,
            jt: 0,
            jf: 1,
            k: SERVER_AND_CLIENT_PORTS,
        },
        libc::sock_filter { code: BPF_RET | BPF_K, jt: 0, jf: 0, k: 0x0fff_ffff },
        libc::sock_filter { code: BPF_RET | BPF_K, jt: 0, jf: 0, k: 0 },
    ];

    let prog = libc::sock_fprog {
        len: filter.len() as libc::c_ushort,
        filter: filter.as_mut_ptr(),
    };
    let r = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ATTACH_FILTER,
            (&prog as *const libc::sock_fprog).cast(),
            std::mem::size_of::<libc::sock_fprog>() as libc::socklen_t,
        )
    };
    if r < 0 {
        return Err(os_err("SO_ATTACH_FILTER"));
    }
    Ok(())
}

fn set_reuseaddr(fd: RawFd) -> Result<(), CoreError> {
    let on: c_int = 1;
    let r = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            (&on as *const c_int).cast(),
            std::mem::size_of::<c_int>() as libc::socklen_t,
        )
    };
    if r < 0 {
        return Err(os_err("SO_REUSEADDR"));
    }
    Ok(())
}

fn bind_to_device(fd: RawFd, ifname: &str) -> Result<(), CoreError> {
    let mut name = ifname.as_bytes().to_vec();
    name.push(0);
    let r = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            name.as_ptr().cast(),
            name.len() as libc::socklen_t,
        )
    };
    if r < 0 {
        return Err(os_err("SO_BINDTODEVICE"));
    }
    Ok(())
}

fn sockaddr_in(addr: Ipv4Addr, port: u16) -> libc::sockaddr_in {
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = port.to_be();
    sa.sin_addr = libc::in_addr {
        s_addr: u32::from(addr).to_be(),
    };
    sa
}

fn sockaddr_in6(addr: Ipv6Addr, port: u16) -> libc::sockaddr_in6 {
    let mut sa: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
    sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
    sa.sin6_port = port.to_be();
    sa.sin6_addr = libc::in6_addr {
        s6_addr: addr.octets(),
    };
    sa
}

/// Production [`LinkIo`] over Linux sockets, one instance per interface.
pub struct LinuxLink {
    ifindex: u32,
    ifname: String,
    mode: ListenMode,
    listener: Option<OwnedFd>,
}

impl LinuxLink {
    /// Open the link for `ifindex`. Fails if the interface does not exist
    /// or is down.
    pub fn open(ifindex: u32) -> Result<Self, CoreError> {
        let ifname = if_name(ifindex)?;
        if !if_is_up(ifindex)? {
            return Err(CoreError::new(
                ErrorKind::InterfaceDown,
                format!("interface {ifname} is down"),
            ));
        }
        Ok(Self {
            ifindex,
            ifname,
            mode: ListenMode::None,
            listener: None,
        })
    }

    pub fn ifname(&self) -> &str {
        &self.ifname
    }

    fn l2_listener(&self) -> Result<OwnedFd, CoreError> {
        let fd = socket_fd(
            libc::AF_PACKET,
            libc::SOCK_DGRAM | libc::SOCK_NONBLOCK,
            (ETH_P_IP.to_be() as c_int).into(),
        )?;
        attach_dhcp_filter(fd.as_raw_fd())?;
        bind_ll(fd.as_raw_fd(), &sockaddr_ll(self.ifindex, ETH_P_IP, None))?;
        Ok(fd)
    }

    fn arp_listener(&self) -> Result<OwnedFd, CoreError> {
        let fd = socket_fd(
            libc::AF_PACKET,
            libc::SOCK_DGRAM | libc::SOCK_NONBLOCK,
            (ETH_P_ARP.to_be() as c_int).into(),
        )?;
        bind_ll(fd.as_raw_fd(), &sockaddr_ll(self.ifindex, ETH_P_ARP, None))?;
        Ok(fd)
    }

    fn l3_listener(&self, port: u16, v6: bool) -> Result<OwnedFd, CoreError> {
        let family = if v6 { libc::AF_INET6 } else { libc::AF_INET };
        let fd = socket_fd(
            family,
            libc::SOCK_DGRAM | libc::SOCK_NONBLOCK,
            libc::IPPROTO_UDP,
        )?;
        set_reuseaddr(fd.as_raw_fd())?;
        bind_to_device(fd.as_raw_fd(), &self.ifname)?;
        let r = if v6 {
            let sa = sockaddr_in6(Ipv6Addr::UNSPECIFIED, port);
            unsafe {
                libc::bind(
                    fd.as_raw_fd(),
                    (&sa as *const libc::sockaddr_in6).cast(),
                    std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                )
            }
        } else {
            let sa = sockaddr_in(Ipv4Addr::UNSPECIFIED, port);
            unsafe {
                libc::bind(
                    fd.as_raw_fd(),
                    (&sa as *const libc::sockaddr_in).cast(),
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            }
        };
        if r < 0 {
            return Err(os_err("bind udp listener"));
        }
        Ok(fd)
    }
}

impl LinkIo for LinuxLink {
    fn set_listen(&mut self, mode: ListenMode) -> Result<(), CoreError> {
        if self.mode == mode {
            return Ok(());
        }
        log::debug!("{}: listen mode {:?} -> {:?}", self.ifname, self.mode, mode);
        self.listener = None;
        self.mode = ListenMode::None;

        let fd = match mode {
            ListenMode::None => return Ok(()),
            ListenMode::L2 => self.l2_listener()?,
            ListenMode::L3(port) => self.l3_listener(port, false)?,
            ListenMode::L3V6(port) => self.l3_listener(port, true)?,
            ListenMode::Arp => self.arp_listener()?,
        };
        self.listener = Some(fd);
        self.mode = mode;
        Ok(())
    }

    fn listen_mode(&self) -> ListenMode {
        self.mode
    }

    fn listener_fd(&self) -> Option<RawFd> {
        self.listener.as_ref().map(AsRawFd::as_raw_fd)
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, CoreError> {
        let Some(fd) = self.listener.as_ref() else {
            return Ok(None);
        };
        let n = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EAGAIN) {
                return Ok(None);
            }
            return Err(CoreError::from(err));
        }
        Ok(Some(n as usize))
    }

    fn send_ip(&mut self, frame: &[u8], dst_mac: &[u8; 6]) -> Result<(), CoreError> {
        let fd = socket_fd(
            libc::AF_PACKET,
            libc::SOCK_DGRAM,
            (ETH_P_IP.to_be() as c_int).into(),
        )?;
        let dest = sockaddr_ll(self.ifindex, ETH_P_IP, Some(dst_mac));
        bind_ll(fd.as_raw_fd(), &dest)?;
        let n = unsafe {
            libc::sendto(
                fd.as_raw_fd(),
                frame.as_ptr().cast(),
                frame.len(),
                0,
                (&dest as *const libc::sockaddr_ll).cast(),
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if n < 0 {
            return Err(os_err("raw send"));
        }
        Ok(())
    }

    fn send_udp(
        &mut self,
        src: Ipv4Addr,
        src_port: u16,
        dst: Ipv4Addr,
        dst_port: u16,
        payload: &[u8],
    ) -> Result<(), CoreError> {
        let fd = socket_fd(libc::AF_INET, libc::SOCK_DGRAM, libc::IPPROTO_UDP)?;
        set_reuseaddr(fd.as_raw_fd())?;
        let local = sockaddr_in(src, src_port);
        let r = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                (&local as *const libc::sockaddr_in).cast(),
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if r < 0 {
            return Err(os_err("bind udp send socket"));
        }
        let remote = sockaddr_in(dst, dst_port);
        let r = unsafe {
            libc::connect(
                fd.as_raw_fd(),
                (&remote as *const libc::sockaddr_in).cast(),
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if r < 0 {
            return Err(os_err("connect udp send socket"));
        }
        let n = unsafe { libc::write(fd.as_raw_fd(), payload.as_ptr().cast(), payload.len()) };
        if n < 0 {
            return Err(os_err("udp send"));
        }
        Ok(())
    }

    fn send_arp(&mut self, frame: &[u8]) -> Result<(), CoreError> {
        let fd = socket_fd(
            libc::AF_PACKET,
            libc::SOCK_DGRAM,
            (ETH_P_ARP.to_be() as c_int).into(),
        )?;
        let dest = sockaddr_ll(self.ifindex, ETH_P_ARP, Some(&MAC_BCAST));
        bind_ll(fd.as_raw_fd(), &dest)?;
        let n = unsafe {
            libc::sendto(
                fd.as_raw_fd(),
                frame.as_ptr().cast(),
                frame.len(),
                0,
                (&dest as *const libc::sockaddr_ll).cast(),
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if n < 0 {
            return Err(os_err("arp send"));
        }
        Ok(())
    }

    fn send_udp6_multicast(&mut self, payload: &[u8]) -> Result<(), CoreError> {
        // ff02::1:2, all DHCP relay agents and servers
        let dst = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0x0001, 0x0002);
        let fd = socket_fd(libc::AF_INET6, libc::SOCK_DGRAM, libc::IPPROTO_UDP)?;
        let sa = sockaddr_in6(dst, V6_SERVER_PORT);

        let mut iov = libc::iovec {
            iov_base: payload.as_ptr() as *mut libc::c_void,
            iov_len: payload.len(),
        };
        let mut control = vec![0u8; unsafe {
            libc::CMSG_SPACE(std::mem::size_of::<libc::in6_pktinfo>() as libc::c_uint) as usize
        }];

        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_name = (&sa as *const libc::sockaddr_in6) as *mut libc::c_void;
        msg.msg_namelen = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = control.len();

        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::IPPROTO_IPV6;
            (*cmsg).cmsg_type = libc::IPV6_PKTINFO;
            (*cmsg).cmsg_len =
                libc::CMSG_LEN(std::mem::size_of::<libc::in6_pktinfo>() as libc::c_uint) as usize;
            let info: *mut libc::in6_pktinfo = libc::CMSG_DATA(cmsg).cast();
            (*info) = std::mem::zeroed();
            (*info).ipi6_ifindex = self.ifindex as libc::c_uint;
            msg.msg_controllen = (*cmsg).cmsg_len;
        }

        let n = unsafe { libc::sendmsg(fd.as_raw_fd(), &msg, 0) };
        if n < 0 {
            return Err(os_err("dhcpv6 sendmsg"));
        }
        Ok(())
    }
}

fn ctl_socket() -> Result<OwnedFd, CoreError> {
    socket_fd(libc::AF_INET, libc::SOCK_DGRAM, 0)
}

fn ifreq_zeroed() -> libc::ifreq {
    unsafe { std::mem::zeroed() }
}

fn ifreq_set_name(ifr: &mut libc::ifreq, name: &str) -> Result<(), CoreError> {
    let bytes = name.as_bytes();
    if bytes.len() >= ifr.ifr_name.len() {
        return Err(CoreError::invalid_arg("interface name too long"));
    }
    for (dst, src) in ifr.ifr_name.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    Ok(())
}

fn ifreq_name(ifr: &libc::ifreq) -> String {
    ifr.ifr_name
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8 as char)
        .collect()
}

/// Resolve an interface name to its index.
pub fn if_index(name: &str) -> Result<u32, CoreError> {
    let fd = ctl_socket()?;
    let mut ifr = ifreq_zeroed();
    ifreq_set_name(&mut ifr, name)?;
    let r = unsafe { libc::ioctl(fd.as_raw_fd(), libc::SIOCGIFINDEX, &mut ifr) };
    if r < 0 {
        return Err(CoreError::new(
            ErrorKind::InterfaceUnavailable,
            format!("no such interface: {name}"),
        ));
    }
    let index = unsafe { ifr.ifr_ifru.ifru_ifindex };
    if index <= 0 {
        return Err(CoreError::new(ErrorKind::InvalidIndex, "bad ifindex"));
    }
    Ok(index as u32)
}

/// Resolve an interface index to its name.
pub fn if_name(index: u32) -> Result<String, CoreError> {
    let fd = ctl_socket()?;
    let mut ifr = ifreq_zeroed();
    ifr.ifr_ifru.ifru_ifindex = index as c_int;
    let r = unsafe { libc::ioctl(fd.as_raw_fd(), libc::SIOCGIFNAME, &mut ifr) };
    if r < 0 {
        return Err(CoreError::new(
            ErrorKind::InterfaceUnavailable,
            format!("no interface with index {index}"),
        ));
    }
    Ok(ifreq_name(&ifr))
}

/// Hardware address of the interface.
pub fn if_mac(index: u32) -> Result<[u8; 6], CoreError> {
    let name = if_name(index)?;
    let fd = ctl_socket()?;
    let mut ifr = ifreq_zeroed();
    ifreq_set_name(&mut ifr, &name)?;
    let r = unsafe { libc::ioctl(fd.as_raw_fd(), libc::SIOCGIFHWADDR, &mut ifr) };
    if r < 0 {
        return Err(os_err("SIOCGIFHWADDR"));
    }
    let mut mac = [0u8; 6];
    let data = unsafe { ifr.ifr_ifru.ifru_hwaddr.sa_data };
    for (dst, src) in mac.iter_mut().zip(data.iter()) {
        *dst = *src as u8;
    }
    Ok(mac)
}

/// Whether the interface is administratively up.
pub fn if_is_up(index: u32) -> Result<bool, CoreError> {
    let name = if_name(index)?;
    let fd = ctl_socket()?;
    let mut ifr = ifreq_zeroed();
    ifreq_set_name(&mut ifr, &name)?;
    let r = unsafe { libc::ioctl(fd.as_raw_fd(), libc::SIOCGIFFLAGS, &mut ifr) };
    if r < 0 {
        return Err(os_err("SIOCGIFFLAGS"));
    }
    let flags = unsafe { ifr.ifr_ifru.ifru_flags };
    Ok(flags & libc::IFF_UP as libc::c_short != 0)
}

/// Configured IPv4 address of the interface.
pub fn if_addr(index: u32) -> Result<Ipv4Addr, CoreError> {
    let name = if_name(index)?;
    let fd = ctl_socket()?;
    let mut ifr = ifreq_zeroed();
    ifreq_set_name(&mut ifr, &name)?;
    let r = unsafe { libc::ioctl(fd.as_raw_fd(), libc::SIOCGIFADDR, &mut ifr) };
    if r < 0 {
        return Err(os_err("SIOCGIFADDR"));
    }
    let sa: libc::sockaddr_in =
        unsafe { std::mem::transmute::<libc::sockaddr, libc::sockaddr_in>(ifr.ifr_ifru.ifru_addr) };
    Ok(Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr)))
}

/// Frame recorder + replay queue standing in for a real link in tests.
#[doc(hidden)]
pub mod mock {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Sent {
        Ip {
            frame: Vec<u8>,
            dst_mac: [u8; 6],
        },
        Udp {
            src: Ipv4Addr,
            src_port: u16,
            dst: Ipv4Addr,
            dst_port: u16,
            payload: Vec<u8>,
        },
        Arp(Vec<u8>),
        Udp6(Vec<u8>),
    }

    #[derive(Debug)]
    pub struct MockLink {
        pub mode: ListenMode,
        pub sent: Vec<Sent>,
        pub inbound: VecDeque<Vec<u8>>,
    }

    impl Default for MockLink {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockLink {
        pub fn new() -> Self {
            Self {
                mode: ListenMode::None,
                sent: Vec::new(),
                inbound: VecDeque::new(),
            }
        }

        pub fn push_inbound(&mut self, frame: Vec<u8>) {
            self.inbound.push_back(frame);
        }

        pub fn take_sent(&mut self) -> Vec<Sent> {
            std::mem::take(&mut self.sent)
        }
    }

    impl LinkIo for MockLink {
        fn set_listen(&mut self, mode: ListenMode) -> Result<(), CoreError> {
            self.mode = mode;
            Ok(())
        }

        fn listen_mode(&self) -> ListenMode {
            self.mode
        }

        fn listener_fd(&self) -> Option<RawFd> {
            None
        }

        fn recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, CoreError> {
            match self.inbound.pop_front() {
                Some(frame) => {
                    let n = frame.len().min(buf.len());
                    buf[..n].copy_from_slice(&frame[..n]);
                    Ok(Some(n))
                }
                None => Ok(None),
            }
        }

        fn send_ip(&mut self, frame: &[u8], dst_mac: &[u8; 6]) -> Result<(), CoreError> {
            self.sent.push(Sent::Ip {
                frame: frame.to_vec(),
                dst_mac: *dst_mac,
            });
            Ok(())
        }

        fn send_udp(
            &mut self,
            src: Ipv4Addr,
            src_port: u16,
            dst: Ipv4Addr,
            dst_port: u16,
            payload: &[u8],
        ) -> Result<(), CoreError> {
            self.sent.push(Sent::Udp {
                src,
                src_port,
                dst,
                dst_port,
                payload: payload.to_vec(),
            });
            Ok(())
        }

        fn send_arp(&mut self, frame: &[u8]) -> Result<(), CoreError> {
            self.sent.push(Sent::Arp(frame.to_vec()));
            Ok(())
        }

        fn send_udp6_multicast(&mut self, payload: &[u8]) -> Result<(), CoreError> {
            self.sent.push(Sent::Udp6(payload.to_vec()));
            Ok(())
        }
    }
}
