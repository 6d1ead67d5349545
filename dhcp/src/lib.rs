//! Ad-hoc DHCP engine for Wi-Fi P2P links.
//!
//! Wi-Fi P2P requires a private IPv4 network between exactly two peers, and
//! none of the common DHCP daemons have a usable interface for such setups.
//! This crate is the self-contained replacement: a full DHCPv4 client state
//! machine with an IPv4 link-local fallback, a minimal DHCPv4 server
//! allocating from a configured range, and a partial DHCPv6 client.
//!
//! The state machines are I/O-injected through [`io::LinkIo`], so every
//! transition is testable without privileges; [`io::LinuxLink`] is the
//! production implementation over `AF_PACKET`/UDP sockets. Timers live in a
//! per-client [`miracle_shared::EventPool`] which nests into the caller's
//! poll loop via `as_raw_fd()`.
//!
//! The `miracle-dhcp` binary is the supervisor process spawned per network
//! interface; it applies leases with the `ip` binary and reports them on a
//! datagram comm socket (see `src/bin/miracle-dhcp.rs`).

pub mod arp;
pub mod io;
pub mod pktbuild;
pub mod proto;
pub mod v4;
pub mod v6;

/// DHCPv4 client source port.
pub const CLIENT_PORT: u16 = 68;
/// DHCPv4 server port.
pub const SERVER_PORT: u16 = 67;
/// DHCPv6 client source port.
pub const V6_CLIENT_PORT: u16 = 546;
/// DHCPv6 server/relay port.
pub const V6_SERVER_PORT: u16 = 547;

/// All-ones hardware address.
pub const MAC_BCAST: [u8; 6] = [0xff; 6];
/// All-zero hardware address.
pub const MAC_ANY: [u8; 6] = [0x00; 6];
