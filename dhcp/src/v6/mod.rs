//! DHCPv6 client state machine.

pub mod client;

pub use client::{DhcpV6Client, DhcpV6Event, V6Event, V6Lease, V6State};
