//! DHCPv4 client and server state machines.

pub mod client;
pub mod server;

pub use client::{ClientKind, DhcpEvent, DhcpV4Client, Lease, TimerSlot, V4Event, V4State};
pub use server::{DhcpV4Server, LeaseEntry, ServerEvent};
