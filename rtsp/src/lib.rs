//! RTSP messages and the bus the session engine drives them over.
//!
//! This crate is deliberately small: the session core needs a message model
//! with typed access to headers and `text/parameters` bodies, canonical
//! sealing (CSeq, `Content-Length`, `Content-Type`), and a [`Bus`] it can
//! send requests on and receive matched replies from. [`PairBus`] is the
//! in-memory implementation used by the session tests; every message sent
//! through it round-trips through the wire form, so the canonicalization
//! rules are exercised on each exchange.

pub mod bus;
pub mod message;

pub use bus::{Bus, PairBus};
pub use message::{Message, MessageKind, CODE_OK};
