//! Wi-Fi Display (Miracast) session engine.
//!
//! When a P2P group forms, a [`proc::DhcpProcess`] provisions the link and
//! reports addresses over its comm socket; a [`session::Session`] then
//! drives the WFD capability exchange and setup handshake (RTSP messages
//! M1–M16) against the peer until the stream plays. [`Sink`]s track the
//! peers that can display for us, at most one session each.
//!
//! The DBus surface and the wpa_supplicant control socket live elsewhere;
//! this crate only consumes the RTSP bus contract from `miracle-rtsp`.

pub mod proc;
pub mod registry;
pub mod session;
pub mod sink;
pub mod wfd;

pub use registry::Registry;
pub use session::{RtspMessageId, Session, SessionDir, SessionEvent, SessionState, StreamId};
pub use sink::Sink;
