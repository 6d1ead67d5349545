//! The bus contract the session engine drives, plus an in-memory pair.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use miracle_shared::{CoreError, ErrorKind};

use crate::message::Message;

/// What the session engine requires from an RTSP connection.
///
/// Request/reply pairs keep FIFO order per direction. `call_async` assigns
/// the CSeq and returns it as the cancellation cookie; replies are matched
/// back by the consumer via [`Message::cseq`].
pub trait Bus {
    /// Seal and transmit a message (reply or fire-and-forget request).
    fn send(&mut self, msg: &mut Message) -> Result<(), CoreError>;

    /// Seal and transmit a request expecting a reply; returns the cookie.
    fn call_async(&mut self, msg: &mut Message) -> Result<u64, CoreError>;

    /// Forget an outstanding request.
    fn cancel(&mut self, cookie: u64);

    /// Whether the peer hung up.
    fn is_dead(&self) -> bool;
}

struct Shared {
    /// Messages pending delivery, indexed by receiving side.
    queues: [VecDeque<Message>; 2],
    dead: bool,
}

/// An in-memory connected pair of bus endpoints.
///
/// Every message is sealed and re-parsed on the way through, so both sides
/// always observe the canonical wire form.
pub struct PairBus {
    side: usize,
    next_cseq: u64,
    outstanding: Vec<u64>,
    shared: Rc<RefCell<Shared>>,
}

impl PairBus {
    pub fn pair() -> (PairBus, PairBus) {
        let shared = Rc::new(RefCell::new(Shared {
            queues: [VecDeque::new(), VecDeque::new()],
            dead: false,
        }));
        (
            PairBus {
                side: 0,
                next_cseq: 1,
                outstanding: Vec::new(),
                shared: Rc::clone(&shared),
            },
            PairBus {
                side: 1,
                next_cseq: 1,
                outstanding: Vec::new(),
                shared,
            },
        )
    }

    /// Pull the next message addressed to this endpoint.
    pub fn recv(&mut self) -> Option<Message> {
        self.shared.borrow_mut().queues[self.side].pop_front()
    }

    /// Sever the connection for both sides.
    pub fn hang_up(&mut self) {
        self.shared.borrow_mut().dead = true;
    }

    /// Cookies of requests still waiting for a reply.
    pub fn outstanding(&self) -> &[u64] {
        &self.outstanding
    }

    fn transmit(&mut self, msg: &mut Message) -> Result<(), CoreError> {
        if self.is_dead() {
            return Err(CoreError::new(ErrorKind::Terminated, "bus is dead"));
        }
        let raw = msg.seal()?.to_string();
        let parsed = Message::parse(&raw)?;
        log::trace!("bus[{}] -> {:?}", self.side, raw);
        self.shared.borrow_mut().queues[1 - self.side].push_back(parsed);
        Ok(())
    }
}

impl Bus for PairBus {
    fn send(&mut self, msg: &mut Message) -> Result<(), CoreError> {
        if msg.cseq().is_none() {
            self.next_cseq += 1;
            msg.set_cseq(self.next_cseq - 1);
        }
        self.transmit(msg)
    }

    fn call_async(&mut self, msg: &mut Message) -> Result<u64, CoreError> {
        let cookie = self.next_cseq;
        self.next_cseq += 1;
        msg.set_cseq(cookie);
        self.transmit(msg)?;
        self.outstanding.push(cookie);
        Ok(cookie)
    }

    fn cancel(&mut self, cookie: u64) {
        self.outstanding.retain(|&c| c != cookie);
    }

    fn is_dead(&self) -> bool {
        self.shared.borrow().dead
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::CODE_OK;

    #[test]
    fn requests_flow_in_fifo_order_with_sequential_cseq() {
        let (mut a, mut b) = PairBus::pair();
        let c1 = a.call_async(&mut Message::request("OPTIONS", "*")).unwrap();
        let c2 = a
            .call_async(&mut Message::request("GET_PARAMETER", "rtsp://x"))
            .unwrap();
        assert_eq!(c2, c1 + 1);
        assert_eq!(a.outstanding(), &[c1, c2]);

        let m1 = b.recv().unwrap();
        let m2 = b.recv().unwrap();
        assert_eq!(m1.method(), Some("OPTIONS"));
        assert_eq!(m1.cseq(), Some(c1));
        assert_eq!(m2.method(), Some("GET_PARAMETER"));
        assert_eq!(m2.cseq(), Some(c2));
        assert!(b.recv().is_none());
    }

    #[test]
    fn replies_mirror_the_request_cseq() {
        let (mut a, mut b) = PairBus::pair();
        let cookie = a.call_async(&mut Message::request("OPTIONS", "*")).unwrap();
        let req = b.recv().unwrap();

        let mut rep = Message::reply(CODE_OK, None);
        rep.set_cseq(req.cseq().unwrap());
        b.send(&mut rep).unwrap();

        let rep = a.recv().unwrap();
        assert!(rep.is_reply_code(CODE_OK));
        assert_eq!(rep.cseq(), Some(cookie));
        a.cancel(cookie);
        assert!(a.outstanding().is_empty());
    }

    #[test]
    fn hang_up_kills_both_sides() {
        let (mut a, mut b) = PairBus::pair();
        b.hang_up();
        assert!(a.is_dead());
        assert!(b.is_dead());
        let err = a
            .call_async(&mut Message::request("OPTIONS", "*"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Terminated);
    }

    #[test]
    fn transit_messages_are_canonical() {
        let (mut a, mut b) = PairBus::pair();
        let mut m = Message::request("SET_PARAMETER", "rtsp://x/wfd1.0");
        m.set_body("wfd_standby\r\n");
        a.call_async(&mut m).unwrap();

        let got = b.recv().unwrap();
        // the receiver sees the sealed form, content length applied
        assert!(got.raw().unwrap().contains("Content-Length: 13\r\n"));
        assert!(got.body_str().unwrap().starts_with("wfd_standby"));
    }
}
