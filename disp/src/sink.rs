//! A peer that can display for us.

use miracle_shared::{CoreError, ErrorKind};

use crate::wfd::DeviceInfo;

/// One WFD-capable peer. At most one session runs per sink; the registry
/// clears the reference before the session's final destroy round runs.
#[derive(Debug, Clone)]
pub struct Sink {
    /// Stable identifier derived from the peer MAC.
    label: String,
    /// Opaque handle of the underlying P2P peer.
    peer: String,
    dev_info: DeviceInfo,
    session: Option<u32>,
}

impl Sink {
    /// Only peers whose device-info subelement declares a sink role may
    /// become a `Sink`.
    pub fn new(label: &str, peer: &str, dev_info: DeviceInfo) -> Result<Self, CoreError> {
        if !dev_info.is_sink() {
            return Err(CoreError::new(
                ErrorKind::InvalidArgument,
                format!("peer {label} is not a WFD sink"),
            ));
        }
        Ok(Self {
            label: label.to_string(),
            peer: peer.to_string(),
            dev_info,
            session: None,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn dev_info(&self) -> &DeviceInfo {
        &self.dev_info
    }

    pub fn session(&self) -> Option<u32> {
        self.session
    }

    pub fn is_session_started(&self) -> bool {
        self.session.is_some()
    }

    pub(crate) fn set_session(&mut self, session: Option<u32>) {
        self.session = session;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink_info() -> DeviceInfo {
        DeviceInfo {
            info: 0x0111,
            ctrl_port: 7236,
            max_throughput: 300,
        }
    }

    #[test]
    fn only_sinks_are_accepted() {
        assert!(Sink::new("0x02aa", "peer0", sink_info()).is_ok());
        let source = DeviceInfo {
            info: 0x0110,
            ctrl_port: 0,
            max_throughput: 0,
        };
        assert!(Sink::new("0x02aa", "peer0", source).is_err());
    }

    #[test]
    fn session_slot() {
        let mut s = Sink::new("0x02aa", "peer0", sink_info()).unwrap();
        assert!(!s.is_session_started());
        s.set_session(Some(7));
        assert!(s.is_session_started());
        assert_eq!(s.session(), Some(7));
        s.set_session(None);
        assert!(!s.is_session_started());
    }
}
