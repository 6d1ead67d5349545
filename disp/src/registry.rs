//! Sink and session bookkeeping.

use miracle_rtsp::Bus;
use miracle_shared::{CoreError, ErrorKind, HTable};

use crate::session::Session;
use crate::sink::Sink;

/// Owns every sink (by label) and every running session (by id).
pub struct Registry<B: Bus> {
    sinks: HTable<String, Sink>,
    sessions: HTable<u32, Session<B>>,
    id_pool: u32,
}

impl<B: Bus> Default for Registry<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Bus> Registry<B> {
    pub fn new() -> Self {
        Self {
            sinks: HTable::new(),
            sessions: HTable::new(),
            id_pool: 0,
        }
    }

    pub fn n_sinks(&self) -> usize {
        self.sinks.len()
    }

    pub fn n_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Hand out a fresh non-zero session id, skipping ids still in use.
    pub fn alloc_session_id(&mut self) -> u32 {
        loop {
            self.id_pool = self.id_pool.wrapping_add(1);
            if self.id_pool != 0 && !self.sessions.contains_key(&self.id_pool) {
                return self.id_pool;
            }
        }
    }

    pub fn add_sink(&mut self, sink: Sink) {
        self.sinks.insert(sink.label().to_string(), sink);
    }

    pub fn remove_sink(&mut self, label: &str) -> Option<Sink> {
        self.sinks.remove(&label.to_string())
    }

    pub fn find_sink(&self, label: &str) -> Option<&Sink> {
        self.sinks.get(&label.to_string())
    }

    pub fn find_sink_mut(&mut self, label: &str) -> Option<&mut Sink> {
        self.sinks.get_mut(&label.to_string())
    }

    pub fn find_session(&self, id: u32) -> Option<&Session<B>> {
        self.sessions.get(&id)
    }

    pub fn find_session_mut(&mut self, id: u32) -> Option<&mut Session<B>> {
        self.sessions.get_mut(&id)
    }

    /// Bind a new out-session to the sink. One session per sink.
    pub fn create_session(
        &mut self,
        label: &str,
        make: impl FnOnce(u32) -> Session<B>,
    ) -> Result<u32, CoreError> {
        let Some(sink) = self.sinks.get(&label.to_string()) else {
            return Err(CoreError::invalid_arg(format!("no such sink: {label}")));
        };
        if sink.is_session_started() {
            return Err(CoreError::new(
                ErrorKind::AddressInUse,
                format!("sink {label} already has a session"),
            ));
        }
        let id = self.alloc_session_id();
        let session = make(id);
        self.sessions.insert(id, session);
        if let Some(sink) = self.sinks.get_mut(&label.to_string()) {
            sink.set_session(Some(id));
        }
        Ok(id)
    }

    /// A session ended: clear the sink's reference first, then drop the
    /// session itself.
    pub fn handle_session_ended(&mut self, id: u32) -> Option<Session<B>> {
        let label = self
            .sinks
            .iter()
            .find(|(_, sink)| sink.session() == Some(id))
            .map(|(label, _)| label.clone());
        if let Some(label) = label {
            if let Some(sink) = self.sinks.get_mut(&label) {
                sink.set_session(None);
            }
        }
        self.sessions.remove(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wfd::DeviceInfo;
    use miracle_rtsp::PairBus;

    fn sink(label: &str) -> Sink {
        Sink::new(
            label,
            "peer0",
            DeviceInfo {
                info: 0x0111,
                ctrl_port: 7236,
                max_throughput: 300,
            },
        )
        .unwrap()
    }

    #[test]
    fn one_session_per_sink() {
        let mut reg: Registry<PairBus> = Registry::new();
        reg.add_sink(sink("0x02aa"));

        let id = reg
            .create_session("0x02aa", |id| {
                let (bus, _peer) = PairBus::pair();
                Session::new_out(id, bus)
            })
            .unwrap();
        assert!(id > 0);
        assert!(reg.find_session(id).is_some());
        assert_eq!(reg.find_sink("0x02aa").unwrap().session(), Some(id));

        let err = reg
            .create_session("0x02aa", |id| {
                let (bus, _peer) = PairBus::pair();
                Session::new_out(id, bus)
            })
            .unwrap_err();
        assert_eq!(err.kind(), miracle_shared::ErrorKind::AddressInUse);
    }

    #[test]
    fn ended_session_clears_sink_before_removal() {
        let mut reg: Registry<PairBus> = Registry::new();
        reg.add_sink(sink("0x02aa"));
        let id = reg
            .create_session("0x02aa", |id| {
                let (bus, _peer) = PairBus::pair();
                Session::new_out(id, bus)
            })
            .unwrap();

        let session = reg.handle_session_ended(id);
        assert!(session.is_some());
        assert!(!reg.find_sink("0x02aa").unwrap().is_session_started());
        assert_eq!(reg.n_sessions(), 0);

        // a new session can start immediately
        assert!(reg
            .create_session("0x02aa", |id| {
                let (bus, _peer) = PairBus::pair();
                Session::new_out(id, bus)
            })
            .is_ok());
    }

    #[test]
    fn session_ids_are_unique_nonzero(){
        let mut reg: Registry<PairBus> = Registry::new();
        let mut seen = Vec::new();
        for _ in 0..32 {
            let id = reg.alloc_session_id();
            assert_ne!(id, 0);
            assert!(!seen.contains(&id));
            seen.push(id);
        }
    }
}
