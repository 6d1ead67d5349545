//! The Wi-Fi Display session state machine.
//!
//! A session drives one RTSP connection through the WFD handshake: the
//! capability exchange (M1–M4), the sink-triggered setup (M5–M7) and the
//! stream control verbs (M8/M9, M10–M16). Every message id maps to up to
//! three hooks (build a request, answer an incoming request, digest a
//! reply) plus a declarative rule naming the follow-up request and the
//! state to enter; the dispatcher applies the rule after the hook ran.

use std::time::SystemTime;

use miracle_rtsp::{Bus, Message, CODE_OK};
use miracle_shared::{CoreError, ErrorKind};

use crate::wfd::{supported_audio, AudioCodecs, VideoFormats, SUPPORTED_VIDEO};

/// RTSP exchanges of the WFD session establishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
#[repr(usize)]
pub enum RtspMessageId {
    Unknown = 0,
    /// OPTIONS, source asks sink.
    M1RequestSinkOptions = 1,
    /// OPTIONS, sink asks source.
    M2RequestSrcOptions = 2,
    /// GET_PARAMETER with a body.
    M3GetParameter = 3,
    /// SET_PARAMETER carrying the negotiated formats.
    M4SetParameter = 4,
    /// SET_PARAMETER wfd_trigger_method.
    M5Trigger = 5,
    M6Setup = 6,
    M7Play = 7,
    M8Teardown = 8,
    M9Pause = 9,
    /// SET_PARAMETER wfd_route.
    M10SetRoute = 10,
    /// SET_PARAMETER wfd_connector_type.
    M11SetConnectorType = 11,
    /// SET_PARAMETER wfd_standby.
    M12SetStandby = 12,
    /// SET_PARAMETER wfd_idr_request.
    M13RequestIdr = 13,
    /// SET_PARAMETER wfd_uibc_capability.
    M14EstablishUibc = 14,
    /// SET_PARAMETER wfd_uibc_setting.
    M15EnableUibc = 15,
    /// Bodyless GET_PARAMETER.
    M16Keepalive = 16,
}

const MESSAGE_NAMES: [&str; 17] = [
    "UNKNOWN",
    "OPTIONS(src->sink)",
    "OPTIONS(sink->src)",
    "GET_PARAM",
    "SET_PARAM",
    "SET_PARAM(wfd-trigger-method)",
    "SETUP",
    "PLAY",
    "TEARDOWN",
    "PAUSE",
    "SET_PARAM(wfd-route)",
    "SET_PARAM(wfd-connector-type)",
    "SET_PARAM(wfd-standby)",
    "SET_PARAM(wfd-idr-request)",
    "SET_PARAM(wfd-uibc-cability)",
    "SET_PARAM(wfd-uibc-setting)",
    "GET_PARAM(keepalive)",
];

impl std::fmt::Display for RtspMessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(MESSAGE_NAMES[*self as usize])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Null,
    Connecting,
    CapsExchanging,
    Established,
    SettingUp,
    Paused,
    Playing,
    TearingDown,
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionDir {
    Out,
    In,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamId {
    Primary = 0,
    Secondary = 1,
}

/// What a dispatch round tells the owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// Destroy the session on the next loop iteration (zero-delay task),
    /// so the current handler's stack unwinds first.
    DestroyScheduled,
    /// The session is gone; release the sink's reference.
    Ended,
}

/// Follow-up applied after a hook handled a request or reply.
#[derive(Debug, Clone, Copy, Default)]
struct Rule {
    next_request: Option<RtspMessageId>,
    new_state: Option<SessionState>,
    request_args: Option<&'static str>,
}

type RequestFn<B> = fn(&mut Session<B>, Option<&'static str>) -> Result<Message, CoreError>;
type HandleRequestFn<B> = fn(&mut Session<B>, &Message) -> Result<Message, CoreError>;
type HandleReplyFn<B> = fn(&mut Session<B>, &Message) -> Result<(), CoreError>;

struct DispatchEntry<B: Bus> {
    request: Option<RequestFn<B>>,
    handle_request: Option<HandleRequestFn<B>>,
    handle_reply: Option<HandleReplyFn<B>>,
    rule: Rule,
}

/// Display rectangle handed to the media pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rectangle {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisplayServerType {
    #[default]
    Unknown,
    X,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioServerType {
    #[default]
    Unknown,
    PulseAudio,
}

pub struct Session<B: Bus> {
    id: u32,
    dir: SessionDir,
    state: SessionState,
    last_request: RtspMessageId,
    bus: B,
    req_cookie: Option<u64>,
    destroy_pending: bool,
    table: Vec<DispatchEntry<B>>,
    rule_override: Option<Rule>,

    stream_id: StreamId,
    stream_url: Option<String>,
    local_addr: Option<String>,
    remote_addr: Option<String>,
    media_session: Option<String>,
    rtp_ports: [u16; 2],

    sink_vformats: Option<VideoFormats>,
    sink_acodecs: Option<AudioCodecs>,

    disp_type: DisplayServerType,
    disp_name: Option<String>,
    disp_params: Option<String>,
    disp_auth: Option<String>,
    disp_dimen: Rectangle,
    audio_type: AudioServerType,
    audio_dev_name: Option<String>,
    client_uid: Option<u32>,
    client_gid: Option<u32>,
    client_pid: Option<u32>,
    runtime_path: Option<String>,
}

impl<B: Bus> Session<B> {
    /// A source-side session over an already-connected bus.
    pub fn new_out(id: u32, bus: B) -> Self {
        Self {
            id,
            dir: SessionDir::Out,
            state: SessionState::Null,
            last_request: RtspMessageId::Unknown,
            bus,
            req_cookie: None,
            destroy_pending: false,
            table: out_dispatch_table(),
            rule_override: None,
            stream_id: StreamId::Primary,
            stream_url: None,
            local_addr: None,
            remote_addr: None,
            media_session: None,
            rtp_ports: [0, 0],
            sink_vformats: None,
            sink_acodecs: None,
            disp_type: DisplayServerType::Unknown,
            disp_name: None,
            disp_params: None,
            disp_auth: None,
            disp_dimen: Rectangle::default(),
            audio_type: AudioServerType::Unknown,
            audio_dev_name: None,
            client_uid: None,
            client_gid: None,
            client_pid: None,
            runtime_path: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn dir(&self) -> SessionDir {
        self.dir
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn last_request(&self) -> RtspMessageId {
        self.last_request
    }

    pub fn stream_url(&self) -> Option<&str> {
        self.stream_url.as_deref()
    }

    pub fn rtp_ports(&self) -> [u16; 2] {
        self.rtp_ports
    }

    pub fn is_established(&self) -> bool {
        self.state >= SessionState::Established && self.state < SessionState::TearingDown
    }

    pub fn set_local_addr(&mut self, addr: &str) {
        self.local_addr = Some(addr.to_string());
    }

    pub fn set_remote_addr(&mut self, addr: &str) {
        self.remote_addr = Some(addr.to_string());
    }

    pub fn set_stream_id(&mut self, id: StreamId) {
        self.stream_id = id;
    }

    pub fn set_disp_type(&mut self, t: DisplayServerType) {
        self.disp_type = t;
    }

    pub fn set_disp_name(&mut self, name: &str) {
        self.disp_name = Some(name.to_string());
    }

    pub fn set_disp_params(&mut self, params: Option<&str>) {
        self.disp_params = params.map(str::to_string);
    }

    pub fn set_disp_auth(&mut self, auth: &str) {
        self.disp_auth = Some(auth.to_string());
    }

    pub fn set_disp_dimension(&mut self, rect: Rectangle) -> Result<(), CoreError> {
        if rect.width == 0 || rect.height == 0 {
            return Err(CoreError::invalid_arg("empty display rectangle"));
        }
        self.disp_dimen = rect;
        Ok(())
    }

    pub fn disp_dimension(&self) -> Rectangle {
        self.disp_dimen
    }

    pub fn set_audio_type(&mut self, t: AudioServerType) {
        self.audio_type = t;
    }

    pub fn set_audio_dev_name(&mut self, name: &str) {
        self.audio_dev_name = Some(name.to_string());
    }

    pub fn set_client(&mut self, uid: u32, gid: u32, pid: u32) {
        self.client_uid = Some(uid);
        self.client_gid = Some(gid);
        self.client_pid = Some(pid);
    }

    pub fn set_runtime_path(&mut self, path: &str) {
        self.runtime_path = Some(path.to_string());
    }

    /// Build and store `rtsp://<local>/wfd1.0/streamid=<n>`, replacing any
    /// prior URL.
    pub fn gen_stream_url(&mut self, local_addr: &str, id: StreamId) -> &str {
        let url = format!("rtsp://{local_addr}/wfd1.0/streamid={}", id as u8);
        self.stream_url = Some(url);
        self.stream_url.as_deref().unwrap_or_default()
    }

    fn set_state(&mut self, state: SessionState, out: &mut Vec<SessionEvent>) {
        if state == self.state {
            return;
        }
        log::debug!("session {}: {:?} -> {:?}", self.id, self.state, state);
        self.state = state;
        out.push(SessionEvent::StateChanged(state));
    }

    fn schedule_destroy(&mut self, out: &mut Vec<SessionEvent>) {
        if !self.destroy_pending && self.state != SessionState::Destroyed {
            self.destroy_pending = true;
            out.push(SessionEvent::DestroyScheduled);
        }
    }

    /// Begin connecting. The owner reports the established connection with
    /// [`handle_connected`](Self::handle_connected).
    pub fn start(&mut self) -> Result<Vec<SessionEvent>, CoreError> {
        if self.state != SessionState::Null {
            return Err(CoreError::invalid_arg("session already started"));
        }
        let mut out = Vec::new();
        self.set_state(SessionState::Connecting, &mut out);
        Ok(out)
    }

    /// The RTSP connection is up: enter the capability exchange and fire M1.
    pub fn handle_connected(&mut self) -> Result<Vec<SessionEvent>, CoreError> {
        let mut out = Vec::new();
        self.set_state(SessionState::CapsExchanging, &mut out);
        self.send_request(RtspMessageId::M1RequestSinkOptions, None)?;
        Ok(out)
    }

    pub fn resume(&mut self) -> Result<Vec<SessionEvent>, CoreError> {
        if self.state == SessionState::Playing {
            return Ok(Vec::new());
        }
        if self.state != SessionState::Paused {
            return Err(CoreError::invalid_arg("session is not paused"));
        }
        self.send_request(RtspMessageId::M7Play, None)?;
        Ok(Vec::new())
    }

    pub fn pause(&mut self) -> Result<Vec<SessionEvent>, CoreError> {
        if self.state == SessionState::Paused {
            return Ok(Vec::new());
        }
        if self.state != SessionState::Playing {
            return Err(CoreError::invalid_arg("session is not playing"));
        }
        self.send_request(RtspMessageId::M9Pause, None)?;
        Ok(Vec::new())
    }

    pub fn teardown(&mut self) -> Result<Vec<SessionEvent>, CoreError> {
        if !self.is_established() {
            return Err(CoreError::invalid_arg("session is not established"));
        }
        let mut out = Vec::new();
        self.set_state(SessionState::TearingDown, &mut out);
        self.send_request(RtspMessageId::M8Teardown, None)?;
        Ok(out)
    }

    /// Tear everything down immediately. Idempotent.
    pub fn destroy(&mut self) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        if self.state == SessionState::Destroyed {
            return out;
        }
        self.set_state(SessionState::Destroyed, &mut out);
        out.push(SessionEvent::Ended);

        if let Some(cookie) = self.req_cookie.take() {
            self.bus.cancel(cookie);
        }
        self.destroy_pending = false;
        self.sink_vformats = None;
        self.sink_acodecs = None;
        self.stream_url = None;
        self.media_session = None;
        self.disp_auth = None;
        self.disp_name = None;
        self.audio_dev_name = None;
        self.runtime_path = None;
        self.rtp_ports = [0, 0];
        self.last_request = RtspMessageId::Unknown;
        out
    }

    /// Dispatch one bus delivery. `None` signals a wakeup without a
    /// message; with a dead bus that means the peer hung up.
    pub fn handle_message(&mut self, msg: Option<&Message>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        let Some(msg) = msg else {
            if self.bus.is_dead() {
                if self.state != SessionState::TearingDown {
                    log::info!("rtsp disconnected");
                }
                self.schedule_destroy(&mut out);
            }
            return out;
        };

        let result = if msg.is_reply() {
            self.dispatch_reply(msg, &mut out)
        } else {
            self.dispatch_request(msg, &mut out)
        };
        if let Err(e) = result {
            log::warn!("session {}: {e}", self.id);
            self.schedule_destroy(&mut out);
        }
        out
    }

    fn dispatch_request(
        &mut self,
        msg: &Message,
        out: &mut Vec<SessionEvent>,
    ) -> Result<(), CoreError> {
        let id = self.classify(msg);
        if id == RtspMessageId::Unknown {
            return Err(CoreError::protocol(format!(
                "unable to map request to id: {:?}",
                msg.raw()
            )));
        }
        log::trace!("received {} (M{}) request", id, id as usize);

        let Some(handler) = self.table[id as usize].handle_request else {
            return Err(CoreError::new(
                ErrorKind::InvalidArgument,
                format!("no handler for {id}"),
            ));
        };
        let mut reply = handler(self, msg)?;
        reply.append_header("Date", &http_date(SystemTime::now()));
        if let Some(cseq) = msg.cseq() {
            reply.set_cseq(cseq);
        }
        self.bus.send(&mut reply)?;
        log::trace!("sent {} (M{}) reply", id, id as usize);

        self.post_handle(id, out)
    }

    fn dispatch_reply(
        &mut self,
        msg: &Message,
        out: &mut Vec<SessionEvent>,
    ) -> Result<(), CoreError> {
        match self.req_cookie {
            Some(cookie) if msg.cseq() == Some(cookie) => {
                self.req_cookie = None;
            }
            _ => {
                log::debug!("dropping unmatched reply (CSeq {:?})", msg.cseq());
                return Ok(());
            }
        }
        if !msg.is_reply_code(CODE_OK) {
            return Err(CoreError::protocol(format!(
                "peer answered {} with {:?}",
                self.last_request,
                msg.code()
            )));
        }

        let id = self.last_request;
        log::trace!("received {} (M{}) reply", id, id as usize);
        if let Some(handler) = self.table[id as usize].handle_reply {
            handler(self, msg)?;
        }
        self.post_handle(id, out)
    }

    fn post_handle(
        &mut self,
        id: RtspMessageId,
        out: &mut Vec<SessionEvent>,
    ) -> Result<(), CoreError> {
        let rule = self
            .rule_override
            .take()
            .unwrap_or(self.table[id as usize].rule);
        if let Some(state) = rule.new_state {
            self.set_state(state, out);
        }
        if let Some(next) = rule.next_request {
            self.send_request(next, rule.request_args)?;
        }
        if self.destroy_pending {
            self.destroy_pending = false;
            self.schedule_destroy(out);
        }
        Ok(())
    }

    fn send_request(
        &mut self,
        id: RtspMessageId,
        args: Option<&'static str>,
    ) -> Result<(), CoreError> {
        let Some(builder) = self.table[id as usize].request else {
            return Err(CoreError::invalid_arg(format!("{id} is not requestable")));
        };
        let mut msg = builder(self, args)?;
        let cookie = self.bus.call_async(&mut msg)?;
        self.req_cookie = Some(cookie);
        self.last_request = id;
        log::trace!("sent {} (M{}) request", id, id as usize);
        Ok(())
    }

    /// Map an incoming request to its message id.
    fn classify(&self, m: &Message) -> RtspMessageId {
        use RtspMessageId::*;

        let Some(method) = m.method() else {
            return Unknown;
        };

        match method {
            "SET_PARAMETER" => {
                if m.body_has_param("wfd_trigger_method") {
                    return M5Trigger;
                }
                if m.body_has_param("wfd_route") {
                    return M10SetRoute;
                }
                if m.body_has_param("wfd_connector_type") {
                    return M11SetConnectorType;
                }
                if m.body_has_param("wfd_uibc_setting") {
                    return M15EnableUibc;
                }
                let body = m.body_str().unwrap_or_default();
                if body.starts_with("wfd_standby") {
                    return M12SetStandby;
                }
                if body.starts_with("wfd_idr_request") {
                    return M13RequestIdr;
                }
                if self.state == SessionState::CapsExchanging {
                    return M4SetParameter;
                }
                if m.body_has_param("wfd_uibc_capability") {
                    return M14EstablishUibc;
                }
                Unknown
            }
            "OPTIONS" => match (self.dir, m.is_reply()) {
                (SessionDir::Out, true) => M1RequestSinkOptions,
                (SessionDir::Out, false) => M2RequestSrcOptions,
                (SessionDir::In, true) => M2RequestSrcOptions,
                (SessionDir::In, false) => M1RequestSinkOptions,
            },
            "GET_PARAMETER" => {
                if m.body_len() > 0 {
                    M3GetParameter
                } else {
                    M16Keepalive
                }
            }
            "SETUP" => M6Setup,
            "PLAY" => M7Play,
            "TEARDOWN" => M8Teardown,
            "PAUSE" => M9Pause,
            _ => Unknown,
        }
    }

    fn remote_uri(&self) -> String {
        format!(
            "rtsp://{}/wfd1.0",
            self.remote_addr.as_deref().unwrap_or("localhost")
        )
    }

    #[doc(hidden)]
    pub fn classify_message(&self, m: &Message) -> RtspMessageId {
        self.classify(m)
    }

    #[doc(hidden)]
    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }
}

// --- per-id hooks, out (source) session ---

fn m1_request<B: Bus>(
    _s: &mut Session<B>,
    _args: Option<&'static str>,
) -> Result<Message, CoreError> {
    let mut m = Message::request("OPTIONS", "*");
    m.append_header("Require", "org.wfa.wfd1.0");
    Ok(m)
}

fn m1_handle_reply<B: Bus>(_s: &mut Session<B>, m: &Message) -> Result<(), CoreError> {
    if m.header("Public").is_none() {
        return Err(CoreError::protocol("OPTIONS reply without Public header"));
    }
    Ok(())
}

fn m2_handle_request<B: Bus>(_s: &mut Session<B>, _m: &Message) -> Result<Message, CoreError> {
    let mut rep = Message::reply(CODE_OK, None);
    rep.append_header(
        "Public",
        "org.wfa.wfd1.0, GET_PARAMETER, SET_PARAMETER, SETUP, PLAY, PAUSE, TEARDOWN",
    );
    Ok(rep)
}

fn m3_request<B: Bus>(
    s: &mut Session<B>,
    _args: Option<&'static str>,
) -> Result<Message, CoreError> {
    let mut m = Message::request("GET_PARAMETER", &s.remote_uri());
    m.set_body("wfd_video_formats\r\nwfd_audio_codecs\r\nwfd_client_rtp_ports\r\n");
    Ok(m)
}

fn m3_handle_reply<B: Bus>(s: &mut Session<B>, m: &Message) -> Result<(), CoreError> {
    let formats = m
        .body_param("wfd_video_formats")
        .ok_or_else(|| CoreError::protocol("sink reported no wfd_video_formats"))?;
    s.sink_vformats = Some(VideoFormats::from_param(formats)?);

    if let Some(codecs) = m.body_param("wfd_audio_codecs") {
        s.sink_acodecs = Some(AudioCodecs::from_param(codecs)?);
    }

    if let Some(ports) = m.body_param("wfd_client_rtp_ports") {
        // RTP/AVP/UDP;unicast <port0> <port1> mode=play
        let mut it = ports.split(' ').filter(|t| !t.is_empty()).skip(1);
        for slot in 0..2 {
            let Some(tok) = it.next() else { break };
            if let Ok(p) = miracle_shared::parse::atoi_u16(tok, 10) {
                s.rtp_ports[slot] = p;
            }
        }
    }
    Ok(())
}

fn m4_request<B: Bus>(
    s: &mut Session<B>,
    _args: Option<&'static str>,
) -> Result<Message, CoreError> {
    let local = s
        .local_addr
        .clone()
        .ok_or_else(|| CoreError::invalid_arg("no local address for presentation URL"))?;
    let stream_id = s.stream_id;
    let url = s.gen_stream_url(&local, stream_id).to_string();

    let vformats = s
        .sink_vformats
        .as_ref()
        .map(|sink| sink.negotiate(&SUPPORTED_VIDEO))
        .ok_or_else(|| CoreError::invalid_arg("no sink video formats negotiated"))?;
    let acodecs = s
        .sink_acodecs
        .as_ref()
        .map(|sink| sink.negotiate(&supported_audio()))
        .unwrap_or_default();

    let mut body = String::new();
    body.push_str(&format!("wfd_video_formats: {}\r\n", vformats.to_param()));
    if !acodecs.codecs.is_empty() {
        body.push_str(&format!("wfd_audio_codecs: {}\r\n", acodecs.to_param()));
    }
    body.push_str(&format!("wfd_presentation_URL: {url} none\r\n"));
    body.push_str(&format!(
        "wfd_client_rtp_ports: RTP/AVP/UDP;unicast {} {} mode=play\r\n",
        s.rtp_ports[0], s.rtp_ports[1]
    ));

    let mut m = Message::request("SET_PARAMETER", &s.remote_uri());
    m.set_body(&body);
    Ok(m)
}

fn m5_handle_request<B: Bus>(s: &mut Session<B>, m: &Message) -> Result<Message, CoreError> {
    let trigger = m
        .body_param("wfd_trigger_method")
        .ok_or_else(|| CoreError::protocol("trigger without method"))?;
    let rule = match trigger {
        "SETUP" => Rule {
            next_request: Some(RtspMessageId::M6Setup),
            new_state: Some(SessionState::SettingUp),
            request_args: None,
        },
        "PLAY" => Rule {
            next_request: Some(RtspMessageId::M7Play),
            new_state: None,
            request_args: None,
        },
        "PAUSE" => Rule {
            next_request: Some(RtspMessageId::M9Pause),
            new_state: None,
            request_args: None,
        },
        "TEARDOWN" => Rule {
            next_request: Some(RtspMessageId::M8Teardown),
            new_state: Some(SessionState::TearingDown),
            request_args: None,
        },
        other => {
            return Err(CoreError::protocol(format!(
                "unknown trigger method: {other}"
            )))
        }
    };
    s.rule_override = Some(rule);
    Ok(Message::reply(CODE_OK, None))
}

fn m6_request<B: Bus>(
    s: &mut Session<B>,
    _args: Option<&'static str>,
) -> Result<Message, CoreError> {
    let local = s
        .local_addr
        .clone()
        .ok_or_else(|| CoreError::invalid_arg("no local address for stream URL"))?;
    let stream_id = s.stream_id;
    let url = s.gen_stream_url(&local, stream_id).to_string();

    let mut m = Message::request("SETUP", &url);
    let transport = if s.rtp_ports[1] != 0 {
        format!(
            "RTP/AVP/UDP;unicast;client_port={}-{}",
            s.rtp_ports[0], s.rtp_ports[1]
        )
    } else {
        format!("RTP/AVP/UDP;unicast;client_port={}", s.rtp_ports[0])
    };
    m.append_header("Transport", &transport);
    Ok(m)
}

fn m6_handle_reply<B: Bus>(s: &mut Session<B>, m: &Message) -> Result<(), CoreError> {
    let session = m
        .header("Session")
        .ok_or_else(|| CoreError::protocol("SETUP reply without Session header"))?;
    // "<id>;timeout=<secs>"
    let id = session.split(';').next().unwrap_or(session);
    s.media_session = Some(id.trim().to_string());
    Ok(())
}

fn m7_request<B: Bus>(
    s: &mut Session<B>,
    _args: Option<&'static str>,
) -> Result<Message, CoreError> {
    let url = s
        .stream_url
        .clone()
        .ok_or_else(|| CoreError::new(ErrorKind::NotConnected, "no stream URL yet"))?;
    let mut m = Message::request("PLAY", &url);
    if let Some(session) = &s.media_session {
        m.append_header("Session", session);
    }
    m.append_header("Range", "npt=now-");
    Ok(m)
}

fn m8_request<B: Bus>(
    s: &mut Session<B>,
    _args: Option<&'static str>,
) -> Result<Message, CoreError> {
    let url = s
        .stream_url
        .clone()
        .unwrap_or_else(|| s.remote_uri());
    let mut m = Message::request("TEARDOWN", &url);
    if let Some(session) = &s.media_session {
        m.append_header("Session", session);
    }
    Ok(m)
}

fn m8_handle_reply<B: Bus>(s: &mut Session<B>, _m: &Message) -> Result<(), CoreError> {
    // destruction is deferred so the dispatch stack unwinds first
    s.destroy_pending = true;
    Ok(())
}

fn m9_request<B: Bus>(
    s: &mut Session<B>,
    _args: Option<&'static str>,
) -> Result<Message, CoreError> {
    let url = s
        .stream_url
        .clone()
        .ok_or_else(|| CoreError::new(ErrorKind::NotConnected, "no stream URL yet"))?;
    let mut m = Message::request("PAUSE", &url);
    if let Some(session) = &s.media_session {
        m.append_header("Session", session);
    }
    Ok(m)
}

fn plain_ok<B: Bus>(_s: &mut Session<B>, _m: &Message) -> Result<Message, CoreError> {
    Ok(Message::reply(CODE_OK, None))
}

fn m16_handle_request<B: Bus>(_s: &mut Session<B>, _m: &Message) -> Result<Message, CoreError> {
    Ok(Message::reply(CODE_OK, None))
}

fn out_dispatch_table<B: Bus>() -> Vec<DispatchEntry<B>> {
    use RtspMessageId::*;
    let mut table: Vec<DispatchEntry<B>> = (0..17)
        .map(|_| DispatchEntry {
            request: None,
            handle_request: None,
            handle_reply: None,
            rule: Rule::default(),
        })
        .collect();

    table[M1RequestSinkOptions as usize] = DispatchEntry {
        request: Some(m1_request),
        handle_request: None,
        handle_reply: Some(m1_handle_reply),
        rule: Rule {
            next_request: Some(M3GetParameter),
            new_state: None,
            request_args: None,
        },
    };
    table[M2RequestSrcOptions as usize] = DispatchEntry {
        request: None,
        handle_request: Some(m2_handle_request),
        handle_reply: None,
        rule: Rule::default(),
    };
    table[M3GetParameter as usize] = DispatchEntry {
        request: Some(m3_request),
        handle_request: None,
        handle_reply: Some(m3_handle_reply),
        rule: Rule {
            next_request: Some(M4SetParameter),
            new_state: Some(SessionState::Established),
            request_args: None,
        },
    };
    table[M4SetParameter as usize] = DispatchEntry {
        request: Some(m4_request),
        handle_request: None,
        handle_reply: None,
        rule: Rule::default(),
    };
    table[M5Trigger as usize] = DispatchEntry {
        request: None,
        handle_request: Some(m5_handle_request),
        handle_reply: None,
        // the trigger handler overrides the rule per method
        rule: Rule::default(),
    };
    table[M6Setup as usize] = DispatchEntry {
        request: Some(m6_request),
        handle_request: None,
        handle_reply: Some(m6_handle_reply),
        rule: Rule {
            next_request: Some(M7Play),
            new_state: None,
            request_args: None,
        },
    };
    table[M7Play as usize] = DispatchEntry {
        request: Some(m7_request),
        handle_request: None,
        handle_reply: None,
        rule: Rule {
            next_request: None,
            new_state: Some(SessionState::Playing),
            request_args: None,
        },
    };
    table[M8Teardown as usize] = DispatchEntry {
        request: Some(m8_request),
        handle_request: None,
        handle_reply: Some(m8_handle_reply),
        rule: Rule {
            next_request: None,
            new_state: Some(SessionState::TearingDown),
            request_args: None,
        },
    };
    table[M9Pause as usize] = DispatchEntry {
        request: Some(m9_request),
        handle_request: None,
        handle_reply: None,
        rule: Rule {
            next_request: None,
            new_state: Some(SessionState::Paused),
            request_args: None,
        },
    };
    for id in [
        M10SetRoute,
        M11SetConnectorType,
        M12SetStandby,
        M13RequestIdr,
        M14EstablishUibc,
        M15EnableUibc,
    ] {
        table[id as usize] = DispatchEntry {
            request: None,
            handle_request: Some(plain_ok),
            handle_reply: None,
            rule: Rule::default(),
        };
    }
    table[M16Keepalive as usize] = DispatchEntry {
        request: None,
        handle_request: Some(m16_handle_request),
        handle_reply: None,
        rule: Rule::default(),
    };
    table
}

// --- Date header ---

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
const MONTH_NAMES: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// RFC 1123 date in GMT, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn http_date(t: SystemTime) -> String {
    let secs = t
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;
    let (hour, minute, second) = (rem / 3600, rem % 3600 / 60, rem % 60);
    let weekday = ((days + 4) % 7) as usize; // 1970-01-01 was a Thursday

    // civil-from-days
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);

    format!(
        "{}, {:02} {} {} {:02}:{:02}:{:02} GMT",
        DAY_NAMES[weekday],
        day,
        MONTH_NAMES[(month - 1) as usize],
        year,
        hour,
        minute,
        second
    )
}
