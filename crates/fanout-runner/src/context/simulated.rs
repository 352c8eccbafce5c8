//! In-process execution context.
//!
//! Pages join rooms on a shared [`SimSignaling`] hub using the same
//! messages the real signaling and relay servers speak, and each page runs a
//! small event loop that answers offers and consumes new producers the way
//! the browser client would. Stats reports come back in the native shape of
//! each architecture, shaped by the scenario's loss and bandwidth cap:
//!
//! - mesh presenter: one connection per viewer with candidate-pair,
//!   remote-inbound-rtp and outbound-rtp entries
//! - relay presenter: one send transport towards the relay
//! - viewers: one receiving connection with inbound-rtp counters

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use fanout_common::ids;
use fanout_common::models::{Architecture, BandwidthCap, Role, Scenario};
use fanout_common::protocol::{MediaKind, SignalMessage, TransportDirection};
use rand::Rng;
use serde_json::{Value, json};
use tokio::time::Instant;

use super::DriverError;
use crate::config::EntryPoint;

/// How often a page's event loop drains its signaling mailbox.
const EVENT_LOOP_TICK: Duration = Duration::from_millis(20);
/// RTCStats timing fields report round-trip times after the first RTCP
/// exchange, roughly a second into the call.
const RTT_WARMUP: Duration = Duration::from_secs(1);
const PACKET_BYTES: f64 = 1200.0;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Fault profile ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct SimProfile {
    /// Time between the connect click and the connection signal turning true.
    pub connect_delay: Duration,
    /// Viewer indices that never finish connecting.
    pub stall_viewers: Vec<u32>,
    /// Viewer indices whose page crashes on the connect click. The crash
    /// surfaces as a panic in whoever drives the page.
    pub crash_viewers: Vec<u32>,
}

impl Default for SimProfile {
    fn default() -> Self {
        Self {
            connect_delay: Duration::from_millis(200),
            stall_viewers: Vec::new(),
            crash_viewers: Vec::new(),
        }
    }
}

// ── Signaling hub ───────────────────────────────────────────────────

#[derive(Debug, Default)]
struct SimRoom {
    members: Vec<(String, Role)>,
    /// `(producer_id, peer_id)`
    producers: Vec<(String, String)>,
    /// Per-peer queue of `(from, message)`.
    mailboxes: HashMap<String, VecDeque<(String, SignalMessage)>>,
}

impl SimRoom {
    fn deliver(&mut self, to: &str, from: &str, msg: SignalMessage) {
        self.mailboxes
            .entry(to.to_string())
            .or_default()
            .push_back((from.to_string(), msg));
    }

    fn broadcast(&mut self, from: &str, msg: SignalMessage) {
        let others: Vec<String> = self
            .members
            .iter()
            .map(|(p, _)| p.clone())
            .filter(|p| p != from)
            .collect();
        for peer in others {
            self.deliver(&peer, from, msg.clone());
        }
    }
}

#[derive(Debug, Default)]
struct HubState {
    rooms: HashMap<String, SimRoom>,
    peer_rooms: HashMap<String, String>,
}

impl HubState {
    fn room_of(&mut self, peer: &str) -> Result<&mut SimRoom, String> {
        let room_id = self
            .peer_rooms
            .get(peer)
            .ok_or_else(|| format!("peer {peer} has not joined a room"))?;
        self.rooms
            .get_mut(room_id)
            .ok_or_else(|| format!("unknown room {room_id}"))
    }

    /// Returns the members present before `peer` joined.
    fn join(&mut self, peer: &str, room_id: &str, role: Role) -> Result<Vec<(String, Role)>, String> {
        if let Some(current) = self.peer_rooms.get(peer) {
            return Err(format!("peer {peer} already joined {current}"));
        }
        let room = self.rooms.entry(room_id.to_string()).or_default();
        if role == Role::Presenter && room.members.iter().any(|(_, r)| *r == Role::Presenter) {
            return Err(format!("room {room_id} already has a presenter"));
        }
        let existing = room.members.clone();
        room.members.push((peer.to_string(), role));
        room.broadcast(
            peer,
            SignalMessage::PeerJoined {
                peer_id: peer.to_string(),
                role,
            },
        );
        self.peer_rooms.insert(peer.to_string(), room_id.to_string());
        Ok(existing)
    }
}

/// In-memory stand-in for the signaling server and the relay. It routes
/// messages and announces producers; it does not model transports.
#[derive(Clone, Default)]
pub struct SimSignaling {
    state: Arc<Mutex<HubState>>,
}

impl SimSignaling {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `msg` from `from`. Returns the direct replies to the sender;
    /// notifications for other peers land in their mailboxes.
    pub fn send(&self, from: &str, msg: SignalMessage) -> Result<Vec<SignalMessage>, String> {
        let mut hub = lock(&self.state);
        match msg {
            SignalMessage::JoinRoom { room_id, role, .. } => Ok(hub
                .join(from, &room_id, role)?
                .into_iter()
                .map(|(peer_id, role)| SignalMessage::PeerJoined { peer_id, role })
                .collect()),
            SignalMessage::JoinSfuRoom { room_id, role } => {
                hub.join(from, &room_id, role)?;
                let room = hub.room_of(from)?;
                let mut replies = vec![SignalMessage::RouterRtpCapabilities {
                    rtp_capabilities: json!({"codecs": [{"mimeType": "video/VP8", "clockRate": 90000}]}),
                }];
                replies.extend(room.producers.iter().map(|(producer_id, peer_id)| {
                    SignalMessage::NewProducer {
                        producer_id: producer_id.clone(),
                        peer_id: peer_id.clone(),
                    }
                }));
                Ok(replies)
            }
            SignalMessage::Offer { .. }
            | SignalMessage::Answer { .. }
            | SignalMessage::IceCandidate { .. } => {
                let to = msg.addressed_to().unwrap_or_default().to_string();
                let room = hub.room_of(from)?;
                if !room.members.iter().any(|(p, _)| *p == to) {
                    return Err(format!("peer {to} is not in the room"));
                }
                room.deliver(&to, from, msg);
                Ok(Vec::new())
            }
            SignalMessage::Produce { transport_id, kind, .. } => {
                let room = hub.room_of(from)?;
                let producer_id = format!("{transport_id}/{}", media_kind_name(kind));
                room.producers.push((producer_id.clone(), from.to_string()));
                room.broadcast(
                    from,
                    SignalMessage::NewProducer {
                        producer_id,
                        peer_id: from.to_string(),
                    },
                );
                Ok(Vec::new())
            }
            SignalMessage::Consume { producer_id, .. } => {
                let room = hub.room_of(from)?;
                if !room.producers.iter().any(|(p, _)| *p == producer_id) {
                    return Err(format!("unknown producer {producer_id}"));
                }
                Ok(Vec::new())
            }
            SignalMessage::CreateWebrtcTransport { .. }
            | SignalMessage::ConnectWebrtcTransport { .. }
            | SignalMessage::ResumeConsumer { .. } => {
                hub.room_of(from)?;
                Ok(Vec::new())
            }
            other => Err(format!("{} is sent by the server, not a client", other.kind())),
        }
    }

    /// Take everything queued for `peer`.
    pub fn drain(&self, peer: &str) -> Vec<(String, SignalMessage)> {
        let mut hub = lock(&self.state);
        match hub.room_of(peer) {
            Ok(room) => room
                .mailboxes
                .get_mut(peer)
                .map(|q| q.drain(..).collect())
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    /// Remove `peer` and its producers; remaining members get `peer-left`.
    pub fn leave(&self, peer: &str) {
        let mut hub = lock(&self.state);
        let Some(room_id) = hub.peer_rooms.remove(peer) else {
            return;
        };
        let Some(room) = hub.rooms.get_mut(&room_id) else {
            return;
        };
        room.members.retain(|(p, _)| p != peer);
        room.producers.retain(|(_, owner)| owner != peer);
        room.mailboxes.remove(peer);
        room.broadcast(
            peer,
            SignalMessage::PeerLeft {
                peer_id: peer.to_string(),
            },
        );
        if room.members.is_empty() {
            hub.rooms.remove(&room_id);
        }
    }

    pub fn member_count(&self, room_id: &str) -> usize {
        lock(&self.state)
            .rooms
            .get(room_id)
            .map(|r| r.members.len())
            .unwrap_or(0)
    }
}

fn media_kind_name(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Audio => "audio",
        MediaKind::Video => "video",
    }
}

fn consumer_id(transport_id: &str, producer_id: &str) -> String {
    format!("{transport_id}:{producer_id}")
}

// ── Launcher ────────────────────────────────────────────────────────

/// Clones share the same hub and close counter.
#[derive(Clone)]
pub struct SimLauncher {
    hub: SimSignaling,
    profile: SimProfile,
    entry: Arc<EntryPoint>,
    closes: Arc<AtomicUsize>,
}

impl SimLauncher {
    pub fn new(profile: SimProfile, entry: EntryPoint) -> Self {
        Self {
            hub: SimSignaling::new(),
            profile,
            entry: Arc::new(entry),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Contexts released through an explicit close, as opposed to being
    /// dropped while still open.
    pub fn explicit_closes(&self) -> usize {
        self.closes.load(Ordering::Relaxed)
    }

    /// Create a page and start its event loop. Must be called within a
    /// tokio runtime.
    pub fn launch(&self, scenario: &Scenario) -> SimContext {
        let page = Arc::new(SimPage {
            peer_id: ids::session_id(),
            hub: self.hub.clone(),
            profile: self.profile.clone(),
            entry: self.entry.clone(),
            conditions: Conditions::from(scenario),
            state: Mutex::new(PageState::default()),
            closes: self.closes.clone(),
        });
        let event_loop = tokio::spawn(run_event_loop(Arc::downgrade(&page)));
        SimContext { page, event_loop }
    }
}

async fn run_event_loop(page: Weak<SimPage>) {
    let mut tick = tokio::time::interval(EVENT_LOOP_TICK);
    loop {
        tick.tick().await;
        let Some(page) = page.upgrade() else {
            return;
        };
        if !page.pump() {
            return;
        }
    }
}

// ── Page ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Conditions {
    loss_percent: f64,
    cap: BandwidthCap,
}

impl From<&Scenario> for Conditions {
    fn from(s: &Scenario) -> Self {
        Self {
            loss_percent: s.loss_rate_percent() as f64,
            cap: s.bandwidth_cap(),
        }
    }
}

#[derive(Debug, Clone)]
struct PageParams {
    mode: Architecture,
    role: Role,
    room: String,
    index: Option<u32>,
}

#[derive(Debug, Default)]
struct PageState {
    media: bool,
    params: Option<PageParams>,
    joined: bool,
    stalled: bool,
    /// Mesh: presenter holds answered viewers, viewer holds the presenter.
    peers: BTreeSet<String>,
    produced: bool,
    consumers: BTreeSet<String>,
    connect_at: Option<Instant>,
    connected_since: Option<Instant>,
    closed: bool,
}

struct SimPage {
    peer_id: String,
    hub: SimSignaling,
    profile: SimProfile,
    entry: Arc<EntryPoint>,
    conditions: Conditions,
    state: Mutex<PageState>,
    closes: Arc<AtomicUsize>,
}

impl SimPage {
    /// One event-loop turn. Returns `false` once the page is closed.
    fn pump(&self) -> bool {
        let mut state = lock(&self.state);
        if state.closed {
            return false;
        }
        for (from, msg) in self.hub.drain(&self.peer_id) {
            self.on_message(&mut state, &from, msg);
        }
        true
    }

    fn on_message(&self, state: &mut PageState, from: &str, msg: SignalMessage) {
        let Some(params) = state.params.clone() else {
            return;
        };
        match msg {
            SignalMessage::PeerJoined {
                peer_id,
                role: Role::Viewer,
            } if params.role == Role::Presenter && params.mode == Architecture::Mesh => {
                let offer = SignalMessage::Offer {
                    to: peer_id.clone(),
                    room_id: params.room.clone(),
                    sdp: format!("v=0\r\no=- {} 1 IN IP4 127.0.0.1\r\n", self.peer_id),
                };
                if let Err(e) = self.hub.send(&self.peer_id, offer) {
                    tracing::trace!(peer = %peer_id, error = %e, "offer not delivered");
                }
            }
            SignalMessage::Offer { .. } if params.role == Role::Viewer => {
                let answer = SignalMessage::Answer {
                    to: from.to_string(),
                    room_id: params.room.clone(),
                    sdp: format!("v=0\r\no=- {} 1 IN IP4 127.0.0.1\r\n", self.peer_id),
                };
                if self.hub.send(&self.peer_id, answer).is_ok() {
                    state.peers.insert(from.to_string());
                }
            }
            SignalMessage::Answer { .. } if params.role == Role::Presenter => {
                state.peers.insert(from.to_string());
            }
            SignalMessage::NewProducer { producer_id, .. } if params.role == Role::Viewer => {
                self.consume(state, &producer_id);
            }
            SignalMessage::PeerLeft { peer_id } => {
                state.peers.remove(&peer_id);
            }
            _ => {}
        }
    }

    fn transport_id(&self, direction: TransportDirection) -> String {
        match direction {
            TransportDirection::Send => format!("{}-send", self.peer_id),
            TransportDirection::Recv => format!("{}-recv", self.peer_id),
        }
    }

    fn consume(&self, state: &mut PageState, producer_id: &str) {
        let transport_id = self.transport_id(TransportDirection::Recv);
        let consumed = self
            .hub
            .send(
                &self.peer_id,
                SignalMessage::Consume {
                    transport_id: transport_id.clone(),
                    producer_id: producer_id.to_string(),
                    rtp_capabilities: json!({}),
                },
            )
            .and_then(|_| {
                self.hub.send(
                    &self.peer_id,
                    SignalMessage::ResumeConsumer {
                        consumer_id: consumer_id(&transport_id, producer_id),
                    },
                )
            });
        match consumed {
            Ok(_) => {
                state.consumers.insert(producer_id.to_string());
            }
            Err(e) => tracing::trace!(producer = producer_id, error = %e, "consume failed"),
        }
    }

    fn connect(&self, state: &mut PageState, params: &PageParams) -> Result<(), String> {
        let replies = match params.mode {
            Architecture::Mesh => self.hub.send(
                &self.peer_id,
                SignalMessage::JoinRoom {
                    room_id: params.room.clone(),
                    role: params.role,
                    mode: params.mode,
                },
            )?,
            Architecture::Relay => {
                let replies = self.hub.send(
                    &self.peer_id,
                    SignalMessage::JoinSfuRoom {
                        room_id: params.room.clone(),
                        role: params.role,
                    },
                )?;
                let direction = match params.role {
                    Role::Presenter => TransportDirection::Send,
                    Role::Viewer => TransportDirection::Recv,
                };
                let transport_id = self.transport_id(direction);
                self.hub.send(
                    &self.peer_id,
                    SignalMessage::CreateWebrtcTransport {
                        room_id: params.room.clone(),
                        transport_id: transport_id.clone(),
                        direction,
                    },
                )?;
                self.hub.send(
                    &self.peer_id,
                    SignalMessage::ConnectWebrtcTransport {
                        transport_id: transport_id.clone(),
                        dtls_parameters: json!({"role": "auto"}),
                    },
                )?;
                if params.role == Role::Presenter {
                    self.hub.send(
                        &self.peer_id,
                        SignalMessage::Produce {
                            transport_id,
                            kind: MediaKind::Video,
                            rtp_parameters: json!({"codecs": [{"mimeType": "video/VP8"}]}),
                        },
                    )?;
                    state.produced = true;
                }
                replies
            }
        };
        state.joined = true;
        for msg in replies {
            self.on_message(state, "", msg);
        }
        Ok(())
    }

    fn is_connected(&self, state: &mut PageState) -> bool {
        if state.connected_since.is_some() {
            return true;
        }
        let Some(params) = state.params.as_ref() else {
            return false;
        };
        let Some(at) = state.connect_at else {
            return false;
        };
        if state.stalled || Instant::now() < at {
            return false;
        }
        let ready = match (params.mode, params.role) {
            (Architecture::Mesh, Role::Presenter) => state.joined,
            (Architecture::Mesh, Role::Viewer) => !state.peers.is_empty(),
            (Architecture::Relay, Role::Presenter) => state.produced,
            (Architecture::Relay, Role::Viewer) => !state.consumers.is_empty(),
        };
        if ready {
            state.connected_since = Some(Instant::now());
        }
        ready
    }

    fn stats(&self, state: &mut PageState) -> Value {
        let connected = self.is_connected(state);
        let (Some(params), Some(since), true) =
            (state.params.clone(), state.connected_since, connected)
        else {
            return json!({ "connections": [] });
        };
        let elapsed = since.elapsed();
        let mut rng = rand::rng();
        let viewers = self
            .hub
            .member_count(&params.room)
            .saturating_sub(1)
            .max(1);
        let load = Load::new(self.conditions, params.mode, viewers);

        let connections: Vec<Value> = match (params.mode, params.role) {
            (Architecture::Mesh, Role::Presenter) => state
                .peers
                .iter()
                .map(|peer| {
                    let rtt = load.mesh_rtt_ms(&mut rng) / 1000.0;
                    let jitter = load.jitter_ms(&mut rng) / 1000.0;
                    let packets = load.packets_per_connection(elapsed);
                    let mut pair = json!({"type": "candidate-pair", "state": "succeeded", "nominated": true});
                    let mut remote = json!({
                        "type": "remote-inbound-rtp",
                        "jitter": jitter,
                        "packetsLost": (packets * load.loss_fraction()) as i64,
                    });
                    if elapsed >= RTT_WARMUP {
                        pair["currentRoundTripTime"] = json!(rtt);
                        remote["roundTripTime"] = json!(rtt);
                    }
                    json!({
                        "id": format!("pc-{peer}"),
                        "stats": [
                            pair,
                            remote,
                            {"type": "outbound-rtp", "bytesSent": (packets * PACKET_BYTES) as u64},
                        ],
                    })
                })
                .collect(),
            (Architecture::Relay, Role::Presenter) => {
                let packets = load.packets_per_connection(elapsed);
                let mut pair = json!({"type": "candidate-pair", "state": "succeeded", "nominated": true});
                let mut remote = json!({"type": "remote-inbound-rtp", "packetsLost": (packets * load.loss_fraction()) as i64});
                if elapsed >= RTT_WARMUP {
                    let rtt = load.relay_hop_rtt_ms(&mut rng) / 1000.0;
                    pair["currentRoundTripTime"] = json!(rtt);
                    remote["roundTripTime"] = json!(rtt);
                }
                vec![json!({
                    "id": self.transport_id(TransportDirection::Send),
                    "stats": [
                        pair,
                        remote,
                        {"type": "outbound-rtp", "bytesSent": (packets * PACKET_BYTES) as u64},
                    ],
                })]
            }
            (_, Role::Viewer) => {
                let packets = load.packets_per_connection(elapsed);
                vec![json!({
                    "id": format!("recv-{}", self.peer_id),
                    "stats": [{
                        "type": "inbound-rtp",
                        "jitter": load.jitter_ms(&mut rng) / 1000.0,
                        "packetsLost": (packets * load.loss_fraction()) as i64,
                    }],
                })]
            }
        };
        json!({ "connections": connections })
    }
}

/// Synthetic network load for one page. RTT grows with viewer count and
/// loss; jitter grows with loss, fan-out and a tighter cap.
struct Load {
    mode: Architecture,
    loss_percent: f64,
    cap: BandwidthCap,
    streams: usize,
}

impl Load {
    fn new(conditions: Conditions, mode: Architecture, streams: usize) -> Self {
        Self {
            mode,
            loss_percent: conditions.loss_percent,
            cap: conditions.cap,
            streams,
        }
    }

    fn loss_fraction(&self) -> f64 {
        self.loss_percent / 100.0
    }

    fn cap_mbit(&self) -> Option<f64> {
        self.cap.rate_kbit().map(|k| k as f64 / 1000.0)
    }

    /// Per-connection send rate: each stream wants 80 % of the cap, and mesh
    /// egress across all streams cannot exceed the cap.
    fn rate_bps_per_connection(&self) -> f64 {
        let (stream_mbit, ceiling) = match self.cap_mbit() {
            Some(cap) => (cap * 0.8, cap),
            None => (2.5, f64::INFINITY),
        };
        let streams = match self.mode {
            Architecture::Mesh => self.streams as f64,
            Architecture::Relay => 1.0,
        };
        (stream_mbit * streams).min(ceiling) / streams * 1_000_000.0
    }

    fn packets_per_connection(&self, elapsed: Duration) -> f64 {
        (self.rate_bps_per_connection() / 8.0 / PACKET_BYTES * elapsed.as_secs_f64()).floor()
    }

    fn mesh_rtt_ms(&self, rng: &mut impl Rng) -> f64 {
        let base = 25.0 + self.streams as f64 * 2.0 + self.loss_percent * 15.0;
        (base + rng.random_range(-3.0..3.0)).max(1.0)
    }

    fn relay_hop_rtt_ms(&self, rng: &mut impl Rng) -> f64 {
        let base = 35.0 + self.streams as f64 + self.loss_percent * 15.0;
        (base + rng.random_range(-3.0..3.0)).max(1.0)
    }

    fn jitter_ms(&self, rng: &mut impl Rng) -> f64 {
        let per_viewer = match self.mode {
            Architecture::Mesh => 0.15,
            Architecture::Relay => 0.08,
        };
        let bandwidth = self.cap_mbit().map(|c| (6.0 / c).max(0.5)).unwrap_or(1.0);
        let j = 6.0
            * (1.0 + self.loss_fraction() * 1.5)
            * (1.0 + (self.streams as f64 - 1.0) * per_viewer)
            * bandwidth
            * rng.random_range(0.8..1.2);
        j.max(1.0)
    }
}

fn parse_page_url(url: &str) -> Result<PageParams, DriverError> {
    let reject = |message: String| DriverError::Rejected {
        command: "navigate",
        message,
    };
    let query = url
        .split_once('?')
        .map(|(_, q)| q)
        .ok_or_else(|| reject(format!("{url} has no query string")))?;

    let mut mode = None;
    let mut role = None;
    let mut room = None;
    let mut index = None;
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        match key {
            "mode" => mode = Some(value.parse::<Architecture>().map_err(|e| reject(e.to_string()))?),
            "role" => role = Some(value.parse::<Role>().map_err(|e| reject(e.to_string()))?),
            "room" => room = Some(value.to_string()),
            "index" => index = value.parse().ok(),
            _ => {}
        }
    }
    Ok(PageParams {
        mode: mode.ok_or_else(|| reject("missing mode".into()))?,
        role: role.ok_or_else(|| reject("missing role".into()))?,
        room: room
            .filter(|r| !r.is_empty())
            .ok_or_else(|| reject("missing room".into()))?,
        index,
    })
}

// ── Context ─────────────────────────────────────────────────────────

pub struct SimContext {
    page: Arc<SimPage>,
    event_loop: tokio::task::JoinHandle<()>,
}

impl SimContext {
    fn open_state(&self) -> Result<MutexGuard<'_, PageState>, DriverError> {
        let state = lock(&self.page.state);
        if state.closed {
            return Err(DriverError::Closed);
        }
        Ok(state)
    }

    pub fn inject_media(&self) -> Result<(), DriverError> {
        self.open_state()?.media = true;
        Ok(())
    }

    pub fn navigate(&self, url: &str) -> Result<(), DriverError> {
        let params = parse_page_url(url)?;
        let mut state = self.open_state()?;
        state.params = Some(params);
        Ok(())
    }

    pub fn click(&self, selector: &str) -> Result<(), DriverError> {
        let reject = |message: String| DriverError::Rejected {
            command: "click",
            message,
        };
        if selector != self.page.entry.connect_selector {
            return Err(reject(format!("no element matches {selector}")));
        }
        let mut state = self.open_state()?;
        let params = state
            .params
            .clone()
            .ok_or_else(|| reject("page not loaded".into()))?;
        if state.connect_at.is_some() {
            return Ok(());
        }
        if params.role == Role::Presenter && !state.media {
            return Err(reject("NotFoundError: requested device not found".into()));
        }

        let viewer_index = params.index.filter(|_| params.role == Role::Viewer);
        if let Some(i) = viewer_index.filter(|i| self.page.profile.crash_viewers.contains(i)) {
            drop(state);
            panic!("simulated page for viewer {i} crashed on connect");
        }

        state.connect_at = Some(Instant::now() + self.page.profile.connect_delay);
        let stalled = params.role == Role::Viewer
            && params
                .index
                .is_some_and(|i| self.page.profile.stall_viewers.contains(&i));
        if stalled {
            tracing::debug!(peer = %self.page.peer_id, "simulated viewer stalls before joining");
            state.stalled = true;
            return Ok(());
        }
        self.page
            .connect(&mut state, &params)
            .map_err(reject)
    }

    pub fn evaluate(&self, expression: &str) -> Result<Value, DriverError> {
        let mut state = self.open_state()?;
        if expression == self.page.entry.connected_expression {
            Ok(Value::Bool(self.page.is_connected(&mut state)))
        } else if expression == self.page.entry.stats_expression {
            Ok(self.page.stats(&mut state))
        } else {
            Err(DriverError::Unsupported(expression.to_string()))
        }
    }

    pub fn close(&self) {
        if self.shut() {
            self.page.closes.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Leave the room. Returns `false` if the page was already closed.
    fn shut(&self) -> bool {
        let mut state = lock(&self.page.state);
        if state.closed {
            return false;
        }
        state.closed = true;
        self.page.hub.leave(&self.page.peer_id);
        true
    }
}

impl Drop for SimContext {
    fn drop(&mut self) {
        self.shut();
        self.event_loop.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario(arch: Architecture, viewers: u32, loss: f32) -> Scenario {
        Scenario::new(
            arch,
            viewers,
            loss,
            BandwidthCap::mbit(5),
            1,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn url(arch: Architecture, role: Role, room: &str, index: Option<u32>) -> String {
        let mut u = format!("http://sim/?mode={arch}&role={role}&room={room}");
        if let Some(i) = index {
            u.push_str(&format!("&index={i}"));
        }
        u
    }

    async fn open(
        launcher: &SimLauncher,
        s: &Scenario,
        role: Role,
        room: &str,
        index: Option<u32>,
    ) -> SimContext {
        let ctx = launcher.launch(s);
        ctx.inject_media().unwrap();
        ctx.navigate(&url(s.architecture(), role, room, index)).unwrap();
        ctx.click("#connectBtn").unwrap();
        ctx
    }

    async fn wait_connected(ctx: &SimContext) -> bool {
        let expr = EntryPoint::default().connected_expression;
        for _ in 0..100 {
            if ctx.evaluate(&expr).unwrap() == Value::Bool(true) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[test]
    fn page_url_parsing() {
        let p = parse_page_url("http://h:3000/?mode=relay&role=viewer&room=room_1&index=3").unwrap();
        assert_eq!(p.mode, Architecture::Relay);
        assert_eq!(p.role, Role::Viewer);
        assert_eq!(p.room, "room_1");
        assert_eq!(p.index, Some(3));
        assert!(parse_page_url("http://h:3000/").is_err());
        assert!(parse_page_url("http://h/?mode=mesh&role=viewer").is_err());
        assert!(parse_page_url("http://h/?mode=broadcast&role=viewer&room=r").is_err());
    }

    #[test]
    fn hub_rejects_second_presenter_and_unknown_peers() {
        let hub = SimSignaling::new();
        let join = |role| SignalMessage::JoinRoom {
            room_id: "r".into(),
            role,
            mode: Architecture::Mesh,
        };
        hub.send("a", join(Role::Presenter)).unwrap();
        assert!(hub.send("b", join(Role::Presenter)).is_err());
        let replies = hub.send("c", join(Role::Viewer)).unwrap();
        assert_eq!(
            replies,
            vec![SignalMessage::PeerJoined {
                peer_id: "a".into(),
                role: Role::Presenter
            }]
        );
        assert!(
            hub.send(
                "c",
                SignalMessage::Offer {
                    to: "zz".into(),
                    room_id: "r".into(),
                    sdp: String::new()
                }
            )
            .is_err()
        );
        let queued = hub.drain("a");
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].0, "c");
    }

    #[test]
    fn relay_consume_requires_announced_producer() {
        let hub = SimSignaling::new();
        let join = |role| SignalMessage::JoinSfuRoom {
            room_id: "r".into(),
            role,
        };
        let consume = SignalMessage::Consume {
            transport_id: "v-recv".into(),
            producer_id: "p-send/video".into(),
            rtp_capabilities: json!({}),
        };
        assert!(hub.send("v", consume.clone()).unwrap_err().contains("not joined"));

        let replies = hub.send("v", join(Role::Viewer)).unwrap();
        assert_eq!(replies.len(), 1);
        assert!(hub.send("v", consume.clone()).unwrap_err().contains("unknown producer"));

        hub.send("p", join(Role::Presenter)).unwrap();
        hub.send(
            "p",
            SignalMessage::Produce {
                transport_id: "p-send".into(),
                kind: MediaKind::Video,
                rtp_parameters: json!({}),
            },
        )
        .unwrap();
        let announced: Vec<_> = hub.drain("v").into_iter().map(|(_, m)| m.kind()).collect();
        assert!(announced.contains(&"new-producer"));
        assert!(hub.send("v", consume).is_ok());
    }

    #[test]
    fn leaving_cleans_up_room() {
        let hub = SimSignaling::new();
        for (peer, role) in [("a", Role::Presenter), ("b", Role::Viewer)] {
            hub.send(
                peer,
                SignalMessage::JoinRoom {
                    room_id: "r".into(),
                    role,
                    mode: Architecture::Mesh,
                },
            )
            .unwrap();
        }
        assert_eq!(hub.member_count("r"), 2);
        hub.leave("a");
        hub.leave("a");
        let left: Vec<_> = hub.drain("b").into_iter().map(|(_, m)| m.kind()).collect();
        assert!(left.contains(&"peer-left"));
        hub.leave("b");
        assert_eq!(hub.member_count("r"), 0);
        assert!(hub.send("b", SignalMessage::ResumeConsumer { consumer_id: "c".into() }).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn mesh_viewer_connects_after_presenter_offers() {
        let launcher = SimLauncher::new(SimProfile::default(), EntryPoint::default());
        let s = scenario(Architecture::Mesh, 2, 0.0);
        let presenter = open(&launcher, &s, Role::Presenter, "room_m", None).await;
        assert!(wait_connected(&presenter).await);
        let viewer = open(&launcher, &s, Role::Viewer, "room_m", Some(0)).await;
        assert!(wait_connected(&viewer).await);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let stats = presenter
            .evaluate(&EntryPoint::default().stats_expression)
            .unwrap();
        let conns = stats["connections"].as_array().unwrap();
        assert_eq!(conns.len(), 1);
        let entries = conns[0]["stats"].as_array().unwrap();
        assert!(entries.iter().any(|e| e["type"] == "candidate-pair"
            && e["currentRoundTripTime"].as_f64().unwrap() > 0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn relay_viewer_consumes_existing_producer() {
        let launcher = SimLauncher::new(SimProfile::default(), EntryPoint::default());
        let s = scenario(Architecture::Relay, 1, 5.0);
        let presenter = open(&launcher, &s, Role::Presenter, "room_r", None).await;
        assert!(wait_connected(&presenter).await);
        let viewer = open(&launcher, &s, Role::Viewer, "room_r", Some(0)).await;
        assert!(wait_connected(&viewer).await);

        tokio::time::sleep(Duration::from_secs(3)).await;
        let stats = viewer.evaluate(&EntryPoint::default().stats_expression).unwrap();
        let inbound = &stats["connections"][0]["stats"][0];
        assert_eq!(inbound["type"], "inbound-rtp");
        assert!(inbound["packetsLost"].as_i64().unwrap() > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_viewer_never_connects() {
        let profile = SimProfile {
            stall_viewers: vec![1],
            ..Default::default()
        };
        let launcher = SimLauncher::new(profile, EntryPoint::default());
        let s = scenario(Architecture::Mesh, 2, 0.0);
        let presenter = open(&launcher, &s, Role::Presenter, "room_s", None).await;
        assert!(wait_connected(&presenter).await);
        let stalled = open(&launcher, &s, Role::Viewer, "room_s", Some(1)).await;
        assert!(!wait_connected(&stalled).await);
    }

    #[tokio::test]
    async fn presenter_without_media_cannot_connect() {
        let launcher = SimLauncher::new(SimProfile::default(), EntryPoint::default());
        let s = scenario(Architecture::Mesh, 1, 0.0);
        let ctx = launcher.launch(&s);
        ctx.navigate(&url(Architecture::Mesh, Role::Presenter, "r", None))
            .unwrap();
        assert!(ctx.click("#connectBtn").is_err());
        assert!(ctx.click("#other").unwrap_err().to_string().contains("no element"));
    }

    #[tokio::test]
    async fn closed_context_rejects_calls_and_leaves_room() {
        let launcher = SimLauncher::new(SimProfile::default(), EntryPoint::default());
        let s = scenario(Architecture::Mesh, 1, 0.0);
        let ctx = open(&launcher, &s, Role::Presenter, "room_c", None).await;
        assert_eq!(launcher.hub.member_count("room_c"), 1);
        ctx.close();
        ctx.close();
        assert_eq!(launcher.hub.member_count("room_c"), 0);
        assert_eq!(launcher.explicit_closes(), 1);
        assert!(matches!(ctx.evaluate("x"), Err(DriverError::Closed)));

        let dropped = open(&launcher, &s, Role::Presenter, "room_d", None).await;
        drop(dropped);
        assert_eq!(launcher.hub.member_count("room_d"), 0);
        assert_eq!(launcher.explicit_closes(), 1);
    }

    #[test]
    fn mesh_egress_is_capped_by_link() {
        let conditions = Conditions {
            loss_percent: 0.0,
            cap: BandwidthCap::mbit(5),
        };
        let one = Load::new(conditions, Architecture::Mesh, 1);
        let five = Load::new(conditions, Architecture::Mesh, 5);
        let relay = Load::new(conditions, Architecture::Relay, 5);
        assert!((one.rate_bps_per_connection() - 4_000_000.0).abs() < 1.0);
        assert!((five.rate_bps_per_connection() * 5.0 - 5_000_000.0).abs() < 1.0);
        assert!((relay.rate_bps_per_connection() - 4_000_000.0).abs() < 1.0);
    }
}
