//! Deterministic test doubles for the protocol engine and the OS network
//! facility.
#![allow(dead_code)]

use async_trait::async_trait;
use core_engine::config::{Credentials, Endpoint, ProtocolOptions, TunnelConfig};
use core_engine::network::{NetworkError, NetworkManager, NetworkResult, TunConfig, TunDevice};
use core_engine::status::StatusSubscription;
use core_engine::transport::{Inbound, ProtocolEngine, TransportChannel, TransportError};
use core_engine::types::{Route, SessionParameters, StatusEvent};
use core_engine::TransportKind;
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Encryption stand-in
// ---------------------------------------------------------------------------

/// First byte of every frame the mock puts on the wire.
pub const WIRE_TAG: u8 = 0xE5;
const KEY: u8 = 0x5A;

pub fn seal(plaintext: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(plaintext.len() + 1);
    frame.push(WIRE_TAG);
    frame.extend(plaintext.iter().map(|b| b ^ KEY));
    frame
}

pub fn open(frame: &[u8]) -> Option<Vec<u8>> {
    match frame.split_first() {
        Some((&WIRE_TAG, body)) => Some(body.iter().map(|b| b ^ KEY).collect()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Protocol engine
// ---------------------------------------------------------------------------

/// What the engine does for one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    Succeed,
    ConnectFails,
    NegotiateTimeout,
    AuthReject,
    Incompatible,
    /// Handshake never completes
    Hang,
}

pub fn sample_params() -> SessionParameters {
    SessionParameters {
        local_address: Some("10.8.0.2".parse().unwrap()),
        prefix_len: 24,
        local_address_v6: None,
        peer_address: Some("10.8.0.1".parse().unwrap()),
        routes: vec![
            Route::parse("0.0.0.0/0").unwrap(),
            Route::parse("172.16.0.0/12").unwrap(),
        ],
        excluded_routes: vec![Route::parse("198.51.100.7/32").unwrap()],
        dns_servers: vec!["10.8.0.1".parse().unwrap()],
        search_domains: vec!["corp.example".to_string()],
        mtu: 1400,
    }
}

pub fn test_config() -> TunnelConfig {
    TunnelConfig::new(vec![Endpoint::new("gw.test", 1194, TransportKind::Udp)])
        .with_credentials(Credentials::new("alice", "secret"))
}

pub struct MockEngine {
    script: Mutex<VecDeque<Attempt>>,
    fallback: Mutex<Attempt>,
    params: Mutex<SessionParameters>,
    renegotiate_ok: AtomicBool,
    keepalive_stalls: AtomicBool,
    channels: Mutex<Vec<Arc<MockChannel>>>,
    connects: Mutex<Vec<Instant>>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(MockEngine {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Attempt::Succeed),
            params: Mutex::new(sample_params()),
            renegotiate_ok: AtomicBool::new(true),
            keepalive_stalls: AtomicBool::new(false),
            channels: Mutex::new(Vec::new()),
            connects: Mutex::new(Vec::new()),
        })
    }

    /// Queue behaviours for the next attempts; afterwards the fallback applies.
    pub fn script(&self, attempts: impl IntoIterator<Item = Attempt>) {
        self.script.lock().unwrap().extend(attempts);
    }

    pub fn set_fallback(&self, attempt: Attempt) {
        *self.fallback.lock().unwrap() = attempt;
    }

    pub fn set_params(&self, params: SessionParameters) {
        *self.params.lock().unwrap() = params;
    }

    pub fn set_renegotiate_ok(&self, ok: bool) {
        self.renegotiate_ok.store(ok, Ordering::SeqCst);
    }

    /// Channels handed out from now on never finish a keepalive send.
    pub fn set_keepalive_stalls(&self, stalls: bool) {
        self.keepalive_stalls.store(stalls, Ordering::SeqCst);
    }

    pub fn channels(&self) -> Vec<Arc<MockChannel>> {
        self.channels.lock().unwrap().clone()
    }

    pub fn last_channel(&self) -> Option<Arc<MockChannel>> {
        self.channels.lock().unwrap().last().cloned()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.lock().unwrap().len()
    }

    pub fn connect_times(&self) -> Vec<Instant> {
        self.connects.lock().unwrap().clone()
    }

    /// Channels handed out and not closed yet.
    pub fn open_channels(&self) -> usize {
        self.channels
            .lock()
            .unwrap()
            .iter()
            .filter(|c| !c.is_closed())
            .count()
    }
}

#[async_trait]
impl ProtocolEngine for MockEngine {
    async fn connect(
        &self,
        _endpoint: &Endpoint,
    ) -> Result<Arc<dyn TransportChannel>, TransportError> {
        self.connects.lock().unwrap().push(Instant::now());

        let attempt = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.lock().unwrap().clone());

        if attempt == Attempt::ConnectFails {
            return Err(TransportError::Connect("connection refused".into()));
        }

        let channel = Arc::new(MockChannel::new(
            attempt,
            self.params.lock().unwrap().clone(),
            self.renegotiate_ok.load(Ordering::SeqCst),
        ));
        if self.keepalive_stalls.load(Ordering::SeqCst) {
            channel.stall_keepalives();
        }
        self.channels.lock().unwrap().push(Arc::clone(&channel));
        let channel: Arc<dyn TransportChannel> = channel;
        Ok(channel)
    }
}

enum WireItem {
    Frame(Vec<u8>),
    Item(Inbound),
    Fail(TransportError),
}

pub struct MockChannel {
    attempt: Attempt,
    params: SessionParameters,
    renegotiate_ok: AtomicBool,
    inbound_tx: mpsc::UnboundedSender<WireItem>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<WireItem>>,
    wire: Mutex<Vec<Vec<u8>>>,
    keepalives: AtomicUsize,
    renegotiations: AtomicUsize,
    closed: AtomicBool,
    gated: AtomicBool,
    gate: Semaphore,
    keepalive_stalls: AtomicBool,
    keepalive_panics: AtomicBool,
}

impl MockChannel {
    pub fn new(attempt: Attempt, params: SessionParameters, renegotiate_ok: bool) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        MockChannel {
            attempt,
            params,
            renegotiate_ok: AtomicBool::new(renegotiate_ok),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            wire: Mutex::new(Vec::new()),
            keepalives: AtomicUsize::new(0),
            renegotiations: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            gated: AtomicBool::new(false),
            gate: Semaphore::new(0),
            keepalive_stalls: AtomicBool::new(false),
            keepalive_panics: AtomicBool::new(false),
        }
    }

    /// A channel that negotiates successfully, for driving a pump directly.
    pub fn established() -> Arc<Self> {
        Arc::new(MockChannel::new(Attempt::Succeed, sample_params(), true))
    }

    /// Deliver a sealed frame from the gateway.
    pub fn inject_frame(&self, frame: Vec<u8>) {
        let _ = self.inbound_tx.send(WireItem::Frame(frame));
    }

    pub fn inject(&self, item: Inbound) {
        let _ = self.inbound_tx.send(WireItem::Item(item));
    }

    pub fn inject_error(&self, err: TransportError) {
        let _ = self.inbound_tx.send(WireItem::Fail(err));
    }

    /// Frames put on the wire, in order.
    pub fn wire(&self) -> Vec<Vec<u8>> {
        self.wire.lock().unwrap().clone()
    }

    /// Make `send` wait for [`release_sends`](Self::release_sends).
    pub fn hold_sends(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    pub fn release_sends(&self, count: usize) {
        self.gate.add_permits(count);
    }

    /// Keepalive sends block forever, like a write into a dead link.
    pub fn stall_keepalives(&self) {
        self.keepalive_stalls.store(true, Ordering::SeqCst);
    }

    /// The next keepalive send panics inside the caller's task.
    pub fn panic_on_keepalive(&self) {
        self.keepalive_panics.store(true, Ordering::SeqCst);
    }

    pub fn keepalives(&self) -> usize {
        self.keepalives.load(Ordering::SeqCst)
    }

    pub fn renegotiations(&self) -> usize {
        self.renegotiations.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportChannel for MockChannel {
    async fn negotiate(
        &self,
        _credentials: Option<&Credentials>,
        _options: &ProtocolOptions,
    ) -> Result<SessionParameters, TransportError> {
        match self.attempt {
            Attempt::Succeed => Ok(self.params.clone()),
            Attempt::NegotiateTimeout => Err(TransportError::Timeout),
            Attempt::AuthReject => Err(TransportError::AuthRejected("bad credentials".into())),
            Attempt::Incompatible => Err(TransportError::Incompatible("unknown cipher".into())),
            Attempt::Hang => std::future::pending().await,
            Attempt::ConnectFails => Err(TransportError::Other("not connected".into())),
        }
    }

    async fn renegotiate(&self) -> Result<(), TransportError> {
        self.renegotiations.fetch_add(1, Ordering::SeqCst);
        if self.renegotiate_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Timeout)
        }
    }

    async fn send(&self, packet: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.gated.load(Ordering::SeqCst) {
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| TransportError::Closed)?;
            permit.forget();
        }
        self.wire.lock().unwrap().push(seal(packet));
        Ok(())
    }

    async fn receive(&self) -> Result<Inbound, TransportError> {
        let mut rx = self.inbound_rx.lock().await;
        match rx.recv().await {
            Some(WireItem::Frame(frame)) => open(&frame)
                .map(Inbound::Packet)
                .ok_or_else(|| TransportError::Other("bad frame".into())),
            Some(WireItem::Item(item)) => Ok(item),
            Some(WireItem::Fail(err)) => Err(err),
            None => Ok(Inbound::Closed),
        }
    }

    async fn send_keepalive(&self) -> Result<(), TransportError> {
        if self.keepalive_panics.load(Ordering::SeqCst) {
            panic!("keepalive sent on a corrupted channel");
        }
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.keepalive_stalls.load(Ordering::SeqCst) {
            return std::future::pending().await;
        }
        self.keepalives.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// OS network facility
// ---------------------------------------------------------------------------

pub struct MockTun {
    name: String,
    outbound_tx: mpsc::UnboundedSender<io::Result<Vec<u8>>>,
    outbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<io::Result<Vec<u8>>>>,
    written: Mutex<Vec<Vec<u8>>>,
}

impl MockTun {
    pub fn new(name: &str) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Arc::new(MockTun {
            name: name.to_string(),
            outbound_tx,
            outbound_rx: tokio::sync::Mutex::new(outbound_rx),
            written: Mutex::new(Vec::new()),
        })
    }

    /// A local application sends `packet` into the tunnel.
    pub fn inject(&self, packet: Vec<u8>) {
        let _ = self.outbound_tx.send(Ok(packet));
    }

    pub fn inject_error(&self, kind: io::ErrorKind) {
        let _ = self.outbound_tx.send(Err(io::Error::new(kind, "mock interface error")));
    }

    /// Packets delivered to local applications, in order.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().unwrap().clone()
    }
}

#[async_trait]
impl TunDevice for MockTun {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut rx = self.outbound_rx.lock().await;
        match rx.recv().await {
            Some(Ok(packet)) => {
                let n = packet.len().min(buf.len());
                buf[..n].copy_from_slice(&packet[..n]);
                Ok(n)
            }
            Some(Err(err)) => Err(err),
            None => std::future::pending().await,
        }
    }

    async fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
        self.written.lock().unwrap().push(packet.to_vec());
        Ok(())
    }
}

/// Observable OS state.
#[derive(Debug, Clone, Default)]
pub struct NetState {
    pub live_tuns: Vec<String>,
    pub routes: Vec<Route>,
    pub exclusions: Vec<Route>,
    /// Resolver overrides by interface
    pub dns: BTreeMap<String, (Vec<IpAddr>, Vec<String>)>,
    /// Every successful call, in order
    pub log: Vec<String>,
}

pub struct MockNetwork {
    state: Mutex<NetState>,
    created: AtomicUsize,
    route_calls: AtomicUsize,
    fail_route_at: Mutex<Option<usize>>,
    fail_dns: AtomicBool,
    busy_creates: AtomicUsize,
    tuns: Mutex<Vec<Arc<MockTun>>>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(MockNetwork {
            state: Mutex::new(NetState::default()),
            created: AtomicUsize::new(0),
            route_calls: AtomicUsize::new(0),
            fail_route_at: Mutex::new(None),
            fail_dns: AtomicBool::new(false),
            busy_creates: AtomicUsize::new(0),
            tuns: Mutex::new(Vec::new()),
        })
    }

    /// Fail the `n`th `add_route` call (0-based, counted over the test).
    pub fn fail_route_at(&self, n: usize) {
        *self.fail_route_at.lock().unwrap() = Some(n);
    }

    pub fn fail_dns(&self) {
        self.fail_dns.store(true, Ordering::SeqCst);
    }

    /// Make the next `n` interface creations report a busy device.
    pub fn busy_creates(&self, n: usize) {
        self.busy_creates.store(n, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> NetState {
        self.state.lock().unwrap().clone()
    }

    pub fn tuns_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn last_tun(&self) -> Option<Arc<MockTun>> {
        self.tuns.lock().unwrap().last().cloned()
    }

    /// No interface, route, exclusion or DNS override left behind.
    pub fn is_clean(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.live_tuns.is_empty()
            && state.routes.is_empty()
            && state.exclusions.is_empty()
            && state.dns.is_empty()
    }
}

#[async_trait]
impl NetworkManager for MockNetwork {
    async fn create_tun(&self, config: TunConfig) -> NetworkResult<Arc<dyn TunDevice>> {
        let busy = self
            .busy_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if busy {
            return Err(NetworkError::Busy("tun device busy".into()));
        }

        let mut state = self.state.lock().unwrap();
        if let Some(name) = &config.name {
            if state.live_tuns.contains(name) {
                return Err(NetworkError::Busy(format!("{name} already exists")));
            }
        }

        let index = self.created.fetch_add(1, Ordering::SeqCst);
        let name = config.name.unwrap_or_else(|| format!("mock{index}"));
        let tun = MockTun::new(&name);
        self.tuns.lock().unwrap().push(Arc::clone(&tun));

        state.live_tuns.push(name.clone());
        let mut addresses = Vec::new();
        if let Some(address) = config.address {
            addresses.push(format!("{address}/{}", config.prefix_len));
        }
        if let Some((address, prefix_len)) = config.address_v6 {
            addresses.push(format!("{address}/{prefix_len}"));
        }
        state
            .log
            .push(format!("create {name} {}", addresses.join(" ")));
        let tun: Arc<dyn TunDevice> = tun;
        Ok(tun)
    }

    async fn destroy_tun(&self, name: &str) -> NetworkResult<()> {
        let mut state = self.state.lock().unwrap();
        let before = state.live_tuns.len();
        state.live_tuns.retain(|t| t != name);
        if state.live_tuns.len() == before {
            return Err(NetworkError::NotFound(name.to_string()));
        }
        state.log.push(format!("destroy {name}"));
        Ok(())
    }

    async fn add_route(&self, route: &Route, interface: &str) -> NetworkResult<()> {
        let call = self.route_calls.fetch_add(1, Ordering::SeqCst);
        if *self.fail_route_at.lock().unwrap() == Some(call) {
            return Err(NetworkError::Routing(format!("cannot add {route}")));
        }
        let mut state = self.state.lock().unwrap();
        state.routes.push(route.clone());
        state.log.push(format!("route add {route} dev {interface}"));
        Ok(())
    }

    async fn remove_route(&self, route: &Route, interface: &str) -> NetworkResult<()> {
        let mut state = self.state.lock().unwrap();
        let Some(pos) = state.routes.iter().position(|r| r == route) else {
            return Err(NetworkError::NotFound(route.to_string()));
        };
        state.routes.remove(pos);
        state.log.push(format!("route del {route} dev {interface}"));
        Ok(())
    }

    async fn exclude_route(&self, route: &Route) -> NetworkResult<()> {
        let mut state = self.state.lock().unwrap();
        // Installing an exclusion twice replaces it
        if !state.exclusions.contains(route) {
            state.exclusions.push(route.clone());
        }
        state.log.push(format!("exclude {route}"));
        Ok(())
    }

    async fn remove_exclusion(&self, route: &Route) -> NetworkResult<()> {
        let mut state = self.state.lock().unwrap();
        let Some(pos) = state.exclusions.iter().position(|r| r == route) else {
            return Err(NetworkError::NotFound(route.to_string()));
        };
        state.exclusions.remove(pos);
        state.log.push(format!("unexclude {route}"));
        Ok(())
    }

    async fn configure_dns(
        &self,
        interface: &str,
        servers: &[IpAddr],
        search_domains: &[String],
    ) -> NetworkResult<()> {
        if self.fail_dns.load(Ordering::SeqCst) {
            return Err(NetworkError::DnsConfig("resolver unavailable".into()));
        }
        let mut state = self.state.lock().unwrap();
        state.dns.insert(
            interface.to_string(),
            (servers.to_vec(), search_domains.to_vec()),
        );
        state.log.push(format!("dns {interface}"));
        Ok(())
    }

    async fn restore_dns(&self, interface: &str) -> NetworkResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.dns.remove(interface).is_none() {
            return Err(NetworkError::NotFound(format!("dns for {interface}")));
        }
        state.log.push(format!("dns restore {interface}"));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Status helpers
// ---------------------------------------------------------------------------

/// Collect events until one matches `done`; the match is the last element.
pub async fn wait_for(
    sub: &mut StatusSubscription,
    mut done: impl FnMut(&StatusEvent) -> bool,
) -> Vec<StatusEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(3600), sub.recv())
            .await
            .expect("timed out waiting for a status event")
            .expect("status subscription closed");
        let matched = done(&event);
        events.push(event);
        if matched {
            return events;
        }
    }
}

/// Events already delivered, without waiting.
pub fn drain(sub: &mut StatusSubscription) -> Vec<StatusEvent> {
    let mut events = Vec::new();
    while let Some(event) = sub.try_recv() {
        events.push(event);
    }
    events
}

/// Poll `cond` until it holds, advancing time in small steps.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition never became true");
}
