//! Tunnel session manager.
//!
//! [`TunnelSessionManager`] is the public face of the crate. `start` moves
//! the tunnel to `Connecting` and spawns a supervisor task; from then on
//! the supervisor alone computes transitions until the run ends in
//! `Disconnected` or `Failed`. The supervisor owns every live resource
//! (session, interface, packet pump) and releases them in reverse
//! acquisition order on every exit path.

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::backoff::Backoff;
use crate::config::TunnelConfig;
use crate::configurator::{InterfaceConfigurator, InterfaceHandle};
use crate::error::{FailureReason, TunnelError};
use crate::keepalive::KeepaliveMonitor;
use crate::negotiator::SessionNegotiator;
use crate::network::NetworkManager;
use crate::pump::{PacketPump, PumpHandle, PumpNotice};
use crate::session::SessionHandle;
use crate::status::{StatusHub, StatusSubscription};
use crate::transport::ProtocolEngine;
use crate::types::{NetworkEvent, SessionParameters, TrafficSnapshot, TrafficStats, TunnelState};

/// Owns the lifecycle of one tunnel.
///
/// Cloning is cheap; clones control the same tunnel.
#[derive(Clone)]
pub struct TunnelSessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    negotiator: SessionNegotiator,
    configurator: InterfaceConfigurator,
    status: StatusHub,
    traffic: Arc<TrafficStats>,
    run: Mutex<Option<RunHandle>>,
    next_run: AtomicU64,
}

impl Inner {
    fn lock_run(&self) -> MutexGuard<'_, Option<RunHandle>> {
        self.run.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Control surface of the running supervisor.
struct RunHandle {
    id: u64,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<NetworkEvent>,
    done: Shared<BoxFuture<'static, ()>>,
}

/// Cleanup left behind by a supervisor that unwound while holding resources.
type Salvage = Arc<Mutex<Option<JoinHandle<()>>>>;

fn lock_salvage(salvage: &Salvage) -> MutexGuard<'_, Option<JoinHandle<()>>> {
    salvage.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TunnelSessionManager {
    pub fn new(engine: Arc<dyn ProtocolEngine>, network: Arc<dyn NetworkManager>) -> Self {
        let traffic = Arc::new(TrafficStats::new());
        TunnelSessionManager {
            inner: Arc::new(Inner {
                negotiator: SessionNegotiator::new(engine),
                configurator: InterfaceConfigurator::new(network),
                status: StatusHub::new(Arc::clone(&traffic)),
                traffic,
                run: Mutex::new(None),
                next_run: AtomicU64::new(1),
            }),
        }
    }

    /// Begin connecting. Returns as soon as the tunnel is `Connecting`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, config: TunnelConfig) -> Result<(), TunnelError> {
        let mut slot = self.inner.lock_run();

        let current = self.inner.status.current();
        if !current.can_start() {
            return Err(TunnelError::AlreadyRunning(current));
        }
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TunnelError::Internal(format!("no tokio runtime: {e}")))?;

        self.inner.traffic.reset();
        self.inner
            .status
            .transition_if(TunnelState::can_start, TunnelState::Connecting)
            .map_err(TunnelError::AlreadyRunning)?;

        let id = self.inner.next_run.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        info!(
            run = id,
            endpoints = config.endpoints.len(),
            "Starting tunnel"
        );

        let salvage = Salvage::default();
        let supervisor = Supervisor::new(
            Arc::clone(&self.inner),
            config,
            cancel.clone(),
            events_rx,
            Arc::clone(&salvage),
        );
        let task = runtime.spawn(supervisor.run().instrument(info_span!("tunnel", run = id)));

        let inner = Arc::clone(&self.inner);
        let watcher = runtime.spawn(async move {
            if let Err(err) = task.await {
                if err.is_panic() {
                    error!(run = id, "Tunnel supervisor panicked");
                    let cleanup = lock_salvage(&salvage).take();
                    if let Some(cleanup) = cleanup {
                        if let Err(err) = cleanup.await {
                            error!(run = id, error = %err, "Releasing tunnel resources failed");
                        }
                    }
                    inner.status.transition(
                        TunnelState::Failed(FailureReason::InternalInvariantViolation),
                        0,
                        Some("tunnel supervisor panicked".to_string()),
                    );
                }
            }
        });

        *slot = Some(RunHandle {
            id,
            cancel,
            events: events_tx,
            done: watcher.map(|_| ()).boxed().shared(),
        });
        Ok(())
    }

    /// Tear the tunnel down and wait until nothing is left.
    ///
    /// Safe to call from any state and any number of times. A `Failed`
    /// tunnel is acknowledged with a single `Disconnected` event.
    pub async fn stop(&self) {
        let run = self
            .inner
            .lock_run()
            .as_ref()
            .map(|run| (run.id, run.cancel.clone(), run.done.clone()));

        if let Some((id, cancel, done)) = run {
            debug!(run = id, "Stopping tunnel");
            cancel.cancel();
            done.await;

            let mut slot = self.inner.lock_run();
            if slot.as_ref().is_some_and(|run| run.id == id) {
                *slot = None;
            }
        }

        let _ = self
            .inner
            .status
            .transition_if(|s| matches!(s, TunnelState::Failed(_)), TunnelState::Disconnected);
    }

    /// Current state. Never waits on I/O.
    pub fn current_state(&self) -> TunnelState {
        self.inner.status.current()
    }

    pub fn subscribe(&self) -> StatusSubscription {
        self.inner.status.subscribe()
    }

    /// Remove an observer. Returns false if the id is unknown.
    pub fn unsubscribe(&self, id: u64) -> bool {
        self.inner.status.unsubscribe(id)
    }

    /// Forward a platform network event to the running tunnel.
    pub fn notify_network(&self, event: NetworkEvent) {
        match self.inner.lock_run().as_ref() {
            Some(run) => {
                if run.events.send(event).is_err() {
                    debug!(?event, "Tunnel finished, ignoring network event");
                }
            }
            None => debug!(?event, "No tunnel running, ignoring network event"),
        }
    }

    pub fn traffic(&self) -> TrafficSnapshot {
        self.inner.traffic.snapshot()
    }
}

/// Resources held by a run, in acquisition order.
struct Live {
    session: Option<SessionHandle>,
    interface: Option<InterfaceHandle>,
    pump: Option<PumpHandle>,
    notices: Option<mpsc::UnboundedReceiver<PumpNotice>>,
    configurator: InterfaceConfigurator,
    salvage: Salvage,
}

impl Live {
    fn new(configurator: InterfaceConfigurator, salvage: Salvage) -> Self {
        Live {
            session: None,
            interface: None,
            pump: None,
            notices: None,
            configurator,
            salvage,
        }
    }
}

/// Orderly exits tear down before dropping, so anything still held here
/// belongs to a supervisor that panicked. Release it on a fresh task and
/// leave the handle for the watcher to await.
impl Drop for Live {
    fn drop(&mut self) {
        let pump = self.pump.take();
        let interface = self.interface.take();
        let session = self.session.take();
        if pump.is_none() && interface.is_none() && session.is_none() {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!("Tunnel resources dropped outside a runtime, leaving them in place");
            return;
        };
        warn!(
            interface = ?interface.as_ref().map(InterfaceHandle::name),
            "Releasing tunnel resources after abnormal exit"
        );

        let configurator = self.configurator.clone();
        let cleanup = runtime.spawn(async move {
            if let Some(pump) = pump {
                if let Err(err) = pump.stop().await {
                    debug!(error = %err, "Packet pump ended with error");
                }
            }
            if let Some(interface) = interface {
                configurator.release(interface).await;
            }
            if let Some(session) = session {
                session.close().await;
            }
        });
        *lock_salvage(&self.salvage) = Some(cleanup);
    }
}

/// How a run ends.
enum Exit {
    Stopped,
    Failed(FailureReason, String),
}

/// Why a connection attempt did not complete.
enum Abort {
    Cancelled,
    Error(TunnelError),
}

impl From<TunnelError> for Abort {
    fn from(err: TunnelError) -> Self {
        Abort::Error(err)
    }
}

/// What the connected loop decided.
enum Watch {
    Stop,
    Reconnect { reason: String, immediate: bool },
    Fatal(Exit),
}

fn invariant(message: &str) -> Exit {
    error!(detail = message, "Internal invariant violated");
    Exit::Failed(FailureReason::InternalInvariantViolation, message.to_string())
}

struct Supervisor {
    inner: Arc<Inner>,
    config: TunnelConfig,
    cancel: CancellationToken,
    events: mpsc::UnboundedReceiver<NetworkEvent>,
    events_open: bool,
    backoff: Backoff,
    keepalive: KeepaliveMonitor,
    salvage: Salvage,
}

impl Supervisor {
    fn new(
        inner: Arc<Inner>,
        config: TunnelConfig,
        cancel: CancellationToken,
        events: mpsc::UnboundedReceiver<NetworkEvent>,
        salvage: Salvage,
    ) -> Self {
        Supervisor {
            backoff: Backoff::new(&config.reconnect),
            keepalive: KeepaliveMonitor::new(&config.keepalive),
            inner,
            config,
            cancel,
            events,
            events_open: true,
            salvage,
        }
    }

    fn status(&self) -> &StatusHub {
        &self.inner.status
    }

    async fn run(mut self) {
        let mut live = Live::new(
            self.inner.configurator.clone(),
            Arc::clone(&self.salvage),
        );

        match self.drive(&mut live).await {
            Exit::Stopped => {
                self.status().transition(TunnelState::Disconnecting, 0, None);
                self.teardown(&mut live).await;
                self.status().transition(TunnelState::Disconnected, 0, None);
            }
            Exit::Failed(reason, message) => {
                if reason == FailureReason::InternalInvariantViolation {
                    error!(%reason, error = %message, "Tunnel failed");
                } else {
                    warn!(%reason, error = %message, "Tunnel failed");
                }
                self.teardown(&mut live).await;
                self.status()
                    .transition(TunnelState::Failed(reason), 0, Some(message));
            }
        }
    }

    async fn drive(&mut self, live: &mut Live) -> Exit {
        if let Err(exit) = self.connect_initial(live).await {
            return exit;
        }

        loop {
            match self.watch(live).await {
                Watch::Stop => return Exit::Stopped,
                Watch::Fatal(exit) => return exit,
                Watch::Reconnect { reason, immediate } => {
                    warn!(reason = %reason, "Link lost, reconnecting");
                    if let Err(exit) = self.reconnect(live, reason, immediate).await {
                        return exit;
                    }
                }
            }
        }
    }

    /// Race `fut` against cancellation.
    async fn cancellable<F, T, E>(&self, fut: F) -> Result<T, Abort>
    where
        F: Future<Output = Result<T, E>>,
        TunnelError: From<E>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Abort::Cancelled),
            res = fut => res.map_err(|e| Abort::Error(TunnelError::from(e))),
        }
    }

    /// First connection. Retries re-enter `Connecting` with the retry count.
    async fn connect_initial(&mut self, live: &mut Live) -> Result<(), Exit> {
        let mut retry = 0;
        loop {
            let err = match self.establish(live, retry).await {
                Ok(()) => return Ok(()),
                Err(Abort::Cancelled) => return Err(Exit::Stopped),
                Err(Abort::Error(err)) => err,
            };

            self.teardown(live).await;

            if !err.is_retryable() {
                return Err(Exit::Failed(err.classify(), err.to_string()));
            }
            if retry >= self.config.reconnect.attempts() {
                return Err(Exit::Failed(
                    FailureReason::TransientNetwork,
                    format!("giving up after {retry} retries: {err}"),
                ));
            }

            retry += 1;
            let delay = self.backoff.next_delay();
            warn!(
                retry,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Connection attempt failed"
            );
            self.status()
                .transition(TunnelState::Connecting, retry, Some(err.to_string()));

            if !self.wait_backoff(delay).await {
                return Err(Exit::Stopped);
            }
        }
    }

    async fn establish(&mut self, live: &mut Live, retry: u32) -> Result<(), Abort> {
        let session = self
            .cancellable(self.inner.negotiator.connect(&self.config))
            .await?;
        let session = live.session.insert(session);
        self.status()
            .transition(TunnelState::Negotiating, retry, None);

        let params = self
            .cancellable(self.inner.negotiator.negotiate(session, &self.config))
            .await?;
        self.status()
            .transition(TunnelState::ConfiguringInterface, retry, None);

        let interface = self.apply_interface(params).await?;
        live.interface = Some(interface);

        self.start_pump(live)?;
        self.connected();
        Ok(())
    }

    /// Apply interface configuration in its own task so cancellation never
    /// interrupts it halfway; on cancel, whatever it produced is released.
    async fn apply_interface(&self, params: SessionParameters) -> Result<InterfaceHandle, Abort> {
        let configurator = self.inner.configurator.clone();
        let options = self.config.interface.clone();
        let mut task = tokio::spawn(async move { configurator.apply(&params, &options).await });

        let finished = tokio::select! {
            biased;
            res = &mut task => Some(res),
            _ = self.cancel.cancelled() => None,
        };

        match finished {
            Some(Ok(Ok(handle))) => Ok(handle),
            Some(Ok(Err(err))) => Err(Abort::Error(err.into())),
            Some(Err(join_err)) => Err(Abort::Error(TunnelError::Internal(format!(
                "interface configuration task failed: {join_err}"
            )))),
            None => {
                if let Ok(Ok(handle)) = task.await {
                    self.inner.configurator.release(handle).await;
                }
                Err(Abort::Cancelled)
            }
        }
    }

    fn start_pump(&self, live: &mut Live) -> Result<(), Abort> {
        let (Some(session), Some(interface)) = (live.session.as_ref(), live.interface.as_ref())
        else {
            return Err(Abort::Error(TunnelError::Internal(
                "packet pump needs a live session and interface".to_string(),
            )));
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let pump = PacketPump::new(
            interface.device(),
            session.channel(),
            Arc::clone(&self.inner.traffic),
            self.config.pump.clone(),
            interface.params().mtu,
        );
        debug!(session_id = %session.id(), interface = %interface.name(), "Starting packet pump");

        live.pump = Some(pump.spawn(tx, self.cancel.child_token()));
        live.notices = Some(rx);
        Ok(())
    }

    fn connected(&mut self) {
        self.backoff.reset();
        self.inner.traffic.touch();
        // Events queued while connecting describe a network already in use
        while let Ok(event) = self.events.try_recv() {
            debug!(?event, "Ignoring network event received while connecting");
        }
        self.status().transition(TunnelState::Connected, 0, None);
    }

    /// Supervise a connected tunnel until something needs attention.
    async fn watch(&mut self, live: &mut Live) -> Watch {
        let interval = self.keepalive.interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let Some(notices) = live.notices.as_mut() else {
                return Watch::Fatal(invariant("connected without a packet pump"));
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Watch::Stop,
                notice = notices.recv() => match notice {
                    Some(PumpNotice::RenegotiationRequested) => {
                        info!("Gateway requested renegotiation");
                        if let Err(watch) = self.renegotiate(live).await {
                            return watch;
                        }
                    }
                    Some(PumpNotice::Failed(err)) => {
                        return Watch::Reconnect { reason: err.to_string(), immediate: false };
                    }
                    None => {
                        return Watch::Reconnect {
                            reason: "packet pump stopped".to_string(),
                            immediate: false,
                        };
                    }
                },
                event = self.events.recv(), if self.events_open => match event {
                    Some(NetworkEvent::Changed) => {
                        return Watch::Reconnect {
                            reason: "network changed".to_string(),
                            immediate: true,
                        };
                    }
                    Some(NetworkEvent::Lost) => {
                        return Watch::Reconnect {
                            reason: "network lost".to_string(),
                            immediate: false,
                        };
                    }
                    Some(NetworkEvent::Available) => debug!("Network available while connected"),
                    None => self.events_open = false,
                },
                _ = ticker.tick() => {
                    if let Err(watch) = self.keepalive_tick(live).await {
                        return watch;
                    }
                }
            }
        }
    }

    async fn keepalive_tick(&self, live: &Live) -> Result<(), Watch> {
        if self
            .keepalive
            .is_expired(self.inner.traffic.last_inbound(), Instant::now())
        {
            warn!(
                timeout_secs = self.keepalive.timeout().as_secs(),
                "Gateway silent, attempting renegotiation"
            );
            return self.renegotiate(live).await;
        }

        let Some(session) = live.session.as_ref() else {
            return Err(Watch::Fatal(invariant("connected without a session")));
        };
        let channel = session.channel();
        // A send stuck on a dead link must not hold up the expiry check
        let limit = self.keepalive.interval();
        match tokio::time::timeout(limit, self.cancellable(channel.send_keepalive())).await {
            Err(_) => {
                debug!(limit_ms = limit.as_millis() as u64, "Keepalive send stalled, skipping beat");
                Ok(())
            }
            Ok(Ok(())) => Ok(()),
            Ok(Err(Abort::Cancelled)) => Err(Watch::Stop),
            Ok(Err(Abort::Error(err))) => Err(Watch::Reconnect {
                reason: format!("keepalive failed: {err}"),
                immediate: false,
            }),
        }
    }

    async fn renegotiate(&self, live: &Live) -> Result<(), Watch> {
        let Some(session) = live.session.as_ref() else {
            return Err(Watch::Fatal(invariant("renegotiation without a session")));
        };

        let renewal = self
            .inner
            .negotiator
            .renegotiate(session, self.config.negotiation_timeout);
        match self.cancellable(renewal).await {
            Ok(()) => {
                self.inner.traffic.touch();
                Ok(())
            }
            Err(Abort::Cancelled) => Err(Watch::Stop),
            Err(Abort::Error(err)) if !err.is_retryable() => Err(Watch::Fatal(Exit::Failed(
                err.classify(),
                err.to_string(),
            ))),
            Err(Abort::Error(err)) => Err(Watch::Reconnect {
                reason: format!("renegotiation failed: {err}"),
                immediate: false,
            }),
        }
    }

    /// Replace a broken session while keeping the interface up.
    async fn reconnect(
        &mut self,
        live: &mut Live,
        reason: String,
        immediate: bool,
    ) -> Result<(), Exit> {
        // Routes stay on the tunnel interface; nothing leaks while recovering
        self.stop_pump(live).await;

        let attempts = self.config.reconnect.attempts();
        let mut last_error = reason;
        let mut retry = 0;

        loop {
            if retry >= attempts {
                return Err(Exit::Failed(
                    FailureReason::TransientNetwork,
                    format!("reconnect gave up after {retry} attempts: {last_error}"),
                ));
            }
            retry += 1;
            self.status()
                .transition(TunnelState::Reconnecting, retry, Some(last_error.clone()));

            let delay = if immediate && retry == 1 {
                Duration::ZERO
            } else {
                self.backoff.next_delay()
            };
            if !self.wait_backoff(delay).await {
                return Err(Exit::Stopped);
            }

            match self.reestablish(live).await {
                Ok(()) => {
                    info!(retry, "Reconnected");
                    self.connected();
                    return Ok(());
                }
                Err(Abort::Cancelled) => return Err(Exit::Stopped),
                Err(Abort::Error(err)) => {
                    // Interface failures after a working connection are final
                    if matches!(err, TunnelError::Interface(_)) || !err.is_retryable() {
                        return Err(Exit::Failed(err.classify(), err.to_string()));
                    }
                    warn!(retry, error = %err, "Reconnect attempt failed");
                    last_error = err.to_string();
                }
            }
        }
    }

    /// Negotiate a new session, then swap it in for the stale one.
    async fn reestablish(&mut self, live: &mut Live) -> Result<(), Abort> {
        let session = self
            .cancellable(self.inner.negotiator.connect(&self.config))
            .await?;

        let negotiated = self
            .cancellable(self.inner.negotiator.negotiate(&session, &self.config))
            .await;
        let params = match negotiated {
            Ok(params) => params,
            Err(abort) => {
                session.close().await;
                return Err(abort);
            }
        };

        if let Some(stale) = live.session.replace(session) {
            stale.close().await;
        }

        let unchanged = live
            .interface
            .as_ref()
            .is_some_and(|interface| interface.params() == &params);
        if !unchanged {
            info!("Session parameters changed, reconfiguring interface");
            self.replace_interface(live, params).await?;
        }

        self.start_pump(live)
    }

    /// Bring up the interface for `params`, then retire the old one. A fixed
    /// interface name cannot exist twice; then the old interface goes first.
    /// If the new configuration fails, the old interface stays in `live`.
    async fn replace_interface(
        &self,
        live: &mut Live,
        params: SessionParameters,
    ) -> Result<(), Abort> {
        if let Some(name) = self.config.interface.name.as_deref() {
            if let Some(old) = live.interface.take() {
                warn!(
                    interface = name,
                    "Interface name is fixed, releasing it before reconfiguring"
                );
                self.inner.configurator.release(old).await;
            }
            live.interface = Some(self.apply_interface(params).await?);
            return Ok(());
        }

        let fresh = self.apply_interface(params).await?;
        let old = live.interface.replace(fresh);
        if let (Some(old), Some(current)) = (old, live.interface.as_ref()) {
            self.inner.configurator.release_superseded(old, current).await;
        }
        Ok(())
    }

    /// Sleep before the next attempt. Returns false if cancelled.
    ///
    /// A network coming back cuts the wait short.
    async fn wait_backoff(&mut self, delay: Duration) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        if delay.is_zero() {
            return true;
        }

        debug!(delay_ms = delay.as_millis() as u64, "Waiting before next attempt");
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                _ = &mut sleep => return true,
                event = self.events.recv(), if self.events_open => match event {
                    Some(NetworkEvent::Available | NetworkEvent::Changed) => {
                        info!(?event, "Network back, retrying now");
                        return true;
                    }
                    Some(NetworkEvent::Lost) => debug!("Network lost while waiting"),
                    None => self.events_open = false,
                },
            }
        }
    }

    async fn stop_pump(&self, live: &mut Live) {
        live.notices = None;
        if let Some(pump) = live.pump.take() {
            if let Err(err) = pump.stop().await {
                debug!(error = %err, "Packet pump ended with error");
            }
        }
    }

    /// Release everything in reverse acquisition order.
    async fn teardown(&self, live: &mut Live) {
        self.stop_pump(live).await;
        if let Some(interface) = live.interface.take() {
            self.inner.configurator.release(interface).await;
        }
        if let Some(session) = live.session.take() {
            session.close().await;
        }
    }
}
