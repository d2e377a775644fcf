//! Packet forwarding between the virtual interface and the transport.
//!
//! Three tasks cooperate:
//! - the interface reader pushes outbound packets onto a bounded queue,
//! - the transport writer drains the queue into `TransportChannel::send`,
//! - the transport reader writes inbound packets to the interface.
//!
//! A fatal error in any task stops the others. Per-direction order is
//! preserved.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::PumpOptions;
use crate::network::TunDevice;
use crate::transport::{Inbound, TransportChannel, TransportError};
use crate::types::TrafficStats;

/// Errors that end a pump run.
#[derive(Debug, Error)]
pub enum PumpError {
    /// Reading from or writing to the virtual interface failed
    #[error("Interface I/O error: {0}")]
    Interface(#[from] io::Error),

    /// The transport failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The gateway closed the session
    #[error("Session closed by peer")]
    SessionClosed,

    /// A forwarding task panicked or was aborted
    #[error("Pump task failed: {0}")]
    Task(String),

    /// More than one direction failed
    #[error("{}", MultipleErrors(.0))]
    Multiple(Vec<PumpError>),
}

struct MultipleErrors<'a>(&'a [PumpError]);

impl fmt::Display for MultipleErrors<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "multiple pump errors: ")?;
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

/// Out-of-band signals from the pump to the manager.
#[derive(Debug)]
pub enum PumpNotice {
    /// The gateway asked for new keys
    RenegotiationRequested,
    /// The pump stopped on its own
    Failed(PumpError),
}

fn is_transient(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Bounded FIFO between the interface reader and the transport writer.
///
/// When full, `push` waits up to the block timeout for space and then
/// evicts the oldest packet.
struct OutboundQueue {
    packets: Mutex<VecDeque<Vec<u8>>>,
    capacity: usize,
    space: Notify,
    items: Notify,
}

impl OutboundQueue {
    fn new(capacity: usize) -> Self {
        OutboundQueue {
            packets: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            space: Notify::new(),
            items: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Vec<u8>>> {
        self.packets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue a packet. Returns true if an older packet was evicted.
    async fn push(&self, packet: Vec<u8>, block_timeout: Duration) -> bool {
        let deadline = Instant::now() + block_timeout;
        loop {
            {
                let mut queue = self.lock();
                if queue.len() < self.capacity {
                    queue.push_back(packet);
                    drop(queue);
                    self.items.notify_one();
                    return false;
                }
            }
            if tokio::time::timeout_at(deadline, self.space.notified())
                .await
                .is_err()
            {
                break;
            }
        }

        let mut queue = self.lock();
        queue.pop_front();
        queue.push_back(packet);
        drop(queue);
        self.items.notify_one();
        true
    }

    async fn pop(&self) -> Vec<u8> {
        loop {
            if let Some(packet) = self.lock().pop_front() {
                self.space.notify_one();
                return packet;
            }
            self.items.notified().await;
        }
    }
}

/// Handle to a running pump.
pub struct PumpHandle {
    cancel: CancellationToken,
    join: JoinHandle<Result<(), PumpError>>,
}

impl PumpHandle {
    /// Stop the pump and wait for its tasks to finish.
    pub async fn stop(self) -> Result<(), PumpError> {
        self.cancel.cancel();
        match self.join.await {
            Ok(res) => res,
            Err(join_err) => Err(PumpError::Task(join_err.to_string())),
        }
    }
}

/// Forwards packets for one interface/session pair.
pub struct PacketPump {
    device: Arc<dyn TunDevice>,
    channel: Arc<dyn TransportChannel>,
    stats: Arc<TrafficStats>,
    options: PumpOptions,
    mtu: usize,
}

impl PacketPump {
    pub fn new(
        device: Arc<dyn TunDevice>,
        channel: Arc<dyn TransportChannel>,
        stats: Arc<TrafficStats>,
        options: PumpOptions,
        mtu: u32,
    ) -> Self {
        PacketPump {
            device,
            channel,
            stats,
            options,
            mtu: mtu as usize,
        }
    }

    /// Run the pump in the background.
    ///
    /// If the pump stops for any reason other than `cancel`, the error is
    /// reported as [`PumpNotice::Failed`].
    pub fn spawn(
        self,
        notices: mpsc::UnboundedSender<PumpNotice>,
        cancel: CancellationToken,
    ) -> PumpHandle {
        let task_cancel = cancel.clone();
        let join = tokio::spawn(async move {
            let result = self.run(notices.clone(), task_cancel.clone()).await;
            if !task_cancel.is_cancelled() {
                let err = match result {
                    Ok(()) => PumpError::SessionClosed,
                    Err(err) => err,
                };
                let _ = notices.send(PumpNotice::Failed(err));
                return Ok(());
            }
            result
        });
        PumpHandle { cancel, join }
    }

    /// Forward packets until `cancel` fires or a direction fails.
    pub async fn run(
        self,
        notices: mpsc::UnboundedSender<PumpNotice>,
        cancel: CancellationToken,
    ) -> Result<(), PumpError> {
        // Any task failing stops its siblings without cancelling the caller
        let stop = cancel.child_token();
        let queue = Arc::new(OutboundQueue::new(self.options.queue_depth));

        let interface_reader = {
            let device = Arc::clone(&self.device);
            let queue = Arc::clone(&queue);
            let stats = Arc::clone(&self.stats);
            let stop = stop.clone();
            let block_timeout = self.options.block_timeout;
            // Room for the largest packet the interface can hand us
            let mut buf = vec![0u8; self.mtu.max(1500) + 64];
            tokio::spawn(async move {
                loop {
                    let read = tokio::select! {
                        biased;
                        _ = stop.cancelled() => return Ok(()),
                        read = device.read_packet(&mut buf) => read,
                    };
                    match read {
                        Ok(0) => continue,
                        Ok(n) => {
                            let evicted = tokio::select! {
                                biased;
                                _ = stop.cancelled() => return Ok(()),
                                evicted = queue.push(buf[..n].to_vec(), block_timeout) => evicted,
                            };
                            if evicted {
                                stats.record_drop();
                                trace!("Outbound queue full, dropped oldest packet");
                            }
                        }
                        Err(e) if is_transient(e.kind()) => {
                            trace!(error = %e, "Transient interface read error");
                        }
                        Err(e) => {
                            warn!(error = %e, "Interface read failed");
                            stop.cancel();
                            return Err(PumpError::Interface(e));
                        }
                    }
                }
            })
        };

        let transport_writer = {
            let channel = Arc::clone(&self.channel);
            let queue = Arc::clone(&queue);
            let stats = Arc::clone(&self.stats);
            let stop = stop.clone();
            tokio::spawn(async move {
                loop {
                    let packet = tokio::select! {
                        biased;
                        _ = stop.cancelled() => return Ok(()),
                        packet = queue.pop() => packet,
                    };
                    let sent = tokio::select! {
                        biased;
                        _ = stop.cancelled() => return Ok(()),
                        sent = channel.send(&packet) => sent,
                    };
                    if let Err(e) = sent {
                        warn!(error = %e, "Transport send failed");
                        stop.cancel();
                        return Err(PumpError::Transport(e));
                    }
                    stats.record_outbound(packet.len());
                }
            })
        };

        let transport_reader = {
            let channel = Arc::clone(&self.channel);
            let device = Arc::clone(&self.device);
            let stats = Arc::clone(&self.stats);
            let stop = stop.clone();
            tokio::spawn(async move {
                loop {
                    let inbound = tokio::select! {
                        biased;
                        _ = stop.cancelled() => return Ok(()),
                        inbound = channel.receive() => inbound,
                    };
                    match inbound {
                        Ok(Inbound::Packet(packet)) => {
                            stats.record_inbound(packet.len());
                            let written = tokio::select! {
                                biased;
                                _ = stop.cancelled() => return Ok(()),
                                written = device.write_packet(&packet) => written,
                            };
                            if let Err(e) = written {
                                if is_transient(e.kind()) {
                                    trace!(error = %e, "Dropped inbound packet on transient error");
                                    continue;
                                }
                                warn!(error = %e, "Interface write failed");
                                stop.cancel();
                                return Err(PumpError::Interface(e));
                            }
                        }
                        Ok(Inbound::Keepalive) => stats.touch(),
                        Ok(Inbound::RenegotiationRequested) => {
                            debug!("Gateway requested renegotiation");
                            stats.touch();
                            let _ = notices.send(PumpNotice::RenegotiationRequested);
                        }
                        Ok(Inbound::Closed) => {
                            debug!("Gateway closed the session");
                            stop.cancel();
                            return Err(PumpError::SessionClosed);
                        }
                        Err(e) => {
                            warn!(error = %e, "Transport receive failed");
                            stop.cancel();
                            return Err(PumpError::Transport(e));
                        }
                    }
                }
            })
        };

        let mut errors = Vec::new();
        for task in [interface_reader, transport_writer, transport_reader] {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => errors.push(err),
                Err(join_err) => {
                    stop.cancel();
                    errors.push(PumpError::Task(join_err.to_string()));
                }
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(PumpError::Multiple(errors)),
        }
    }
}
