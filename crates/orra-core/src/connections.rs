use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use orra_types::EngineEvent;
use orra_wire::EngineMessage;

use crate::events::EventHub;

const SEEN_ENVELOPE_WINDOW: usize = 1024;

#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub queue_max_depth: usize,
}

/// Outcome of handing a message to the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Delivered to the live connection.
    Sent,
    /// Service offline; the message joined the send queue.
    Queued,
    /// Queue at capacity. Requests are never dropped; the caller must back
    /// off (pausing its orchestration).
    QueueFull,
    /// Non-queueable message (ping/ack) with no live connection.
    Dropped,
}

struct ServiceLink {
    project_id: String,
    /// Bumped per handshake so a stale socket cannot detach its successor.
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<EngineMessage>>,
    queue: VecDeque<EngineMessage>,
    pending_ping: Option<String>,
    missed_pongs: u8,
    seen_order: VecDeque<String>,
    seen: HashSet<String>,
}

impl ServiceLink {
    fn new(project_id: String) -> Self {
        Self {
            project_id,
            generation: 0,
            outbound: None,
            queue: VecDeque::new(),
            pending_ping: None,
            missed_pongs: 0,
            seen_order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    fn is_connected(&self) -> bool {
        self.outbound.is_some()
    }
}

/// Owns the live side of every service channel: at most one connection per
/// service id, a bounded send queue across disconnects and heartbeat-based
/// liveness. Connections are soft state; identity is the service id.
pub struct ConnectionManager {
    links: RwLock<HashMap<String, ServiceLink>>,
    events: EventHub,
    settings: ConnectionSettings,
}

impl ConnectionManager {
    pub fn new(settings: ConnectionSettings, events: EventHub) -> Arc<Self> {
        Arc::new(Self {
            links: RwLock::new(HashMap::new()),
            events,
            settings,
        })
    }

    /// Bind a freshly handshaken connection. A previous live connection for
    /// the same service is evicted by dropping its outbound sender. Queued
    /// messages flush in enqueue order.
    pub async fn attach(
        &self,
        project_id: &str,
        service_id: &str,
        outbound: mpsc::UnboundedSender<EngineMessage>,
    ) -> u64 {
        let mut links = self.links.write().await;
        let link = links
            .entry(service_id.to_string())
            .or_insert_with(|| ServiceLink::new(project_id.to_string()));
        let evicting = link.outbound.take().is_some();
        link.generation += 1;
        link.project_id = project_id.to_string();
        link.missed_pongs = 0;
        link.pending_ping = None;

        let mut flushed = 0usize;
        while let Some(msg) = link.queue.pop_front() {
            if outbound.send(msg).is_err() {
                break;
            }
            flushed += 1;
        }
        link.outbound = Some(outbound);
        let generation = link.generation;
        drop(links);

        tracing::info!(
            target: "orra.conn",
            service_id,
            evicted_previous = evicting,
            flushed,
            "service connected"
        );
        self.events.emit(EngineEvent::ServiceConnected {
            project_id: project_id.to_string(),
            service_id: service_id.to_string(),
        });
        generation
    }

    /// Unbind a connection. No-op when `generation` is stale (the socket was
    /// already evicted by a newer handshake).
    pub async fn detach(&self, service_id: &str, generation: u64) {
        let mut links = self.links.write().await;
        let Some(link) = links.get_mut(service_id) else {
            return;
        };
        if link.generation != generation || !link.is_connected() {
            return;
        }
        link.outbound = None;
        link.pending_ping = None;
        let project_id = link.project_id.clone();
        drop(links);

        tracing::info!(target: "orra.conn", service_id, "service disconnected");
        self.events.emit(EngineEvent::ServiceDisconnected {
            project_id,
            service_id: service_id.to_string(),
        });
    }

    pub async fn is_connected(&self, service_id: &str) -> bool {
        self.links
            .read()
            .await
            .get(service_id)
            .map(ServiceLink::is_connected)
            .unwrap_or(false)
    }

    /// Deliver or queue a message for a service. Requests queue across
    /// disconnects up to the depth cap; pings and acks never queue.
    pub async fn send(
        &self,
        project_id: &str,
        service_id: &str,
        msg: EngineMessage,
    ) -> SendOutcome {
        let mut links = self.links.write().await;
        let link = links
            .entry(service_id.to_string())
            .or_insert_with(|| ServiceLink::new(project_id.to_string()));

        if let Some(outbound) = &link.outbound {
            match outbound.send(msg) {
                Ok(()) => return SendOutcome::Sent,
                Err(mpsc::error::SendError(msg)) => {
                    // Writer went away without a detach; treat as dead.
                    link.outbound = None;
                    link.pending_ping = None;
                    let project_id = link.project_id.clone();
                    let outcome = Self::enqueue(link, msg, self.settings.queue_max_depth);
                    drop(links);
                    self.events.emit(EngineEvent::ServiceDisconnected {
                        project_id,
                        service_id: service_id.to_string(),
                    });
                    return outcome;
                }
            }
        }

        Self::enqueue(link, msg, self.settings.queue_max_depth)
    }

    fn enqueue(link: &mut ServiceLink, msg: EngineMessage, cap: usize) -> SendOutcome {
        if !msg.is_queueable() {
            return SendOutcome::Dropped;
        }
        if link.queue.len() >= cap {
            return SendOutcome::QueueFull;
        }
        link.queue.push_back(msg);
        SendOutcome::Queued
    }

    pub async fn queue_depth(&self, service_id: &str) -> usize {
        self.links
            .read()
            .await
            .get(service_id)
            .map(|l| l.queue.len())
            .unwrap_or(0)
    }

    /// First-sighting check for a service envelope id. Duplicates (service
    /// retries of unacked envelopes) return false and are only re-ACKed.
    pub async fn note_envelope(&self, project_id: &str, service_id: &str, envelope_id: &str) -> bool {
        let mut links = self.links.write().await;
        let link = links
            .entry(service_id.to_string())
            .or_insert_with(|| ServiceLink::new(project_id.to_string()));
        if link.seen.contains(envelope_id) {
            return false;
        }
        link.seen.insert(envelope_id.to_string());
        link.seen_order.push_back(envelope_id.to_string());
        while link.seen_order.len() > SEEN_ENVELOPE_WINDOW {
            if let Some(old) = link.seen_order.pop_front() {
                link.seen.remove(&old);
            }
        }
        true
    }

    pub async fn handle_pong(&self, service_id: &str, ping_id: &str) {
        let mut links = self.links.write().await;
        if let Some(link) = links.get_mut(service_id) {
            if link.pending_ping.as_deref() == Some(ping_id) {
                link.pending_ping = None;
                link.missed_pongs = 0;
            }
        }
    }

    /// Probe every live connection, wait out the pong window, then evaluate.
    /// Two consecutive misses mark the connection dead.
    async fn heartbeat_tick(&self) {
        let probed: Vec<String> = {
            let mut links = self.links.write().await;
            let mut probed = Vec::new();
            for (service_id, link) in links.iter_mut() {
                let Some(outbound) = &link.outbound else {
                    continue;
                };
                let ping_id = format!("ping_{}", Uuid::new_v4().simple());
                if outbound
                    .send(EngineMessage::Ping {
                        id: ping_id.clone(),
                    })
                    .is_err()
                {
                    continue;
                }
                link.pending_ping = Some(ping_id);
                probed.push(service_id.clone());
            }
            probed
        };

        if probed.is_empty() {
            return;
        }
        tokio::time::sleep(self.settings.heartbeat_timeout).await;

        let mut dead = Vec::new();
        {
            let mut links = self.links.write().await;
            for service_id in probed {
                let Some(link) = links.get_mut(&service_id) else {
                    continue;
                };
                if link.pending_ping.take().is_none() {
                    continue; // pong arrived in time
                }
                link.missed_pongs += 1;
                if link.missed_pongs >= 2 && link.is_connected() {
                    link.outbound = None;
                    dead.push((link.project_id.clone(), service_id));
                }
            }
        }
        for (project_id, service_id) in dead {
            tracing::warn!(
                target: "orra.conn",
                service_id = %service_id,
                "connection marked dead after missed heartbeats"
            );
            self.events.emit(EngineEvent::ServiceDisconnected {
                project_id,
                service_id,
            });
        }
    }

    /// Background liveness loop; cancelled via the engine shutdown token.
    pub fn spawn_heartbeat(
        self: Arc<Self>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let manager = self;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(manager.settings.heartbeat_interval) => {
                        manager.heartbeat_tick().await;
                    }
                }
            }
        })
    }
}
