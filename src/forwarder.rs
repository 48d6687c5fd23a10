//! UDP forwarder
//!
//! Relays datagrams between clients and one upstream address through the
//! shaper. Each client source address gets its own upstream socket and a pair
//! of flows (client to upstream, upstream to client), so every client competes
//! for the same simulated link.

use crate::errors::{Result, SimError};
use crate::settings::ForwardSettings;
use crate::shaper::{FlowHandle, TrafficShaper};
use crate::types::Delivered;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const MAX_DATAGRAM: usize = 65_535;

type Datagram = Vec<u8>;

/// One client's upstream socket and its two flows
struct ClientSession {
    client: SocketAddr,
    to_upstream: FlowHandle<Datagram>,
    last_seen: Arc<Mutex<Instant>>,
    /// Owns the upstream-to-client flow; aborting it cancels that flow
    upstream_reader: JoinHandle<()>,
}

impl ClientSession {
    async fn open(
        client: SocketAddr,
        upstream_addr: SocketAddr,
        listener: Arc<UdpSocket>,
        shaper: &TrafficShaper,
    ) -> Result<Self> {
        let bind_addr = if upstream_addr.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let upstream = Arc::new(UdpSocket::bind(bind_addr).await?);
        upstream.connect(upstream_addr).await?;

        let (to_upstream, upstream_rx) = shaper.open_flow::<Datagram>();
        let (to_client, client_rx) = shaper.open_flow::<Datagram>();
        let last_seen = Arc::new(Mutex::new(Instant::now()));

        tokio::spawn(pump_to_upstream(upstream.clone(), upstream_rx));
        tokio::spawn(pump_to_client(listener, client, client_rx));
        let upstream_reader = tokio::spawn(read_upstream(upstream, to_client, last_seen.clone()));

        info!(client = %client, upstream = %upstream_addr, "New forwarding session");
        Ok(Self {
            client,
            to_upstream,
            last_seen,
            upstream_reader,
        })
    }

    fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_seen.lock())
    }

    /// Cancel both flows, discarding anything still in flight
    async fn close(self) {
        let summary = self.to_upstream.cancel().await;
        self.upstream_reader.abort();
        let _ = self.upstream_reader.await;
        debug!(client = %self.client, ?summary, "Closed forwarding session");
    }
}

async fn pump_to_upstream(
    upstream: Arc<UdpSocket>,
    mut rx: mpsc::UnboundedReceiver<Delivered<Datagram>>,
) {
    while let Some(unit) = rx.recv().await {
        if let Err(e) = upstream.send(&unit.payload).await {
            debug!("Failed to send to upstream: {}", e);
        }
    }
}

async fn pump_to_client(
    listener: Arc<UdpSocket>,
    client: SocketAddr,
    mut rx: mpsc::UnboundedReceiver<Delivered<Datagram>>,
) {
    while let Some(unit) = rx.recv().await {
        if let Err(e) = listener.send_to(&unit.payload, client).await {
            debug!(client = %client, "Failed to send to client: {}", e);
        }
    }
}

async fn read_upstream(
    upstream: Arc<UdpSocket>,
    to_client: FlowHandle<Datagram>,
    last_seen: Arc<Mutex<Instant>>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match upstream.recv(&mut buf).await {
            Ok(len) => {
                *last_seen.lock() = Instant::now();
                if let Err(e) = to_client.submit(len, buf[..len].to_vec()) {
                    debug!("Upstream reader stopping: {}", e);
                    break;
                }
            }
            // ICMP errors surface here on connected sockets; the session stays up
            Err(e) => debug!("Failed to receive from upstream: {}", e),
        }
    }
}

/// UDP forwarder shaping both directions of every client session
pub struct UdpForwarder {
    settings: ForwardSettings,
    shaper: Arc<TrafficShaper>,
    local_addr: Option<SocketAddr>,
    clients: Arc<AtomicUsize>,
    handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl UdpForwarder {
    pub fn new(settings: ForwardSettings, shaper: Arc<TrafficShaper>) -> Self {
        Self {
            settings,
            shaper,
            local_addr: None,
            clients: Arc::new(AtomicUsize::new(0)),
            handle: None,
            shutdown_tx: None,
        }
    }

    /// Bind the listen address and start relaying; returns the bound address
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if let Some(addr) = self.local_addr {
            if self.handle.is_some() {
                return Ok(addr);
            }
        }

        let listener = UdpSocket::bind(self.settings.listen_addr)
            .await
            .map_err(|e| {
                SimError::ForwarderBind(format!("{}: {}", self.settings.listen_addr, e))
            })?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(run_forwarder(
            Arc::new(listener),
            self.settings.clone(),
            self.shaper.clone(),
            self.clients.clone(),
            shutdown_rx,
        ));

        self.local_addr = Some(local_addr);
        self.shutdown_tx = Some(shutdown_tx);
        self.handle = Some(handle);

        info!(
            "Started forwarder: {} -> {}",
            local_addr, self.settings.upstream_addr
        );
        Ok(local_addr)
    }

    /// Stop relaying and cancel every session
    pub async fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Clients with a live session
    pub fn active_clients(&self) -> usize {
        self.clients.load(Ordering::Relaxed)
    }
}

impl Drop for UdpForwarder {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
    }
}

async fn run_forwarder(
    listener: Arc<UdpSocket>,
    settings: ForwardSettings,
    shaper: Arc<TrafficShaper>,
    clients: Arc<AtomicUsize>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let idle_timeout = settings.idle_timeout();
    let mut reaper = tokio::time::interval((idle_timeout / 2).max(Duration::from_millis(10)));
    reaper.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut sessions: HashMap<SocketAddr, ClientSession> = HashMap::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                info!("UDP forwarder shutting down");
                break;
            }

            _ = reaper.tick() => {
                let now = Instant::now();
                let idle: Vec<SocketAddr> = sessions
                    .iter()
                    .filter(|(_, s)| s.idle_for(now) >= idle_timeout)
                    .map(|(addr, _)| *addr)
                    .collect();
                for addr in idle {
                    if let Some(session) = sessions.remove(&addr) {
                        info!(client = %addr, "Session idle, cancelling its flows");
                        session.close().await;
                    }
                }
                clients.store(sessions.len(), Ordering::Relaxed);
            }

            result = listener.recv_from(&mut buf) => {
                let (len, client) = match result {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("Failed to receive packet: {}", e);
                        continue;
                    }
                };

                if !sessions.contains_key(&client) {
                    match ClientSession::open(client, settings.upstream_addr, listener.clone(), &shaper).await {
                        Ok(session) => {
                            sessions.insert(client, session);
                            clients.store(sessions.len(), Ordering::Relaxed);
                        }
                        Err(e) => {
                            warn!(client = %client, "Failed to open session: {}", e);
                            continue;
                        }
                    }
                }

                if let Some(session) = sessions.get(&client) {
                    session.touch();
                    if let Err(e) = session.to_upstream.submit(len, buf[..len].to_vec()) {
                        debug!(client = %client, "Dropped datagram: {}", e);
                    }
                }
            }
        }
    }

    for (_, session) in sessions.drain() {
        session.close().await;
    }
    clients.store(0, Ordering::Relaxed);
}
