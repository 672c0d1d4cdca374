//! UDP forwarder (§4.10): per-5-tuple mapping table, one connected socket
//! per mapping, idle-expiry sweep. Generalized from the same
//! semaphore-gated-admission idiom as `tcp_forwarder.rs`
//! (`ferrotunnel-http::tcp_ingress`), replacing "accept a stream" with
//! "first datagram from a new (client_ip, client_port) pair creates a
//! mapping".

use crate::config::{IdleTimeoutsConfig, LimitsConfig};
use crate::tcp_forwarder::ForwardObserver;
use crate::upstream_manager::UpstreamManager;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Mutex, Semaphore};

const UDP_RECV_BUFFER: usize = 64 * 1024;

struct UdpMapping {
    socket: Arc<UdpSocket>,
    upstream_tag: String,
    last_activity: Instant,
}

pub struct UdpForwarder {
    listen_addr: SocketAddr,
    manager: Arc<UpstreamManager>,
    observer: Arc<dyn ForwardObserver>,
    limits: LimitsConfig,
    idle: IdleTimeoutsConfig,
    semaphore: Arc<Semaphore>,
    mappings: Arc<Mutex<HashMap<SocketAddr, UdpMapping>>>,
}

impl UdpForwarder {
    pub fn new(
        listen_addr: SocketAddr,
        manager: Arc<UpstreamManager>,
        observer: Arc<dyn ForwardObserver>,
        limits: LimitsConfig,
        idle: IdleTimeoutsConfig,
    ) -> Self {
        Self {
            listen_addr,
            manager,
            observer,
            semaphore: Arc::new(Semaphore::new(limits.max_udp_mappings)),
            limits,
            idle,
            mappings: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of mappings currently pinned to `tag`, reported to the metrics
    /// sink (§6 "active flow counts").
    pub async fn active_flow_count(&self, tag: &str) -> usize {
        self.mappings.lock().await.values().filter(|m| m.upstream_tag == tag).count()
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> std::io::Result<()> {
        let socket = Arc::new(UdpSocket::bind(self.listen_addr).await?);
        tracing::info!(addr = %self.listen_addr, "udp forwarder listening");

        let reaper = self.clone();
        let reaper_shutdown = shutdown.resubscribe();
        let reaper_handle = tokio::spawn(async move { reaper.run_reaper(reaper_shutdown).await });

        let mut buf = vec![0u8; UDP_RECV_BUFFER];
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(addr = %self.listen_addr, "udp forwarder shutting down");
                    reaper_handle.abort();
                    return Ok(());
                }
                recvd = socket.recv_from(&mut buf) => {
                    let (n, client_addr) = match recvd {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::warn!(error = %e, "udp recv failed");
                            continue;
                        }
                    };
                    self.handle_datagram(&socket, client_addr, &buf[..n]).await;
                }
            }
        }
    }

    async fn handle_datagram(&self, listener: &Arc<UdpSocket>, client_addr: SocketAddr, payload: &[u8]) {
        let existing_tag = {
            let mut mappings = self.mappings.lock().await;
            if let Some(mapping) = mappings.get_mut(&client_addr) {
                mapping.last_activity = Instant::now();
                let upstream_socket = mapping.socket.clone();
                let tag = mapping.upstream_tag.clone();
                drop(mappings);
                if let Err(e) = upstream_socket.send(payload).await {
                    tracing::warn!(peer = %client_addr, upstream = %tag, error = %e, "udp forward send failed");
                }
                self.observer.bytes_transferred(&tag, payload.len() as u64, 0);
                Some(tag)
            } else {
                None
            }
        };
        if existing_tag.is_some() {
            return;
        }

        let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
            tracing::warn!(peer = %client_addr, limit = self.limits.max_udp_mappings, "udp mapping limit reached, dropping packet");
            return;
        };

        let tag = match self.manager.select_primary().await {
            Ok(tag) => tag,
            Err(e) => {
                tracing::warn!(peer = %client_addr, error = %e, "no usable primary, dropping packet");
                return;
            }
        };
        let Some(active_ip) = self.manager.active_ip(&tag).await else {
            tracing::warn!(peer = %client_addr, upstream = %tag, "upstream has no active ip");
            return;
        };
        let upstream_addr = SocketAddr::new(active_ip, self.listen_addr.port());

        let upstream_socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
            Ok(s) => Arc::new(s),
            Err(e) => {
                tracing::warn!(peer = %client_addr, error = %e, "failed to open upstream udp socket");
                return;
            }
        };
        if let Err(e) = upstream_socket.connect(upstream_addr).await {
            tracing::warn!(peer = %client_addr, upstream = %tag, error = %e, "udp connect failed");
            self.manager.record_dial_failure(&tag).await;
            return;
        }
        if let Err(e) = upstream_socket.send(payload).await {
            tracing::warn!(peer = %client_addr, upstream = %tag, error = %e, "udp initial send failed");
            return;
        }
        self.observer.bytes_transferred(&tag, payload.len() as u64, 0);

        self.mappings.lock().await.insert(
            client_addr,
            UdpMapping {
                socket: upstream_socket.clone(),
                upstream_tag: tag.clone(),
                last_activity: Instant::now(),
            },
        );

        let listener = listener.clone();
        let mappings = self.mappings.clone();
        let observer = self.observer.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let mut buf = vec![0u8; UDP_RECV_BUFFER];
            loop {
                match upstream_socket.recv(&mut buf).await {
                    Ok(n) => {
                        if listener.send_to(&buf[..n], client_addr).await.is_err() {
                            break;
                        }
                        observer.bytes_transferred(&tag, 0, n as u64);
                        if let Some(mapping) = mappings.lock().await.get_mut(&client_addr) {
                            mapping.last_activity = Instant::now();
                        }
                    }
                    Err(_) => break,
                }
            }
        });
    }

    async fn run_reaper(&self, mut shutdown: broadcast::Receiver<()>) {
        let idle_timeout = Duration::from_secs(self.idle.udp_seconds);
        let mut tick = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = tick.tick() => {
                    let mut mappings = self.mappings.lock().await;
                    mappings.retain(|addr, mapping| {
                        let keep = mapping.last_activity.elapsed() < idle_timeout;
                        if !keep {
                            tracing::debug!(peer = %addr, upstream = %mapping.upstream_tag, "udp mapping idle, removing");
                        }
                        keep
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ScoringConfig, SwitchingConfig};
    use crate::model::Upstream;
    use crate::tcp_forwarder::NoopObserver;

    async fn echo_udp(addr: SocketAddr) {
        let socket = UdpSocket::bind(addr).await.unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                let Ok((n, peer)) = socket.recv_from(&mut buf).await else { return };
                let _ = socket.send_to(&buf[..n], peer).await;
            }
        });
    }

    #[tokio::test]
    async fn first_datagram_creates_mapping_and_replies_flow_back() {
        let upstream_addr: SocketAddr = "127.0.0.3:18902".parse().unwrap();
        echo_udp(upstream_addr).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut upstream = Upstream::new("echo-udp", "127.0.0.3", "127.0.0.3:19002".parse().unwrap());
        upstream.reachable = true;
        upstream.active_ip = Some(upstream_addr.ip());

        let manager = Arc::new(UpstreamManager::new(
            vec![upstream],
            ScoringConfig::default(),
            SwitchingConfig::default(),
            Duration::from_secs(3600),
            Duration::ZERO,
        ));
        manager.set_manual("echo-udp".to_string()).await.unwrap();

        let listen_addr: SocketAddr = "127.0.0.1:18902".parse().unwrap();
        let forwarder = Arc::new(UdpForwarder::new(
            listen_addr,
            manager,
            Arc::new(NoopObserver),
            LimitsConfig::default(),
            IdleTimeoutsConfig::default(),
        ));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(forwarder.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(listen_addr).await.unwrap();
        client.send(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        let n = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"ping");

        let _ = shutdown_tx.send(());
        let _ = handle.await;
    }
}
