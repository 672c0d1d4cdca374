//! TCP forwarder (§4.9): one accept loop per listener, admit-and-pin on
//! accept, two concurrent copy loops. Grounded directly on
//! `ferrotunnel-http::tcp_ingress::TcpIngress` (semaphore-limited accept
//! loop, `TCP_NODELAY`, timeout-wrapped `copy_bidirectional_with_sizes`,
//! structured per-connection tracing), generalized from "forward into a
//! tunnel multiplexer" to "dial the scored primary upstream on the same
//! port".

use crate::config::{IdleTimeoutsConfig, LimitsConfig};
use crate::model::Flow;
use crate::upstream_manager::UpstreamManager;
use fbforward_protocol::Protocol;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock, Semaphore};
use tokio::time::timeout;

const TCP_COPY_BUFFER_SIZE: usize = 64 * 1024;
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

pub type FlowTable = Arc<RwLock<std::collections::HashMap<String, Flow>>>;

/// Observes byte counts and flow lifecycle; the real implementation is the
/// status/metrics sinks (§6), this trait only narrows what the forwarder
/// needs from them.
pub trait ForwardObserver: Send + Sync {
    fn flow_opened(&self, flow: &Flow);
    fn flow_closed(&self, flow: &Flow);
    fn bytes_transferred(&self, upstream_tag: &str, up: u64, down: u64);
}

pub struct NoopObserver;
impl ForwardObserver for NoopObserver {
    fn flow_opened(&self, _flow: &Flow) {}
    fn flow_closed(&self, _flow: &Flow) {}
    fn bytes_transferred(&self, _upstream_tag: &str, _up: u64, _down: u64) {}
}

pub struct TcpForwarder {
    listen_addr: SocketAddr,
    manager: Arc<UpstreamManager>,
    flows: FlowTable,
    observer: Arc<dyn ForwardObserver>,
    limits: LimitsConfig,
    idle: IdleTimeoutsConfig,
    semaphore: Arc<Semaphore>,
    next_flow_id: AtomicU64,
}

impl TcpForwarder {
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
            flows: Arc::new(RwLock::new(std::collections::HashMap::new())),
            observer,
            semaphore: Arc::new(Semaphore::new(limits.max_tcp_connections)),
            limits,
            idle,
            next_flow_id: AtomicU64::new(0),
        }
    }

    pub fn flow_table(&self) -> FlowTable {
        self.flows.clone()
    }

    /// Number of flows currently pinned to `tag`, reported to the metrics
    /// sink (§6 "active flow counts").
    pub async fn active_flow_count(&self, tag: &str) -> usize {
        self.flows.read().await.values().filter(|f| f.upstream_tag == tag).count()
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        tracing::info!(addr = %self.listen_addr, "tcp forwarder listening");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(addr = %self.listen_addr, "tcp forwarder shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::warn!(error = %e, "tcp accept failed");
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::warn!(peer = %peer_addr, error = %e, "failed to set TCP_NODELAY");
                    }

                    let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                        tracing::warn!(peer = %peer_addr, limit = self.limits.max_tcp_connections, "tcp connection limit reached, rejecting");
                        drop(stream);
                        continue;
                    };

                    let this = self.clone();
                    let shutdown_rx = shutdown.resubscribe();
                    tokio::spawn(async move {
                        let _permit = permit;
                        this.handle_connection(stream, peer_addr, shutdown_rx).await;
                    });
                }
            }
        }
    }

    async fn handle_connection(&self, client: TcpStream, peer_addr: SocketAddr, mut shutdown: broadcast::Receiver<()>) {
        let tag = match self.manager.select_primary().await {
            Ok(tag) => tag,
            Err(e) => {
                tracing::warn!(peer = %peer_addr, error = %e, "no usable primary, closing client");
                return;
            }
        };

        let Some(active_ip) = self.manager.active_ip(&tag).await else {
            tracing::warn!(peer = %peer_addr, upstream = %tag, "upstream has no active ip");
            return;
        };
        let upstream_addr = SocketAddr::new(active_ip, self.listen_addr.port());

        let upstream = match timeout(DIAL_TIMEOUT, TcpStream::connect(upstream_addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::warn!(peer = %peer_addr, upstream = %tag, error = %e, "dial failed");
                self.manager.record_dial_failure(&tag).await;
                return;
            }
            Err(_) => {
                tracing::warn!(peer = %peer_addr, upstream = %tag, "dial timed out");
                self.manager.record_dial_failure(&tag).await;
                return;
            }
        };
        let _ = upstream.set_nodelay(true);

        let flow_id = format!("tcp-{}", self.next_flow_id.fetch_add(1, Ordering::Relaxed));
        let flow = Flow::new(flow_id.clone(), Protocol::Tcp, peer_addr, self.listen_addr, tag.clone());
        self.flows.write().await.insert(flow_id.clone(), flow.clone());
        self.observer.flow_opened(&flow);

        let idle_timeout = Duration::from_secs(self.idle.tcp_seconds);
        let result = tokio::select! {
            r = timeout(idle_timeout, copy_both_ways(client, upstream)) => r,
            _ = shutdown.recv() => Ok(Ok((0, 0))),
        };

        match result {
            Ok(Ok((to_upstream, to_client))) => {
                self.observer.bytes_transferred(&tag, to_upstream, to_client);
                tracing::info!(peer = %peer_addr, upstream = %tag, bytes_up = to_upstream, bytes_down = to_client, "tcp flow closed");
            }
            Ok(Err(e)) => {
                tracing::warn!(peer = %peer_addr, upstream = %tag, error = %e, "tcp copy error");
            }
            Err(_) => {
                tracing::info!(peer = %peer_addr, upstream = %tag, "tcp flow idle timeout");
            }
        }

        if let Some(flow) = self.flows.write().await.remove(&flow_id) {
            self.observer.flow_closed(&flow);
        }
    }
}

async fn copy_both_ways(mut client: TcpStream, mut upstream: TcpStream) -> std::io::Result<(u64, u64)> {
    let result = tokio::io::copy_bidirectional_with_sizes(&mut client, &mut upstream, TCP_COPY_BUFFER_SIZE, TCP_COPY_BUFFER_SIZE).await;
    let _ = client.shutdown().await;
    let _ = upstream.shutdown().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ScoringConfig, SwitchingConfig};
    use crate::model::Upstream;
    use tokio::io::{AsyncReadExt, AsyncWriteExt as _};

    async fn echo_server(addr: SocketAddr) {
        let listener = TcpListener::bind(addr).await.unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else { return };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
        });
    }

    #[tokio::test]
    async fn forwarded_connection_round_trips_bytes_through_echo_upstream() {
        // Same port (18802) on a different loopback address, matching the
        // "dial at the same port as the listener" pinning rule.
        let upstream_addr: SocketAddr = "127.0.0.2:18802".parse().unwrap();
        echo_server(upstream_addr).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut upstream = Upstream::new("echo", "127.0.0.2", "127.0.0.2:18902".parse().unwrap());
        upstream.reachable = true;
        upstream.active_ip = Some(upstream_addr.ip());

        let manager = Arc::new(UpstreamManager::new(
            vec![upstream],
            ScoringConfig::default(),
            SwitchingConfig::default(),
            Duration::from_secs(3600),
            Duration::ZERO,
        ));
        manager.set_manual("echo".to_string()).await.unwrap();

        let listen_addr: SocketAddr = "127.0.0.1:18802".parse().unwrap();
        let forwarder = Arc::new(TcpForwarder::new(
            listen_addr,
            manager,
            Arc::new(NoopObserver),
            LimitsConfig::default(),
            IdleTimeoutsConfig::default(),
        ));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(forwarder.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut client = TcpStream::connect(listen_addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        let _ = shutdown_tx.send(());
        let _ = handle.await;
    }
}
