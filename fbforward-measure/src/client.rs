//! Measurement client (§4.3): drives a session against a measurement server
//! and aggregates the per-sample reports into throughput/RTT/loss statistics.

use crate::config::{MeasurementClientConfig, ProtocolMeasurementConfig};
use crate::error::{MeasureError, Result};
use crate::pacing;
use crate::tcp_info;
use fbforward_protocol::{
    aggregate_throughput, methods, HelloParams, HelloResult, RpcErrorCode, RpcRequest,
    RpcResponse, SampleReport, SampleStartParams, SampleStartReverseParams, SampleStopParams,
    ThroughputStats, UdpFrameType, UdpSessionFrame, DATA_CHANNEL_DOWNLOAD_HEADER,
    DATA_CHANNEL_UPLOAD_HEADER, RPC_DISPATCH_PREFIX,
};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

/// Round-trip time statistics accumulated over one sample's duration.
#[derive(Debug, Clone, Copy, Default)]
pub struct RttStats {
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub jitter_ms: f64, // stddev of samples
    pub sample_count: u32,
}

impl RttStats {
    fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
        Self {
            mean_ms: mean,
            min_ms: samples.iter().cloned().fold(f64::INFINITY, f64::min),
            max_ms: samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            jitter_ms: variance.sqrt(),
            sample_count: samples.len() as u32,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunResult {
    pub throughput: ThroughputStats,
    pub rtt: RttStats,
    pub packets_lost: u64,
    pub segments_retransmitted: u64,
    pub samples_planned: u32,
    pub samples_completed: u32,
    pub duration: Duration,
}

pub struct MeasurementClient {
    server_addr: SocketAddr,
    control: TcpStream,
    session_id: String,
    next_rpc_id: u64,
}

impl MeasurementClient {
    /// Opens the control connection and performs `session.hello` (§4.3 step 0).
    pub async fn connect(server_addr: SocketAddr) -> Result<Self> {
        let mut control = TcpStream::connect(server_addr).await?;
        control.set_nodelay(true)?;
        control.write_all(RPC_DISPATCH_PREFIX).await?;

        let mut client = Self {
            server_addr,
            control,
            session_id: String::new(),
            next_rpc_id: 1,
        };

        let hello: HelloResult = client
            .call(
                methods::SESSION_HELLO,
                serde_json::to_value(HelloParams {
                    client_version: env!("CARGO_PKG_VERSION").to_string(),
                })?,
            )
            .await?;
        client.session_id = hello.session_id;
        Ok(client)
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &mut self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T> {
        let id = self.next_rpc_id;
        self.next_rpc_id += 1;
        let req = RpcRequest::new(method, params, id);
        let data = serde_json::to_vec(&req)?;
        self.control
            .write_all(&(data.len() as u32).to_be_bytes())
            .await?;
        self.control.write_all(&data).await?;
        self.control.flush().await?;

        let mut len_buf = [0u8; 4];
        self.control.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut resp_buf = vec![0u8; len];
        self.control.read_exact(&mut resp_buf).await?;
        let resp: RpcResponse = serde_json::from_slice(&resp_buf)?;

        if let Some(err) = resp.error {
            return Err(MeasureError::Protocol(format!(
                "rpc error {}: {}",
                err.code, err.message
            )));
        }
        let result = resp.result.ok_or_else(|| {
            MeasureError::Protocol("rpc response carried neither result nor error".into())
        })?;
        Ok(serde_json::from_value(result)?)
    }

    async fn heartbeat(&mut self) -> Result<()> {
        let _: serde_json::Value = self.call(methods::HEARTBEAT, serde_json::Value::Null).await?;
        Ok(())
    }

    /// Runs `cfg.sample_count` upload samples then the same count of download
    /// samples over TCP, returning aggregated throughput, RTT and loss stats
    /// (§4.3 contract).
    pub async fn run_tcp(
        &mut self,
        cfg: &ProtocolMeasurementConfig,
        sample_wait_ms: u64,
    ) -> Result<RunResult> {
        self.run_protocol("tcp", cfg, sample_wait_ms).await
    }

    pub async fn run_udp(
        &mut self,
        cfg: &ProtocolMeasurementConfig,
        sample_wait_ms: u64,
    ) -> Result<RunResult> {
        self.run_protocol("udp", cfg, sample_wait_ms).await
    }

    async fn run_protocol(
        &mut self,
        network: &str,
        cfg: &ProtocolMeasurementConfig,
        sample_wait_ms: u64,
    ) -> Result<RunResult> {
        if !cfg.enabled {
            return Ok(RunResult::default());
        }
        let started = Instant::now();
        let mut reports = Vec::with_capacity(cfg.sample_count as usize * 2);
        let mut rtt_samples = Vec::new();
        let mut completed = 0u32;
        let total_samples = cfg.sample_count * 2;

        for i in 0..cfg.sample_count {
            let up = self
                .run_upload_sample(network, i, cfg, &mut rtt_samples)
                .await;
            if let Ok(report) = up {
                reports.push(report);
                completed += 1;
            } else {
                tracing::warn!(sample = i, network, "upload sample failed");
            }
            if sample_wait_ms > 0 {
                tokio::time::sleep(Duration::from_millis(sample_wait_ms)).await;
            }
        }
        for i in cfg.sample_count..cfg.sample_count * 2 {
            let down = self
                .run_download_sample(network, i, cfg, &mut rtt_samples)
                .await;
            if let Ok(report) = down {
                reports.push(report);
                completed += 1;
            } else {
                tracing::warn!(sample = i, network, "download sample failed");
            }
        }

        let target_bps = if network == "tcp" {
            cfg.target_bandwidth_up_bps
        } else {
            cfg.target_bandwidth_down_bps
        };
        let throughput = aggregate_throughput(target_bps, &reports);
        let packets_lost = reports.iter().map(|r| r.counters.udp_packets_lost).sum();
        let segments_retransmitted = reports.iter().map(|r| r.counters.tcp_retransmits).sum();

        Ok(RunResult {
            throughput,
            rtt: RttStats::from_samples(&rtt_samples),
            packets_lost,
            segments_retransmitted,
            samples_planned: total_samples,
            samples_completed: completed,
            duration: started.elapsed(),
        })
    }

    async fn run_upload_sample(
        &mut self,
        network: &str,
        sample_id: u32,
        cfg: &ProtocolMeasurementConfig,
        rtt_samples: &mut Vec<f64>,
    ) -> Result<SampleReport> {
        let _: serde_json::Value = self
            .call(
                methods::SAMPLE_START,
                serde_json::to_value(SampleStartParams {
                    sample_id,
                    network: network.to_string(),
                })?,
            )
            .await?;

        let send_result = match network {
            "tcp" => {
                let mut data = TcpStream::connect(self.server_addr).await?;
                bind_tcp_data_channel(&mut data, DATA_CHANNEL_UPLOAD_HEADER, &self.session_id)
                    .await?;
                if let Ok(rtt) = self.sample_tcp_rtt().await {
                    rtt_samples.push(rtt);
                }
                pacing::send_sample_tcp(
                    &mut data,
                    sample_id,
                    cfg.target_bandwidth_up_bps,
                    cfg.sample_size_bytes,
                    cfg.chunk_size,
                )
                .await?
            }
            _ => {
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                socket.connect(self.server_addr).await?;
                self.exchange_udp_ping(&socket, sample_id, rtt_samples)
                    .await;
                pacing::send_sample_udp(
                    &socket,
                    sample_id,
                    cfg.target_bandwidth_up_bps,
                    cfg.sample_size_bytes,
                    cfg.chunk_size,
                )
                .await?
            }
        };
        tracing::debug!(bytes_sent = send_result.bytes_sent, "upload sample sent");

        self.call(
            methods::SAMPLE_STOP,
            serde_json::to_value(SampleStopParams { sample_id })?,
        )
        .await
    }

    async fn run_download_sample(
        &mut self,
        network: &str,
        sample_id: u32,
        cfg: &ProtocolMeasurementConfig,
        rtt_samples: &mut Vec<f64>,
    ) -> Result<SampleReport> {
        let _: serde_json::Value = self
            .call(
                methods::SAMPLE_START_REVERSE,
                serde_json::to_value(SampleStartReverseParams {
                    sample_id,
                    network: network.to_string(),
                    target_bps: cfg.target_bandwidth_down_bps,
                    chunk_size: cfg.chunk_size,
                    byte_budget: cfg.sample_size_bytes,
                })?,
            )
            .await?;

        let mut total = 0u64;
        match network {
            "tcp" => {
                let mut data = TcpStream::connect(self.server_addr).await?;
                bind_tcp_data_channel(&mut data, DATA_CHANNEL_DOWNLOAD_HEADER, &self.session_id)
                    .await?;
                if let Ok(rtt) = self.sample_tcp_rtt().await {
                    rtt_samples.push(rtt);
                }
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    match data.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => total += n as u64,
                    }
                }
            }
            _ => {
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                socket.connect(self.server_addr).await?;
                self.exchange_udp_ping(&socket, sample_id, rtt_samples)
                    .await;
                let mut buf = vec![0u8; 64 * 1024];
                let deadline = Instant::now() + Duration::from_millis(cfg.timeout_per_sample_ms);
                while Instant::now() < deadline {
                    match tokio::time::timeout(Duration::from_millis(200), socket.recv(&mut buf))
                        .await
                    {
                        Ok(Ok(n)) => total += n as u64,
                        _ => break,
                    }
                }
            }
        }
        tracing::debug!(bytes_received = total, "download sample received");

        self.call(
            methods::SAMPLE_STOP,
            serde_json::to_value(SampleStopParams { sample_id })?,
        )
        .await
    }

    /// Reads the kernel RTT estimate off the control socket (§4.3 TCP RTT
    /// sampling).
    async fn sample_tcp_rtt(&self) -> Result<f64> {
        let counters = tcp_info::read_tcp_info(&self.control)?;
        #[cfg(target_os = "linux")]
        {
            Ok(counters.tcpi_rtt as f64 / 1000.0)
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = counters;
            Err(MeasureError::Protocol("rtt unsupported".into()))
        }
    }

    async fn exchange_udp_ping(
        &self,
        socket: &UdpSocket,
        sample_id: u32,
        rtt_samples: &mut Vec<f64>,
    ) {
        let frame = UdpSessionFrame {
            frame_type: UdpFrameType::Ping,
            session_id: &self.session_id,
            sample_id,
            sequence: 0,
            payload: &[],
        };
        let sent_at = Instant::now();
        if socket.send(&frame.encode()).await.is_err() {
            return;
        }
        let mut buf = [0u8; 256];
        if let Ok(Ok(n)) =
            tokio::time::timeout(Duration::from_millis(500), socket.recv(&mut buf)).await
        {
            if UdpSessionFrame::decode(&buf[..n])
                .map(|f| f.frame_type == UdpFrameType::Pong)
                .unwrap_or(false)
            {
                rtt_samples.push(sent_at.elapsed().as_secs_f64() * 1000.0);
            }
        }
    }

    pub async fn close(mut self) -> Result<()> {
        let _: serde_json::Value = self
            .call(methods::SESSION_GOODBYE, serde_json::Value::Null)
            .await?;
        Ok(())
    }
}

async fn bind_tcp_data_channel(
    stream: &mut TcpStream,
    header: &[u8; 4],
    session_id: &str,
) -> Result<()> {
    stream.set_nodelay(true)?;
    stream.write_all(header).await?;
    let id_bytes = session_id.as_bytes();
    stream.write_all(&(id_bytes.len() as u16).to_be_bytes()).await?;
    stream.write_all(id_bytes).await?;
    Ok(())
}

/// Runs both TCP and UDP protocol cycles against one session, honoring
/// `MeasurementClientConfig::sample_wait_ms` between samples (§4.3 contract).
pub async fn run(
    server_addr: SocketAddr,
    cfg: &MeasurementClientConfig,
) -> Result<(RunResult, RunResult)> {
    let mut client = MeasurementClient::connect(server_addr).await?;
    client.heartbeat().await?;
    let tcp_result = client.run_tcp(&cfg.tcp, cfg.sample_wait_ms).await?;
    let udp_result = client.run_udp(&cfg.udp, cfg.sample_wait_ms).await?;
    client.close().await?;
    Ok((tcp_result, udp_result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtt_stats_from_samples_computes_mean_and_jitter() {
        let stats = RttStats::from_samples(&[10.0, 20.0, 30.0]);
        assert_eq!(stats.sample_count, 3);
        assert!((stats.mean_ms - 20.0).abs() < 1e-9);
        assert!(stats.jitter_ms > 0.0);
    }

    #[test]
    fn rtt_stats_from_empty_samples_is_default() {
        let stats = RttStats::from_samples(&[]);
        assert_eq!(stats.sample_count, 0);
    }
}
