//! Measurement session state, owned exclusively by the measurement server (§3).

use fbforward_protocol::{IntervalSample, ProtocolCounters, SampleReport, INTERVAL_MS};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// In-progress accounting for one sample, reset on `sample.start[_reverse]`
/// and consumed on `sample.stop`.
pub struct ActiveSample {
    pub sample_id: u32,
    pub network: String,
    started_at: Instant,
    first_byte_unix_ms: Arc<AtomicU64>,
    last_byte_unix_ms: Arc<AtomicU64>,
    total_bytes: Arc<AtomicU64>,
    intervals: Mutex<Vec<IntervalSample>>,
    current_interval_bytes: AtomicU64,
    current_interval_started: Mutex<Instant>,
    current_interval_ooo: AtomicU64,
    /// UDP loss tracking: highest sequence number observed and count received.
    max_seq_seen: AtomicU64,
    packets_received: AtomicU64,
    /// TCP_INFO delta accumulated over the sample's data channel(s) (§4.2).
    tcp_segments_sent: AtomicU64,
    tcp_retransmits: AtomicU64,
}

impl ActiveSample {
    pub fn new(sample_id: u32, network: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            sample_id,
            network: network.into(),
            started_at: now,
            first_byte_unix_ms: Arc::new(AtomicU64::new(0)),
            last_byte_unix_ms: Arc::new(AtomicU64::new(0)),
            total_bytes: Arc::new(AtomicU64::new(0)),
            intervals: Mutex::new(Vec::new()),
            current_interval_bytes: AtomicU64::new(0),
            current_interval_started: Mutex::new(now),
            current_interval_ooo: AtomicU64::new(0),
            max_seq_seen: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            tcp_segments_sent: AtomicU64::new(0),
            tcp_retransmits: AtomicU64::new(0),
        }
    }

    /// Accumulates a TCP_INFO before/after delta onto the sample (§4.2
    /// TCP-retransmit reporting). Call once per data channel bound to this
    /// sample; `finish` sums them into the reported counters.
    pub fn record_tcp_counters(&self, delta: crate::tcp_info::TcpCounters) {
        self.tcp_segments_sent.fetch_add(delta.segments_sent, Ordering::Relaxed);
        self.tcp_retransmits.fetch_add(delta.retransmits, Ordering::Relaxed);
    }

    /// Record the arrival of `n` payload bytes, rolling the 100ms interval
    /// bucket if its time has elapsed (§4.2 per-sample bucketing).
    pub async fn record_bytes(&self, n: u64, sequence: Option<u64>) {
        let now_ms = now_unix_ms();
        self.first_byte_unix_ms
            .compare_exchange(0, now_ms, Ordering::SeqCst, Ordering::SeqCst)
            .ok();
        self.last_byte_unix_ms.store(now_ms, Ordering::SeqCst);
        self.total_bytes.fetch_add(n, Ordering::Relaxed);
        self.current_interval_bytes.fetch_add(n, Ordering::Relaxed);

        if let Some(seq) = sequence {
            self.packets_received.fetch_add(1, Ordering::Relaxed);
            let prev_max = self.max_seq_seen.fetch_max(seq, Ordering::Relaxed);
            if seq < prev_max {
                self.current_interval_ooo.fetch_add(1, Ordering::Relaxed);
            }
        }

        let mut started = self.current_interval_started.lock().await;
        if started.elapsed() >= Duration::from_millis(INTERVAL_MS) {
            self.roll_interval(&mut started, false).await;
        }
    }

    async fn roll_interval(&self, started: &mut Instant, truncated_ok: bool) {
        let elapsed = started.elapsed();
        let duration_ms = elapsed.as_millis() as u64;
        if duration_ms == 0 && !truncated_ok {
            return;
        }
        let bytes = self.current_interval_bytes.swap(0, Ordering::SeqCst);
        let ooo = self.current_interval_ooo.swap(0, Ordering::SeqCst);
        self.intervals.lock().await.push(IntervalSample {
            bytes,
            duration_ms,
            out_of_order: ooo,
        });
        *started = Instant::now();
    }

    /// Finalize the sample: flush the (possibly truncated) trailing interval
    /// and build the full report (§4.2, §3 measurement sample result).
    pub async fn finish(&self, counters: ProtocolCounters) -> SampleReport {
        {
            let mut started = self.current_interval_started.lock().await;
            self.roll_interval(&mut started, true).await;
        }
        let mut counters = counters;
        if self.network == "udp" {
            let received = self.packets_received.load(Ordering::Relaxed);
            let max_seq = self.max_seq_seen.load(Ordering::Relaxed);
            counters.udp_packets_received = received;
            counters.udp_packets_lost = (max_seq + 1).saturating_sub(received);
        }
        if self.network == "tcp" {
            counters.tcp_segments_sent = self.tcp_segments_sent.load(Ordering::Relaxed);
            counters.tcp_retransmits = self.tcp_retransmits.load(Ordering::Relaxed);
        }
        SampleReport {
            sample_id: self.sample_id,
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            total_duration_ms: self.started_at.elapsed().as_millis() as u64,
            intervals: self.intervals.lock().await.clone(),
            first_byte_unix_ms: self.first_byte_unix_ms.load(Ordering::Relaxed),
            last_byte_unix_ms: self.last_byte_unix_ms.load(Ordering::Relaxed),
            counters,
        }
    }
}

fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// One measurement session, bound to a control connection and, once data
/// flows, its data connection(s) (§3 measurement session state).
pub struct MeasurementSession {
    pub session_id: String,
    pub client_addr: SocketAddr,
    pub created_at: Instant,
    last_heartbeat: Mutex<Instant>,
    active_sample: Mutex<Option<Arc<ActiveSample>>>,
}

impl MeasurementSession {
    pub fn new(session_id: String, client_addr: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            session_id,
            client_addr,
            created_at: now,
            last_heartbeat: Mutex::new(now),
            active_sample: Mutex::new(None),
        }
    }

    pub async fn touch(&self) {
        *self.last_heartbeat.lock().await = Instant::now();
    }

    pub async fn idle_for(&self) -> Duration {
        self.last_heartbeat.lock().await.elapsed()
    }

    pub async fn start_sample(
        &self,
        sample_id: u32,
        network: impl Into<String>,
    ) -> Result<Arc<ActiveSample>, crate::error::MeasureError> {
        let mut slot = self.active_sample.lock().await;
        if slot.is_some() {
            return Err(crate::error::MeasureError::SampleAlreadyActive(sample_id));
        }
        let sample = Arc::new(ActiveSample::new(sample_id, network));
        *slot = Some(sample.clone());
        Ok(sample)
    }

    pub async fn current_sample(&self) -> Option<Arc<ActiveSample>> {
        self.active_sample.lock().await.clone()
    }

    pub async fn stop_sample(
        &self,
        sample_id: u32,
    ) -> Result<Arc<ActiveSample>, crate::error::MeasureError> {
        let mut slot = self.active_sample.lock().await;
        match slot.take() {
            Some(sample) if sample.sample_id == sample_id => Ok(sample),
            Some(sample) => {
                let expected = sample.sample_id;
                *slot = Some(sample);
                Err(crate::error::MeasureError::SampleIdMismatch {
                    expected,
                    got: sample_id,
                })
            }
            None => Err(crate::error::MeasureError::SampleNotFound(sample_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn active_sample_rolls_interval_after_window() {
        let sample = ActiveSample::new(1, "tcp");
        sample.record_bytes(1000, None).await;
        tokio::time::sleep(Duration::from_millis(110)).await;
        sample.record_bytes(500, None).await;
        let report = sample.finish(ProtocolCounters::default()).await;
        assert!(report.intervals.len() >= 2);
        assert_eq!(report.total_bytes, 1500);
    }

    #[tokio::test]
    async fn udp_loss_counts_gap_not_out_of_order() {
        let sample = ActiveSample::new(1, "udp");
        sample.record_bytes(100, Some(0)).await;
        sample.record_bytes(100, Some(2)).await; // gap: seq 1 lost
        sample.record_bytes(100, Some(1)).await; // out of order, not lost
        let report = sample.finish(ProtocolCounters::default()).await;
        assert_eq!(report.counters.udp_packets_received, 3);
        assert_eq!(report.counters.udp_packets_lost, 1); // max_seq(2)+1 - 3
    }

    #[tokio::test]
    async fn starting_two_samples_without_stop_is_rejected() {
        let session =
            MeasurementSession::new("s1".into(), "127.0.0.1:1".parse().unwrap());
        session.start_sample(1, "tcp").await.unwrap();
        let err = session.start_sample(2, "tcp").await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::MeasureError::SampleAlreadyActive(2)
        ));
    }

    #[tokio::test]
    async fn stopping_with_wrong_id_is_rejected_and_sample_survives() {
        let session =
            MeasurementSession::new("s1".into(), "127.0.0.1:1".parse().unwrap());
        session.start_sample(5, "tcp").await.unwrap();
        let err = session.stop_sample(6).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::MeasureError::SampleIdMismatch {
                expected: 5,
                got: 6
            }
        ));
        assert!(session.current_sample().await.is_some());
    }
}
