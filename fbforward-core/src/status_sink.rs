//! Status sink (§6): flow-lifecycle and measurement-completion events,
//! delivered over a bounded `tokio::sync::mpsc` channel so a slow
//! subscriber applies backpressure rather than unbounded memory growth.
//! Grounded on the `tokio::sync::broadcast`/`mpsc` channel-as-observer
//! idiom already used for shutdown signaling in
//! `fbforward-measure/src/server.rs`, generalized to a typed event enum.

use fbforward_protocol::Protocol;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub enum FlowEvent {
    Added {
        id: String,
        protocol: Protocol,
        client_addr: SocketAddr,
        upstream_tag: String,
    },
    Updated {
        id: String,
        bytes_up: u64,
        bytes_down: u64,
        last_activity: Instant,
    },
    Removed {
        id: String,
    },
}

#[derive(Debug, Clone)]
pub struct MeasurementCompletionEvent {
    pub upstream_tag: String,
    pub protocol: Protocol,
    pub direction: MeasurementDirection,
    pub duration: std::time::Duration,
    pub success: bool,
    pub bandwidth_bps: f64,
    pub rtt_ms: f64,
    pub jitter_ms: f64,
    pub loss_or_retrans_rate: f64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementDirection {
    Upload,
    Download,
}

#[derive(Debug, Clone)]
pub enum StatusEvent {
    Flow(FlowEvent),
    Measurement(MeasurementCompletionEvent),
}

/// Handle a subscriber uses to publish events; the core holds the sending
/// half, external collaborators hold receivers obtained at `subscribe` time.
#[derive(Clone)]
pub struct StatusSink {
    tx: mpsc::Sender<StatusEvent>,
}

/// Default channel depth; add/remove events are never coalesced, only
/// dropped under sustained backpressure (§6 "each subscriber controls its
/// periodic snapshot interval" implies the core does not block on a slow
/// subscriber beyond this buffer).
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

impl StatusSink {
    pub fn new() -> (Self, mpsc::Receiver<StatusEvent>) {
        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }

    pub fn publish_flow(&self, event: FlowEvent) {
        if let Err(e) = self.tx.try_send(StatusEvent::Flow(event)) {
            tracing::debug!(error = %e, "status sink dropped flow event under backpressure");
        }
    }

    pub fn publish_measurement(&self, event: MeasurementCompletionEvent) {
        if let Err(e) = self.tx.try_send(StatusEvent::Measurement(event)) {
            tracing::debug!(error = %e, "status sink dropped measurement event under backpressure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn flow_added_event_is_delivered_to_subscriber() {
        let (sink, mut rx) = StatusSink::new();
        sink.publish_flow(FlowEvent::Added {
            id: "f1".into(),
            protocol: Protocol::Tcp,
            client_addr: "127.0.0.1:1234".parse().unwrap(),
            upstream_tag: "a".into(),
        });
        let event = rx.recv().await.unwrap();
        match event {
            StatusEvent::Flow(FlowEvent::Added { id, .. }) => assert_eq!(id, "f1"),
            _ => panic!("expected a flow-added event"),
        }
    }

    #[tokio::test]
    async fn measurement_completion_event_carries_error_when_unsuccessful() {
        let (sink, mut rx) = StatusSink::new();
        sink.publish_measurement(MeasurementCompletionEvent {
            upstream_tag: "a".into(),
            protocol: Protocol::Udp,
            direction: MeasurementDirection::Download,
            duration: std::time::Duration::from_secs(1),
            success: false,
            bandwidth_bps: 0.0,
            rtt_ms: 0.0,
            jitter_ms: 0.0,
            loss_or_retrans_rate: 1.0,
            error: Some("timeout".into()),
        });
        match rx.recv().await.unwrap() {
            StatusEvent::Measurement(m) => {
                assert!(!m.success);
                assert_eq!(m.error.as_deref(), Some("timeout"));
            }
            _ => panic!("expected a measurement event"),
        }
    }
}
