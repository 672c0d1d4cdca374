//! Pacing sender (§4.1): emits framed byte streams at a target rate.

use crate::error::{MeasureError, Result};
use fbforward_protocol::{FrameHeader, FRAME_HEADER_LEN};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};

/// Outcome of one `SendSample` call (§4.1 contract).
#[derive(Debug, Clone, Copy)]
pub struct SendResult {
    pub bytes_sent: u64,
    pub first_byte_unix_ms: u64,
    pub last_byte_unix_ms: u64,
}

fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Token-bucket rate limiter releasing `chunk_size * 8` bits per frame, used
/// on UDP or when kernel pacing isn't available on the TCP socket.
struct TokenBucket {
    target_bps: f64,
    started_at: Instant,
    bytes_sent_so_far: u64,
}

impl TokenBucket {
    fn new(target_bps: f64) -> Self {
        Self {
            target_bps,
            started_at: Instant::now(),
            bytes_sent_so_far: 0,
        }
    }

    /// Blocks (via async sleep) until sending `chunk_bytes` more would not
    /// exceed the target rate measured since the bucket was created.
    async fn wait_for_budget(&mut self, chunk_bytes: u64) {
        if self.target_bps <= 0.0 {
            return;
        }
        let projected_bytes = self.bytes_sent_so_far + chunk_bytes;
        let expected_duration =
            Duration::from_secs_f64((projected_bytes as f64 * 8.0) / self.target_bps);
        let elapsed = self.started_at.elapsed();
        if expected_duration > elapsed {
            tokio::time::sleep(expected_duration - elapsed).await;
        }
        self.bytes_sent_so_far = projected_bytes;
    }
}

/// Sends one sample's worth of paced frames over a TCP data connection.
/// Kernel pacing (`TCP_MAXPACING` where the platform supports it) is the
/// preferred mechanism; the token bucket is the portable fallback and is
/// always used here since socket-option pacing is platform-specific and not
/// exposed by the stable standard library.
pub async fn send_sample_tcp(
    stream: &mut TcpStream,
    sample_id: u32,
    target_bps: f64,
    byte_budget: u64,
    chunk_size: u32,
) -> Result<SendResult> {
    let mut bucket = TokenBucket::new(target_bps);
    let mut sequence: u64 = 0;
    let mut bytes_sent: u64 = 0;
    let mut first_byte_unix_ms = 0;
    let payload = vec![0u8; chunk_size as usize];

    while bytes_sent < byte_budget {
        bucket.wait_for_budget(chunk_size as u64).await;

        let header = FrameHeader {
            sample_id,
            sequence,
            payload_len: chunk_size,
        };
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&header.encode());
        frame.extend_from_slice(&payload);

        stream
            .write_all(&frame)
            .await
            .map_err(|e| MeasureError::ConnectionError(e.to_string()))?;

        if sequence == 0 {
            first_byte_unix_ms = now_unix_ms();
        }
        sequence += 1;
        bytes_sent += frame.len() as u64;
    }
    stream
        .flush()
        .await
        .map_err(|e| MeasureError::ConnectionError(e.to_string()))?;

    Ok(SendResult {
        bytes_sent,
        first_byte_unix_ms,
        last_byte_unix_ms: now_unix_ms(),
    })
}

/// Sends one sample's worth of paced frames over a connected UDP socket.
pub async fn send_sample_udp(
    socket: &UdpSocket,
    sample_id: u32,
    target_bps: f64,
    byte_budget: u64,
    chunk_size: u32,
) -> Result<SendResult> {
    let mut bucket = TokenBucket::new(target_bps);
    let mut sequence: u64 = 0;
    let mut bytes_sent: u64 = 0;
    let mut first_byte_unix_ms = 0;
    let payload = vec![0u8; chunk_size as usize];

    while bytes_sent < byte_budget {
        bucket.wait_for_budget(chunk_size as u64).await;

        let header = FrameHeader {
            sample_id,
            sequence,
            payload_len: chunk_size,
        };
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&header.encode());
        frame.extend_from_slice(&payload);

        socket
            .send(&frame)
            .await
            .map_err(|e| MeasureError::ConnectionError(e.to_string()))?;

        if sequence == 0 {
            first_byte_unix_ms = now_unix_ms();
        }
        sequence += 1;
        bytes_sent += frame.len() as u64;
    }

    Ok(SendResult {
        bytes_sent,
        first_byte_unix_ms,
        last_byte_unix_ms: now_unix_ms(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tcp_sample_stops_at_byte_budget() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 65536];
            let mut total = 0u64;
            loop {
                match tokio::io::AsyncReadExt::read(&mut sock, &mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => total += n as u64,
                }
            }
            total
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let result = send_sample_tcp(&mut client, 1, 0.0, 16_000, 1200)
            .await
            .unwrap();
        drop(client);

        assert!(result.bytes_sent >= 16_000);
        let received = server.await.unwrap();
        assert_eq!(received, result.bytes_sent);
    }
}
