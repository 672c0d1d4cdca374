//! Reachability prober (§4.8): raw ICMP echo requests on a sliding window,
//! used only for usability gating and fast-start bootstrap, never for the
//! quality score. No teacher module sends ICMP (the deleted
//! `icmp_listener.rs` only ever received error datagrams); this is built
//! from the same `socket2` raw-socket idiom that file used, generalized
//! from receive-only to a send/receive echo round trip.

use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_ECHO_REPLY: u8 = 0;

/// Tracks the last `window_size` probe outcomes for one upstream (§4.8).
pub struct ReachabilityWindow {
    window_size: usize,
    samples: VecDeque<bool>,
}

impl ReachabilityWindow {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size: window_size.max(1),
            samples: VecDeque::with_capacity(window_size.max(1)),
        }
    }

    pub fn record(&mut self, success: bool) {
        if self.samples.len() == self.window_size {
            self.samples.pop_front();
        }
        self.samples.push_back(success);
    }

    /// Reachability bit: true if any sample in the window succeeded.
    pub fn is_reachable(&self) -> bool {
        self.samples.iter().any(|s| *s)
    }
}

fn build_icmp_echo(identifier: u16, sequence: u16) -> [u8; 8] {
    let mut packet = [0u8; 8];
    packet[0] = ICMP_ECHO_REQUEST;
    packet[1] = 0; // code
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    let checksum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    packet
}

fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Sends one ICMP echo to `target` and waits up to `timeout` for a reply.
/// Requires `CAP_NET_RAW` (or root) on Linux; callers treat any socket
/// creation failure as "probe unavailable" rather than a fatal error.
pub fn send_echo(target: IpAddr, identifier: u16, sequence: u16, timeout: Duration) -> io::Result<Option<Duration>> {
    let domain = match target {
        IpAddr::V4(_) => Domain::IPV4,
        IpAddr::V6(_) => Domain::IPV6,
    };
    let protocol = match target {
        IpAddr::V4(_) => SockProtocol::ICMPV4,
        IpAddr::V6(_) => SockProtocol::ICMPV6,
    };
    let socket = Socket::new(domain, Type::RAW, Some(protocol))?;
    socket.set_read_timeout(Some(timeout))?;

    let packet = build_icmp_echo(identifier, sequence);
    let dest: SocketAddr = SocketAddr::new(target, 0);
    socket.send_to(&packet, &dest.into())?;

    let sent_at = Instant::now();
    let mut buf = [std::mem::MaybeUninit::new(0u8); 1024];
    match socket.recv(&mut buf) {
        Ok(n) => {
            let elapsed = sent_at.elapsed();
            let bytes: Vec<u8> = buf[..n].iter().map(|b| unsafe { b.assume_init() }).collect();
            if is_matching_reply(&bytes, identifier, sequence) {
                Ok(Some(elapsed))
            } else {
                Ok(None)
            }
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => Ok(None),
        Err(e) => Err(e),
    }
}

/// IPv4 replies arrive with the IP header still attached; skip it (20 bytes,
/// no options assumed) before reading the ICMP type/id/sequence fields.
fn is_matching_reply(bytes: &[u8], identifier: u16, sequence: u16) -> bool {
    let icmp = if bytes.len() >= 28 && (bytes[0] >> 4) == 4 {
        &bytes[20..]
    } else {
        bytes
    };
    if icmp.len() < 8 || icmp[0] != ICMP_ECHO_REPLY {
        return false;
    }
    let reply_id = u16::from_be_bytes([icmp[4], icmp[5]]);
    let reply_seq = u16::from_be_bytes([icmp[6], icmp[7]]);
    reply_id == identifier && reply_seq == sequence
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_reports_reachable_if_any_sample_succeeded() {
        let mut w = ReachabilityWindow::new(3);
        w.record(false);
        w.record(false);
        assert!(!w.is_reachable());
        w.record(true);
        assert!(w.is_reachable());
    }

    #[test]
    fn window_drops_oldest_sample_beyond_capacity() {
        let mut w = ReachabilityWindow::new(2);
        w.record(true);
        w.record(false);
        w.record(false);
        assert!(!w.is_reachable());
    }

    #[test]
    fn checksum_of_echo_request_is_internally_consistent() {
        let packet = build_icmp_echo(42, 1);
        // A correctly checksummed packet sums (with its own checksum field)
        // to 0xFFFF under ones-complement addition.
        let mut sum: u32 = 0;
        for chunk in packet.chunks_exact(2) {
            sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
        }
        while sum >> 16 != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        assert_eq!(sum as u16, 0xFFFF);
    }

    #[test]
    fn matching_reply_requires_identifier_and_sequence_to_agree() {
        let mut reply = [0u8; 8];
        reply[0] = ICMP_ECHO_REPLY;
        reply[4..6].copy_from_slice(&7u16.to_be_bytes());
        reply[6..8].copy_from_slice(&3u16.to_be_bytes());
        assert!(is_matching_reply(&reply, 7, 3));
        assert!(!is_matching_reply(&reply, 7, 4));
    }
}
