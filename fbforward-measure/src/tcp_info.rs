//! Kernel TCP statistics read via `getsockopt(TCP_INFO)` (§4.2 retransmit
//! reporting). Linux-only, same `#[cfg(target_os = "linux")]` convention the
//! raw-ICMP reachability code uses for platform-specific socket options.

#[cfg(target_os = "linux")]
pub fn read_tcp_info(stream: &tokio::net::TcpStream) -> std::io::Result<libc::tcp_info> {
    use std::os::unix::io::AsRawFd;

    let fd = stream.as_raw_fd();
    let mut info: libc::tcp_info = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::tcp_info>() as libc::socklen_t;

    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_INFO,
            &mut info as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };

    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(info)
}

#[cfg(not(target_os = "linux"))]
pub fn read_tcp_info(_stream: &tokio::net::TcpStream) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "TCP_INFO is only available on Linux",
    ))
}

/// Segments-sent / retransmits counters at one point in time, diffed across
/// sample boundaries by the caller (§4.2 "segments_sent_delta,
/// retransmits_delta").
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpCounters {
    pub segments_sent: u64,
    pub retransmits: u64,
}

#[cfg(target_os = "linux")]
pub fn tcp_counters(stream: &tokio::net::TcpStream) -> std::io::Result<TcpCounters> {
    let info = read_tcp_info(stream)?;
    Ok(TcpCounters {
        segments_sent: info.tcpi_segs_out as u64,
        retransmits: info.tcpi_total_retrans as u64,
    })
}

#[cfg(not(target_os = "linux"))]
pub fn tcp_counters(_stream: &tokio::net::TcpStream) -> std::io::Result<TcpCounters> {
    Ok(TcpCounters::default())
}
