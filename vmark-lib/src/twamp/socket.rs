use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::warn;

use crate::error::{NodeError, Result};

/// IP-level options applied to measurement sockets. `ttl` doubles as the
/// IPv6 hop limit and `tos` as the traffic class; `df` only exists for
/// IPv4 and is ignored elsewhere.
#[derive(Debug, Clone, Copy)]
pub struct SocketOptions {
    pub ttl: u8,
    pub tos: u8,
    pub df: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self { ttl: 64, tos: 0, df: false }
    }
}

/// Bind a UDP socket with the measurement options applied, registered
/// with the tokio reactor.
pub fn bind_udp(addr: SocketAddr, opts: &SocketOptions) -> Result<UdpSocket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket =
        Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(NodeError::Network)?;

    if addr.is_ipv4() {
        socket.set_ttl_v4(opts.ttl as u32).map_err(NodeError::Network)?;
        socket.set_tos_v4(opts.tos as u32).map_err(NodeError::Network)?;
        if opts.df {
            set_dont_fragment(&socket)?;
        }
    } else {
        socket.set_unicast_hops_v6(opts.ttl as u32).map_err(NodeError::Network)?;
        socket.set_tclass_v6(opts.tos as u32).map_err(NodeError::Network)?;
        if opts.df {
            warn!("do-not-fragment requested on an IPv6 socket, ignoring");
        }
    }

    socket.set_nonblocking(true).map_err(NodeError::Network)?;
    socket.bind(&addr.into()).map_err(NodeError::Network)?;
    UdpSocket::from_std(socket.into()).map_err(NodeError::Network)
}

/// socket2 exposes no wrapper for `IP_MTU_DISCOVER`, so the DF bit is set
/// through a contained libc call.
#[cfg(target_os = "linux")]
fn set_dont_fragment(socket: &Socket) -> Result<()> {
    use std::os::fd::AsRawFd;

    let value: libc::c_int = libc::IP_PMTUDISC_DO;
    #[allow(unsafe_code)]
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_MTU_DISCOVER,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(NodeError::Network(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_dont_fragment(_socket: &Socket) -> Result<()> {
    warn!("do-not-fragment is only supported on Linux, ignoring");
    Ok(())
}
