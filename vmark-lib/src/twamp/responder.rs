use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{NodeError, Result};
use crate::twamp::codec::{ReflectedPacket, SenderPacket, DEFAULT_ERROR_ESTIMATE, MAX_PADDING};
use crate::twamp::socket::{bind_udp, SocketOptions};
use crate::twamp::time::NtpTimestamp;

/// RFC 5357 §4.2.1: sender TTL value when the received TTL cannot be
/// recovered from the socket.
const SENDER_TTL_UNKNOWN: u8 = 255;

#[derive(Debug, Clone)]
pub struct ResponderConfig {
    pub port: u16,
    pub ipv6: bool,
    pub padding: usize,
    pub socket: SocketOptions,
}

impl ResponderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(NodeError::invalid("port must be 1..65535"));
        }
        if self.padding > MAX_PADDING {
            return Err(NodeError::invalid(format!(
                "padding {} exceeds the {MAX_PADDING} byte limit",
                self.padding
            )));
        }
        Ok(())
    }
}

/// Stateless test-packet reflector. Every received sender packet is
/// echoed to its source with receive (`t2`) and transmit (`t3`)
/// timestamps; no per-sender state is kept across packets.
pub struct Responder {
    socket: UdpSocket,
    padding: usize,
    seq: u32,
}

impl Responder {
    pub fn bind(config: &ResponderConfig) -> Result<Responder> {
        config.validate()?;
        let addr = if config.ipv6 {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), config.port)
        } else {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.port)
        };
        let socket = bind_udp(addr, &config.socket)?;
        Ok(Responder { socket, padding: config.padding, seq: 0 })
    }

    /// Reflect on an already-bound socket (e.g. an ephemeral port).
    pub fn from_socket(socket: UdpSocket, padding: usize) -> Responder {
        Responder { socket, padding, seq: 0 }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(NodeError::Network)
    }

    /// Reflect until the shutdown signal fires. Malformed packets and
    /// send failures are logged and skipped; only a broken socket ends
    /// the session. Returns the number of packets reflected.
    pub async fn run(mut self, shutdown: &mut watch::Receiver<bool>) -> Result<u64> {
        let local = self.local_addr()?;
        info!(%local, "TWAMP responder listening");
        let mut reflected: u64 = 0;
        let mut shutdown_open = true;
        let mut buf = vec![0u8; SenderPacket::BASE_LEN + MAX_PADDING];
        loop {
            let received = tokio::select! {
                res = self.socket.recv_from(&mut buf) => res,
                res = shutdown.changed(), if shutdown_open => {
                    if res.is_ok() {
                        info!(reflected, "shutdown signal received, stopping responder");
                        break;
                    }
                    // sender dropped; treat as no shutdown signal
                    shutdown_open = false;
                    continue;
                }
            };
            let (len, peer) = match received {
                Ok(pair) => pair,
                Err(e) => return Err(NodeError::Network(e)),
            };
            let t2 = NtpTimestamp::now();

            let request = match SenderPacket::decode(&buf[..len]) {
                Ok(pkt) => pkt,
                Err(e) => {
                    warn!(%peer, len, error = %e, "discarding malformed test packet");
                    continue;
                }
            };

            let reflection = ReflectedPacket {
                seq: self.seq,
                // t3 is stamped immediately before the send syscall.
                timestamp: NtpTimestamp::now(),
                error_estimate: DEFAULT_ERROR_ESTIMATE,
                receive_timestamp: t2,
                sender_seq: request.seq,
                sender_timestamp: request.timestamp,
                sender_error_estimate: request.error_estimate,
                sender_ttl: SENDER_TTL_UNKNOWN,
                padding: self.padding,
            };
            let bytes = reflection.encode()?;
            match self.socket.send_to(&bytes, peer).await {
                Ok(_) => {
                    reflected += 1;
                    self.seq = self.seq.wrapping_add(1);
                    debug!(%peer, seq = request.seq, "reflected test packet");
                }
                Err(e) => warn!(%peer, seq = request.seq, error = %e, "reflection send failed"),
            }
        }
        Ok(reflected)
    }
}
