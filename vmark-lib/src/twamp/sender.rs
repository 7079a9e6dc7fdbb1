use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::error::{NodeError, Result};
use crate::twamp::codec::{ReflectedPacket, SenderPacket, DEFAULT_ERROR_ESTIMATE, MAX_PADDING};
use crate::twamp::socket::{bind_udp, SocketOptions};
use crate::twamp::stats::{compute_report, PacketRecord, SessionReport};
use crate::twamp::time::NtpTimestamp;

pub const COUNT_MIN: u32 = 1;
pub const COUNT_MAX: u32 = 9999;
pub const INTERVAL_MIN: Duration = Duration::from_millis(10);
pub const INTERVAL_MAX: Duration = Duration::from_millis(1000);
const GRACE_FLOOR: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub destination: IpAddr,
    pub port: u16,
    pub count: u32,
    pub interval: Duration,
    pub padding: usize,
    pub socket: SocketOptions,
}

impl SenderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(NodeError::invalid("port must be 1..65535"));
        }
        if !(COUNT_MIN..=COUNT_MAX).contains(&self.count) {
            return Err(NodeError::invalid(format!(
                "count {} outside {COUNT_MIN}..{COUNT_MAX}",
                self.count
            )));
        }
        if self.interval < INTERVAL_MIN || self.interval > INTERVAL_MAX {
            return Err(NodeError::invalid(format!(
                "interval {:?} outside {INTERVAL_MIN:?}..{INTERVAL_MAX:?}",
                self.interval
            )));
        }
        if self.padding > MAX_PADDING {
            return Err(NodeError::invalid(format!(
                "padding {} exceeds the {MAX_PADDING} byte limit",
                self.padding
            )));
        }
        Ok(())
    }

    /// Drain window after the last scheduled send: twice the interval,
    /// never under 100 ms.
    fn grace(&self) -> Duration {
        (self.interval * 2).max(GRACE_FLOOR)
    }
}

/// Session progression. Cancellation jumps to `Done` from any state and
/// partial statistics are reported over the matched packets only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Init,
    Sending,
    Drain,
    Done,
}

/// Paced test-packet sender. The pacer emits `count` packets on a
/// monotonic schedule (`t0 + k·interval`) while the receive loop matches
/// reflections by sequence number until all are in or the drain deadline
/// passes.
pub struct Sender {
    config: SenderConfig,
}

impl Sender {
    pub fn new(config: SenderConfig) -> Result<Sender> {
        config.validate()?;
        Ok(Sender { config })
    }

    pub async fn run(self, cancel: &mut watch::Receiver<bool>) -> Result<SessionReport> {
        let config = self.config;
        let peer = SocketAddr::new(config.destination, config.port);
        let bind_addr = if peer.is_ipv4() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        } else {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
        };
        let socket = Arc::new(bind_udp(bind_addr, &config.socket)?);

        let count = config.count;
        let records = Arc::new(Mutex::new(vec![PacketRecord::default(); count as usize]));
        let sent = Arc::new(AtomicU32::new(0));
        let mut state = SenderState::Init;
        debug!(?state, %peer, "session record created");

        let t0 = Instant::now();
        let grace = config.grace();
        let mut deadline = t0 + config.interval * count + grace;

        let pacer = tokio::spawn(pace(
            Arc::clone(&socket),
            peer,
            config.clone(),
            t0,
            Arc::clone(&records),
            Arc::clone(&sent),
            cancel.clone(),
        ));
        state = SenderState::Sending;
        debug!(%peer, count, interval_ms = config.interval.as_millis() as u64, "session started");

        let mut canceled = false;
        let mut cancel_open = true;
        let mut received: u32 = 0;
        let mut buf = vec![0u8; ReflectedPacket::BASE_LEN + MAX_PADDING];
        loop {
            if received >= count && pacer.is_finished() {
                break;
            }
            if state == SenderState::Sending && pacer.is_finished() {
                state = SenderState::Drain;
                debug!("all packets sent, draining reflections");
            }
            tokio::select! {
                res = cancel.changed(), if cancel_open && !canceled => {
                    if res.is_ok() {
                        info!("cancellation requested, stopping pacer");
                        canceled = true;
                        pacer.abort();
                        let drain_until = Instant::now() + grace;
                        deadline = deadline.min(drain_until);
                        state = SenderState::Drain;
                    } else {
                        // Cancel handle dropped; no interrupt can arrive.
                        cancel_open = false;
                    }
                }
                _ = sleep_until(deadline) => break,
                res = socket.recv_from(&mut buf) => {
                    match res {
                        Ok((len, from)) => {
                            let t4 = NtpTimestamp::now();
                            if from.ip() != peer.ip() {
                                debug!(%from, "ignoring packet from unexpected source");
                                continue;
                            }
                            if let Some(()) = record_reflection(&records, count, &buf[..len], t4) {
                                received += 1;
                            }
                        }
                        Err(e) => {
                            // Per-packet receive errors (e.g. ICMP-driven)
                            // do not end the session; back off briefly.
                            warn!(error = %e, "receive error");
                            sleep(Duration::from_millis(10)).await;
                        }
                    }
                }
            }
        }

        pacer.abort();
        let _ = pacer.await;
        state = SenderState::Done;
        debug!(?state, received, "session finished");

        let records = records.lock().unwrap_or_else(PoisonError::into_inner);
        let report = compute_report(&records, count, sent.load(Ordering::Acquire), canceled);
        info!(
            matched = report.matched,
            lost = report.lost,
            loss_pct = report.loss_pct,
            canceled = report.canceled,
            "TWAMP session complete"
        );
        Ok(report)
    }
}

/// Match a reflection to its send slot by sender sequence number.
/// Returns `Some(())` for a newly filled slot.
fn record_reflection(
    records: &Mutex<Vec<PacketRecord>>,
    count: u32,
    buf: &[u8],
    t4: NtpTimestamp,
) -> Option<()> {
    let reflection = match ReflectedPacket::decode(buf) {
        Ok(pkt) => pkt,
        Err(e) => {
            warn!(error = %e, "discarding malformed reflection");
            return None;
        }
    };
    if reflection.sender_seq >= count {
        warn!(seq = reflection.sender_seq, count, "reflection for unknown sequence");
        return None;
    }
    let mut records = records.lock().unwrap_or_else(PoisonError::into_inner);
    let slot = &mut records[reflection.sender_seq as usize];
    if slot.t4.is_some() {
        debug!(seq = reflection.sender_seq, "duplicate reflection, keeping first");
        return None;
    }
    slot.t2 = Some(reflection.receive_timestamp);
    slot.t3 = Some(reflection.timestamp);
    slot.t4 = Some(t4);
    Some(())
}

/// Emit `count` packets at `t0 + k·interval`, stamping `t1` immediately
/// before each send syscall.
async fn pace(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    config: SenderConfig,
    t0: Instant,
    records: Arc<Mutex<Vec<PacketRecord>>>,
    sent: Arc<AtomicU32>,
    mut cancel: watch::Receiver<bool>,
) {
    for seq in 0..config.count {
        let target = t0 + config.interval * seq;
        tokio::select! {
            _ = sleep_until(target) => {}
            res = cancel.changed() => {
                if res.is_ok() {
                    return;
                }
                // Cancel handle dropped; hold the schedule regardless.
                sleep_until(target).await;
            }
        }
        let t1 = NtpTimestamp::now();
        let packet = SenderPacket {
            seq,
            timestamp: t1,
            error_estimate: DEFAULT_ERROR_ESTIMATE,
            padding: config.padding,
        };
        let bytes = match packet.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(seq, error = %e, "encode failed, stopping pacer");
                return;
            }
        };
        if let Err(e) = socket.send_to(&bytes, peer).await {
            // Per-packet send errors don't end the session; the packet
            // simply counts as lost.
            warn!(seq, error = %e, "send failed");
        }
        records.lock().unwrap_or_else(PoisonError::into_inner)[seq as usize].t1 = Some(t1);
        sent.fetch_add(1, Ordering::Release);
    }
}
