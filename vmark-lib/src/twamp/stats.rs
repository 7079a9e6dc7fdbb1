use serde::Serialize;
use tracing::warn;

use crate::twamp::time::NtpTimestamp;

/// Timestamps collected for one test packet. `t1` is stamped at send;
/// `t2`/`t3` come from the reflection payload, `t4` from its arrival.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketRecord {
    pub t1: Option<NtpTimestamp>,
    pub t2: Option<NtpTimestamp>,
    pub t3: Option<NtpTimestamp>,
    pub t4: Option<NtpTimestamp>,
}

impl PacketRecord {
    pub fn matched(&self) -> bool {
        self.t1.is_some() && self.t2.is_some() && self.t3.is_some() && self.t4.is_some()
    }
}

/// Min/max/avg delay plus jitter for one direction, in nanoseconds.
/// One-way values are signed: unsynchronized clocks legitimately produce
/// negative deltas.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DirectionStats {
    pub min_ns: i64,
    pub max_ns: i64,
    pub avg_ns: i64,
    pub jitter_ns: i64,
    pub samples: u32,
}

impl DirectionStats {
    /// Mean absolute deviation of consecutive deltas over in-order
    /// samples; 0 with fewer than two samples.
    fn from_samples(samples: &[i64]) -> Option<DirectionStats> {
        if samples.is_empty() {
            return None;
        }
        let min = *samples.iter().min().unwrap_or(&0);
        let max = *samples.iter().max().unwrap_or(&0);
        let avg = (samples.iter().map(|v| *v as i128).sum::<i128>() / samples.len() as i128) as i64;
        let jitter = if samples.len() < 2 {
            0
        } else {
            let total: i128 = samples
                .windows(2)
                .map(|pair| (pair[1] - pair[0]).unsigned_abs() as i128)
                .sum();
            (total / (samples.len() as i128 - 1)) as i64
        };
        Some(DirectionStats {
            min_ns: min,
            max_ns: max,
            avg_ns: avg,
            jitter_ns: jitter,
            samples: samples.len() as u32,
        })
    }

    pub fn avg_ms(&self) -> f64 {
        self.avg_ns as f64 / 1e6
    }
}

/// Statistics for one sender run.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    /// Configured packet count (`matched + lost == count`).
    pub count: u32,
    pub sent: u32,
    pub matched: u32,
    pub lost: u32,
    pub loss_pct: f64,
    pub outbound: Option<DirectionStats>,
    pub inbound: Option<DirectionStats>,
    pub roundtrip: Option<DirectionStats>,
    pub canceled: bool,
}

/// Compute per-direction statistics over the matched records.
///
/// - outbound: `t2 - t1`
/// - inbound: `t4 - t3`
/// - round-trip: `(t4 - t1) - (t3 - t2)`, clamped at 0 with a warning
///   (a negative round trip means inconsistent timestamps, not time
///   travel).
pub fn compute_report(
    records: &[PacketRecord],
    count: u32,
    sent: u32,
    canceled: bool,
) -> SessionReport {
    let mut outbound = Vec::new();
    let mut inbound = Vec::new();
    let mut roundtrip = Vec::new();

    for record in records.iter().filter(|r| r.matched()) {
        let (t1, t2, t3, t4) = (
            record.t1.unwrap_or_default(),
            record.t2.unwrap_or_default(),
            record.t3.unwrap_or_default(),
            record.t4.unwrap_or_default(),
        );
        outbound.push(t2.delta_nanos(t1));
        inbound.push(t4.delta_nanos(t3));
        let rtt = t4.delta_nanos(t1) - t3.delta_nanos(t2);
        if rtt < 0 {
            warn!(rtt_ns = rtt, "negative round-trip sample, clamping to 0");
            roundtrip.push(0);
        } else {
            roundtrip.push(rtt);
        }
    }

    let matched = outbound.len() as u32;
    let lost = count.saturating_sub(matched);
    SessionReport {
        count,
        sent,
        matched,
        lost,
        loss_pct: if count == 0 { 0.0 } else { lost as f64 * 100.0 / count as f64 },
        outbound: DirectionStats::from_samples(&outbound),
        inbound: DirectionStats::from_samples(&inbound),
        roundtrip: DirectionStats::from_samples(&roundtrip),
        canceled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(nanos: i64) -> NtpTimestamp {
        let seconds = (nanos / 1_000_000_000) as u32;
        let rem = (nanos % 1_000_000_000) as u128;
        NtpTimestamp { seconds, fraction: ((rem << 32) / 1_000_000_000) as u32 }
    }

    fn record(t1: i64, t2: i64, t3: i64, t4: i64) -> PacketRecord {
        PacketRecord {
            t1: Some(ts(t1)),
            t2: Some(ts(t2)),
            t3: Some(ts(t3)),
            t4: Some(ts(t4)),
        }
    }

    #[test]
    fn matched_plus_lost_equals_count() {
        let records =
            vec![record(0, 1_000_000, 2_000_000, 3_000_000), PacketRecord::default()];
        let report = compute_report(&records, 2, 2, false);
        assert_eq!(report.matched, 1);
        assert_eq!(report.lost, 1);
        assert_eq!(report.matched + report.lost, report.count);
        assert_eq!(report.loss_pct, 50.0);
    }

    #[test]
    fn directional_delays() {
        // 1 ms out, 2 ms back, 1 ms on the reflector.
        let records = vec![record(0, 1_000_000, 2_000_000, 4_000_000)];
        let report = compute_report(&records, 1, 1, false);
        let outbound = report.outbound.unwrap();
        let inbound = report.inbound.unwrap();
        let rtt = report.roundtrip.unwrap();
        assert_eq!(outbound.avg_ns, 1_000_000);
        assert_eq!(inbound.avg_ns, 2_000_000);
        assert_eq!(rtt.avg_ns, 3_000_000);
    }

    #[test]
    fn one_way_delays_may_be_negative() {
        // Reflector clock 5 ms behind the sender's.
        let records = vec![record(10_000_000, 6_000_000, 7_000_000, 13_000_000)];
        let report = compute_report(&records, 1, 1, false);
        assert_eq!(report.outbound.unwrap().avg_ns, -4_000_000);
        assert_eq!(report.inbound.unwrap().avg_ns, 6_000_000);
        // Round trip is immune to the offset.
        assert_eq!(report.roundtrip.unwrap().avg_ns, 2_000_000);
    }

    #[test]
    fn negative_roundtrip_clamps_to_zero() {
        // Reflector claims more processing time than the whole round trip.
        let records = vec![record(0, 1_000_000, 9_000_000, 4_000_000)];
        let report = compute_report(&records, 1, 1, false);
        assert_eq!(report.roundtrip.unwrap().avg_ns, 0);
    }

    #[test]
    fn jitter_is_mean_absolute_consecutive_delta() {
        let records = vec![
            record(0, 1_000_000, 1_000_000, 2_000_000),
            record(0, 3_000_000, 3_000_000, 4_000_000),
            record(0, 2_000_000, 2_000_000, 3_000_000),
        ];
        let report = compute_report(&records, 3, 3, false);
        // Outbound samples 1, 3, 2 ms: |2| + |-1| over 2 -> 1.5 ms.
        assert_eq!(report.outbound.unwrap().jitter_ns, 1_500_000);
    }

    #[test]
    fn empty_run_reports_full_loss() {
        let report = compute_report(&[PacketRecord::default(); 10], 10, 10, false);
        assert_eq!(report.matched, 0);
        assert_eq!(report.loss_pct, 100.0);
        assert!(report.outbound.is_none());
    }
}
