use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds between the NTP epoch (1900-01-01) and the Unix epoch.
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// NTP 64-bit timestamp: seconds since 1900-01-01 and a 2^-32 fractional
/// part, network byte order on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct NtpTimestamp {
    pub seconds: u32,
    pub fraction: u32,
}

impl NtpTimestamp {
    pub const LEN: usize = 8;

    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    pub fn from_system_time(t: SystemTime) -> Self {
        let since_epoch = t.duration_since(UNIX_EPOCH).unwrap_or_default();
        let seconds = (since_epoch.as_secs() + NTP_UNIX_OFFSET) as u32;
        let fraction = (((since_epoch.subsec_nanos() as u128) << 32) / NANOS_PER_SEC) as u32;
        Self { seconds, fraction }
    }

    pub fn to_bytes(self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0..4].copy_from_slice(&self.seconds.to_be_bytes());
        buf[4..8].copy_from_slice(&self.fraction.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::LEN]) -> Self {
        Self {
            seconds: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            fraction: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }

    fn total_nanos(self) -> i128 {
        (self.seconds as i128) * NANOS_PER_SEC as i128
            + ((self.fraction as i128 * NANOS_PER_SEC as i128) >> 32)
    }

    /// Signed `self - earlier` in nanoseconds. One-way deltas between
    /// unsynchronized clocks are legitimately negative.
    pub fn delta_nanos(self, earlier: NtpTimestamp) -> i64 {
        (self.total_nanos() - earlier.total_nanos()) as i64
    }
}
