pub mod codec;
pub mod responder;
pub mod sender;
pub mod socket;
pub mod stats;
pub mod time;

pub use codec::{
    ReflectedPacket, RequestTwSession, SenderPacket, DEFAULT_ERROR_ESTIMATE, MAX_PADDING,
};
pub use responder::{Responder, ResponderConfig};
pub use sender::{Sender, SenderConfig, SenderState, COUNT_MAX, COUNT_MIN};
pub use socket::{bind_udp, SocketOptions};
pub use stats::{compute_report, DirectionStats, PacketRecord, SessionReport};
pub use time::NtpTimestamp;
