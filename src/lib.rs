//! RTP/RTCP session transport manager.
//!
//! Binds paired RTP/RTCP UDP ports, negotiates SRTP from SDES crypto lines,
//! frames and sends outbound media, and routes inbound datagrams to a
//! registered consumer.

pub mod config;
pub mod error;
pub mod rtp;
pub mod session;
pub mod srtp;
pub mod transport;

pub use config::SessionConfig;
pub use error::{DispatchError, ManagerError};
pub use rtp::RtpPacket;
pub use session::{LifecycleState, RtpConsumer, Session, StatsSnapshot};
pub use srtp::{CryptoSuite, SrtpEngine};
pub use transport::stun::NatContext;
