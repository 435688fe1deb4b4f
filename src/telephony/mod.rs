//! Telephony carrier integration
//!
//! REST dialing (placing and terminating PSTN calls) and the per-call media
//! stream WebSocket framing. The carrier itself is an external collaborator;
//! this module only speaks its wire formats.

pub mod media_stream;
pub mod outbound;

pub use media_stream::{MediaInbound, TelephonyMediaHandler};
pub use outbound::CarrierClient;
