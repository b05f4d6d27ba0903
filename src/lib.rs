//! Two-participant WebRTC pairing over a shared key-value relay.
//!
//! The first participant to find the session document empty writes an
//! offer; the second answers it. Candidates trickle through the same
//! document until the data channel opens, after which it is deleted.

pub mod config;
pub mod error;
pub mod logger;
pub mod message;
pub mod peer;
pub mod relay;
pub mod session;
pub mod signaling;
pub mod transport;
pub mod utils;
pub mod webrtc_peer;

pub use config::{PairingConfig, PeerConfig};
pub use error::{ConfigError, PairingError, RelayError, TransportError};
pub use message::AppMessage;
pub use peer::{IceCandidate, NegotiatorState, SessionDescription};
pub use relay::{MemoryRelay, MemoryRelayClient, RelayStore};
pub use signaling::{start_pairing, PairingCoordinator, PairingPhase, Role};
pub use transport::{Transport, TransportEvent};
pub use webrtc_peer::WebRtcPeer;
