pub(crate) mod connection;
pub(crate) mod data_channel;
pub mod ice;
pub mod state;
pub mod types;

pub use ice::{analyze_candidates, CandidateSummary};
pub use state::{NegotiatorState, CONNECTED_NOTIFY_DELAY, DATA_CHANNEL_LABEL, GRACE_PERIOD};
pub use types::{CandidateKind, IceCandidate, SdpKind, ServerConfig, SessionDescription};
