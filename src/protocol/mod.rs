//! Envelope construction, validation and duplicate detection.
//!
//! Send path: construct, sign, encode. Receive path: decode, verify the
//! signature, check freshness, check for duplicates, decrypt. A failure at
//! any step rejects the envelope.

pub mod envelope;
pub mod replay;

pub use envelope::{
    build, check_freshness, decrypt, parse, unix_now, verify, verify_and_decrypt, Envelope,
};
pub use replay::ReplayWindow;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum plaintext length in Unicode scalar values
pub const MAX_PLAINTEXT_CHARS: usize = 10_000;

/// Accepted clock difference between sender and receiver, in seconds
pub const FRESHNESS_WINDOW_SECS: f64 = 300.0;

/// Default number of message ids remembered for duplicate detection
pub const REPLAY_WINDOW_CAPACITY: usize = 10_000;
