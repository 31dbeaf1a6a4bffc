//! TCP transport: framing, inbound listener, outbound sender and pool.
//!
//! Every connection carries exactly one length-prefixed envelope. The
//! inbound side closes the socket after reading it.

pub mod frame;
pub mod listener;
pub mod pool;
pub mod sender;

pub use frame::{read_frame, write_frame, MAX_FRAME_SIZE};
pub use listener::{Listener, MessageHandler};
pub use pool::{ConnectionPool, PoolKey};
pub use sender::{FanoutReport, Sender};
