//! File tailing.
//!
//! [`FileTail`] follows one file line by line; [`TailSession`] drives it,
//! forwarding lines downstream and checkpointing the read offset.

mod error;
mod follower;
mod session;

pub use error::TailError;
pub use follower::{FileTail, Line, TailConfig};
pub use session::{SessionContext, TailSession};
