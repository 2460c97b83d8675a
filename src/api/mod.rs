//! Entry handler API.
//!
//! Lines read by a tail session are handed to an [`EntryHandler`], which
//! owns everything downstream (batching, shipping, retries).

mod handler;
mod labels;

pub use handler::{AddLabels, ChannelHandler, Entry, EntryHandler, HandlerError};
pub use labels::{LabelSet, FILENAME_LABEL};
