//! Shared log storage.
//!
//! - `LogFile`: append, read and delete operations on the data file
//! - `SharedLog`: the lock that serializes all of them

mod file;
mod guard;

pub use file::{LogFile, ReplayError};
pub use guard::SharedLog;
