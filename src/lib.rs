//! Log tailing agent.
//!
//! Watches directories for log files whose names match a regex, tails each
//! file from a persisted byte offset, parses new lines into records and
//! stores them in SQLite tables whose columns follow a declared field schema.

pub mod checkpoint;
pub mod config;
pub mod debounce;
pub mod error;
pub mod metrics;
pub mod parsers;
pub mod processor;
pub mod rotation;
pub mod runner;
pub mod storage;
pub mod tailer;
pub mod watcher;

/// Raw fields extracted from a single log line.
pub type Record = std::collections::HashMap<String, String>;

/// Static per-file fields captured from the file name.
pub type ExtensionData = std::collections::HashMap<String, String>;
