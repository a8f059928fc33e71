//! xv-watch: filesystem producer for the encryption pipeline
//!
//! [`DirWatcherTap`] observes a source directory, feeds every file through
//! the engine as an encryption work unit and mirrors the results into a
//! target directory with a `.xv` suffix. Decryption of watched files is
//! deliberately not offered.

mod dir_watcher;

pub use dir_watcher::{DirWatcherTap, WatchOptions, ENCODED_FILE_EXTENSION};
