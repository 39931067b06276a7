//! Library root for rstorrent.
//!
//! Re-exports core modules: bencode, torrent, tracker, peer, scheduler,
//! output, and logging for use by the `rstc` binary and its tests.
pub mod bencode;
pub mod logging;
pub mod output;
pub mod peer;
pub mod scheduler;
pub mod torrent;
pub mod tracker;
