//! Deduplicating clean/smudge filter for large binary files.
//!
//! git delta-compresses poorly across revisions of large binaries
//! (sample libraries, disk images), so history size and `add` time blow
//! up. This filter replaces such files in the main tree with a tiny
//! manifest of content-defined chunk digests; the chunks themselves are
//! stored once each, as plain blobs on the `git-fastcdc` side branch,
//! and shared between all revisions that contain the same byte ranges.
//!
//! The binary speaks git's long-running filter process protocol
//! (version 2) over its standard streams: one process per git
//! invocation, many clean/smudge requests per process. Protocol framing
//! lives in [pktline], the request loop and state machine in [filter];
//! chunking and chunk storage live in the `gfc_datastore` crate.

pub mod filter;
pub mod pktline;

pub use filter::{FilterDriver, SessionStats};
