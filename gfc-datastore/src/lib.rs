//! This crate implements the chunk storage and access layer.
//!
//! # Data formats
//!
//! git-fastcdc splits large files into content-defined chunks and stores
//! them deduplicated inside the repository itself, as ordinary blob
//! objects on a dedicated branch (`refs/heads/git-fastcdc`).
//!
//! The blob recorded in the main tree for a filtered file is a small
//! *manifest*: a `fastcdc` magic line followed by one chunk digest per
//! line. Concatenating the listed chunks in order reconstructs the
//! original file.
//!
//! A chunk is addressed by its own object id, so storing the same data
//! twice is free. On the chunk branch, chunks are grouped below
//! two-hex-character prefix directories (`ab/abcdef...`) to keep any
//! single tree small.
//!
//! # Synchronization
//!
//! Chunks written during one filter session become loose objects
//! immediately (`hash-object -w` is safe against concurrent writers),
//! but the branch is only advanced once, at session end, with a single
//! commit on top of the previous tip. The `update-ref` compare-and-swap
//! is the atomic commit point: a crash beforehand orphans loose objects
//! but can never corrupt the ref, and concurrent filter processes
//! serialize there (losers re-merge their entries onto the fresh tip and
//! retry once).

pub mod blob_buffer;
pub mod chunk_store;
pub mod chunker;
pub mod config;
pub mod git;
pub mod manifest;

pub use blob_buffer::BlobBuffer;
pub use chunk_store::{ChunkStorage, ChunkStore, MissingChunk, RefContention, SIDE_BRANCH};
pub use chunker::{ChunkStream, Chunker};
pub use config::FilterConfig;
pub use git::GitRepo;
pub use manifest::{InvalidManifest, Manifest, MANIFEST_MAGIC};
