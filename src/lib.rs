//! Foldsync
//!
//! The pull engine of a peer-to-peer folder synchronizer. For each
//! mirrored folder it reconciles the local tree with the cluster's
//! agreed-upon view: directories are created or re-moded in place,
//! deletions are applied children first, and changed files are
//! assembled block by block into a temporary, from local files where
//! the content already exists and from the least busy peer where it
//! does not, then verified and atomically renamed over the target.
//!
//! The index, the network transport and the scan logic live elsewhere;
//! they plug in through the traits in [`model`].

pub mod activity;
pub mod config;
pub mod events;
pub mod fdcache;
pub mod model;
pub mod osutil;
pub mod protocol;
pub mod puller;
pub mod scanner;
pub mod state;
pub mod tempname;
pub mod versioner;

pub use puller::Puller;
