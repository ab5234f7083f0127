//! Villip - Content-filtering reverse proxy
//!
//! Forwards client traffic to configured backends and rewrites it on the way.
//!
//! ## Features
//!
//! - Body and `Location` substitutions scoped by URL pattern
//! - Header injection on requests and responses
//! - Source-network and header-token restrictions with per-port priorities
//! - gzip and deflate transcoding
//! - Dump capture of original and filtered messages
//! - Raw TCP splicing

pub mod api;
pub mod config;
pub mod dump;
pub mod error;
pub mod proxy;
pub mod rewrite;
pub mod rule;

pub use config::Config;
pub use error::{Result, VillipError};
