//! Feed acquisition core.
//!
//! Fetches articles from direct HTTP feeds, local files, shell plugins and
//! remote aggregation services, and normalizes them into one canonical model.
//!
//! - [`feed`] - retrieval dispatcher, parser, normalizer and bulk reloader
//! - [`remote`] - the remote service contract and its provider adapters
//! - [`config`] - TOML configuration
//! - [`util`] - text, date and URL helpers shared by the above

pub mod config;
pub mod feed;
pub mod remote;
pub mod util;
