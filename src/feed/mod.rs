//! Feed retrieval and normalization.
//!
//! - [`dispatcher`] - picks a fetch strategy per feed URL (HTTP, file, plugin,
//!   remote service) and applies the retry and conditional-GET policy
//! - [`http`] - transport: client construction, conditional GET, size limits
//! - [`parser`] - RSS/Atom/JSON Feed documents into [`RawFeed`]
//! - [`normalizer`] - [`RawFeed`] of any dialect into [`CanonicalFeed`]
//! - [`reloader`] - bounded-concurrency bulk reload
//! - [`collab`] - validator cache, ignore list and text renderer interfaces
//!
//! # Example
//!
//! ```ignore
//! let retriever = Retriever::new(&config, client.clone(), cache, ignores.clone());
//! let normalizer = Normalizer::new(&config, client, renderer, ignores);
//! let raw = retriever.retrieve("https://example.com/feed.xml").await?;
//! let feed = normalizer.normalize(raw, "https://example.com/feed.xml").await;
//! ```

pub mod collab;
pub mod dispatcher;
pub mod http;
pub mod model;
pub mod normalizer;
pub mod parser;
pub mod reloader;

pub use dispatcher::{RetrieveError, Retriever};
pub use model::{CanonicalFeed, CanonicalItem, Dialect, Enclosure, RawFeed, RawItem};
pub use normalizer::Normalizer;
pub use reloader::{ReloadOutcome, ReloadResult, Reloader};
