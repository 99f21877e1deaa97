//! Utility functions for common operations.
//!
//! This module provides reusable utilities for:
//!
//! - **Text processing**: title derivation from links, line folding, control
//!   character stripping
//! - **Dates**: lenient feed date parsing and HTTP date formatting
//! - **URLs**: relative link resolution and `~` expansion

mod date;
mod links;
mod text;

pub use date::{
    format_http_date, format_rfc822, format_timestamp, parse_date, parse_http_date, try_parse_date,
    w3cdtf_to_rfc822,
};
pub use links::{absolute_url, resolve_tilde};
pub use text::{first_line, make_title, single_line, strip_control_chars};
