//! DatabaseCredentialBinding cache and Pod matching.
//!
//! - `cache`: watch-backed mirror of every binding in the cluster
//! - `matcher`: selects and de-duplicates the bindings that apply to a Pod

pub mod cache;
pub mod matcher;

pub use cache::{BindingCache, BindingEvent, ObjectKey};
pub use matcher::{BindingMatcher, DEFAULT_OUTPUT_PATH, MatchedCredential, match_bindings};
