//! Illustrative C4 plugin (spec §4.4's "Rust realization"). Real per-provider usage
//! endpoint parsing is out of scope; this stands in for "an endpoint that already
//! returns the normalized [`crate::usage::UsageReport`] shape".

pub mod generic_json;

pub use generic_json::GenericJsonProber;
