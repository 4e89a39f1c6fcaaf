//! Illustrative C5 strategy (spec §4.5's "Rust realization"): a generalization of
//! the "5-hour / weekly" two-window pattern spec.md uses as its running example.

pub mod primary_secondary_window;

pub use primary_secondary_window::PrimarySecondaryWindowRanking;
