//! Illustrative C3 plugins (spec §4.3's "Rust realization"). Concrete vendor wire
//! formats beyond these two are out of scope; they exist to show how a real
//! provider wires an `OAuthRefresher` into a [`crate::refresher::RefresherRegistry`].

pub mod chatgpt_session;
pub mod oauth2_standard;

pub use chatgpt_session::ChatGptSessionRefresher;
pub use oauth2_standard::Oauth2StandardRefresher;
