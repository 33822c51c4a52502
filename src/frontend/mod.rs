//! Frontend listener.
//!
//! Accepts client connections and dispatches each HTTP request to the
//! load-balance handler.

mod listener;

pub use listener::FrontendListener;
