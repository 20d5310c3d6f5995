//! chatline - terminal chat client
//!
//! Keeps a local session list and conversations, syncs them with a chat
//! backend, and shows optimistic "thinking" placeholders while replies are
//! in flight.

pub mod app;
pub mod client;
pub mod config;
pub mod conversation;
pub mod logging;
pub mod message;
pub mod reconcile;
pub mod store;
pub mod ui;
