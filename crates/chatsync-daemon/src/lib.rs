//! chatsync daemon library
//!
//! Watches the chat database files for modification, collapses bursts of
//! changes, and polls the database for new and updated rows, emitting each
//! logical change once as a typed event.

pub mod listener;
pub mod poller;
pub mod sink;
