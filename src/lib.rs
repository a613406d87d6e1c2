//! Offline-first sync core for a shared two-person planner workspace.
//!
//! Cache-first reads with background revalidation, live change feeds,
//! an offline mutation queue replayed on reconnect, and approval-gated
//! edits for records the current user did not author.

pub mod approval;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod logging;
pub mod queue;
pub mod realtime;
pub mod remote;
pub mod resource;
pub mod session;
pub mod sync;

#[cfg(test)]
mod testing;
