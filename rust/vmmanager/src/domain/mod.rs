//! Core domain models.
//!
//! This module contains the cached VM record, its lifecycle status, and the
//! queue intent payloads exchanged with the lab front-end.

pub mod intents;
pub mod server;

pub use intents::*;
pub use server::*;
