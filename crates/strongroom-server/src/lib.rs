//! Strongroom node daemon.
//!
//! Builds a [`strongroom_core::node::Core`] from the environment, unseals it
//! with stored keys when the seal allows, and seals it again on shutdown.

pub mod config;
pub mod hardening;
