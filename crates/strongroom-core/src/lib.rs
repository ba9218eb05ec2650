//! Core library for `Strongroom`.
//!
//! Contains the encryption barrier, cryptographic primitives, the Shamir and
//! auto seals, seal migration, mount tables and the [`node::Core`] state
//! machine that drives a node through sealed, standby and active. This crate
//! depends on `strongroom-storage` for the storage backend traits and knows
//! nothing about specific secret engines or auth methods; those plug in
//! through [`subsystem`].

pub mod barrier;
pub mod crypto;
pub mod error;
pub mod mount;
pub mod node;
pub mod replication;
pub mod seal;
pub mod shamir;
pub mod subsystem;
pub mod unseal;
