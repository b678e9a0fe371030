//! Host-resident backup agent gated by a secrets backend.
//!
//! The agent keeps a host's encrypted volumes mounted, its repositories
//! checked out, and its restic backups current, but only while the
//! Vault-style secrets backend holding every credential is unsealed. A
//! sequential scheduler drives the routine work; an HTTP control surface
//! exposes the same actions, plus the seal-key and token plumbing needed
//! to bring a freshly booted host back into service.

pub mod agent;
pub mod config;
pub mod error;
pub mod jobs;
pub mod ops;
pub mod server;
pub mod store;
pub mod vault;

#[cfg(test)]
pub(crate) mod testutil;
