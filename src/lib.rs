// src/lib.rs
//
// Provisions containerized VPN services on remote hosts over SSH and drives the
// local side of a connection: config assembly, tunnel lifecycle and routing.

pub mod config;
pub mod configurators;
pub mod containers;
pub mod credentials;
pub mod daemon;
pub mod error;
pub mod provision;
pub mod scripts;
pub mod sys;
pub mod vpn;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
