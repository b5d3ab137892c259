// src/sys/mod.rs
// 🛡️ Host-facing plumbing. Everything that touches a process, a socket or a
// file outside the crate sits behind one of these modules.

pub mod traits;     // Capability seams (shell, tunnel, resolver)
pub mod secrets;    // Memory hygiene for passwords and keys
pub mod ssh;        // OpenSSH-backed remote shell
pub mod firewall;   // Remote host firewall policy
