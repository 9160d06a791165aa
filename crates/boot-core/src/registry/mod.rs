//! Registry interop: the on-disk index layout and the upstream HTTP client.

pub mod client;
pub mod index;

pub use client::RegistryClient;
