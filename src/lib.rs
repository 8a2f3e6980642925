// Re-export the transport-agnostic core
pub use cvcore::{keys, progress, request, workflow};

// Transport and service adapters remain here
pub mod cloudkeys;
pub mod config;
pub mod controller;
pub mod fallback;
pub mod keystore;
pub mod stream;
pub mod transport;
