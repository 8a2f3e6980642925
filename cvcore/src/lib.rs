//! Transport-free core of the decryption workflow: key normalization, the
//! progress wire model and its aggregation, and the phase state machine.

pub mod keys;
pub mod progress;
pub mod request;
pub mod workflow;
