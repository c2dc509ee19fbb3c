//! Adapter implementations.

pub mod bottleneck;
pub mod embeddings;
pub mod invertible;
pub mod lora;
pub mod prefix_tuning;
