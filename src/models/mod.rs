//! Transformer models with adapter support.

pub mod bert;
