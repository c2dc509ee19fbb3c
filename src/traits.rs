//! Core traits for adapters and adapter-capable model components.

use std::collections::HashMap;

use candle_core::Tensor;

use crate::config::AdaptersConfig;
use crate::Result;

/// Configuration trait for adapter hyperparameters.
pub trait AdapterConfig: Clone + Send + Sync {
    /// Validate the configuration parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    fn validate(&self) -> Result<()>;
}

/// Core adapter trait for parameter-efficient fine-tuning.
pub trait Adapter: Send + Sync {
    /// The configuration type for this adapter.
    type Config: AdapterConfig;

    /// Forward pass applying the adapter transformation.
    ///
    /// # Arguments
    /// * `input` - Input tensor
    /// * `base_output` - Optional output from the base layer (for residual adapters)
    ///
    /// # Returns
    /// Transformed tensor
    ///
    /// # Errors
    ///
    /// Returns an error if the forward pass fails.
    fn forward(&self, input: &Tensor, base_output: Option<&Tensor>) -> Result<Tensor>;

    /// Get the number of trainable parameters.
    #[must_use]
    fn num_parameters(&self) -> usize;

    /// Get the adapter's configuration.
    fn config(&self) -> &Self::Config;
}

/// Trait for adapters that can be merged into base weights.
pub trait Mergeable: Adapter {
    /// Merge adapter weights into base model weights.
    ///
    /// # Arguments
    /// * `base_weight` - The original weight tensor to merge into
    ///
    /// # Returns
    /// New tensor with adapter weights merged
    ///
    /// # Errors
    ///
    /// Returns an error if merging fails.
    fn merge(&self, base_weight: &Tensor) -> Result<Tensor>;

    /// Unmerge adapter weights from merged weights.
    ///
    /// # Arguments
    /// * `merged_weight` - Weight tensor with adapter already merged
    ///
    /// # Returns
    /// Original base weight tensor
    ///
    /// # Errors
    ///
    /// Returns an error if unmerging fails.
    fn unmerge(&self, merged_weight: &Tensor) -> Result<Tensor>;
}

/// Trait for trainable adapters.
pub trait Trainable {
    /// Freeze all adapter parameters (disable gradients).
    fn freeze(&mut self);

    /// Unfreeze all adapter parameters (enable gradients).
    fn unfreeze(&mut self);

    /// Check if the adapter is frozen.
    #[must_use]
    fn is_frozen(&self) -> bool;
}

/// Trait for adapter state that can be saved and loaded.
pub trait SaveLoad {
    /// Get all tensors as a map of name -> tensor.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor cannot be collected.
    fn state_dict(&self) -> Result<HashMap<String, Tensor>>;

    /// Load tensors from a state dict.
    ///
    /// # Errors
    ///
    /// Returns an error if a required tensor is missing or has the wrong shape.
    fn load_state_dict(&mut self, state_dict: &HashMap<String, Tensor>) -> Result<()>;
}

/// One-time adapter setup for a model component.
///
/// Called once per component during model adapter setup, parents before
/// children's containers. Calling it again must leave the component in the
/// same state.
pub trait InitAdapters {
    /// Wire adapter support into the component and instantiate every adapter
    /// already registered in `config` that targets it.
    ///
    /// # Errors
    ///
    /// Returns an error if a required sub-module is missing or an adapter
    /// cannot be created.
    fn init_adapters(&mut self, config: &AdaptersConfig) -> Result<()>;
}
