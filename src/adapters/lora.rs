//! LoRA (Low-Rank Adaptation) implementation.
//!
//! LoRA reduces the number of trainable parameters by decomposing weight updates
//! into low-rank matrices: `ΔW = BA` where `B ∈ R^{d×r}` and `A ∈ R^{r×k}`.
//!
//! [`LoraLinear`] wraps a frozen base [`Linear`] and holds any number of named
//! LoRA deltas for it. [`Projection`] is the slot a model keeps for a linear
//! sublayer: plain until adapter setup wraps it.
//!
//! Reference: <https://arxiv.org/abs/2106.09685>

use std::collections::{BTreeMap, HashMap};

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::Linear;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::AdaptersConfig;
use crate::context::ForwardContext;
use crate::error::{AdapterError, Result};
use crate::io::expect_tensor;
use crate::location::{AttnMatrix, LoraLocation};
use crate::traits::{Adapter, AdapterConfig, Mergeable, SaveLoad, Trainable};

/// Configuration for LoRA adapters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    /// Rank of the low-rank decomposition.
    pub r: usize,

    /// Scaling numerator; the delta is scaled by `alpha / r`.
    pub alpha: usize,

    /// Dropout probability on the LoRA branch.
    ///
    /// Validated and saved with the adapter config so training setups can
    /// read it back; the forward pass here never applies dropout.
    #[serde(default)]
    pub dropout: f64,

    /// Wrap the attention query/key/value projections.
    #[serde(default = "default_true")]
    pub selfattn_lora: bool,

    /// Wrap the first feed-forward dense layer.
    #[serde(default)]
    pub intermediate_lora: bool,

    /// Wrap the second feed-forward dense layer.
    #[serde(default)]
    pub output_lora: bool,

    /// Attention matrices adapted when `selfattn_lora` is set.
    #[serde(default = "default_attn_matrices")]
    pub attn_matrices: Vec<AttnMatrix>,

    /// Initialize A with Gaussian, B with zeros (standard) or vice versa.
    #[serde(default)]
    pub init_lora_weights: LoraInitialization,
}

fn default_true() -> bool {
    true
}

fn default_attn_matrices() -> Vec<AttnMatrix> {
    vec![AttnMatrix::Q, AttnMatrix::V]
}

/// Initialization strategy for LoRA weights.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoraInitialization {
    /// Standard: A ~ N(0, σ²), B = 0
    #[default]
    Standard,
    /// Gaussian for both: A, B ~ N(0, σ²)
    Gaussian,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            r: 8,
            alpha: 8,
            dropout: 0.0,
            selfattn_lora: true,
            intermediate_lora: false,
            output_lora: false,
            attn_matrices: default_attn_matrices(),
            init_lora_weights: LoraInitialization::Standard,
        }
    }
}

impl LoraConfig {
    /// Whether this configuration adapts the linear layer at `location`.
    #[must_use]
    pub fn targets(&self, location: LoraLocation, attn_matrix: Option<AttnMatrix>) -> bool {
        match location {
            LoraLocation::SelfAttn => {
                self.selfattn_lora
                    && attn_matrix.is_some_and(|m| self.attn_matrices.contains(&m))
            }
            LoraLocation::Intermediate => self.intermediate_lora,
            LoraLocation::Output => self.output_lora,
        }
    }
}

impl AdapterConfig for LoraConfig {
    fn validate(&self) -> Result<()> {
        if self.r == 0 {
            return Err(AdapterError::InvalidConfig("rank must be > 0".into()));
        }
        if self.alpha == 0 {
            return Err(AdapterError::InvalidConfig("alpha must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.dropout) {
            return Err(AdapterError::InvalidConfig(
                "dropout must be between 0 and 1".into(),
            ));
        }
        if !self.selfattn_lora && !self.intermediate_lora && !self.output_lora {
            return Err(AdapterError::InvalidConfig(
                "LoRA must target at least one location".into(),
            ));
        }
        if self.selfattn_lora && self.attn_matrices.is_empty() {
            return Err(AdapterError::InvalidConfig(
                "attn_matrices cannot be empty when selfattn_lora is set".into(),
            ));
        }
        Ok(())
    }
}

/// LoRA layer implementing low-rank adaptation.
///
/// Computes: `output = base_output + (x @ A^T @ B^T) * scaling`
pub struct LoraLayer {
    /// Down projection: in_features → r
    lora_a: Linear,
    /// Up projection: r → out_features
    lora_b: Linear,
    /// Scaling factor = alpha / r
    scaling: f64,
    /// Configuration
    config: LoraConfig,
    /// Input dimension
    in_features: usize,
    /// Output dimension
    out_features: usize,
    /// Whether gradients are disabled
    frozen: bool,
}

impl LoraLayer {
    /// Create a new LoRA layer with zeros initialization for B.
    ///
    /// # Arguments
    /// * `in_features` - Input dimension
    /// * `out_features` - Output dimension
    /// * `config` - LoRA configuration
    /// * `dtype` - Data type of the wrapped layer
    /// * `device` - Device to create tensors on
    ///
    /// # Errors
    /// Returns error if configuration is invalid or weight initialization fails.
    pub fn new_with_zeros(
        in_features: usize,
        out_features: usize,
        config: LoraConfig,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;

        #[allow(clippy::cast_precision_loss)]
        let scaling = config.alpha as f64 / config.r as f64;

        #[allow(clippy::cast_precision_loss)]
        let std = (1.0 / in_features as f64).sqrt() as f32;
        let a_weight = Tensor::randn(0.0f32, std, (config.r, in_features), device)?;
        let b_weight = match config.init_lora_weights {
            LoraInitialization::Standard => {
                Tensor::zeros((out_features, config.r), DType::F32, device)?
            }
            LoraInitialization::Gaussian => {
                Tensor::randn(0.0f32, std, (out_features, config.r), device)?
            }
        };

        Ok(Self {
            lora_a: Linear::new(a_weight.to_dtype(dtype)?, None),
            lora_b: Linear::new(b_weight.to_dtype(dtype)?, None),
            scaling,
            config,
            in_features,
            out_features,
            frozen: false,
        })
    }

    /// Get the scaling factor.
    #[must_use]
    pub fn scaling(&self) -> f64 {
        self.scaling
    }

    /// Get the rank.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.config.r
    }

    /// Scaled weight delta `B @ A * scaling`, shaped like the base weight.
    ///
    /// # Errors
    ///
    /// Returns an error if the matmul fails.
    pub fn delta_weight(&self) -> Result<Tensor> {
        let delta_w = self.lora_b.weight().matmul(self.lora_a.weight())?;
        Ok(delta_w.affine(self.scaling, 0.0)?)
    }
}

impl Adapter for LoraLayer {
    type Config = LoraConfig;

    fn forward(&self, input: &Tensor, base_output: Option<&Tensor>) -> Result<Tensor> {
        // LoRA forward: x @ A^T @ B^T * scaling
        let lora_out = self.lora_a.forward(input)?;
        let lora_out = self.lora_b.forward(&lora_out)?;
        let lora_out = lora_out.affine(self.scaling, 0.0)?;

        match base_output {
            Some(base) => Ok(base.broadcast_add(&lora_out)?),
            None => Ok(lora_out),
        }
    }

    fn num_parameters(&self) -> usize {
        self.config.r * (self.in_features + self.out_features)
    }

    fn config(&self) -> &Self::Config {
        &self.config
    }
}

impl Mergeable for LoraLayer {
    fn merge(&self, base_weight: &Tensor) -> Result<Tensor> {
        Ok(base_weight.broadcast_add(&self.delta_weight()?)?)
    }

    fn unmerge(&self, merged_weight: &Tensor) -> Result<Tensor> {
        Ok(merged_weight.broadcast_sub(&self.delta_weight()?)?)
    }
}

impl Trainable for LoraLayer {
    fn freeze(&mut self) {
        self.frozen = true;
    }

    fn unfreeze(&mut self) {
        self.frozen = false;
    }

    fn is_frozen(&self) -> bool {
        self.frozen
    }
}

impl SaveLoad for LoraLayer {
    fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        let mut state_dict = HashMap::new();
        state_dict.insert("lora_a".to_string(), self.lora_a.weight().clone());
        state_dict.insert("lora_b".to_string(), self.lora_b.weight().clone());
        Ok(state_dict)
    }

    fn load_state_dict(&mut self, state_dict: &HashMap<String, Tensor>) -> Result<()> {
        let a = expect_tensor(state_dict, "lora_a", &[self.config.r, self.in_features])?;
        let b = expect_tensor(state_dict, "lora_b", &[self.out_features, self.config.r])?;
        self.lora_a = Linear::new(a, None);
        self.lora_b = Linear::new(b, None);
        Ok(())
    }
}

/// Linear layer carrying named LoRA adapters on top of a frozen base layer.
pub struct LoraLinear {
    base: Linear,
    location: LoraLocation,
    attn_matrix: Option<AttnMatrix>,
    adapters: BTreeMap<String, LoraLayer>,
    merged: Option<String>,
}

impl LoraLinear {
    /// Wrap `base` for LoRA at `location`.
    ///
    /// Every LoRA adapter already registered in `config` that targets this
    /// location (and attention matrix) is instantiated immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if an adapter cannot be created.
    pub fn wrap(
        base: Linear,
        location: LoraLocation,
        config: &AdaptersConfig,
        attn_matrix: Option<AttnMatrix>,
    ) -> Result<Self> {
        let mut wrapped = Self {
            base,
            location,
            attn_matrix,
            adapters: BTreeMap::new(),
            merged: None,
        };
        wrapped.sync_with_config(config)?;
        debug!(
            location = %location,
            attn_matrix = ?attn_matrix.map(AttnMatrix::as_str),
            adapters = wrapped.adapters.len(),
            "wrapped linear layer for LoRA"
        );
        Ok(wrapped)
    }

    /// Instantiate registered adapters that are not yet present.
    ///
    /// # Errors
    ///
    /// Returns an error if an adapter cannot be created.
    pub fn sync_with_config(&mut self, config: &AdaptersConfig) -> Result<()> {
        for (name, lora) in config.lora_adapters() {
            self.add_adapter(name, lora)?;
        }
        Ok(())
    }

    /// Add a LoRA adapter if `config` targets this layer.
    ///
    /// Returns `true` if an adapter was created, `false` if this layer is not
    /// targeted or already holds an adapter with this name.
    ///
    /// # Errors
    ///
    /// Returns an error if weight initialization fails.
    pub fn add_adapter(&mut self, name: &str, config: &LoraConfig) -> Result<bool> {
        if !config.targets(self.location, self.attn_matrix) || self.adapters.contains_key(name) {
            return Ok(false);
        }
        let weight = self.base.weight();
        let layer = LoraLayer::new_with_zeros(
            self.in_features(),
            self.out_features(),
            config.clone(),
            weight.dtype(),
            weight.device(),
        )?;
        self.adapters.insert(name.to_string(), layer);
        Ok(true)
    }

    /// Remove an adapter. A merged adapter is unmerged first.
    ///
    /// # Errors
    ///
    /// Returns an error if unmerging fails.
    pub fn delete_adapter(&mut self, name: &str) -> Result<bool> {
        if self.merged.as_deref() == Some(name) {
            self.unmerge_adapter()?;
        }
        Ok(self.adapters.remove(name).is_some())
    }

    /// Check if an adapter is held by this layer.
    #[must_use]
    pub fn has_adapter(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    /// Names of held adapters in sorted order.
    #[must_use]
    pub fn adapter_names(&self) -> Vec<&str> {
        self.adapters.keys().map(String::as_str).collect()
    }

    /// Get a held adapter.
    #[must_use]
    pub fn adapter(&self, name: &str) -> Option<&LoraLayer> {
        self.adapters.get(name)
    }

    /// Get a held adapter mutably.
    pub fn adapter_mut(&mut self, name: &str) -> Option<&mut LoraLayer> {
        self.adapters.get_mut(name)
    }

    /// Location this layer was wrapped at.
    #[must_use]
    pub fn location(&self) -> LoraLocation {
        self.location
    }

    /// Attention matrix this layer projects, for attention projections.
    #[must_use]
    pub fn attn_matrix(&self) -> Option<AttnMatrix> {
        self.attn_matrix
    }

    /// The wrapped base layer.
    #[must_use]
    pub fn base(&self) -> &Linear {
        &self.base
    }

    /// Input dimension of the base layer.
    #[must_use]
    pub fn in_features(&self) -> usize {
        self.base.weight().dims()[1]
    }

    /// Output dimension of the base layer.
    #[must_use]
    pub fn out_features(&self) -> usize {
        self.base.weight().dims()[0]
    }

    /// Name of the adapter currently merged into the base weight.
    #[must_use]
    pub fn merged_adapter(&self) -> Option<&str> {
        self.merged.as_deref()
    }

    /// Merge an adapter into the base weight.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter is missing or another adapter is merged.
    pub fn merge_adapter(&mut self, name: &str) -> Result<()> {
        if let Some(merged) = &self.merged {
            if merged == name {
                return Ok(());
            }
            return Err(AdapterError::InvalidConfig(format!(
                "adapter '{merged}' is already merged"
            )));
        }
        let adapter = self
            .adapters
            .get(name)
            .ok_or_else(|| AdapterError::AdapterNotFound {
                name: name.to_string(),
            })?;
        let weight = adapter.merge(self.base.weight())?;
        self.base = Linear::new(weight, self.base.bias().cloned());
        self.merged = Some(name.to_string());
        Ok(())
    }

    /// Undo [`LoraLinear::merge_adapter`]. No-op if nothing is merged.
    ///
    /// # Errors
    ///
    /// Returns an error if the weight update fails.
    pub fn unmerge_adapter(&mut self) -> Result<()> {
        let Some(name) = self.merged.take() else {
            return Ok(());
        };
        if let Some(adapter) = self.adapters.get(&name) {
            let weight = adapter.unmerge(self.base.weight())?;
            self.base = Linear::new(weight, self.base.bias().cloned());
        }
        Ok(())
    }

    /// Forward pass applying the adapters named by the active composition.
    ///
    /// # Errors
    ///
    /// Returns an error if a held adapter is part of a parallel block.
    pub fn forward(&self, x: &Tensor, ctx: &ForwardContext) -> Result<Tensor> {
        let mut output = self.base.forward(x)?;
        let Some(active) = ctx.active() else {
            return Ok(output);
        };
        let names: Vec<&str> = active
            .flatten()
            .into_iter()
            .filter(|n| self.adapters.contains_key(*n))
            .collect();
        if names.is_empty() {
            return Ok(output);
        }
        if active.has_parallel() {
            return Err(AdapterError::UnsupportedComposition {
                location: self.location.to_string(),
                message: "LoRA does not support parallel composition".into(),
            });
        }
        for name in names {
            if self.merged.as_deref() == Some(name) {
                continue;
            }
            if let Some(adapter) = self.adapters.get(name) {
                output = adapter.forward(x, Some(&output))?;
            }
        }
        Ok(output)
    }
}

/// Linear sublayer slot that adapter setup can wrap in place.
pub enum Projection {
    /// Unwrapped base layer.
    Plain(Linear),
    /// Base layer wrapped for LoRA.
    Lora(LoraLinear),
}

impl Projection {
    /// Replace a plain layer with its LoRA-wrapped equivalent.
    ///
    /// An already wrapped layer keeps its adapters and only picks up newly
    /// registered ones.
    ///
    /// # Errors
    ///
    /// Returns an error if an adapter cannot be created.
    pub fn wrap_lora(
        &mut self,
        location: LoraLocation,
        config: &AdaptersConfig,
        attn_matrix: Option<AttnMatrix>,
    ) -> Result<()> {
        match self {
            Self::Plain(base) => {
                *self = Self::Lora(LoraLinear::wrap(base.clone(), location, config, attn_matrix)?);
            }
            Self::Lora(lora) => lora.sync_with_config(config)?,
        }
        Ok(())
    }

    /// Whether setup has wrapped this slot.
    #[must_use]
    pub fn is_lora_wrapped(&self) -> bool {
        matches!(self, Self::Lora(_))
    }

    /// The LoRA wrapper, if wrapped.
    #[must_use]
    pub fn as_lora(&self) -> Option<&LoraLinear> {
        match self {
            Self::Lora(lora) => Some(lora),
            Self::Plain(_) => None,
        }
    }

    /// The LoRA wrapper mutably, if wrapped.
    pub fn as_lora_mut(&mut self) -> Option<&mut LoraLinear> {
        match self {
            Self::Lora(lora) => Some(lora),
            Self::Plain(_) => None,
        }
    }

    fn weight(&self) -> &Tensor {
        match self {
            Self::Plain(base) => base.weight(),
            Self::Lora(lora) => lora.base().weight(),
        }
    }

    /// Input dimension.
    #[must_use]
    pub fn in_features(&self) -> usize {
        self.weight().dims()[1]
    }

    /// Output dimension.
    #[must_use]
    pub fn out_features(&self) -> usize {
        self.weight().dims()[0]
    }

    /// Forward pass.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying forward fails.
    pub fn forward(&self, x: &Tensor, ctx: &ForwardContext) -> Result<Tensor> {
        match self {
            Self::Plain(base) => Ok(base.forward(x)?),
            Self::Lora(lora) => lora.forward(x, ctx),
        }
    }
}

impl From<Linear> for Projection {
    fn from(base: Linear) -> Self {
        Self::Plain(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composition::Composition;
    use candle_core::Device;

    fn base_linear(in_features: usize, out_features: usize) -> Result<Linear> {
        let device = Device::Cpu;
        let weight = Tensor::randn(0f32, 1f32, (out_features, in_features), &device)?;
        let bias = Tensor::zeros(out_features, DType::F32, &device)?;
        Ok(Linear::new(weight, Some(bias)))
    }

    fn lora_registry(name: &str, config: LoraConfig) -> Result<AdaptersConfig> {
        let mut adapters = AdaptersConfig::new();
        adapters.add(name, config.into())?;
        Ok(adapters)
    }

    #[test]
    fn test_lora_config_default() {
        let config = LoraConfig::default();
        assert_eq!(config.r, 8);
        assert_eq!(config.alpha, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_lora_config_invalid_rank() {
        let config = LoraConfig {
            r: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lora_config_targets() {
        let config = LoraConfig::default();
        assert!(config.targets(LoraLocation::SelfAttn, Some(AttnMatrix::Q)));
        assert!(!config.targets(LoraLocation::SelfAttn, Some(AttnMatrix::K)));
        assert!(config.targets(LoraLocation::SelfAttn, Some(AttnMatrix::V)));
        assert!(!config.targets(LoraLocation::Intermediate, None));

        let ffn = LoraConfig {
            selfattn_lora: false,
            intermediate_lora: true,
            ..Default::default()
        };
        assert!(ffn.targets(LoraLocation::Intermediate, None));
        assert!(!ffn.targets(LoraLocation::SelfAttn, Some(AttnMatrix::Q)));
    }

    #[test]
    fn test_lora_forward_shape() -> Result<()> {
        let device = Device::Cpu;
        let layer =
            LoraLayer::new_with_zeros(768, 768, LoraConfig::default(), DType::F32, &device)?;

        let input = Tensor::zeros(&[1, 10, 768], DType::F32, &device)?;
        let output = layer.forward(&input, None)?;

        assert_eq!(output.shape().dims(), &[1, 10, 768]);
        Ok(())
    }

    #[test]
    fn test_lora_num_parameters() -> Result<()> {
        let device = Device::Cpu;
        let layer =
            LoraLayer::new_with_zeros(768, 768, LoraConfig::default(), DType::F32, &device)?;

        // r * (in + out) = 8 * (768 + 768) = 12288
        assert_eq!(layer.num_parameters(), 12288);
        Ok(())
    }

    #[test]
    fn test_wrap_keeps_dimensions_and_targets() -> Result<()> {
        let config = lora_registry("lora", LoraConfig::default())?;

        let q = LoraLinear::wrap(
            base_linear(16, 32)?,
            LoraLocation::SelfAttn,
            &config,
            Some(AttnMatrix::Q),
        )?;
        assert_eq!(q.in_features(), 16);
        assert_eq!(q.out_features(), 32);
        assert!(q.has_adapter("lora"));

        let k = LoraLinear::wrap(
            base_linear(16, 32)?,
            LoraLocation::SelfAttn,
            &config,
            Some(AttnMatrix::K),
        )?;
        assert!(!k.has_adapter("lora"));
        Ok(())
    }

    #[test]
    fn test_zero_initialized_adapter_matches_base() -> Result<()> {
        let config = lora_registry("lora", LoraConfig::default())?;
        let base = base_linear(16, 16)?;
        let wrapped =
            LoraLinear::wrap(base.clone(), LoraLocation::SelfAttn, &config, Some(AttnMatrix::Q))?;

        let x = Tensor::randn(0f32, 1f32, (2, 4, 16), &Device::Cpu)?;
        let ctx = ForwardContext::new(Some(Composition::from("lora")));
        let out = wrapped.forward(&x, &ctx)?;
        let expected = base.forward(&x)?;

        let diff = (out - expected)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }

    #[test]
    fn test_dropout_not_applied_in_forward() -> Result<()> {
        let config = LoraConfig {
            dropout: 0.5,
            init_lora_weights: LoraInitialization::Gaussian,
            ..Default::default()
        };
        let wrapped = LoraLinear::wrap(
            base_linear(16, 16)?,
            LoraLocation::SelfAttn,
            &lora_registry("lora", config)?,
            Some(AttnMatrix::Q),
        )?;

        let x = Tensor::randn(0f32, 1f32, (2, 4, 16), &Device::Cpu)?;
        let ctx = ForwardContext::new(Some(Composition::from("lora")));
        let first = wrapped.forward(&x, &ctx)?;
        let second = wrapped.forward(&x, &ctx)?;
        let diff = (first - second)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-7);
        Ok(())
    }

    #[test]
    fn test_parallel_rejected() -> Result<()> {
        let config = lora_registry("lora", LoraConfig::default())?;
        let wrapped = LoraLinear::wrap(
            base_linear(8, 8)?,
            LoraLocation::SelfAttn,
            &config,
            Some(AttnMatrix::Q),
        )?;
        let x = Tensor::zeros((1, 2, 8), DType::F32, &Device::Cpu)?;
        let ctx = ForwardContext::new(Some(Composition::parallel(["lora", "other"])));
        assert!(matches!(
            wrapped.forward(&x, &ctx),
            Err(AdapterError::UnsupportedComposition { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_merge_unmerge_round_trip() -> Result<()> {
        let config = lora_registry(
            "lora",
            LoraConfig {
                init_lora_weights: LoraInitialization::Gaussian,
                ..Default::default()
            },
        )?;
        let mut wrapped = LoraLinear::wrap(
            base_linear(8, 8)?,
            LoraLocation::SelfAttn,
            &config,
            Some(AttnMatrix::V),
        )?;
        let x = Tensor::randn(0f32, 1f32, (1, 3, 8), &Device::Cpu)?;
        let ctx = ForwardContext::new(Some(Composition::from("lora")));

        let unmerged_out = wrapped.forward(&x, &ctx)?;
        let original = wrapped.base().weight().clone();

        wrapped.merge_adapter("lora")?;
        assert_eq!(wrapped.merged_adapter(), Some("lora"));
        let merged_out = wrapped.forward(&x, &ctx)?;
        let diff = (merged_out - &unmerged_out)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-4);

        wrapped.unmerge_adapter()?;
        let diff = (wrapped.base().weight() - original)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }

    #[test]
    fn test_projection_wrap_is_idempotent() -> Result<()> {
        let config = lora_registry("lora", LoraConfig::default())?;
        let mut proj = Projection::from(base_linear(8, 4)?);
        assert!(!proj.is_lora_wrapped());

        proj.wrap_lora(LoraLocation::SelfAttn, &config, Some(AttnMatrix::Q))?;
        proj.wrap_lora(LoraLocation::SelfAttn, &config, Some(AttnMatrix::Q))?;

        assert!(proj.is_lora_wrapped());
        assert_eq!(proj.in_features(), 8);
        assert_eq!(proj.out_features(), 4);
        assert_eq!(proj.as_lora().map(|l| l.adapter_names().len()), Some(1));
        Ok(())
    }

    #[test]
    fn test_state_dict_shape_checked() -> Result<()> {
        let device = Device::Cpu;
        let mut layer =
            LoraLayer::new_with_zeros(8, 8, LoraConfig::default(), DType::F32, &device)?;
        let mut state = layer.state_dict()?;
        assert!(layer.load_state_dict(&state).is_ok());

        state.insert("lora_a".into(), Tensor::zeros((3, 8), DType::F32, &device)?);
        assert!(matches!(
            layer.load_state_dict(&state),
            Err(AdapterError::ShapeMismatch { .. })
        ));
        Ok(())
    }
}
