//! Bottleneck adapters and the per-location container that runs them.
//!
//! A bottleneck adapter projects the hidden states down, applies a
//! non-linearity, projects back up and adds the result to a residual:
//! `h' = h + scaling * W_up(f(W_down(h)))`.
//!
//! [`AdapterLayer`] sits after an attention or feed-forward output projection
//! (identified by its [`LocationKey`]), applies the active composition and then
//! the sublayer's original residual connection and layer norm.
//!
//! Reference: <https://arxiv.org/abs/1902.00751>

use std::collections::{BTreeMap, HashMap};

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{LayerNorm, Linear};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::adapters::invertible::InvertibleAdapterConfig;
use crate::composition::{adjust_tensors_for_parallel, repeat_batch, Composition};
use crate::config::AdaptersConfig;
use crate::context::ForwardContext;
use crate::error::{AdapterError, Result};
use crate::io::expect_tensor;
use crate::location::LocationKey;
use crate::traits::{Adapter, AdapterConfig, SaveLoad, Trainable};

/// Activation applied inside the bottleneck.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NonLinearity {
    /// Rectified linear unit.
    #[default]
    Relu,
    /// Gaussian error linear unit.
    Gelu,
    /// `x * sigmoid(x)`.
    Swish,
    /// Hyperbolic tangent.
    Tanh,
}

impl NonLinearity {
    /// Apply the activation.
    ///
    /// # Errors
    ///
    /// Returns an error if the tensor op fails.
    pub fn apply(self, x: &Tensor) -> Result<Tensor> {
        Ok(match self {
            Self::Relu => x.relu()?,
            Self::Gelu => x.gelu_erf()?,
            Self::Swish => x.silu()?,
            Self::Tanh => x.tanh()?,
        })
    }
}

/// Configuration for bottleneck adapters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BottleneckConfig {
    /// Insert an adapter after the multi-head attention block.
    #[serde(default = "default_true")]
    pub mh_adapter: bool,

    /// Insert an adapter after the feed-forward block.
    #[serde(default = "default_true")]
    pub output_adapter: bool,

    /// Ratio of hidden size to bottleneck size.
    #[serde(default = "default_reduction_factor")]
    pub reduction_factor: usize,

    /// Activation between the down and up projections.
    #[serde(default)]
    pub non_linearity: NonLinearity,

    /// Multiplier on the adapter branch.
    #[serde(default = "default_scaling")]
    pub scaling: f64,

    /// Apply the sublayer's residual connection and layer norm after the adapter.
    #[serde(default = "default_true")]
    pub original_ln_after: bool,

    /// Invertible adapter added after the embeddings.
    #[serde(default)]
    pub inv_adapter: Option<InvertibleAdapterConfig>,
}

fn default_true() -> bool {
    true
}

fn default_reduction_factor() -> usize {
    16
}

fn default_scaling() -> f64 {
    1.0
}

impl Default for BottleneckConfig {
    fn default() -> Self {
        Self {
            mh_adapter: true,
            output_adapter: true,
            reduction_factor: default_reduction_factor(),
            non_linearity: NonLinearity::Relu,
            scaling: default_scaling(),
            original_ln_after: true,
            inv_adapter: None,
        }
    }
}

impl BottleneckConfig {
    /// Single adapter after the feed-forward block (Pfeiffer et al., 2020).
    #[must_use]
    pub fn pfeiffer() -> Self {
        Self {
            mh_adapter: false,
            ..Self::default()
        }
    }

    /// Adapters after both attention and feed-forward (Houlsby et al., 2019).
    #[must_use]
    pub fn houlsby() -> Self {
        Self {
            non_linearity: NonLinearity::Swish,
            ..Self::default()
        }
    }

    /// Whether an adapter is inserted at `location`.
    #[must_use]
    pub fn enabled_at(&self, location: LocationKey) -> bool {
        match location {
            LocationKey::MhAdapter => self.mh_adapter,
            LocationKey::OutputAdapter => self.output_adapter,
        }
    }
}

impl AdapterConfig for BottleneckConfig {
    fn validate(&self) -> Result<()> {
        if self.reduction_factor == 0 {
            return Err(AdapterError::InvalidConfig(
                "reduction_factor must be > 0".into(),
            ));
        }
        if !self.mh_adapter && !self.output_adapter && self.inv_adapter.is_none() {
            return Err(AdapterError::InvalidConfig(
                "bottleneck adapter must be enabled at one location at least".into(),
            ));
        }
        if let Some(inv) = &self.inv_adapter {
            inv.validate()?;
        }
        Ok(())
    }
}

/// Down-project, activate, up-project.
pub struct BottleneckAdapter {
    adapter_down: Linear,
    adapter_up: Linear,
    config: BottleneckConfig,
    hidden_size: usize,
    bottleneck_size: usize,
    frozen: bool,
}

impl BottleneckAdapter {
    /// Create a new bottleneck adapter.
    ///
    /// The up projection starts at zero, so a fresh adapter returns its
    /// residual unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or initialization fails.
    pub fn new(
        hidden_size: usize,
        config: BottleneckConfig,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let bottleneck_size = (hidden_size / config.reduction_factor).max(1);

        let down_w = Tensor::randn(0f32, 1e-2, (bottleneck_size, hidden_size), device)?
            .to_dtype(dtype)?;
        let down_b = Tensor::zeros(bottleneck_size, dtype, device)?;
        let up_w = Tensor::zeros((hidden_size, bottleneck_size), dtype, device)?;
        let up_b = Tensor::zeros(hidden_size, dtype, device)?;

        Ok(Self {
            adapter_down: Linear::new(down_w, Some(down_b)),
            adapter_up: Linear::new(up_w, Some(up_b)),
            config,
            hidden_size,
            bottleneck_size,
            frozen: false,
        })
    }

    /// Width of the bottleneck.
    #[must_use]
    pub fn bottleneck_size(&self) -> usize {
        self.bottleneck_size
    }
}

impl Adapter for BottleneckAdapter {
    type Config = BottleneckConfig;

    fn forward(&self, input: &Tensor, base_output: Option<&Tensor>) -> Result<Tensor> {
        let down = self.adapter_down.forward(input)?;
        let down = self.config.non_linearity.apply(&down)?;
        let up = self.adapter_up.forward(&down)?.affine(self.config.scaling, 0.0)?;
        match base_output {
            Some(residual) => Ok(up.broadcast_add(residual)?),
            None => Ok(up),
        }
    }

    fn num_parameters(&self) -> usize {
        2 * self.hidden_size * self.bottleneck_size + self.hidden_size + self.bottleneck_size
    }

    fn config(&self) -> &Self::Config {
        &self.config
    }
}

impl Trainable for BottleneckAdapter {
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

impl SaveLoad for BottleneckAdapter {
    fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        let mut state_dict = HashMap::new();
        for (prefix, linear) in [
            ("adapter_down", &self.adapter_down),
            ("adapter_up", &self.adapter_up),
        ] {
            state_dict.insert(format!("{prefix}.weight"), linear.weight().clone());
            if let Some(bias) = linear.bias() {
                state_dict.insert(format!("{prefix}.bias"), bias.clone());
            }
        }
        Ok(state_dict)
    }

    fn load_state_dict(&mut self, state_dict: &HashMap<String, Tensor>) -> Result<()> {
        let (h, b) = (self.hidden_size, self.bottleneck_size);
        self.adapter_down = Linear::new(
            expect_tensor(state_dict, "adapter_down.weight", &[b, h])?,
            Some(expect_tensor(state_dict, "adapter_down.bias", &[b])?),
        );
        self.adapter_up = Linear::new(
            expect_tensor(state_dict, "adapter_up.weight", &[h, b])?,
            Some(expect_tensor(state_dict, "adapter_up.bias", &[h])?),
        );
        Ok(())
    }
}

/// Container of bottleneck adapters at one location of a layer.
pub struct AdapterLayer {
    location: LocationKey,
    hidden_size: usize,
    dtype: DType,
    device: Device,
    adapters: BTreeMap<String, BottleneckAdapter>,
}

impl AdapterLayer {
    /// Create an empty container at `location`.
    #[must_use]
    pub fn new(location: LocationKey, hidden_size: usize, dtype: DType, device: &Device) -> Self {
        Self {
            location,
            hidden_size,
            dtype,
            device: device.clone(),
            adapters: BTreeMap::new(),
        }
    }

    /// Location of this container.
    #[must_use]
    pub fn location_key(&self) -> LocationKey {
        self.location
    }

    /// Move the container to another location.
    pub fn set_location_key(&mut self, location: LocationKey) {
        self.location = location;
    }

    /// Instantiate every registered bottleneck adapter enabled at this location.
    ///
    /// # Errors
    ///
    /// Returns an error if an adapter cannot be created.
    pub fn init_adapters(&mut self, config: &AdaptersConfig) -> Result<()> {
        for (name, bottleneck) in config.bottleneck_adapters() {
            self.add_adapter(name, bottleneck)?;
        }
        debug!(
            location = %self.location,
            adapters = self.adapters.len(),
            "initialized bottleneck adapter container"
        );
        Ok(())
    }

    /// Add an adapter if `config` enables this location.
    ///
    /// Returns `true` if an adapter was created.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter cannot be created.
    pub fn add_adapter(&mut self, name: &str, config: &BottleneckConfig) -> Result<bool> {
        if !config.enabled_at(self.location) || self.adapters.contains_key(name) {
            return Ok(false);
        }
        let adapter =
            BottleneckAdapter::new(self.hidden_size, config.clone(), self.dtype, &self.device)?;
        self.adapters.insert(name.to_string(), adapter);
        Ok(true)
    }

    /// Remove an adapter. Returns whether it was present.
    pub fn delete_adapter(&mut self, name: &str) -> bool {
        self.adapters.remove(name).is_some()
    }

    /// Check if an adapter is held.
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
    pub fn adapter(&self, name: &str) -> Option<&BottleneckAdapter> {
        self.adapters.get(name)
    }

    /// Get a held adapter mutably.
    pub fn adapter_mut(&mut self, name: &str) -> Option<&mut BottleneckAdapter> {
        self.adapters.get_mut(name)
    }

    /// Apply active adapters, then the sublayer residual and layer norm.
    ///
    /// `hidden_states` is the output of the sublayer's dense projection and
    /// `input_tensor` the sublayer input used as residual.
    ///
    /// # Errors
    ///
    /// Returns an error if composition fails or shapes do not line up.
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        input_tensor: &Tensor,
        layer_norm: &LayerNorm,
        ctx: &mut ForwardContext,
    ) -> Result<Tensor> {
        let active = ctx
            .active()
            .filter(|c| c.flatten().iter().any(|n| self.adapters.contains_key(*n)))
            .cloned();

        let Some(composition) = active else {
            return Ok(layer_norm.forward(&(hidden_states + input_tensor)?)?);
        };

        let mut input_tensor = input_tensor.clone();
        let hidden = self.compose(&composition, hidden_states.clone(), &mut input_tensor, ctx)?;

        let ln_after = composition
            .flatten()
            .into_iter()
            .find_map(|n| self.adapters.get(n))
            .map_or(true, |a| a.config.original_ln_after);
        if ln_after {
            Ok(layer_norm.forward(&(hidden + input_tensor)?)?)
        } else {
            Ok(hidden)
        }
    }

    fn compose(
        &self,
        composition: &Composition,
        hidden: Tensor,
        input_tensor: &mut Tensor,
        ctx: &mut ForwardContext,
    ) -> Result<Tensor> {
        match composition {
            Composition::Single(name) => match self.adapters.get(name) {
                Some(adapter) => adapter.forward(&hidden, Some(&hidden)),
                None => Ok(hidden),
            },
            Composition::Stack(children) => {
                let mut hidden = hidden;
                for child in children {
                    hidden = self.compose(child, hidden, input_tensor, ctx)?;
                }
                Ok(hidden)
            }
            Composition::Parallel(children) => {
                self.compose_parallel(children, hidden, input_tensor, ctx)
            }
        }
    }

    fn compose_parallel(
        &self,
        children: &[Composition],
        hidden: Tensor,
        input_tensor: &mut Tensor,
        ctx: &mut ForwardContext,
    ) -> Result<Tensor> {
        let n = children.len();
        let hidden = match ctx.parallel_replicas() {
            None => {
                let replicated = repeat_batch(&hidden, n)?;
                ctx.mark_parallelized(n);
                replicated
            }
            Some(replicas) if replicas == n => hidden,
            Some(replicas) => {
                return Err(AdapterError::UnsupportedComposition {
                    location: self.location.to_string(),
                    message: format!(
                        "batch already replicated {replicas} times, block has {n} children"
                    ),
                })
            }
        };
        adjust_tensors_for_parallel(&hidden, &mut [&mut *input_tensor])?;

        let batch = hidden.dim(0)? / n;
        let mut outputs = Vec::with_capacity(n);
        for (i, child) in children.iter().enumerate() {
            let chunk = hidden.narrow(0, i * batch, batch)?;
            let mut chunk_input = input_tensor.narrow(0, i * batch, batch)?;
            outputs.push(self.compose(child, chunk, &mut chunk_input, ctx)?);
        }
        Ok(Tensor::cat(&outputs, 0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::{layer_norm, LayerNormConfig, VarBuilder, VarMap};

    fn test_layer_norm(hidden: usize) -> Result<LayerNorm> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        Ok(layer_norm(hidden, LayerNormConfig::default(), vb)?)
    }

    fn container_with(
        name: &str,
        config: BottleneckConfig,
        location: LocationKey,
    ) -> Result<AdapterLayer> {
        let mut registry = AdaptersConfig::new();
        registry.add(name, config.into())?;
        let mut layer = AdapterLayer::new(location, 32, DType::F32, &Device::Cpu);
        layer.init_adapters(&registry)?;
        Ok(layer)
    }

    #[test]
    fn test_config_presets() {
        assert!(!BottleneckConfig::pfeiffer().mh_adapter);
        assert!(BottleneckConfig::pfeiffer().output_adapter);
        assert!(BottleneckConfig::houlsby().mh_adapter);
        assert_eq!(BottleneckConfig::houlsby().non_linearity, NonLinearity::Swish);
    }

    #[test]
    fn test_config_invalid_reduction() {
        let config = BottleneckConfig {
            reduction_factor: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_adapter_shapes_and_parameters() -> Result<()> {
        let adapter =
            BottleneckAdapter::new(64, BottleneckConfig::default(), DType::F32, &Device::Cpu)?;
        assert_eq!(adapter.bottleneck_size(), 4);
        // 2 * 64 * 4 weights + 64 + 4 biases
        assert_eq!(adapter.num_parameters(), 580);

        let x = Tensor::randn(0f32, 1f32, (2, 5, 64), &Device::Cpu)?;
        let out = adapter.forward(&x, Some(&x))?;
        assert_eq!(out.dims(), &[2, 5, 64]);
        let diff = (out - &x)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn test_container_respects_location() -> Result<()> {
        let mh = container_with("a", BottleneckConfig::pfeiffer(), LocationKey::MhAdapter)?;
        assert!(!mh.has_adapter("a"));
        let out = container_with("a", BottleneckConfig::pfeiffer(), LocationKey::OutputAdapter)?;
        assert!(out.has_adapter("a"));
        assert_eq!(out.location_key(), LocationKey::OutputAdapter);
        Ok(())
    }

    #[test]
    fn test_init_adapters_is_idempotent() -> Result<()> {
        let mut registry = AdaptersConfig::new();
        registry.add("a", BottleneckConfig::default().into())?;
        let mut layer = AdapterLayer::new(LocationKey::MhAdapter, 32, DType::F32, &Device::Cpu);
        layer.init_adapters(&registry)?;
        layer.init_adapters(&registry)?;
        assert_eq!(layer.adapter_names(), vec!["a"]);
        Ok(())
    }

    #[test]
    fn test_forward_without_active_adapters() -> Result<()> {
        let layer = container_with("a", BottleneckConfig::default(), LocationKey::OutputAdapter)?;
        let ln = test_layer_norm(32)?;
        let hidden = Tensor::randn(0f32, 1f32, (2, 3, 32), &Device::Cpu)?;
        let input = Tensor::randn(0f32, 1f32, (2, 3, 32), &Device::Cpu)?;

        let mut ctx = ForwardContext::default();
        let out = layer.forward(&hidden, &input, &ln, &mut ctx)?;
        let expected = ln.forward(&(&hidden + &input)?)?;
        let diff = (out - expected)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn test_forward_parallel_replicates_batch() -> Result<()> {
        let mut registry = AdaptersConfig::new();
        registry.add("a", BottleneckConfig::default().into())?;
        registry.add("b", BottleneckConfig::default().into())?;
        let mut layer = AdapterLayer::new(LocationKey::OutputAdapter, 32, DType::F32, &Device::Cpu);
        layer.init_adapters(&registry)?;

        let ln = test_layer_norm(32)?;
        let hidden = Tensor::randn(0f32, 1f32, (2, 3, 32), &Device::Cpu)?;
        let input = Tensor::randn(0f32, 1f32, (2, 3, 32), &Device::Cpu)?;

        let mut ctx = ForwardContext::new(Some(Composition::parallel(["a", "b"])));
        let out = layer.forward(&hidden, &input, &ln, &mut ctx)?;
        assert_eq!(out.dims(), &[4, 3, 32]);
        assert_eq!(ctx.parallel_replicas(), Some(2));

        // Already replicated input stays at the replicated batch size.
        let out = layer.forward(&out, &out, &ln, &mut ctx)?;
        assert_eq!(out.dims(), &[4, 3, 32]);
        Ok(())
    }

    #[test]
    fn test_state_dict_round_trip_keys() -> Result<()> {
        let adapter =
            BottleneckAdapter::new(16, BottleneckConfig::default(), DType::F32, &Device::Cpu)?;
        let state = adapter.state_dict()?;
        let mut keys: Vec<_> = state.keys().cloned().collect();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "adapter_down.bias",
                "adapter_down.weight",
                "adapter_up.bias",
                "adapter_up.weight"
            ]
        );
        let mut other =
            BottleneckAdapter::new(16, BottleneckConfig::default(), DType::F32, &Device::Cpu)?;
        other.load_state_dict(&state)?;
        Ok(())
    }
}
