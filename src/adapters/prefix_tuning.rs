//! Prefix Tuning implementation.
//!
//! Prefix tuning prepends trainable "prefix" vectors to the keys and values
//! in attention layers, without modifying the original model weights.
//!
//! Each attention block owns a [`PrefixTuningShim`] named after its location
//! (`self_prefix`, `cross_prefix`). The shim holds one [`Prefix`] per adapter
//! and splices the active prefixes into keys, values and the attention mask.
//!
//! Reference: <https://arxiv.org/abs/2101.00190>

use std::collections::{BTreeMap, HashMap};

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::Linear;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::AdaptersConfig;
use crate::context::ForwardContext;
use crate::error::{AdapterError, Result};
use crate::io::expect_tensor;
use crate::location::AttentionLocation;
use crate::traits::{AdapterConfig, SaveLoad, Trainable};

/// Configuration for prefix tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefixTuningConfig {
    /// Number of prefix tokens to prepend.
    #[serde(default = "default_prefix_length")]
    pub prefix_length: usize,

    /// Hidden width of the reparameterization MLP.
    ///
    /// The MLP only produces the initial prefixes. It is dropped afterwards,
    /// so the stored and trained parameters are the prefixes themselves.
    #[serde(default = "default_bottleneck_size")]
    pub bottleneck_size: usize,

    /// Draw the initial prefixes directly instead of through the
    /// reparameterization MLP. Either way only the prefixes are kept.
    #[serde(default)]
    pub flat: bool,

    /// Also prefix cross-attention blocks.
    #[serde(default = "default_true")]
    pub cross_prefix: bool,

    /// Dropout on the prefixes.
    ///
    /// Validated and saved with the adapter config; the forward pass here
    /// never applies dropout.
    #[serde(default)]
    pub dropout: f64,
}

fn default_prefix_length() -> usize {
    30
}

fn default_bottleneck_size() -> usize {
    512
}

fn default_true() -> bool {
    true
}

impl Default for PrefixTuningConfig {
    fn default() -> Self {
        Self {
            prefix_length: default_prefix_length(),
            bottleneck_size: default_bottleneck_size(),
            flat: false,
            cross_prefix: true,
            dropout: 0.0,
        }
    }
}

impl AdapterConfig for PrefixTuningConfig {
    fn validate(&self) -> Result<()> {
        if self.prefix_length == 0 {
            return Err(AdapterError::InvalidConfig(
                "prefix_length must be > 0".into(),
            ));
        }
        if !self.flat && self.bottleneck_size == 0 {
            return Err(AdapterError::InvalidConfig(
                "bottleneck_size must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.dropout) {
            return Err(AdapterError::InvalidConfig(
                "dropout must be between 0 and 1".into(),
            ));
        }
        Ok(())
    }
}

/// Key and value prefixes of one adapter at one attention block.
pub struct Prefix {
    /// Prefix keys: [`prefix_length`, `num_heads`, `head_dim`]
    prefix_keys: Tensor,
    /// Prefix values: [`prefix_length`, `num_heads`, `head_dim`]
    prefix_values: Tensor,
    config: PrefixTuningConfig,
    frozen: bool,
}

impl Prefix {
    /// Create prefixes for an attention block.
    ///
    /// Non-flat prefixes are produced by a two-layer tanh MLP over a random
    /// prefix embedding, the way they are parameterized during training.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration validation fails or construction fails.
    pub fn new(
        config: PrefixTuningConfig,
        num_heads: usize,
        head_dim: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let hidden = num_heads * head_dim;
        let p = config.prefix_length;

        let (keys, values) = if config.flat {
            (
                Tensor::randn(0f32, 0.02, (p, hidden), device)?,
                Tensor::randn(0f32, 0.02, (p, hidden), device)?,
            )
        } else {
            let b = config.bottleneck_size;
            let wte = Tensor::randn(0f32, 0.02, (p, hidden), device)?;
            let down = Linear::new(
                Tensor::randn(0f32, 0.02, (b, hidden), device)?,
                Some(Tensor::zeros(b, DType::F32, device)?),
            );
            let up = Linear::new(
                Tensor::randn(0f32, 0.02, (2 * hidden, b), device)?,
                Some(Tensor::zeros(2 * hidden, DType::F32, device)?),
            );
            let kv = up.forward(&down.forward(&wte)?.tanh()?)?;
            (kv.narrow(1, 0, hidden)?, kv.narrow(1, hidden, hidden)?)
        };

        let shape = (p, num_heads, head_dim);
        Ok(Self {
            prefix_keys: keys.reshape(shape)?.to_dtype(dtype)?,
            prefix_values: values.reshape(shape)?.to_dtype(dtype)?,
            config,
            frozen: false,
        })
    }

    /// Prefix keys `[prefix_length, num_heads, head_dim]`.
    #[must_use]
    pub fn keys(&self) -> &Tensor {
        &self.prefix_keys
    }

    /// Prefix values `[prefix_length, num_heads, head_dim]`.
    #[must_use]
    pub fn values(&self) -> &Tensor {
        &self.prefix_values
    }

    /// Number of prefix tokens.
    #[must_use]
    pub fn prefix_length(&self) -> usize {
        self.config.prefix_length
    }

    /// Number of parameters.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.prefix_keys.elem_count() + self.prefix_values.elem_count()
    }

    /// Configuration.
    #[must_use]
    pub fn config(&self) -> &PrefixTuningConfig {
        &self.config
    }

    /// Expand `[p, heads, head_dim]` to `[batch, heads, p, head_dim]`.
    fn expand(t: &Tensor, batch: usize) -> Result<Tensor> {
        let (p, heads, head_dim) = t.dims3()?;
        Ok(t
            .transpose(0, 1)?
            .unsqueeze(0)?
            .expand((batch, heads, p, head_dim))?
            .contiguous()?)
    }
}

impl Trainable for Prefix {
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

impl SaveLoad for Prefix {
    fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        let mut state_dict = HashMap::new();
        state_dict.insert("prefix_keys".to_string(), self.prefix_keys.clone());
        state_dict.insert("prefix_values".to_string(), self.prefix_values.clone());
        Ok(state_dict)
    }

    fn load_state_dict(&mut self, state_dict: &HashMap<String, Tensor>) -> Result<()> {
        let dims = self.prefix_keys.dims().to_vec();
        self.prefix_keys = expect_tensor(state_dict, "prefix_keys", &dims)?;
        self.prefix_values = expect_tensor(state_dict, "prefix_values", &dims)?;
        Ok(())
    }
}

/// Per-attention-block store of prefixes.
pub struct PrefixTuningShim {
    prefix_name: Option<String>,
    num_heads: usize,
    head_dim: usize,
    dtype: DType,
    device: Device,
    prefixes: BTreeMap<String, Prefix>,
}

impl PrefixTuningShim {
    /// Create a shim named `prefix_name` and instantiate the registered
    /// prefix-tuning adapters that apply to it.
    ///
    /// A shim without a name is inert: it never holds prefixes.
    ///
    /// # Errors
    ///
    /// Returns an error if a prefix cannot be created.
    pub fn new(
        prefix_name: Option<String>,
        config: &AdaptersConfig,
        num_heads: usize,
        head_dim: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let mut shim = Self {
            prefix_name,
            num_heads,
            head_dim,
            dtype,
            device: device.clone(),
            prefixes: BTreeMap::new(),
        };
        for (name, prefix) in config.prefix_tuning_adapters() {
            shim.add_adapter(name, prefix)?;
        }
        debug!(
            prefix_name = ?shim.prefix_name,
            adapters = shim.prefixes.len(),
            "initialized prefix tuning shim"
        );
        Ok(shim)
    }

    /// Shim name, e.g. `self_prefix`.
    #[must_use]
    pub fn prefix_name(&self) -> Option<&str> {
        self.prefix_name.as_deref()
    }

    fn accepts(&self, config: &PrefixTuningConfig) -> bool {
        match self.prefix_name.as_deref() {
            None => false,
            Some(name) if name == AttentionLocation::Cross.prefix_name() => config.cross_prefix,
            Some(_) => true,
        }
    }

    /// Add prefixes for an adapter if it applies to this shim.
    ///
    /// Returns `true` if prefixes were created.
    ///
    /// # Errors
    ///
    /// Returns an error if construction fails.
    pub fn add_adapter(&mut self, name: &str, config: &PrefixTuningConfig) -> Result<bool> {
        if !self.accepts(config) || self.prefixes.contains_key(name) {
            return Ok(false);
        }
        let prefix =
            Prefix::new(config.clone(), self.num_heads, self.head_dim, self.dtype, &self.device)?;
        self.prefixes.insert(name.to_string(), prefix);
        Ok(true)
    }

    /// Remove an adapter's prefixes. Returns whether they were present.
    pub fn delete_adapter(&mut self, name: &str) -> bool {
        self.prefixes.remove(name).is_some()
    }

    /// Check if prefixes for an adapter are held.
    #[must_use]
    pub fn has_adapter(&self, name: &str) -> bool {
        self.prefixes.contains_key(name)
    }

    /// Get an adapter's prefixes.
    #[must_use]
    pub fn adapter(&self, name: &str) -> Option<&Prefix> {
        self.prefixes.get(name)
    }

    /// Get an adapter's prefixes mutably.
    pub fn adapter_mut(&mut self, name: &str) -> Option<&mut Prefix> {
        self.prefixes.get_mut(name)
    }

    /// Prepend active prefixes to keys and values and extend the mask.
    ///
    /// `key_states`/`value_states` are `[batch, heads, seq, head_dim]`; the
    /// additive `attention_mask` is `[batch, 1, q, seq]` and gains zero
    /// entries for the prefix positions.
    ///
    /// # Errors
    ///
    /// Returns an error if a held adapter is part of a parallel block.
    pub fn forward(
        &self,
        key_states: &Tensor,
        value_states: &Tensor,
        attention_mask: &Tensor,
        ctx: &ForwardContext,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let Some(active) = ctx.active() else {
            return Ok((key_states.clone(), value_states.clone(), attention_mask.clone()));
        };
        let held: Vec<&Prefix> = active
            .flatten()
            .into_iter()
            .filter_map(|n| self.prefixes.get(n))
            .collect();
        if held.is_empty() {
            return Ok((key_states.clone(), value_states.clone(), attention_mask.clone()));
        }
        if active.has_parallel() {
            return Err(AdapterError::UnsupportedComposition {
                location: self.prefix_name.clone().unwrap_or_default(),
                message: "prefix tuning does not support parallel composition".into(),
            });
        }

        let batch = key_states.dim(0)?;
        let mut keys = Vec::with_capacity(held.len() + 1);
        let mut values = Vec::with_capacity(held.len() + 1);
        let mut total = 0;
        for prefix in held {
            keys.push(Prefix::expand(&prefix.prefix_keys, batch)?);
            values.push(Prefix::expand(&prefix.prefix_values, batch)?);
            total += prefix.prefix_length();
        }
        keys.push(key_states.clone());
        values.push(value_states.clone());

        let (mask_b, mask_h, mask_q, _) = attention_mask.dims4()?;
        let prefix_mask = Tensor::zeros(
            (mask_b, mask_h, mask_q, total),
            attention_mask.dtype(),
            attention_mask.device(),
        )?;
        let mask = Tensor::cat(&[&prefix_mask, attention_mask], 3)?;

        Ok((Tensor::cat(&keys, 2)?, Tensor::cat(&values, 2)?, mask))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composition::Composition;

    fn registry(config: PrefixTuningConfig) -> Result<AdaptersConfig> {
        let mut adapters = AdaptersConfig::new();
        adapters.add("prefix", config.into())?;
        Ok(adapters)
    }

    #[test]
    fn test_prefix_shapes() -> Result<()> {
        let config = PrefixTuningConfig {
            prefix_length: 10,
            bottleneck_size: 16,
            ..Default::default()
        };
        let prefix = Prefix::new(config, 8, 4, DType::F32, &Device::Cpu)?;
        assert_eq!(prefix.keys().dims(), &[10, 8, 4]);
        assert_eq!(prefix.values().dims(), &[10, 8, 4]);
        assert_eq!(prefix.num_parameters(), 2 * 10 * 32);
        Ok(())
    }

    #[test]
    fn test_reparameterization_keeps_only_prefixes() -> Result<()> {
        for flat in [false, true] {
            let config = PrefixTuningConfig {
                prefix_length: 4,
                bottleneck_size: 64,
                flat,
                ..Default::default()
            };
            let prefix = Prefix::new(config, 2, 4, DType::F32, &Device::Cpu)?;
            assert_eq!(prefix.num_parameters(), 2 * 4 * 8);
            let mut keys: Vec<String> = prefix.state_dict()?.into_keys().collect();
            keys.sort();
            assert_eq!(keys, vec!["prefix_keys", "prefix_values"]);
        }
        Ok(())
    }

    #[test]
    fn test_unnamed_shim_is_inert() -> Result<()> {
        let config = registry(PrefixTuningConfig::default())?;
        let shim = PrefixTuningShim::new(None, &config, 2, 4, DType::F32, &Device::Cpu)?;
        assert!(shim.prefix_name().is_none());
        assert!(!shim.has_adapter("prefix"));
        Ok(())
    }

    #[test]
    fn test_cross_prefix_flag() -> Result<()> {
        let config = registry(PrefixTuningConfig {
            cross_prefix: false,
            flat: true,
            ..Default::default()
        })?;
        let cross = PrefixTuningShim::new(
            Some(AttentionLocation::Cross.prefix_name()),
            &config,
            2,
            4,
            DType::F32,
            &Device::Cpu,
        )?;
        assert!(!cross.has_adapter("prefix"));
        let self_attn = PrefixTuningShim::new(
            Some(AttentionLocation::SelfAttn.prefix_name()),
            &config,
            2,
            4,
            DType::F32,
            &Device::Cpu,
        )?;
        assert!(self_attn.has_adapter("prefix"));
        Ok(())
    }

    #[test]
    fn test_forward_prepends_prefix() -> Result<()> {
        let device = Device::Cpu;
        let config = registry(PrefixTuningConfig {
            prefix_length: 5,
            flat: true,
            ..Default::default()
        })?;
        let shim =
            PrefixTuningShim::new(Some("self_prefix".into()), &config, 2, 4, DType::F32, &device)?;

        let k = Tensor::randn(0f32, 1f32, (3, 2, 7, 4), &device)?;
        let v = Tensor::randn(0f32, 1f32, (3, 2, 7, 4), &device)?;
        let mask = Tensor::zeros((3, 1, 1, 7), DType::F32, &device)?;

        let inactive = ForwardContext::default();
        let (k0, _, m0) = shim.forward(&k, &v, &mask, &inactive)?;
        assert_eq!(k0.dims(), &[3, 2, 7, 4]);
        assert_eq!(m0.dims(), &[3, 1, 1, 7]);

        let ctx = ForwardContext::new(Some(Composition::from("prefix")));
        let (k1, v1, m1) = shim.forward(&k, &v, &mask, &ctx)?;
        assert_eq!(k1.dims(), &[3, 2, 12, 4]);
        assert_eq!(v1.dims(), &[3, 2, 12, 4]);
        assert_eq!(m1.dims(), &[3, 1, 1, 12]);
        Ok(())
    }

    #[test]
    fn test_forward_rejects_parallel() -> Result<()> {
        let device = Device::Cpu;
        let config = registry(PrefixTuningConfig {
            flat: true,
            ..Default::default()
        })?;
        let shim =
            PrefixTuningShim::new(Some("self_prefix".into()), &config, 2, 4, DType::F32, &device)?;
        let k = Tensor::zeros((1, 2, 3, 4), DType::F32, &device)?;
        let mask = Tensor::zeros((1, 1, 1, 3), DType::F32, &device)?;
        let ctx = ForwardContext::new(Some(Composition::parallel(["prefix", "other"])));
        assert!(matches!(
            shim.forward(&k, &k, &mask, &ctx),
            Err(AdapterError::UnsupportedComposition { .. })
        ));
        Ok(())
    }
}
