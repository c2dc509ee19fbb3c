//! Invertible adapters applied to the embedding output.
//!
//! Each adapter is a NICE additive coupling block. The hidden state is split
//! in two halves `x1, x2`:
//!
//! ```text
//! y1 = x1 + F(x2)
//! y2 = x2 + G(y1)
//! ```
//!
//! which is inverted exactly by `x2 = y2 - G(y1)`, `x1 = y1 - F(x2)`.
//!
//! Reference: <https://arxiv.org/abs/1410.8516>

use std::collections::{BTreeMap, HashMap};

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::Linear;
use serde::{Deserialize, Serialize};

use crate::adapters::bottleneck::NonLinearity;
use crate::context::ForwardContext;
use crate::error::{AdapterError, Result};
use crate::io::expect_tensor;
use crate::traits::{AdapterConfig, SaveLoad, Trainable};

/// Configuration for an invertible adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvertibleAdapterConfig {
    /// Activation inside the coupling sub-networks.
    #[serde(default)]
    pub non_linearity: NonLinearity,

    /// Ratio of half the hidden size to the sub-network bottleneck.
    #[serde(default = "default_reduction_factor")]
    pub reduction_factor: usize,
}

fn default_reduction_factor() -> usize {
    2
}

impl Default for InvertibleAdapterConfig {
    fn default() -> Self {
        Self {
            non_linearity: NonLinearity::Relu,
            reduction_factor: default_reduction_factor(),
        }
    }
}

impl AdapterConfig for InvertibleAdapterConfig {
    fn validate(&self) -> Result<()> {
        if self.reduction_factor == 0 {
            return Err(AdapterError::InvalidConfig(
                "invertible adapter reduction_factor must be > 0".into(),
            ));
        }
        Ok(())
    }
}

struct CouplingNet {
    down: Linear,
    up: Linear,
}

impl CouplingNet {
    fn new(half: usize, inner: usize, dtype: DType, device: &Device) -> Result<Self> {
        let down = Tensor::randn(0f32, 1e-2, (inner, half), device)?.to_dtype(dtype)?;
        let up = Tensor::randn(0f32, 1e-2, (half, inner), device)?.to_dtype(dtype)?;
        Ok(Self {
            down: Linear::new(down, Some(Tensor::zeros(inner, dtype, device)?)),
            up: Linear::new(up, Some(Tensor::zeros(half, dtype, device)?)),
        })
    }

    fn forward(&self, x: &Tensor, act: NonLinearity) -> Result<Tensor> {
        let h = act.apply(&self.down.forward(x)?)?;
        Ok(self.up.forward(&h)?)
    }

    fn num_parameters(&self) -> usize {
        let (inner, half) = (self.down.weight().dims()[0], self.down.weight().dims()[1]);
        2 * inner * half + inner + half
    }

    fn state_dict(&self, prefix: &str, out: &mut HashMap<String, Tensor>) {
        for (name, linear) in [("down", &self.down), ("up", &self.up)] {
            out.insert(format!("{prefix}.{name}.weight"), linear.weight().clone());
            if let Some(bias) = linear.bias() {
                out.insert(format!("{prefix}.{name}.bias"), bias.clone());
            }
        }
    }

    fn load_state_dict(&mut self, prefix: &str, state: &HashMap<String, Tensor>) -> Result<()> {
        let (inner, half) = (self.down.weight().dims()[0], self.down.weight().dims()[1]);
        self.down = Linear::new(
            expect_tensor(state, &format!("{prefix}.down.weight"), &[inner, half])?,
            Some(expect_tensor(state, &format!("{prefix}.down.bias"), &[inner])?),
        );
        self.up = Linear::new(
            expect_tensor(state, &format!("{prefix}.up.weight"), &[half, inner])?,
            Some(expect_tensor(state, &format!("{prefix}.up.bias"), &[half])?),
        );
        Ok(())
    }
}

/// NICE additive coupling block.
pub struct NiceCoupling {
    f: CouplingNet,
    g: CouplingNet,
    config: InvertibleAdapterConfig,
    half: usize,
    frozen: bool,
}

impl NiceCoupling {
    /// Create a coupling block over `hidden_size` features.
    ///
    /// # Errors
    ///
    /// Returns an error if `hidden_size` is odd or the configuration is invalid.
    pub fn new(
        hidden_size: usize,
        config: InvertibleAdapterConfig,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        if hidden_size % 2 != 0 {
            return Err(AdapterError::InvalidConfig(format!(
                "invertible adapters need an even hidden size, got {hidden_size}"
            )));
        }
        let half = hidden_size / 2;
        let inner = (half / config.reduction_factor).max(1);
        Ok(Self {
            f: CouplingNet::new(half, inner, dtype, device)?,
            g: CouplingNet::new(half, inner, dtype, device)?,
            config,
            half,
            frozen: false,
        })
    }

    fn split(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let last = x.dim(D::Minus1)?;
        if last != 2 * self.half {
            return Err(AdapterError::ShapeMismatch {
                expected: vec![2 * self.half],
                actual: vec![last],
            });
        }
        Ok((
            x.narrow(D::Minus1, 0, self.half)?,
            x.narrow(D::Minus1, self.half, self.half)?,
        ))
    }

    /// Forward transform.
    ///
    /// # Errors
    ///
    /// Returns an error if the last dimension does not match.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let act = self.config.non_linearity;
        let (x1, x2) = self.split(x)?;
        let y1 = (x1 + self.f.forward(&x2, act)?)?;
        let y2 = (x2 + self.g.forward(&y1, act)?)?;
        Ok(Tensor::cat(&[y1, y2], D::Minus1)?)
    }

    /// Inverse transform.
    ///
    /// # Errors
    ///
    /// Returns an error if the last dimension does not match.
    pub fn inverse(&self, y: &Tensor) -> Result<Tensor> {
        let act = self.config.non_linearity;
        let (y1, y2) = self.split(y)?;
        let x2 = (y2 - self.g.forward(&y1, act)?)?;
        let x1 = (y1 - self.f.forward(&x2, act)?)?;
        Ok(Tensor::cat(&[x1, x2], D::Minus1)?)
    }

    /// Number of parameters.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.f.num_parameters() + self.g.num_parameters()
    }

    /// Configuration.
    #[must_use]
    pub fn config(&self) -> &InvertibleAdapterConfig {
        &self.config
    }
}

impl Trainable for NiceCoupling {
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

impl SaveLoad for NiceCoupling {
    fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        self.f.state_dict("F", &mut state);
        self.g.state_dict("G", &mut state);
        Ok(state)
    }

    fn load_state_dict(&mut self, state_dict: &HashMap<String, Tensor>) -> Result<()> {
        self.f.load_state_dict("F", state_dict)?;
        self.g.load_state_dict("G", state_dict)
    }
}

/// Named invertible adapters owned by the model.
pub struct InvertibleAdapters {
    hidden_size: usize,
    dtype: DType,
    device: Device,
    adapters: BTreeMap<String, NiceCoupling>,
}

impl InvertibleAdapters {
    /// Create an empty set.
    #[must_use]
    pub fn new(hidden_size: usize, dtype: DType, device: &Device) -> Self {
        Self {
            hidden_size,
            dtype,
            device: device.clone(),
            adapters: BTreeMap::new(),
        }
    }

    /// Add an invertible adapter. Returns `false` if one with this name exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the coupling cannot be created.
    pub fn add_adapter(&mut self, name: &str, config: &InvertibleAdapterConfig) -> Result<bool> {
        if self.adapters.contains_key(name) {
            return Ok(false);
        }
        let coupling =
            NiceCoupling::new(self.hidden_size, config.clone(), self.dtype, &self.device)?;
        self.adapters.insert(name.to_string(), coupling);
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

    /// Get a held adapter.
    #[must_use]
    pub fn adapter(&self, name: &str) -> Option<&NiceCoupling> {
        self.adapters.get(name)
    }

    /// Get a held adapter mutably.
    pub fn adapter_mut(&mut self, name: &str) -> Option<&mut NiceCoupling> {
        self.adapters.get_mut(name)
    }

    /// Number of held adapters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    /// Whether no adapters are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Apply the adapter of the first active adapter, if it has one.
    ///
    /// With `rev` set the inverse transform is applied instead.
    ///
    /// # Errors
    ///
    /// Returns an error if the transform fails.
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        ctx: &ForwardContext,
        rev: bool,
    ) -> Result<Tensor> {
        let coupling = ctx
            .active()
            .and_then(|c| c.first())
            .and_then(|name| self.adapters.get(name));
        match coupling {
            Some(c) if rev => c.inverse(hidden_states),
            Some(c) => c.forward(hidden_states),
            None => Ok(hidden_states.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composition::Composition;

    #[test]
    fn test_odd_hidden_size_rejected() {
        let result =
            NiceCoupling::new(7, InvertibleAdapterConfig::default(), DType::F32, &Device::Cpu);
        assert!(matches!(result, Err(AdapterError::InvalidConfig(_))));
    }

    #[test]
    fn test_inverse_recovers_input() -> Result<()> {
        let coupling =
            NiceCoupling::new(16, InvertibleAdapterConfig::default(), DType::F32, &Device::Cpu)?;
        let x = Tensor::randn(0f32, 1f32, (2, 5, 16), &Device::Cpu)?;
        let y = coupling.forward(&x)?;
        assert_eq!(y.dims(), &[2, 5, 16]);
        let back = coupling.inverse(&y)?;
        let diff = (back - &x)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }

    #[test]
    fn test_forward_uses_first_active_adapter() -> Result<()> {
        let mut set = InvertibleAdapters::new(8, DType::F32, &Device::Cpu);
        assert!(set.add_adapter("lang", &InvertibleAdapterConfig::default())?);
        assert!(!set.add_adapter("lang", &InvertibleAdapterConfig::default())?);

        let x = Tensor::randn(0f32, 1f32, (1, 3, 8), &Device::Cpu)?;
        let inactive = set.forward(&x, &ForwardContext::default(), false)?;
        let diff = (inactive - &x)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-7);

        let ctx = ForwardContext::new(Some(Composition::stack(["lang", "task"])));
        let y = set.forward(&x, &ctx, false)?;
        let back = set.forward(&y, &ctx, true)?;
        let diff = (back - &x)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }
}
