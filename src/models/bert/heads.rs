//! Sequence classification heads on top of [`BertModel`].
#![allow(deprecated)]

use std::collections::BTreeMap;

use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::{Linear, VarBuilder};
use tracing::info;

use super::{BertConfig, BertLayer, BertModel};
use crate::composition::Composition;
use crate::config::AdaptersConfig;
use crate::error::{AdapterError, Result};
use crate::model::{AdapterSite, AdapterSiteMut, ModelAdapters};
use crate::traits::InitAdapters;

/// `[CLS]` pooling, dense + tanh, then a projection to the labels.
pub struct ClassificationHead {
    dense: Linear,
    out_proj: Linear,
    num_labels: usize,
}

impl ClassificationHead {
    /// Create a randomly initialized head.
    ///
    /// # Errors
    ///
    /// Returns an error if weight initialization fails.
    pub fn new(
        hidden_size: usize,
        num_labels: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let init = |rows: usize, cols: usize| -> Result<Linear> {
            let weight = Tensor::randn(0f32, 0.02, (rows, cols), device)?.to_dtype(dtype)?;
            let bias = Tensor::zeros(rows, dtype, device)?;
            Ok(Linear::new(weight, Some(bias)))
        };
        Ok(Self {
            dense: init(hidden_size, hidden_size)?,
            out_proj: init(num_labels, hidden_size)?,
            num_labels,
        })
    }

    /// Number of output labels.
    #[must_use]
    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    /// Logits `[batch, num_labels]` from encoder output `[batch, seq, hidden]`.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not three-dimensional.
    pub fn forward(&self, hidden_states: &Tensor) -> Result<Tensor> {
        let cls = hidden_states.i((.., 0))?;
        let pooled = self.dense.forward(&cls)?.tanh()?;
        Ok(self.out_proj.forward(&pooled)?)
    }
}

/// BERT with named classification heads.
///
/// Kept for compatibility with code written against the combined model; it
/// forwards every adapter operation to the wrapped [`BertModel`].
#[deprecated(since = "0.1.0", note = "use `BertModel` with a `ClassificationHead` instead")]
pub struct BertModelWithHeads {
    bert: BertModel,
    heads: BTreeMap<String, ClassificationHead>,
    active_head: Option<String>,
}

impl BertModelWithHeads {
    /// Build the base model from `vb`, without heads.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or a weight is missing.
    pub fn new(config: BertConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            bert: BertModel::new(config, vb)?,
            heads: BTreeMap::new(),
            active_head: None,
        })
    }

    /// The wrapped model.
    #[must_use]
    pub fn base_model(&self) -> &BertModel {
        &self.bert
    }

    /// The wrapped model, mutably.
    pub fn base_model_mut(&mut self) -> &mut BertModel {
        &mut self.bert
    }

    /// Add a classification head and make it active.
    ///
    /// # Errors
    ///
    /// Returns an error if a head with this name exists and `overwrite` is off.
    pub fn add_classification_head(
        &mut self,
        name: &str,
        num_labels: usize,
        overwrite: bool,
    ) -> Result<()> {
        if self.heads.contains_key(name) && !overwrite {
            return Err(AdapterError::AdapterExists {
                name: name.to_string(),
            });
        }
        let config = self.bert.config();
        let head = ClassificationHead::new(
            config.hidden_size,
            num_labels,
            self.bert.dtype,
            &self.bert.device,
        )?;
        self.heads.insert(name.to_string(), head);
        self.active_head = Some(name.to_string());
        info!(head = name, num_labels, "added classification head");
        Ok(())
    }

    /// Remove a head.
    ///
    /// # Errors
    ///
    /// Returns an error if no head with this name exists.
    pub fn delete_head(&mut self, name: &str) -> Result<()> {
        self.heads
            .remove(name)
            .ok_or_else(|| AdapterError::AdapterNotFound {
                name: name.to_string(),
            })?;
        if self.active_head.as_deref() == Some(name) {
            self.active_head = None;
        }
        Ok(())
    }

    /// Select the head used by [`BertModelWithHeads::forward`].
    ///
    /// # Errors
    ///
    /// Returns an error if no head with this name exists.
    pub fn set_active_head(&mut self, name: &str) -> Result<()> {
        if !self.heads.contains_key(name) {
            return Err(AdapterError::AdapterNotFound {
                name: name.to_string(),
            });
        }
        self.active_head = Some(name.to_string());
        Ok(())
    }

    /// Name of the active head.
    #[must_use]
    pub fn active_head(&self) -> Option<&str> {
        self.active_head.as_deref()
    }

    /// Add a word-embedding table to the wrapped model.
    ///
    /// # Errors
    ///
    /// Returns an error if adapter setup has not run or the name is taken.
    pub fn add_embeddings(&mut self, name: &str, vocab_size: usize) -> Result<()> {
        self.bert.add_embeddings(name, vocab_size)
    }

    /// Select the word-embedding table of the wrapped model.
    ///
    /// # Errors
    ///
    /// Returns an error if adapter setup has not run or the table is unknown.
    pub fn set_active_embeddings(&mut self, name: Option<&str>) -> Result<()> {
        self.bert.set_active_embeddings(name)
    }

    /// Remove a word-embedding table from the wrapped model.
    ///
    /// # Errors
    ///
    /// Returns an error if adapter setup has not run, the table is unknown or active.
    pub fn delete_embeddings(&mut self, name: &str) -> Result<()> {
        self.bert.delete_embeddings(name)
    }

    /// Encode and classify with the active head.
    ///
    /// # Errors
    ///
    /// Returns an error if no head is active or the forward pass fails.
    pub fn forward(&self, input_ids: &Tensor, attention_mask: Option<&Tensor>) -> Result<Tensor> {
        let head = self
            .active_head
            .as_ref()
            .and_then(|name| self.heads.get(name))
            .ok_or_else(|| AdapterError::MissingModule("no active classification head".into()))?;
        let hidden_states = self.bert.forward(input_ids, attention_mask, None)?;
        head.forward(&hidden_states)
    }
}

impl InitAdapters for BertModelWithHeads {
    fn init_adapters(&mut self, config: &AdaptersConfig) -> Result<()> {
        self.bert.init_adapters(config)
    }
}

impl ModelAdapters for BertModelWithHeads {
    type Layer = BertLayer;

    fn adapters_config(&self) -> &AdaptersConfig {
        self.bert.adapters_config()
    }

    fn adapters_config_mut(&mut self) -> &mut AdaptersConfig {
        self.bert.adapters_config_mut()
    }

    fn iter_layers(&self) -> impl Iterator<Item = (usize, &BertLayer)> {
        self.bert.encoder.layers.iter().enumerate()
    }

    fn iter_layers_mut(&mut self) -> impl Iterator<Item = (usize, &mut BertLayer)> {
        self.bert.encoder.layers.iter_mut().enumerate()
    }

    fn model_sites(&self) -> Vec<(String, AdapterSite<'_>)> {
        self.bert.model_sites()
    }

    fn model_sites_mut(&mut self) -> Vec<(String, AdapterSiteMut<'_>)> {
        self.bert.model_sites_mut()
    }

    fn active_adapters(&self) -> Option<&Composition> {
        self.bert.active_adapters()
    }

    fn set_active_setup(&mut self, setup: Option<Composition>) {
        self.bert.set_active_setup(setup);
    }

    fn device(&self) -> &Device {
        ModelAdapters::device(&self.bert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::bottleneck::BottleneckConfig;
    use candle_nn::VarMap;

    fn model() -> Result<BertModelWithHeads> {
        let config = BertConfig {
            vocab_size: 30,
            hidden_size: 8,
            num_hidden_layers: 1,
            num_attention_heads: 2,
            intermediate_size: 16,
            max_position_embeddings: 8,
            ..Default::default()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mut model = BertModelWithHeads::new(config, vb)?;
        model.init_adapters(&AdaptersConfig::new())?;
        Ok(model)
    }

    #[test]
    fn test_classification_logits() -> Result<()> {
        let mut model = model()?;
        model.add_classification_head("sst2", 3, false)?;
        let ids = Tensor::new(&[[1u32, 4, 2], [1, 6, 2]], &Device::Cpu)?;
        let logits = model.forward(&ids, None)?;
        assert_eq!(logits.dims(), &[2, 3]);
        Ok(())
    }

    #[test]
    fn test_head_management() -> Result<()> {
        let mut model = model()?;
        let ids = Tensor::new(&[[1u32, 2]], &Device::Cpu)?;
        assert!(matches!(model.forward(&ids, None), Err(AdapterError::MissingModule(_))));

        model.add_classification_head("a", 2, false)?;
        assert!(model.add_classification_head("a", 2, false).is_err());
        model.add_classification_head("a", 4, true)?;
        model.add_classification_head("b", 2, false)?;
        assert_eq!(model.active_head(), Some("b"));

        model.set_active_head("a")?;
        assert_eq!(model.forward(&ids, None)?.dims(), &[1, 4]);
        model.delete_head("a")?;
        assert_eq!(model.active_head(), None);
        assert!(model.set_active_head("a").is_err());
        Ok(())
    }

    #[test]
    fn test_adapter_operations_delegate() -> Result<()> {
        let mut model = model()?;
        model.add_adapter("task", BottleneckConfig::pfeiffer().into(), true)?;
        assert!(model.base_model().adapters_config().contains("task"));
        assert_eq!(model.active_adapters(), Some(&Composition::from("task")));
        assert!(model.num_adapter_parameters("task")? > 0);

        model.add_embeddings("domain", 12)?;
        model.set_active_embeddings(Some("domain"))?;
        assert_eq!(
            model.base_model().embedding_adapters().and_then(|e| e.active_name()),
            Some("domain")
        );
        Ok(())
    }
}
