//! Adapter setup for the BERT components.
//!
//! [`BertModel::init_adapters`](InitAdapters::init_adapters) runs the model's
//! capability setups in order (embeddings, invertible adapters, base
//! adapters) and then registers the parallel-alignment step on every layer.
//! The base-adapter setup initializes each layer, which assigns attention
//! locations before it initializes the attention and output sublayers.
//!
//! Every setup routine can be run again: wrapped projections stay wrapped,
//! instantiated adapters are not duplicated and built-in steps are
//! registered once.

use tracing::{debug, warn};

use super::{
    BertAttention, BertLayer, BertModel, BertOutput, BertSelfAttention, BertSelfOutput,
};
use crate::adapters::embeddings::EmbeddingAdapters;
use crate::adapters::invertible::InvertibleAdapters;
use crate::adapters::prefix_tuning::PrefixTuningShim;
use crate::composition::Composition;
use crate::config::AdaptersConfig;
use crate::error::{AdapterError, Result};
use crate::hooks::{EmbeddingStep, LayerPreStep};
use crate::location::{AttentionLocation, AttnMatrix, LocationKey, LoraLocation};
use crate::model::{AdaptedLayer, AdapterSite, AdapterSiteMut, ModelAdapters};
use crate::traits::InitAdapters;

impl InitAdapters for BertSelfAttention {
    fn init_adapters(&mut self, config: &AdaptersConfig) -> Result<()> {
        self.query
            .wrap_lora(LoraLocation::SelfAttn, config, Some(AttnMatrix::Q))?;
        self.key
            .wrap_lora(LoraLocation::SelfAttn, config, Some(AttnMatrix::K))?;
        self.value
            .wrap_lora(LoraLocation::SelfAttn, config, Some(AttnMatrix::V))?;

        let prefix_name = self.location.map(AttentionLocation::prefix_name);
        match self
            .prefix_tuning
            .as_mut()
            .filter(|shim| shim.prefix_name() == prefix_name.as_deref())
        {
            Some(shim) => {
                for (name, prefix) in config.prefix_tuning_adapters() {
                    shim.add_adapter(name, prefix)?;
                }
            }
            None => {
                self.prefix_tuning = Some(PrefixTuningShim::new(
                    prefix_name,
                    config,
                    self.num_heads,
                    self.head_dim,
                    self.dtype,
                    &self.device,
                )?);
            }
        }
        Ok(())
    }
}

impl InitAdapters for BertSelfOutput {
    fn init_adapters(&mut self, config: &AdaptersConfig) -> Result<()> {
        self.adapters.set_location_key(LocationKey::MhAdapter);
        self.adapters.init_adapters(config)
    }
}

impl InitAdapters for BertOutput {
    fn init_adapters(&mut self, config: &AdaptersConfig) -> Result<()> {
        self.adapters.set_location_key(LocationKey::OutputAdapter);
        self.adapters.init_adapters(config)
    }
}

impl InitAdapters for BertAttention {
    fn init_adapters(&mut self, config: &AdaptersConfig) -> Result<()> {
        self.self_attn.init_adapters(config)?;
        self.output.init_adapters(config)
    }
}

impl InitAdapters for BertLayer {
    fn init_adapters(&mut self, config: &AdaptersConfig) -> Result<()> {
        self.intermediate
            .dense
            .wrap_lora(LoraLocation::Intermediate, config, None)?;
        self.output.dense.wrap_lora(LoraLocation::Output, config, None)?;

        // locations must be set before the attention setup names its shim
        self.attention.self_attn.location = Some(AttentionLocation::SelfAttn);
        if self.add_cross_attention {
            let cross = self.crossattention.as_mut().ok_or_else(|| {
                AdapterError::MissingModule(
                    "add_cross_attention is set but the layer has no crossattention block".into(),
                )
            })?;
            cross.self_attn.location = Some(AttentionLocation::Cross);
        }

        self.attention.init_adapters(config)?;
        if let Some(cross) = self.crossattention.as_mut() {
            cross.init_adapters(config)?;
        }
        self.output.init_adapters(config)
    }
}

impl BertModel {
    fn init_embedding_adapters(&mut self) {
        if self.embedding_adapters.is_none() {
            self.embedding_adapters = Some(EmbeddingAdapters::new(
                self.config.hidden_size,
                self.dtype,
                &self.device,
            ));
        }
    }

    fn init_invertible_adapters(&mut self, config: &AdaptersConfig) -> Result<()> {
        let invertible = self.invertible_adapters.get_or_insert_with(|| {
            InvertibleAdapters::new(self.config.hidden_size, self.dtype, &self.device)
        });
        for (name, bottleneck) in config.bottleneck_adapters() {
            if let Some(inv) = &bottleneck.inv_adapter {
                invertible.add_adapter(name, inv)?;
            }
        }
        self.hook_after_embeddings(EmbeddingStep::InvertibleAdapters);
        Ok(())
    }

    fn init_base_adapters(&mut self, config: &AdaptersConfig) -> Result<()> {
        for layer in &mut self.encoder.layers {
            layer.init_adapters(config)?;
        }
        for name in config.names() {
            if !self.holds_adapter(name) {
                warn!(adapter = name, "adapter does not target any location in this model");
            }
        }
        Ok(())
    }

    fn holds_adapter(&self, name: &str) -> bool {
        self.model_sites().iter().any(|(_, s)| s.has_adapter(name))
            || self
                .encoder
                .layers
                .iter()
                .any(|l| l.adapter_sites().iter().any(|(_, s)| s.has_adapter(name)))
    }
}

impl InitAdapters for BertModel {
    fn init_adapters(&mut self, config: &AdaptersConfig) -> Result<()> {
        // adapters added earlier stay registered
        let added = self.config.adapters.merge(config)?;
        let registry = self.config.adapters.clone();
        debug!(added, registered = registry.len(), "merged adapter registry");

        self.init_embedding_adapters();
        self.init_invertible_adapters(&registry)?;
        self.init_base_adapters(&registry)?;

        for (i, layer) in self.encoder.layers.iter_mut().enumerate() {
            layer.register_pre_step(LayerPreStep::AlignForParallel);
            debug!(
                layer = i,
                steps = layer.pre_steps().len(),
                "registered parallel alignment step"
            );
        }
        Ok(())
    }
}

fn attention_sites<'a>(
    prefix: &str,
    attention: &'a BertAttention,
    sites: &mut Vec<(String, AdapterSite<'a>)>,
) {
    let self_attn = &attention.self_attn;
    for (name, projection) in [
        ("query", &self_attn.query),
        ("key", &self_attn.key),
        ("value", &self_attn.value),
    ] {
        if let Some(lora) = projection.as_lora() {
            sites.push((format!("{prefix}.self.{name}"), AdapterSite::Lora(lora)));
        }
    }
    if let Some(shim) = &self_attn.prefix_tuning {
        sites.push((format!("{prefix}.self.prefix_tuning"), AdapterSite::Prefix(shim)));
    }
    sites.push((
        format!("{prefix}.output.adapters"),
        AdapterSite::Bottleneck(&attention.output.adapters),
    ));
}

fn attention_sites_mut<'a>(
    prefix: &str,
    attention: &'a mut BertAttention,
    sites: &mut Vec<(String, AdapterSiteMut<'a>)>,
) {
    let BertAttention { self_attn, output } = attention;
    let BertSelfAttention {
        query,
        key,
        value,
        prefix_tuning,
        ..
    } = self_attn;
    for (name, projection) in [("query", query), ("key", key), ("value", value)] {
        if let Some(lora) = projection.as_lora_mut() {
            sites.push((format!("{prefix}.self.{name}"), AdapterSiteMut::Lora(lora)));
        }
    }
    if let Some(shim) = prefix_tuning.as_mut() {
        sites.push((format!("{prefix}.self.prefix_tuning"), AdapterSiteMut::Prefix(shim)));
    }
    sites.push((
        format!("{prefix}.output.adapters"),
        AdapterSiteMut::Bottleneck(&mut output.adapters),
    ));
}

impl AdaptedLayer for BertLayer {
    fn adapter_sites(&self) -> Vec<(String, AdapterSite<'_>)> {
        let mut sites = Vec::new();
        attention_sites("attention", &self.attention, &mut sites);
        if let Some(cross) = &self.crossattention {
            attention_sites("crossattention", cross, &mut sites);
        }
        if let Some(lora) = self.intermediate.dense.as_lora() {
            sites.push(("intermediate.dense".to_string(), AdapterSite::Lora(lora)));
        }
        if let Some(lora) = self.output.dense.as_lora() {
            sites.push(("output.dense".to_string(), AdapterSite::Lora(lora)));
        }
        sites.push((
            "output.adapters".to_string(),
            AdapterSite::Bottleneck(&self.output.adapters),
        ));
        sites
    }

    fn adapter_sites_mut(&mut self) -> Vec<(String, AdapterSiteMut<'_>)> {
        let Self {
            attention,
            crossattention,
            intermediate,
            output,
            ..
        } = self;
        let mut sites = Vec::new();
        attention_sites_mut("attention", attention, &mut sites);
        if let Some(cross) = crossattention.as_mut() {
            attention_sites_mut("crossattention", cross, &mut sites);
        }
        if let Some(lora) = intermediate.dense.as_lora_mut() {
            sites.push(("intermediate.dense".to_string(), AdapterSiteMut::Lora(lora)));
        }
        let BertOutput { dense, adapters, .. } = output;
        if let Some(lora) = dense.as_lora_mut() {
            sites.push(("output.dense".to_string(), AdapterSiteMut::Lora(lora)));
        }
        sites.push(("output.adapters".to_string(), AdapterSiteMut::Bottleneck(adapters)));
        sites
    }
}

impl ModelAdapters for BertModel {
    type Layer = BertLayer;

    fn adapters_config(&self) -> &AdaptersConfig {
        &self.config.adapters
    }

    fn adapters_config_mut(&mut self) -> &mut AdaptersConfig {
        &mut self.config.adapters
    }

    fn iter_layers(&self) -> impl Iterator<Item = (usize, &BertLayer)> {
        self.encoder.layers.iter().enumerate()
    }

    fn iter_layers_mut(&mut self) -> impl Iterator<Item = (usize, &mut BertLayer)> {
        self.encoder.layers.iter_mut().enumerate()
    }

    fn model_sites(&self) -> Vec<(String, AdapterSite<'_>)> {
        self.invertible_adapters
            .iter()
            .map(|inv| ("invertible_adapters".to_string(), AdapterSite::Invertible(inv)))
            .collect()
    }

    fn model_sites_mut(&mut self) -> Vec<(String, AdapterSiteMut<'_>)> {
        self.invertible_adapters
            .iter_mut()
            .map(|inv| ("invertible_adapters".to_string(), AdapterSiteMut::Invertible(inv)))
            .collect()
    }

    fn active_adapters(&self) -> Option<&Composition> {
        self.active_setup.as_ref()
    }

    fn set_active_setup(&mut self, setup: Option<Composition>) {
        self.active_setup = setup;
    }

    fn device(&self) -> &candle_core::Device {
        &self.device
    }
}
