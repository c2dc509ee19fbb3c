//! Model-level adapter management.
//!
//! This module provides functionality for:
//! - Enumerating the places inside a layer where adapters live ([`AdapterSite`])
//! - Per-layer adapter operations ([`AdaptedLayer`])
//! - Adding, deleting, activating, training, saving and loading named adapters
//!   across a whole model ([`ModelAdapters`])

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

use candle_core::{Device, Tensor};
use tracing::{info, warn};

use crate::adapters::bottleneck::AdapterLayer;
use crate::adapters::invertible::InvertibleAdapters;
use crate::adapters::lora::LoraLinear;
use crate::adapters::prefix_tuning::PrefixTuningShim;
use crate::composition::Composition;
use crate::config::{AdapterMethod, AdaptersConfig};
use crate::error::{AdapterError, Result};
use crate::io::{
    extend_prefixed, load_adapter_config, load_adapter_weights, save_adapter_config,
    save_adapter_weights, strip_prefixed, SavedAdapterConfig, ADAPTER_CONFIG_FILENAME,
    ADAPTER_WEIGHTS_FILENAME,
};
use crate::traits::{Adapter, SaveLoad, Trainable};

/// A place in the model that holds named adapters.
pub enum AdapterSite<'a> {
    /// LoRA-wrapped linear layer.
    Lora(&'a LoraLinear),
    /// Bottleneck adapter container.
    Bottleneck(&'a AdapterLayer),
    /// Prefix-tuning shim of an attention block.
    Prefix(&'a PrefixTuningShim),
    /// Invertible adapters after the embeddings.
    Invertible(&'a InvertibleAdapters),
}

/// Mutable access to a place in the model that holds named adapters.
pub enum AdapterSiteMut<'a> {
    /// LoRA-wrapped linear layer.
    Lora(&'a mut LoraLinear),
    /// Bottleneck adapter container.
    Bottleneck(&'a mut AdapterLayer),
    /// Prefix-tuning shim of an attention block.
    Prefix(&'a mut PrefixTuningShim),
    /// Invertible adapters after the embeddings.
    Invertible(&'a mut InvertibleAdapters),
}

fn set_frozen<T: Trainable>(module: Option<&mut T>, frozen: bool) {
    if let Some(module) = module {
        if frozen {
            module.freeze();
        } else {
            module.unfreeze();
        }
    }
}

impl AdapterSite<'_> {
    /// Whether this site holds the named adapter.
    #[must_use]
    pub fn has_adapter(&self, name: &str) -> bool {
        match self {
            Self::Lora(l) => l.has_adapter(name),
            Self::Bottleneck(b) => b.has_adapter(name),
            Self::Prefix(p) => p.has_adapter(name),
            Self::Invertible(i) => i.has_adapter(name),
        }
    }

    /// Parameters of the named adapter at this site.
    #[must_use]
    pub fn num_parameters(&self, name: &str) -> usize {
        match self {
            Self::Lora(l) => l.adapter(name).map_or(0, Adapter::num_parameters),
            Self::Bottleneck(b) => b.adapter(name).map_or(0, Adapter::num_parameters),
            Self::Prefix(p) => p.adapter(name).map_or(0, |a| a.num_parameters()),
            Self::Invertible(i) => i.adapter(name).map_or(0, |a| a.num_parameters()),
        }
    }

    /// Whether the named adapter at this site is frozen.
    #[must_use]
    pub fn is_frozen(&self, name: &str) -> Option<bool> {
        match self {
            Self::Lora(l) => l.adapter(name).map(Trainable::is_frozen),
            Self::Bottleneck(b) => b.adapter(name).map(Trainable::is_frozen),
            Self::Prefix(p) => p.adapter(name).map(Trainable::is_frozen),
            Self::Invertible(i) => i.adapter(name).map(Trainable::is_frozen),
        }
    }

    /// Tensors of the named adapter at this site, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the state dict cannot be built.
    pub fn state_dict(&self, name: &str) -> Result<Option<HashMap<String, Tensor>>> {
        let module: Option<&dyn SaveLoad> = match self {
            Self::Lora(l) => l.adapter(name).map(|a| a as &dyn SaveLoad),
            Self::Bottleneck(b) => b.adapter(name).map(|a| a as &dyn SaveLoad),
            Self::Prefix(p) => p.adapter(name).map(|a| a as &dyn SaveLoad),
            Self::Invertible(i) => i.adapter(name).map(|a| a as &dyn SaveLoad),
        };
        module.map(SaveLoad::state_dict).transpose()
    }
}

impl AdapterSiteMut<'_> {
    /// Instantiate the adapter here if its method targets this site.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter cannot be created.
    pub fn add_adapter(&mut self, name: &str, method: &AdapterMethod) -> Result<bool> {
        match (self, method) {
            (Self::Lora(l), AdapterMethod::Lora(c)) => l.add_adapter(name, c),
            (Self::Bottleneck(b), AdapterMethod::Bottleneck(c)) => b.add_adapter(name, c),
            (Self::Prefix(p), AdapterMethod::PrefixTuning(c)) => p.add_adapter(name, c),
            (Self::Invertible(i), AdapterMethod::Bottleneck(c)) => match &c.inv_adapter {
                Some(inv) => i.add_adapter(name, inv),
                None => Ok(false),
            },
            _ => Ok(false),
        }
    }

    /// Remove the named adapter from this site.
    ///
    /// # Errors
    ///
    /// Returns an error if a merged LoRA adapter cannot be unmerged.
    pub fn delete_adapter(&mut self, name: &str) -> Result<bool> {
        Ok(match self {
            Self::Lora(l) => l.delete_adapter(name)?,
            Self::Bottleneck(b) => b.delete_adapter(name),
            Self::Prefix(p) => p.delete_adapter(name),
            Self::Invertible(i) => i.delete_adapter(name),
        })
    }

    /// Freeze or unfreeze the named adapter at this site.
    pub fn set_frozen(&mut self, name: &str, frozen: bool) {
        match self {
            Self::Lora(l) => set_frozen(l.adapter_mut(name), frozen),
            Self::Bottleneck(b) => set_frozen(b.adapter_mut(name), frozen),
            Self::Prefix(p) => set_frozen(p.adapter_mut(name), frozen),
            Self::Invertible(i) => set_frozen(i.adapter_mut(name), frozen),
        }
    }

    /// Load tensors of the named adapter at this site. Sites not holding the
    /// adapter are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor is missing or mis-shaped.
    pub fn load_state_dict(&mut self, name: &str, state: &HashMap<String, Tensor>) -> Result<()> {
        let module: Option<&mut dyn SaveLoad> = match self {
            Self::Lora(l) => l.adapter_mut(name).map(|a| a as &mut dyn SaveLoad),
            Self::Bottleneck(b) => b.adapter_mut(name).map(|a| a as &mut dyn SaveLoad),
            Self::Prefix(p) => p.adapter_mut(name).map(|a| a as &mut dyn SaveLoad),
            Self::Invertible(i) => i.adapter_mut(name).map(|a| a as &mut dyn SaveLoad),
        };
        match module {
            Some(module) => module.load_state_dict(state),
            None => Ok(()),
        }
    }
}

/// A layer (or other component) that exposes its adapter sites.
///
/// Site paths are dotted module paths relative to the component, e.g.
/// `attention.self.query`.
pub trait AdaptedLayer {
    /// All sites, in a fixed order.
    fn adapter_sites(&self) -> Vec<(String, AdapterSite<'_>)>;

    /// All sites, mutably, in the same order as [`AdaptedLayer::adapter_sites`].
    fn adapter_sites_mut(&mut self) -> Vec<(String, AdapterSiteMut<'_>)>;

    /// Instantiate an adapter at every site it targets. Returns the site count.
    ///
    /// # Errors
    ///
    /// Returns an error if an adapter cannot be created.
    fn add_adapter(&mut self, name: &str, method: &AdapterMethod) -> Result<usize> {
        let mut created = 0;
        for (_, mut site) in self.adapter_sites_mut() {
            if site.add_adapter(name, method)? {
                created += 1;
            }
        }
        Ok(created)
    }

    /// Remove an adapter from every site. Returns the site count.
    ///
    /// # Errors
    ///
    /// Returns an error if a merged LoRA adapter cannot be unmerged.
    fn delete_adapter(&mut self, name: &str) -> Result<usize> {
        let mut removed = 0;
        for (_, mut site) in self.adapter_sites_mut() {
            if site.delete_adapter(name)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Freeze or unfreeze an adapter at every site.
    fn set_adapter_frozen(&mut self, name: &str, frozen: bool) {
        for (_, mut site) in self.adapter_sites_mut() {
            site.set_frozen(name, frozen);
        }
    }

    /// Parameters of an adapter across all sites.
    fn adapter_num_parameters(&self, name: &str) -> usize {
        self.adapter_sites()
            .iter()
            .map(|(_, site)| site.num_parameters(name))
            .sum()
    }

    /// Tensors of an adapter keyed by `site.tensor`.
    ///
    /// # Errors
    ///
    /// Returns an error if a state dict cannot be built.
    fn adapter_state_dict(&self, name: &str) -> Result<HashMap<String, Tensor>> {
        let mut out = HashMap::new();
        for (path, site) in self.adapter_sites() {
            if let Some(state) = site.state_dict(name)? {
                extend_prefixed(&mut out, &path, state);
            }
        }
        Ok(out)
    }

    /// Load tensors produced by [`AdaptedLayer::adapter_state_dict`].
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor is missing or mis-shaped.
    fn load_adapter_state_dict(
        &mut self,
        name: &str,
        state: &HashMap<String, Tensor>,
    ) -> Result<()> {
        for (path, mut site) in self.adapter_sites_mut() {
            site.load_state_dict(name, &strip_prefixed(state, &path))?;
        }
        Ok(())
    }
}

/// One row of [`ModelAdapters::adapter_summary`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterSummary {
    /// Adapter name.
    pub name: String,
    /// Method name (`bottleneck`, `lora`, `prefix_tuning`).
    pub method: &'static str,
    /// Number of instantiated parameters.
    pub parameters: usize,
    /// Whether the adapter is part of the active composition.
    pub active: bool,
}

impl fmt::Display for AdapterSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<20} {:<14} {:>10} {}",
            self.name,
            self.method,
            format_parameter_count(self.parameters),
            if self.active { "active" } else { "" }
        )
    }
}

/// Format parameter count with appropriate units.
///
/// # Arguments
///
/// * `count` - Number of parameters
///
/// # Returns
///
/// Human-readable string (e.g., "12.30K", "1.50M", "2.10B")
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_parameter_count(count: usize) -> String {
    if count >= 1_000_000_000 {
        format!("{:.2}B", count as f64 / 1_000_000_000.0)
    } else if count >= 1_000_000 {
        format!("{:.2}M", count as f64 / 1_000_000.0)
    } else if count >= 1_000 {
        format!("{:.2}K", count as f64 / 1_000.0)
    } else {
        count.to_string()
    }
}

/// Adapter management for a whole model.
///
/// Implementors provide access to their adapter config, layers and any
/// model-level sites; adding, removing, activating, training and persisting
/// adapters are provided on top.
pub trait ModelAdapters {
    /// Layer type walked by [`ModelAdapters::iter_layers`].
    type Layer: AdaptedLayer;

    /// Registered adapter configurations.
    fn adapters_config(&self) -> &AdaptersConfig;

    /// Registered adapter configurations, mutably.
    fn adapters_config_mut(&mut self) -> &mut AdaptersConfig;

    /// `(index, layer)` pairs in ascending index order.
    ///
    /// Each call walks the layer collection afresh.
    fn iter_layers(&self) -> impl Iterator<Item = (usize, &Self::Layer)>;

    /// `(index, layer)` pairs in ascending index order, mutably.
    fn iter_layers_mut(&mut self) -> impl Iterator<Item = (usize, &mut Self::Layer)>;

    /// Sites owned by the model rather than a layer.
    fn model_sites(&self) -> Vec<(String, AdapterSite<'_>)> {
        Vec::new()
    }

    /// Model-level sites, mutably, in the same order as [`ModelAdapters::model_sites`].
    fn model_sites_mut(&mut self) -> Vec<(String, AdapterSiteMut<'_>)> {
        Vec::new()
    }

    /// Currently active composition.
    fn active_adapters(&self) -> Option<&Composition>;

    /// Replace the active composition without validation.
    fn set_active_setup(&mut self, setup: Option<Composition>);

    /// Device adapter weights are loaded onto.
    fn device(&self) -> &Device;

    /// Register an adapter and instantiate it at every site it targets.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is taken, the config is invalid or
    /// instantiation fails.
    fn add_adapter(&mut self, name: &str, method: AdapterMethod, set_active: bool) -> Result<()> {
        self.adapters_config_mut().add(name, method.clone())?;

        let created = match instantiate_everywhere(self, name, &method) {
            Ok(created) => created,
            Err(e) => {
                // leave no partial sites or registry entry behind
                if let Err(cleanup) = remove_everywhere(self, name) {
                    warn!(adapter = name, error = %cleanup, "failed to clean up partial adapter");
                }
                self.adapters_config_mut().remove(name)?;
                return Err(e);
            }
        };
        if created == 0 {
            warn!(adapter = name, "adapter does not target any location in this model");
        }
        info!(adapter = name, method = method.method_name(), sites = created, "added adapter");

        if set_active {
            self.set_active_adapters(name)?;
        }
        Ok(())
    }

    /// Remove an adapter everywhere and drop it from the active composition.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter is not registered.
    fn delete_adapter(&mut self, name: &str) -> Result<()> {
        self.adapters_config_mut().remove(name)?;
        remove_everywhere(self, name)?;
        if self.active_adapters().is_some_and(|c| c.contains(name)) {
            self.set_active_setup(None);
        }
        info!(adapter = name, "deleted adapter");
        Ok(())
    }

    /// Activate a composition of registered adapters.
    ///
    /// # Errors
    ///
    /// Returns an error if the composition is malformed or names an unknown adapter.
    fn set_active_adapters(&mut self, setup: impl Into<Composition>) -> Result<()> {
        let setup = setup.into();
        setup.validate()?;
        if let Some(missing) = setup
            .flatten()
            .into_iter()
            .find(|n| !self.adapters_config().contains(n))
        {
            return Err(AdapterError::AdapterNotFound {
                name: missing.to_string(),
            });
        }
        info!(setup = ?setup, "activated adapters");
        self.set_active_setup(Some(setup));
        Ok(())
    }

    /// Activate `setup` and freeze every other adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if the composition is malformed or names an unknown adapter.
    fn train_adapter(&mut self, setup: impl Into<Composition>) -> Result<()> {
        let setup = setup.into();
        self.set_active_adapters(setup.clone())?;
        let names: Vec<String> = self
            .adapters_config()
            .names()
            .into_iter()
            .map(str::to_string)
            .collect();
        for name in &names {
            let frozen = !setup.contains(name);
            for (_, mut site) in self.model_sites_mut() {
                site.set_frozen(name, frozen);
            }
            for (_, layer) in self.iter_layers_mut() {
                layer.set_adapter_frozen(name, frozen);
            }
        }
        Ok(())
    }

    /// Whether every instantiated part of the adapter is frozen.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter is not registered.
    fn is_adapter_frozen(&self, name: &str) -> Result<bool> {
        self.ensure_registered(name)?;
        let model = self.model_sites();
        let layers: Vec<_> = self.iter_layers().map(|(_, l)| l.adapter_sites()).collect();
        let mut states = model
            .iter()
            .chain(layers.iter().flatten())
            .filter_map(|(_, site)| site.is_frozen(name))
            .peekable();
        Ok(states.peek().is_some() && states.all(|frozen| frozen))
    }

    /// Parameters of an adapter across the model.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter is not registered.
    fn num_adapter_parameters(&self, name: &str) -> Result<usize> {
        self.ensure_registered(name)?;
        let model: usize = self
            .model_sites()
            .iter()
            .map(|(_, site)| site.num_parameters(name))
            .sum();
        let layers: usize = self
            .iter_layers()
            .map(|(_, layer)| layer.adapter_num_parameters(name))
            .sum();
        Ok(model + layers)
    }

    /// One row per registered adapter, in name order.
    fn adapter_summary(&self) -> Vec<AdapterSummary> {
        self.adapters_config()
            .iter()
            .map(|(name, method)| AdapterSummary {
                name: name.to_string(),
                method: method.method_name(),
                parameters: self.num_adapter_parameters(name).unwrap_or(0),
                active: self.active_adapters().is_some_and(|c| c.contains(name)),
            })
            .collect()
    }

    /// Fail with `AdapterNotFound` unless `name` is registered.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter is not registered.
    fn ensure_registered(&self, name: &str) -> Result<()> {
        if self.adapters_config().contains(name) {
            Ok(())
        } else {
            Err(AdapterError::AdapterNotFound {
                name: name.to_string(),
            })
        }
    }

    /// All tensors of an adapter, keyed by model path.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter is not registered.
    fn adapter_state_dict(&self, name: &str) -> Result<HashMap<String, Tensor>> {
        self.ensure_registered(name)?;
        let mut out = HashMap::new();
        for (path, site) in self.model_sites() {
            if let Some(state) = site.state_dict(name)? {
                extend_prefixed(&mut out, &path, state);
            }
        }
        for (i, layer) in self.iter_layers() {
            extend_prefixed(
                &mut out,
                &format!("encoder.layer.{i}"),
                layer.adapter_state_dict(name)?,
            );
        }
        Ok(out)
    }

    /// Load tensors produced by [`ModelAdapters::adapter_state_dict`].
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter is not registered or a tensor is
    /// missing or mis-shaped.
    fn load_adapter_state_dict(
        &mut self,
        name: &str,
        state: &HashMap<String, Tensor>,
    ) -> Result<()> {
        self.ensure_registered(name)?;
        for (path, mut site) in self.model_sites_mut() {
            site.load_state_dict(name, &strip_prefixed(state, &path))?;
        }
        for (i, layer) in self.iter_layers_mut() {
            let layer_state = strip_prefixed(state, &format!("encoder.layer.{i}"));
            layer.load_adapter_state_dict(name, &layer_state)?;
        }
        Ok(())
    }

    /// Write `adapter_config.json` and `adapter_model.safetensors` to `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter is not registered or writing fails.
    fn save_adapter<P: AsRef<Path>>(&self, dir: P, name: &str) -> Result<()> {
        let dir = dir.as_ref();
        let config = self
            .adapters_config()
            .get(name)
            .cloned()
            .ok_or_else(|| AdapterError::AdapterNotFound {
                name: name.to_string(),
            })?;
        fs::create_dir_all(dir)
            .map_err(|e| AdapterError::Io(format!("Failed to create {}: {e}", dir.display())))?;

        let saved = SavedAdapterConfig {
            name: name.to_string(),
            config,
        };
        save_adapter_config(&saved, dir.join(ADAPTER_CONFIG_FILENAME))?;
        let state = self.adapter_state_dict(name)?;
        save_adapter_weights(&state, dir.join(ADAPTER_WEIGHTS_FILENAME))?;
        info!(adapter = name, tensors = state.len(), dir = %dir.display(), "saved adapter");
        Ok(())
    }

    /// Add an adapter saved with [`ModelAdapters::save_adapter`] and load its weights.
    ///
    /// Returns the name the adapter was saved under.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails, the name is taken or weights do not fit.
    fn load_adapter<P: AsRef<Path>>(&mut self, dir: P, set_active: bool) -> Result<String> {
        let dir = dir.as_ref();
        let saved: SavedAdapterConfig = load_adapter_config(dir.join(ADAPTER_CONFIG_FILENAME))?;
        let state = load_adapter_weights(dir.join(ADAPTER_WEIGHTS_FILENAME), self.device())?;

        self.add_adapter(&saved.name, saved.config, set_active)?;
        if let Err(e) = self.load_adapter_state_dict(&saved.name, &state) {
            self.delete_adapter(&saved.name)?;
            return Err(e);
        }
        info!(adapter = %saved.name, dir = %dir.display(), "loaded adapter");
        Ok(saved.name)
    }
}

fn instantiate_everywhere<M: ModelAdapters + ?Sized>(
    model: &mut M,
    name: &str,
    method: &AdapterMethod,
) -> Result<usize> {
    let mut created = 0;
    for (_, mut site) in model.model_sites_mut() {
        if site.add_adapter(name, method)? {
            created += 1;
        }
    }
    for (_, layer) in model.iter_layers_mut() {
        created += layer.add_adapter(name, method)?;
    }
    Ok(created)
}

fn remove_everywhere<M: ModelAdapters + ?Sized>(model: &mut M, name: &str) -> Result<()> {
    for (_, mut site) in model.model_sites_mut() {
        site.delete_adapter(name)?;
    }
    for (_, layer) in model.iter_layers_mut() {
        layer.delete_adapter(name)?;
    }
    Ok(())
}
