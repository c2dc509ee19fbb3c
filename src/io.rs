//! I/O utilities for saving and loading adapter weights and configurations.
//!
//! This module provides functionality for:
//! - Saving adapter weights to safetensors format
//! - Loading adapter weights from safetensors format
//! - Saving adapter configurations to JSON
//! - Loading adapter configurations from JSON

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use candle_core::{Device, Tensor};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::config::AdapterMethod;
use crate::error::{AdapterError, Result};

/// File name of the adapter configuration inside a saved adapter directory.
pub const ADAPTER_CONFIG_FILENAME: &str = "adapter_config.json";

/// File name of the adapter weights inside a saved adapter directory.
pub const ADAPTER_WEIGHTS_FILENAME: &str = "adapter_model.safetensors";

/// Contents of `adapter_config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedAdapterConfig {
    /// Name the adapter was saved under.
    pub name: String,
    /// Adapter configuration.
    pub config: AdapterMethod,
}

/// Save adapter weights to a safetensors file.
///
/// # Arguments
/// * `tensors` - Map of tensor name -> tensor
/// * `path` - Path to save the safetensors file
///
/// # Errors
/// Returns an error if:
/// - Failed to serialize tensors to safetensors format
/// - Failed to write file to disk
pub fn save_adapter_weights<P: AsRef<Path>>(
    tensors: &HashMap<String, Tensor>,
    path: P,
) -> Result<()> {
    let tensors: Vec<(&str, Tensor)> = tensors
        .iter()
        .map(|(name, tensor)| (name.as_str(), tensor.clone()))
        .collect();

    safetensors::tensor::serialize_to_file(tensors, &None, path.as_ref())
        .map_err(|e| AdapterError::Io(format!("Failed to save safetensors: {e}")))?;

    Ok(())
}

/// Load adapter weights from a safetensors file.
///
/// # Arguments
/// * `path` - Path to the safetensors file
/// * `device` - Device to load tensors on
///
/// # Errors
/// Returns an error if:
/// - Failed to read file from disk
/// - Failed to parse safetensors format
pub fn load_adapter_weights<P: AsRef<Path>>(
    path: P,
    device: &Device,
) -> Result<HashMap<String, Tensor>> {
    candle_core::safetensors::load(path.as_ref(), device)
        .map_err(|e| AdapterError::WeightLoad(format!("{}: {e}", path.as_ref().display())))
}

/// Save adapter configuration to a JSON file.
///
/// # Arguments
/// * `config` - The configuration to save
/// * `path` - Path to save the JSON file
///
/// # Errors
/// Returns an error if serialization or file writing fails
pub fn save_adapter_config<T: Serialize, P: AsRef<Path>>(config: &T, path: P) -> Result<()> {
    let json = serde_json::to_string_pretty(config)
        .map_err(|e| AdapterError::Io(format!("Failed to serialize config: {e}")))?;

    fs::write(path, json)
        .map_err(|e| AdapterError::Io(format!("Failed to write config file: {e}")))?;

    Ok(())
}

/// Load adapter configuration from a JSON file.
///
/// # Arguments
/// * `path` - Path to the JSON file
///
/// # Errors
/// Returns an error if file reading or deserialization fails
pub fn load_adapter_config<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let json = fs::read_to_string(path)
        .map_err(|e| AdapterError::Io(format!("Failed to read config file: {e}")))?;

    let config = serde_json::from_str(&json)
        .map_err(|e| AdapterError::Io(format!("Failed to parse config: {e}")))?;

    Ok(config)
}

/// Fetch `key` from a state dict and check its shape.
///
/// # Errors
///
/// Returns an error if the tensor is missing or has a different shape.
pub(crate) fn expect_tensor(
    state_dict: &HashMap<String, Tensor>,
    key: &str,
    dims: &[usize],
) -> Result<Tensor> {
    let tensor = state_dict
        .get(key)
        .ok_or_else(|| AdapterError::WeightLoad(format!("missing tensor '{key}'")))?;
    if tensor.dims() != dims {
        return Err(AdapterError::ShapeMismatch {
            expected: dims.to_vec(),
            actual: tensor.dims().to_vec(),
        });
    }
    Ok(tensor.clone())
}

/// Insert every entry of `state` into `out` under `prefix.`.
pub(crate) fn extend_prefixed(
    out: &mut HashMap<String, Tensor>,
    prefix: &str,
    state: HashMap<String, Tensor>,
) {
    out.extend(state.into_iter().map(|(k, v)| (format!("{prefix}.{k}"), v)));
}

/// Entries of `state` under `prefix.`, with the prefix removed.
pub(crate) fn strip_prefixed(
    state: &HashMap<String, Tensor>,
    prefix: &str,
) -> HashMap<String, Tensor> {
    let prefix = format!("{prefix}.");
    state
        .iter()
        .filter_map(|(k, v)| k.strip_prefix(&prefix).map(|rest| (rest.to_string(), v.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::lora::LoraConfig;
    use candle_core::{DType, Device};
    use tempfile::TempDir;

    #[test]
    fn test_save_load_adapter_weights() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let temp_dir = TempDir::new()?;
        let weights_path = temp_dir.path().join(ADAPTER_WEIGHTS_FILENAME);

        let mut weights = HashMap::new();
        weights.insert(
            "lora_a".to_string(),
            Tensor::randn(0f32, 1f32, (64, 8), &device)?,
        );
        weights.insert(
            "lora_b".to_string(),
            Tensor::randn(0f32, 1f32, (8, 64), &device)?,
        );

        save_adapter_weights(&weights, &weights_path)?;
        assert!(weights_path.exists());

        let loaded = load_adapter_weights(&weights_path, &device)?;
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["lora_a"].dims(), &[64, 8]);
        assert_eq!(loaded["lora_b"].dims(), &[8, 64]);

        Ok(())
    }

    #[test]
    fn test_save_load_config() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join(ADAPTER_CONFIG_FILENAME);

        let saved = SavedAdapterConfig {
            name: "sentiment".into(),
            config: LoraConfig::default().into(),
        };

        save_adapter_config(&saved, &config_path)?;
        assert!(config_path.exists());

        let loaded: SavedAdapterConfig = load_adapter_config(&config_path)?;
        assert_eq!(saved, loaded);

        Ok(())
    }

    #[test]
    fn test_missing_weights_file() {
        let result = load_adapter_weights("/nonexistent/adapter.safetensors", &Device::Cpu);
        assert!(matches!(result, Err(AdapterError::WeightLoad(_))));
    }

    #[test]
    fn test_prefix_helpers() -> Result<()> {
        let device = Device::Cpu;
        let mut inner = HashMap::new();
        inner.insert("lora_a".to_string(), Tensor::zeros(2, DType::F32, &device)?);

        let mut out = HashMap::new();
        extend_prefixed(&mut out, "layer.0.query", inner);
        assert!(out.contains_key("layer.0.query.lora_a"));

        let back = strip_prefixed(&out, "layer.0.query");
        assert!(back.contains_key("lora_a"));
        assert!(strip_prefixed(&out, "layer.0.key").is_empty());

        let err = expect_tensor(&back, "lora_a", &[3]);
        assert!(matches!(err, Err(AdapterError::ShapeMismatch { .. })));
        Ok(())
    }
}
