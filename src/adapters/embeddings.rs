//! Alternative word-embedding tables that can replace the base vocabulary.

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor};
use candle_nn::{Embedding, Module};
use tracing::info;

use crate::error::{AdapterError, Result};

/// Named word-embedding tables and the currently active one.
///
/// When no table is active the model uses its own word embeddings.
pub struct EmbeddingAdapters {
    hidden_size: usize,
    dtype: DType,
    device: Device,
    tables: BTreeMap<String, Embedding>,
    active: Option<String>,
}

impl EmbeddingAdapters {
    /// Create an empty set.
    #[must_use]
    pub fn new(hidden_size: usize, dtype: DType, device: &Device) -> Self {
        Self {
            hidden_size,
            dtype,
            device: device.clone(),
            tables: BTreeMap::new(),
            active: None,
        }
    }

    /// Add a randomly initialized table for a vocabulary of `vocab_size`.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is taken or initialization fails.
    pub fn add_embeddings(&mut self, name: impl Into<String>, vocab_size: usize) -> Result<()> {
        let weight = Tensor::randn(0f32, 0.02, (vocab_size, self.hidden_size), &self.device)?
            .to_dtype(self.dtype)?;
        self.insert(name.into(), weight)
    }

    /// Add a table from an existing weight matrix `[vocab_size, hidden_size]`.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is taken or the shape does not match.
    pub fn add_embeddings_from_weight(
        &mut self,
        name: impl Into<String>,
        weight: Tensor,
    ) -> Result<()> {
        let (_, hidden) = weight.dims2()?;
        if hidden != self.hidden_size {
            return Err(AdapterError::ShapeMismatch {
                expected: vec![weight.dim(0)?, self.hidden_size],
                actual: weight.dims().to_vec(),
            });
        }
        self.insert(name.into(), weight)
    }

    fn insert(&mut self, name: String, weight: Tensor) -> Result<()> {
        if self.tables.contains_key(&name) {
            return Err(AdapterError::AdapterExists { name });
        }
        info!(embeddings = %name, vocab_size = weight.dim(0)?, "added embeddings");
        let embedding = Embedding::new(weight, self.hidden_size);
        self.tables.insert(name, embedding);
        Ok(())
    }

    /// Activate a table by name, or the base embeddings with `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if no table with this name exists.
    pub fn set_active(&mut self, name: Option<&str>) -> Result<()> {
        match name {
            Some(name) if !self.tables.contains_key(name) => Err(AdapterError::AdapterNotFound {
                name: name.to_string(),
            }),
            _ => {
                self.active = name.map(str::to_string);
                Ok(())
            }
        }
    }

    /// Remove a table. The active table cannot be removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the table is missing or active.
    pub fn delete_embeddings(&mut self, name: &str) -> Result<()> {
        if self.active.as_deref() == Some(name) {
            return Err(AdapterError::InvalidConfig(
                "Cannot remove the currently active embeddings".to_string(),
            ));
        }
        self.tables
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| AdapterError::AdapterNotFound {
                name: name.to_string(),
            })
    }

    /// Name of the active table.
    #[must_use]
    pub fn active_name(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Names of all tables.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.tables.keys().map(String::as_str).collect()
    }

    /// Look up `input_ids` in the active table, or `None` if the base table applies.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    pub fn forward(&self, input_ids: &Tensor) -> Result<Option<Tensor>> {
        match self.active.as_ref().and_then(|n| self.tables.get(n)) {
            Some(table) => Ok(Some(table.forward(input_ids)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_activate_lookup() -> Result<()> {
        let device = Device::Cpu;
        let mut emb = EmbeddingAdapters::new(8, DType::F32, &device);
        emb.add_embeddings("de", 50)?;

        let ids = Tensor::new(&[[1u32, 2, 3]], &device)?;
        assert!(emb.forward(&ids)?.is_none());

        emb.set_active(Some("de"))?;
        let out = emb.forward(&ids)?.map(|t| t.dims().to_vec());
        assert_eq!(out, Some(vec![1, 3, 8]));
        Ok(())
    }

    #[test]
    fn test_duplicate_and_missing() -> Result<()> {
        let device = Device::Cpu;
        let mut emb = EmbeddingAdapters::new(8, DType::F32, &device);
        emb.add_embeddings("de", 10)?;
        assert!(matches!(
            emb.add_embeddings("de", 10),
            Err(AdapterError::AdapterExists { .. })
        ));
        assert!(emb.set_active(Some("fr")).is_err());
        Ok(())
    }

    #[test]
    fn test_cannot_delete_active() -> Result<()> {
        let device = Device::Cpu;
        let mut emb = EmbeddingAdapters::new(8, DType::F32, &device);
        emb.add_embeddings("de", 10)?;
        emb.set_active(Some("de"))?;
        assert!(emb.delete_embeddings("de").is_err());
        emb.set_active(None)?;
        emb.delete_embeddings("de")?;
        assert!(emb.names().is_empty());
        Ok(())
    }

    #[test]
    fn test_weight_shape_checked() -> Result<()> {
        let device = Device::Cpu;
        let mut emb = EmbeddingAdapters::new(8, DType::F32, &device);
        let bad = Tensor::zeros((10, 4), DType::F32, &device)?;
        assert!(matches!(
            emb.add_embeddings_from_weight("bad", bad),
            Err(AdapterError::ShapeMismatch { .. })
        ));
        Ok(())
    }
}
