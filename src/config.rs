//! Configuration types shared across adapter methods.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::adapters::bottleneck::BottleneckConfig;
use crate::adapters::lora::LoraConfig;
use crate::adapters::prefix_tuning::PrefixTuningConfig;
use crate::error::{AdapterError, Result};
use crate::traits::AdapterConfig;

/// Configuration of one named adapter, tagged by method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "architecture", rename_all = "snake_case")]
pub enum AdapterMethod {
    /// Bottleneck adapter inserted after attention and/or feed-forward output.
    Bottleneck(BottleneckConfig),
    /// Low-rank update of linear sublayers.
    Lora(LoraConfig),
    /// Trainable key/value prefixes for attention.
    PrefixTuning(PrefixTuningConfig),
}

impl AdapterMethod {
    /// Short name of the method.
    #[must_use]
    pub fn method_name(&self) -> &'static str {
        match self {
            Self::Bottleneck(_) => "bottleneck",
            Self::Lora(_) => "lora",
            Self::PrefixTuning(_) => "prefix_tuning",
        }
    }
}

impl AdapterConfig for AdapterMethod {
    fn validate(&self) -> Result<()> {
        match self {
            Self::Bottleneck(c) => c.validate(),
            Self::Lora(c) => c.validate(),
            Self::PrefixTuning(c) => c.validate(),
        }
    }
}

impl From<BottleneckConfig> for AdapterMethod {
    fn from(config: BottleneckConfig) -> Self {
        Self::Bottleneck(config)
    }
}

impl From<LoraConfig> for AdapterMethod {
    fn from(config: LoraConfig) -> Self {
        Self::Lora(config)
    }
}

impl From<PrefixTuningConfig> for AdapterMethod {
    fn from(config: PrefixTuningConfig) -> Self {
        Self::PrefixTuning(config)
    }
}

/// Registry of named adapter configurations attached to a model config.
///
/// Components read this during `init_adapters` to instantiate adapters that
/// were registered before setup ran.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdaptersConfig {
    #[serde(default)]
    adapters: BTreeMap<String, AdapterMethod>,
}

impl AdaptersConfig {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named adapter configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is taken or the configuration is invalid.
    pub fn add(&mut self, name: impl Into<String>, method: AdapterMethod) -> Result<()> {
        let name = name.into();
        if name.is_empty() {
            return Err(AdapterError::InvalidConfig(
                "adapter name cannot be empty".into(),
            ));
        }
        if self.adapters.contains_key(&name) {
            return Err(AdapterError::AdapterExists { name });
        }
        method.validate()?;
        self.adapters.insert(name, method);
        Ok(())
    }

    /// Register every adapter of `other` whose name is not taken yet.
    /// Existing entries win. Returns the number of names added.
    ///
    /// # Errors
    ///
    /// Returns an error if an incoming configuration is invalid.
    pub fn merge(&mut self, other: &AdaptersConfig) -> Result<usize> {
        let mut added = 0;
        for (name, method) in other.iter() {
            if !self.contains(name) {
                self.add(name, method.clone())?;
                added += 1;
            }
        }
        Ok(added)
    }

    /// Remove a named adapter configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if no adapter with this name exists.
    pub fn remove(&mut self, name: &str) -> Result<AdapterMethod> {
        self.adapters
            .remove(name)
            .ok_or_else(|| AdapterError::AdapterNotFound {
                name: name.to_string(),
            })
    }

    /// Get a configuration by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&AdapterMethod> {
        self.adapters.get(name)
    }

    /// Check if an adapter with the given name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    /// Registered adapter names in sorted order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.adapters.keys().map(String::as_str).collect()
    }

    /// Number of registered adapters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    /// Check if the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// All registered adapters in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &AdapterMethod)> {
        self.adapters.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Registered bottleneck adapters.
    pub fn bottleneck_adapters(&self) -> impl Iterator<Item = (&str, &BottleneckConfig)> {
        self.iter().filter_map(|(name, m)| match m {
            AdapterMethod::Bottleneck(c) => Some((name, c)),
            _ => None,
        })
    }

    /// Registered LoRA adapters.
    pub fn lora_adapters(&self) -> impl Iterator<Item = (&str, &LoraConfig)> {
        self.iter().filter_map(|(name, m)| match m {
            AdapterMethod::Lora(c) => Some((name, c)),
            _ => None,
        })
    }

    /// Registered prefix-tuning adapters.
    pub fn prefix_tuning_adapters(&self) -> impl Iterator<Item = (&str, &PrefixTuningConfig)> {
        self.iter().filter_map(|(name, m)| match m {
            AdapterMethod::PrefixTuning(c) => Some((name, c)),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_lookup() -> Result<()> {
        let mut config = AdaptersConfig::new();
        config.add("a", LoraConfig::default().into())?;
        config.add("b", BottleneckConfig::default().into())?;

        assert_eq!(config.len(), 2);
        assert_eq!(config.names(), vec!["a", "b"]);
        assert_eq!(config.lora_adapters().count(), 1);
        assert_eq!(config.bottleneck_adapters().count(), 1);
        assert_eq!(config.prefix_tuning_adapters().count(), 0);
        assert_eq!(config.get("a").map(AdapterMethod::method_name), Some("lora"));
        Ok(())
    }

    #[test]
    fn test_duplicate_and_invalid() {
        let mut config = AdaptersConfig::new();
        assert!(config.add("a", LoraConfig::default().into()).is_ok());
        assert!(matches!(
            config.add("a", LoraConfig::default().into()),
            Err(AdapterError::AdapterExists { .. })
        ));
        let bad = LoraConfig {
            r: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.add("bad", bad.into()),
            Err(AdapterError::InvalidConfig(_))
        ));
        assert!(!config.contains("bad"));
    }

    #[test]
    fn test_merge_keeps_existing() -> Result<()> {
        let mut config = AdaptersConfig::new();
        config.add("a", LoraConfig::default().into())?;
        let mut incoming = AdaptersConfig::new();
        incoming.add("a", BottleneckConfig::default().into())?;
        incoming.add("b", BottleneckConfig::default().into())?;

        assert_eq!(config.merge(&incoming)?, 1);
        assert_eq!(config.names(), vec!["a", "b"]);
        assert_eq!(config.get("a").map(AdapterMethod::method_name), Some("lora"));
        assert_eq!(config.merge(&AdaptersConfig::new())?, 0);
        assert_eq!(config.len(), 2);
        Ok(())
    }

    #[test]
    fn test_remove_missing() {
        let mut config = AdaptersConfig::new();
        assert!(matches!(
            config.remove("missing"),
            Err(AdapterError::AdapterNotFound { .. })
        ));
    }

    #[test]
    fn test_tagged_serialization() -> anyhow::Result<()> {
        let mut config = AdaptersConfig::new();
        config.add("lang", BottleneckConfig::default().into())?;
        let json = serde_json::to_string(&config)?;
        assert!(json.contains(r#""architecture":"bottleneck""#));
        let back: AdaptersConfig = serde_json::from_str(&json)?;
        assert_eq!(back, config);
        Ok(())
    }
}
