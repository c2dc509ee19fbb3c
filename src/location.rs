//! Attachment points for adapters inside a transformer layer.
//!
//! Every place an adapter can live is a closed enum, so a container can never
//! be initialized with an unknown or missing location.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Location of a bottleneck adapter container within a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationKey {
    /// After the multi-head attention output projection.
    MhAdapter,
    /// After the feed-forward output projection.
    OutputAdapter,
}

impl LocationKey {
    /// Canonical string form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MhAdapter => "mh_adapter",
            Self::OutputAdapter => "output_adapter",
        }
    }
}

/// Role of an attention block inside a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionLocation {
    /// Self-attention over the layer input.
    #[serde(rename = "self")]
    SelfAttn,
    /// Cross-attention over encoder hidden states.
    Cross,
}

impl AttentionLocation {
    /// Canonical string form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SelfAttn => "self",
            Self::Cross => "cross",
        }
    }

    /// Name under which prefix-tuning prefixes for this block are kept.
    #[must_use]
    pub fn prefix_name(self) -> String {
        format!("{}_prefix", self.as_str())
    }
}

/// Linear sublayers that can be wrapped with LoRA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoraLocation {
    /// Query/key/value projections of an attention block.
    #[serde(rename = "selfattn")]
    SelfAttn,
    /// First dense layer of the feed-forward block.
    Intermediate,
    /// Second dense layer of the feed-forward block.
    Output,
}

impl LoraLocation {
    /// Canonical string form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SelfAttn => "selfattn",
            Self::Intermediate => "intermediate",
            Self::Output => "output",
        }
    }
}

/// Attention projection matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttnMatrix {
    /// Query projection.
    Q,
    /// Key projection.
    K,
    /// Value projection.
    V,
}

impl AttnMatrix {
    /// Canonical string form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Q => "q",
            Self::K => "k",
            Self::V => "v",
        }
    }
}

macro_rules! impl_display {
    ($($ty:ty),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(self.as_str())
                }
            }
        )*
    };
}

impl_display!(LocationKey, AttentionLocation, LoraLocation, AttnMatrix);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_names() {
        assert_eq!(LocationKey::MhAdapter.as_str(), "mh_adapter");
        assert_eq!(LocationKey::OutputAdapter.as_str(), "output_adapter");
        assert_eq!(AttentionLocation::SelfAttn.to_string(), "self");
        assert_eq!(LoraLocation::SelfAttn.to_string(), "selfattn");
        assert_eq!(AttnMatrix::V.to_string(), "v");
    }

    #[test]
    fn test_prefix_name() {
        assert_eq!(AttentionLocation::SelfAttn.prefix_name(), "self_prefix");
        assert_eq!(AttentionLocation::Cross.prefix_name(), "cross_prefix");
    }

    #[test]
    fn test_serde_matches_canonical_names() -> anyhow::Result<()> {
        let json = serde_json::to_string(&vec![AttnMatrix::Q, AttnMatrix::K])?;
        assert_eq!(json, r#"["q","k"]"#);
        let loc: AttentionLocation = serde_json::from_str(r#""self""#)?;
        assert_eq!(loc, AttentionLocation::SelfAttn);
        let lora: LoraLocation = serde_json::from_str(r#""selfattn""#)?;
        assert_eq!(lora, LoraLocation::SelfAttn);
        Ok(())
    }
}
