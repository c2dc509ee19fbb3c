//! Composition of multiple adapters within one forward pass.
//!
//! A [`Composition`] describes which adapters are active and how they combine:
//! - `Single`: one adapter
//! - `Stack`: adapters applied one after another
//! - `Parallel`: each adapter runs on its own replica of the batch

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{AdapterError, Result};

/// Active adapter setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Composition {
    /// A single named adapter.
    Single(String),
    /// Children applied in sequence.
    Stack(Vec<Composition>),
    /// Children applied to replicas of the batch.
    Parallel(Vec<Composition>),
}

impl Composition {
    /// Stack of single adapters.
    pub fn stack<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Stack(names.into_iter().map(|n| Self::Single(n.into())).collect())
    }

    /// Parallel block of single adapters.
    pub fn parallel<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Parallel(names.into_iter().map(|n| Self::Single(n.into())).collect())
    }

    /// All adapter names in the composition, depth-first.
    #[must_use]
    pub fn flatten(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_names(&mut names);
        names
    }

    fn collect_names<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Single(name) => out.push(name.as_str()),
            Self::Stack(children) | Self::Parallel(children) => {
                for child in children {
                    child.collect_names(out);
                }
            }
        }
    }

    /// First adapter name, depth-first.
    #[must_use]
    pub fn first(&self) -> Option<&str> {
        match self {
            Self::Single(name) => Some(name.as_str()),
            Self::Stack(children) | Self::Parallel(children) => {
                children.iter().find_map(Composition::first)
            }
        }
    }

    /// Whether the composition names the given adapter anywhere.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.flatten().contains(&name)
    }

    /// Whether a `Parallel` block appears anywhere in the composition.
    #[must_use]
    pub fn has_parallel(&self) -> bool {
        match self {
            Self::Single(_) => false,
            Self::Parallel(_) => true,
            Self::Stack(children) => children.iter().any(Composition::has_parallel),
        }
    }

    /// Reject empty blocks and nested parallel blocks.
    ///
    /// # Errors
    ///
    /// Returns an error if the composition is malformed.
    pub fn validate(&self) -> Result<()> {
        self.validate_inner(false)
    }

    fn validate_inner(&self, inside_parallel: bool) -> Result<()> {
        match self {
            Self::Single(name) if name.is_empty() => Err(AdapterError::InvalidConfig(
                "adapter name cannot be empty".into(),
            )),
            Self::Single(_) => Ok(()),
            Self::Stack(children) | Self::Parallel(children) if children.is_empty() => Err(
                AdapterError::InvalidConfig("composition block cannot be empty".into()),
            ),
            Self::Stack(children) => children
                .iter()
                .try_for_each(|c| c.validate_inner(inside_parallel)),
            Self::Parallel(children) => {
                if inside_parallel {
                    return Err(AdapterError::InvalidConfig(
                        "nested parallel blocks are not supported".into(),
                    ));
                }
                children.iter().try_for_each(|c| c.validate_inner(true))
            }
        }
    }
}

impl From<&str> for Composition {
    fn from(name: &str) -> Self {
        Self::Single(name.to_string())
    }
}

impl From<String> for Composition {
    fn from(name: String) -> Self {
        Self::Single(name)
    }
}

/// Repeat tensors along the batch dimension so they match `hidden_states`.
///
/// After parallel composition replicates the hidden states, companion tensors
/// (attention masks, residuals) still carry the original batch size. Each
/// tensor whose batch size differs is tiled to match.
///
/// # Errors
///
/// Returns an error if a batch size does not evenly divide the hidden batch size.
pub fn adjust_tensors_for_parallel(
    hidden_states: &Tensor,
    tensors: &mut [&mut Tensor],
) -> Result<()> {
    let batch_size = hidden_states.dim(0)?;
    for tensor in tensors.iter_mut() {
        let other = tensor.dim(0)?;
        if other == batch_size {
            continue;
        }
        if other == 0 || batch_size % other != 0 {
            return Err(AdapterError::ShapeMismatch {
                expected: hidden_states.dims().to_vec(),
                actual: tensor.dims().to_vec(),
            });
        }
        **tensor = repeat_batch(&**tensor, batch_size / other)?;
    }
    Ok(())
}

/// Tile a tensor `n` times along the batch dimension.
///
/// # Errors
///
/// Returns an error if the tensor has no batch dimension.
pub fn repeat_batch(tensor: &Tensor, n: usize) -> Result<Tensor> {
    if tensor.rank() == 0 {
        return Err(AdapterError::ShapeMismatch {
            expected: vec![1],
            actual: Vec::new(),
        });
    }
    let mut repeats = vec![1usize; tensor.rank()];
    repeats[0] = n;
    Ok(tensor.repeat(repeats)?)
}
