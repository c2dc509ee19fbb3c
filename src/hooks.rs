//! Ordered pre- and post-processing steps owned by model components.
//!
//! Layers and the embedding stage keep an explicit list of steps that their
//! forward routine runs directly. Built-in steps are registered at most once,
//! so repeated adapter initialization never duplicates them.

use std::fmt;
use std::sync::Arc;

use candle_core::Tensor;

use crate::composition::adjust_tensors_for_parallel;
use crate::error::Result;

/// Handle identifying a registered step, usable to remove it later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookHandle(usize);

/// Custom step run before an encoder layer on `(hidden_states, attention_mask)`.
pub type LayerPreFn = Arc<dyn Fn(&mut Tensor, &mut Tensor) -> Result<()> + Send + Sync>;

/// Custom step run on the embedding output.
pub type EmbeddingFn = Arc<dyn Fn(&Tensor) -> Result<Tensor> + Send + Sync>;

/// Step run before an encoder layer executes.
#[derive(Clone)]
pub enum LayerPreStep {
    /// Tile the attention mask to the batch size of the hidden states.
    AlignForParallel,
    /// User-supplied step.
    Custom(LayerPreFn),
}

impl LayerPreStep {
    /// Apply the step to the layer inputs.
    ///
    /// # Errors
    ///
    /// Returns an error if the step fails.
    pub fn run(&self, hidden_states: &mut Tensor, attention_mask: &mut Tensor) -> Result<()> {
        match self {
            Self::AlignForParallel => {
                adjust_tensors_for_parallel(hidden_states, &mut [attention_mask])
            }
            Self::Custom(f) => f(hidden_states, attention_mask),
        }
    }
}

/// Step run on the output of the embedding stage.
#[derive(Clone)]
pub enum EmbeddingStep {
    /// Apply the model's invertible adapters for the active composition.
    InvertibleAdapters,
    /// User-supplied step.
    Custom(EmbeddingFn),
}

/// Whether two steps are the same built-in step.
pub trait BuiltinStep {
    /// Identity of the built-in step, `None` for custom steps.
    fn builtin_id(&self) -> Option<&'static str>;
}

impl BuiltinStep for LayerPreStep {
    fn builtin_id(&self) -> Option<&'static str> {
        match self {
            Self::AlignForParallel => Some("align_for_parallel"),
            Self::Custom(_) => None,
        }
    }
}

impl BuiltinStep for EmbeddingStep {
    fn builtin_id(&self) -> Option<&'static str> {
        match self {
            Self::InvertibleAdapters => Some("invertible_adapters"),
            Self::Custom(_) => None,
        }
    }
}

macro_rules! impl_step_debug {
    ($($ty:ty),*) => {
        $(
            impl fmt::Debug for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(self.builtin_id().unwrap_or("custom"))
                }
            }
        )*
    };
}

impl_step_debug!(LayerPreStep, EmbeddingStep);

/// Ordered list of steps.
#[derive(Debug, Clone)]
pub struct StepList<S> {
    steps: Vec<(HookHandle, S)>,
    next_id: usize,
}

impl<S> Default for StepList<S> {
    fn default() -> Self {
        Self {
            steps: Vec::new(),
            next_id: 0,
        }
    }
}

impl<S: BuiltinStep> StepList<S> {
    /// Append a step.
    ///
    /// A built-in step that is already present is not added again; the handle
    /// of the existing registration is returned instead.
    pub fn register(&mut self, step: S) -> HookHandle {
        if let Some(id) = step.builtin_id() {
            if let Some((handle, _)) = self
                .steps
                .iter()
                .find(|(_, s)| s.builtin_id() == Some(id))
            {
                return *handle;
            }
        }
        let handle = HookHandle(self.next_id);
        self.next_id += 1;
        self.steps.push((handle, step));
        handle
    }

    /// Remove a step by handle. Returns whether it was present.
    pub fn remove(&mut self, handle: HookHandle) -> bool {
        let before = self.steps.len();
        self.steps.retain(|(h, _)| *h != handle);
        self.steps.len() != before
    }

    /// Steps in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &S> {
        self.steps.iter().map(|(_, s)| s)
    }

    /// Number of registered steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether no steps are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
