//! # bert-adapters
//!
//! Adapter modules for BERT-style encoders on [candle](https://github.com/huggingface/candle).
//!
//! Supported adapter methods:
//! - **Bottleneck adapters** after the attention and feed-forward blocks
//! - **`LoRA`** on the attention projections and feed-forward dense layers
//! - **Prefix tuning** on self- and cross-attention
//! - **Invertible adapters** (NICE coupling) after the embeddings
//! - **Embedding tables** that replace the base vocabulary
//!
//! Adapters are composed with [`Composition`]: a single adapter, a stack
//! applied in sequence, or parallel branches over a replicated batch.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use bert_adapters::{BertConfig, BertModel, InitAdapters, LoraConfig, ModelAdapters};
//! use candle_core::{DType, Device, Tensor};
//! use candle_nn::{VarBuilder, VarMap};
//!
//! let varmap = VarMap::new();
//! let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
//! let mut model = BertModel::new(BertConfig::default(), vb)?;
//! model.init_adapters(&Default::default())?;
//!
//! model.add_adapter("sentiment", LoraConfig::default().into(), true)?;
//! let input_ids = Tensor::new(&[[101u32, 2023, 2003, 102]], &Device::Cpu)?;
//! let hidden = model.forward(&input_ids, None, None)?;
//! ```
//!
//! ## Architecture
//!
//! Each BERT component implements [`InitAdapters`]. The model's setup runs the
//! embedding, invertible-adapter and base-adapter setups in order, then adds
//! a parallel-alignment step to every layer. Adapter management (add, delete,
//! activate, train, save, load) is provided by [`ModelAdapters`].

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod adapters;
pub mod composition;
pub mod config;
pub mod context;
pub mod error;
pub mod hooks;
pub mod io;
pub mod location;
pub mod model;
pub mod models;
pub mod traits;

pub use adapters::bottleneck::{AdapterLayer, BottleneckAdapter, BottleneckConfig, NonLinearity};
pub use adapters::embeddings::EmbeddingAdapters;
pub use adapters::invertible::{InvertibleAdapterConfig, InvertibleAdapters, NiceCoupling};
pub use adapters::lora::{LoraConfig, LoraInitialization, LoraLayer, LoraLinear, Projection};
pub use adapters::prefix_tuning::{Prefix, PrefixTuningConfig, PrefixTuningShim};
pub use composition::{adjust_tensors_for_parallel, Composition};
pub use config::{AdapterMethod, AdaptersConfig};
pub use context::ForwardContext;
pub use error::{AdapterError, Result};
pub use hooks::{EmbeddingStep, HookHandle, LayerPreStep, StepList};
pub use io::{
    load_adapter_config, load_adapter_weights, save_adapter_config, save_adapter_weights,
    SavedAdapterConfig, ADAPTER_CONFIG_FILENAME, ADAPTER_WEIGHTS_FILENAME,
};
pub use location::{AttentionLocation, AttnMatrix, LocationKey, LoraLocation};
pub use model::{format_parameter_count, AdaptedLayer, AdapterSummary, ModelAdapters};
#[allow(deprecated)]
pub use models::bert::BertModelWithHeads;
pub use models::bert::{BertConfig, BertLayer, BertModel, ClassificationHead};
pub use traits::{Adapter, AdapterConfig, InitAdapters, Mergeable, SaveLoad, Trainable};
