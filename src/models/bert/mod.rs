//! BERT encoder with adapter support.
//!
//! The module tree mirrors the Hugging Face checkpoint layout
//! (`embeddings`, `encoder.layer.{i}.attention.self.query`, ...), so
//! pretrained weights load through a [`VarBuilder`] unchanged.
//!
//! Every component carries the state its adapter setup needs: LoRA-capable
//! [`Projection`] slots, bottleneck [`AdapterLayer`] containers, an optional
//! prefix-tuning shim and an explicit list of pre-layer steps. Setup itself
//! lives in [`setup`].

mod heads;
pub mod setup;

#[allow(deprecated)]
pub use heads::{BertModelWithHeads, ClassificationHead};

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{embedding, layer_norm, linear, Embedding, LayerNorm, Linear, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::adapters::bottleneck::{AdapterLayer, NonLinearity};
use crate::adapters::embeddings::EmbeddingAdapters;
use crate::adapters::invertible::InvertibleAdapters;
use crate::adapters::lora::Projection;
use crate::adapters::prefix_tuning::PrefixTuningShim;
use crate::composition::{adjust_tensors_for_parallel, Composition};
use crate::config::AdaptersConfig;
use crate::context::ForwardContext;
use crate::error::{AdapterError, Result};
use crate::hooks::{EmbeddingStep, HookHandle, LayerPreStep, StepList};
use crate::location::{AttentionLocation, LocationKey};

/// BERT model configuration, using the Hugging Face `config.json` field names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BertConfig {
    /// Vocabulary size.
    pub vocab_size: usize,
    /// Hidden size.
    pub hidden_size: usize,
    /// Number of encoder layers.
    pub num_hidden_layers: usize,
    /// Attention heads per layer.
    pub num_attention_heads: usize,
    /// Feed-forward inner size.
    pub intermediate_size: usize,
    /// Feed-forward activation.
    #[serde(default = "default_hidden_act")]
    pub hidden_act: NonLinearity,
    /// Maximum sequence length.
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    /// Number of token types (segments).
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    /// Layer norm epsilon.
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    /// Whether every layer has a cross-attention block.
    #[serde(default)]
    pub add_cross_attention: bool,
    /// Adapters registered on this model.
    #[serde(default)]
    pub adapters: AdaptersConfig,
}

fn default_hidden_act() -> NonLinearity {
    NonLinearity::Gelu
}

fn default_max_position_embeddings() -> usize {
    512
}

fn default_type_vocab_size() -> usize {
    2
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

impl Default for BertConfig {
    /// `bert-base-uncased`.
    fn default() -> Self {
        Self {
            vocab_size: 30522,
            hidden_size: 768,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            intermediate_size: 3072,
            hidden_act: default_hidden_act(),
            max_position_embeddings: default_max_position_embeddings(),
            type_vocab_size: default_type_vocab_size(),
            layer_norm_eps: default_layer_norm_eps(),
            add_cross_attention: false,
            adapters: AdaptersConfig::default(),
        }
    }
}

impl BertConfig {
    /// Check that the dimensions are consistent.
    ///
    /// # Errors
    ///
    /// Returns an error if the hidden size is not divisible by the head count.
    pub fn validate(&self) -> Result<()> {
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(AdapterError::InvalidConfig(format!(
                "hidden_size {} is not a multiple of num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            )));
        }
        Ok(())
    }

    fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}

/// Word, position and token type embeddings followed by layer norm.
pub struct BertEmbeddings {
    /// Base word embeddings.
    pub word_embeddings: Embedding,
    /// Absolute position embeddings.
    pub position_embeddings: Embedding,
    /// Segment embeddings.
    pub token_type_embeddings: Embedding,
    layer_norm: LayerNorm,
}

impl BertEmbeddings {
    fn new(cfg: &BertConfig, vb: VarBuilder) -> Result<Self> {
        let hidden_size = cfg.hidden_size;
        Ok(Self {
            word_embeddings: embedding(cfg.vocab_size, hidden_size, vb.pp("word_embeddings"))?,
            position_embeddings: embedding(
                cfg.max_position_embeddings,
                hidden_size,
                vb.pp("position_embeddings"),
            )?,
            token_type_embeddings: embedding(
                cfg.type_vocab_size,
                hidden_size,
                vb.pp("token_type_embeddings"),
            )?,
            layer_norm: layer_norm(hidden_size, cfg.layer_norm_eps, vb.pp("LayerNorm"))?,
        })
    }

    /// Embed `input_ids`, taking word embeddings from `word_embeds` when given.
    ///
    /// # Errors
    ///
    /// Returns an error if a lookup fails.
    pub fn forward(&self, input_ids: &Tensor, word_embeds: Option<Tensor>) -> Result<Tensor> {
        let (batch_size, seq_len) = input_ids.dims2()?;

        let word_emb = match word_embeds {
            Some(w) => w,
            None => self.word_embeddings.forward(input_ids)?,
        };

        #[allow(clippy::cast_possible_truncation)]
        let position_ids = Tensor::arange(0u32, seq_len as u32, input_ids.device())?
            .unsqueeze(0)?
            .expand((batch_size, seq_len))?;
        let pos_emb = self.position_embeddings.forward(&position_ids)?;

        let token_type_ids = Tensor::zeros((batch_size, seq_len), DType::U32, input_ids.device())?;
        let type_emb = self.token_type_embeddings.forward(&token_type_ids)?;

        let embeddings = (word_emb + pos_emb)?.add(&type_emb)?;
        Ok(self.layer_norm.forward(&embeddings)?)
    }
}

/// Multi-head attention with LoRA-capable projections and prefix tuning.
pub struct BertSelfAttention {
    /// Query projection.
    pub query: Projection,
    /// Key projection.
    pub key: Projection,
    /// Value projection.
    pub value: Projection,
    /// Where this block sits; set by layer setup.
    pub location: Option<AttentionLocation>,
    /// Prefix-tuning shim; created by adapter setup.
    pub prefix_tuning: Option<PrefixTuningShim>,
    num_heads: usize,
    head_dim: usize,
    dtype: DType,
    device: Device,
}

impl BertSelfAttention {
    fn new(cfg: &BertConfig, vb: VarBuilder) -> Result<Self> {
        let hidden_size = cfg.hidden_size;
        Ok(Self {
            query: linear(hidden_size, hidden_size, vb.pp("query"))?.into(),
            key: linear(hidden_size, hidden_size, vb.pp("key"))?.into(),
            value: linear(hidden_size, hidden_size, vb.pp("value"))?.into(),
            location: None,
            prefix_tuning: None,
            num_heads: cfg.num_attention_heads,
            head_dim: cfg.head_dim(),
            dtype: vb.dtype(),
            device: vb.device().clone(),
        })
    }

    /// Number of attention heads.
    #[must_use]
    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Size of each head.
    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// `[batch, seq, hidden]` -> `[batch, heads, seq, head_dim]`
    fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len, _) = x.dims3()?;
        Ok(x.reshape((batch_size, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    /// Attend from `hidden_states` to itself, or to `encoder_hidden_states`
    /// for cross-attention.
    ///
    /// `attention_mask` is additive, `[batch, 1, 1, kv_seq]`.
    ///
    /// # Errors
    ///
    /// Returns an error if shapes do not line up or an adapter rejects the
    /// active composition.
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        attention_mask: &Tensor,
        encoder_hidden_states: Option<&Tensor>,
        ctx: &ForwardContext,
    ) -> Result<Tensor> {
        let (batch_size, seq_len, _) = hidden_states.dims3()?;
        let kv_input = encoder_hidden_states.unwrap_or(hidden_states);

        let q = self.split_heads(&self.query.forward(hidden_states, ctx)?)?;
        let k = self.split_heads(&self.key.forward(kv_input, ctx)?)?;
        let v = self.split_heads(&self.value.forward(kv_input, ctx)?)?;

        let (k, v, mask) = match &self.prefix_tuning {
            Some(shim) => shim.forward(&k, &v, attention_mask, ctx)?,
            None => (k, v, attention_mask.clone()),
        };

        #[allow(clippy::cast_precision_loss)]
        let scale = (self.head_dim as f64).powf(-0.5);
        let scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        let scores = scores.broadcast_add(&mask)?;
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;
        let out = probs.matmul(&v.contiguous()?)?;

        Ok(out
            .transpose(1, 2)?
            .reshape((batch_size, seq_len, self.num_heads * self.head_dim))?)
    }
}

/// Attention output projection, `mh_adapter` bottlenecks and residual norm.
pub struct BertSelfOutput {
    /// Output projection.
    pub dense: Linear,
    /// Bottleneck container at `mh_adapter`.
    pub adapters: AdapterLayer,
    layer_norm: LayerNorm,
}

impl BertSelfOutput {
    fn new(cfg: &BertConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            dense: linear(cfg.hidden_size, cfg.hidden_size, vb.pp("dense"))?,
            adapters: AdapterLayer::new(
                LocationKey::MhAdapter,
                cfg.hidden_size,
                vb.dtype(),
                vb.device(),
            ),
            layer_norm: layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("LayerNorm"))?,
        })
    }

    /// # Errors
    ///
    /// Returns an error if the projection or adapters fail.
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        input_tensor: &Tensor,
        ctx: &mut ForwardContext,
    ) -> Result<Tensor> {
        let hidden_states = self.dense.forward(hidden_states)?;
        self.adapters
            .forward(&hidden_states, input_tensor, &self.layer_norm, ctx)
    }
}

/// Attention block: attention plus its output sublayer.
pub struct BertAttention {
    /// Multi-head attention (`attention.self` in checkpoints).
    pub self_attn: BertSelfAttention,
    /// Output sublayer.
    pub output: BertSelfOutput,
}

impl BertAttention {
    fn new(cfg: &BertConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attn: BertSelfAttention::new(cfg, vb.pp("self"))?,
            output: BertSelfOutput::new(cfg, vb.pp("output"))?,
        })
    }

    /// # Errors
    ///
    /// Returns an error if attention or the output sublayer fails.
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        attention_mask: &Tensor,
        encoder_hidden_states: Option<&Tensor>,
        ctx: &mut ForwardContext,
    ) -> Result<Tensor> {
        let attn_output =
            self.self_attn
                .forward(hidden_states, attention_mask, encoder_hidden_states, ctx)?;
        self.output.forward(&attn_output, hidden_states, ctx)
    }
}

/// First half of the feed-forward block.
pub struct BertIntermediate {
    /// Up projection.
    pub dense: Projection,
    act: NonLinearity,
}

impl BertIntermediate {
    fn new(cfg: &BertConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            dense: linear(cfg.hidden_size, cfg.intermediate_size, vb.pp("dense"))?.into(),
            act: cfg.hidden_act,
        })
    }

    /// # Errors
    ///
    /// Returns an error if the projection fails.
    pub fn forward(&self, hidden_states: &Tensor, ctx: &ForwardContext) -> Result<Tensor> {
        self.act.apply(&self.dense.forward(hidden_states, ctx)?)
    }
}

/// Second half of the feed-forward block with `output_adapter` bottlenecks.
pub struct BertOutput {
    /// Down projection.
    pub dense: Projection,
    /// Bottleneck container at `output_adapter`.
    pub adapters: AdapterLayer,
    layer_norm: LayerNorm,
}

impl BertOutput {
    fn new(cfg: &BertConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            dense: linear(cfg.intermediate_size, cfg.hidden_size, vb.pp("dense"))?.into(),
            adapters: AdapterLayer::new(
                LocationKey::OutputAdapter,
                cfg.hidden_size,
                vb.dtype(),
                vb.device(),
            ),
            layer_norm: layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("LayerNorm"))?,
        })
    }

    /// # Errors
    ///
    /// Returns an error if the projection or adapters fail.
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        input_tensor: &Tensor,
        ctx: &mut ForwardContext,
    ) -> Result<Tensor> {
        let hidden_states = self.dense.forward(hidden_states, ctx)?;
        self.adapters
            .forward(&hidden_states, input_tensor, &self.layer_norm, ctx)
    }
}

/// Hidden states and additive mask of an encoder attended to by cross-attention.
#[derive(Debug, Clone, Copy)]
pub struct EncoderStates<'a> {
    /// `[batch, enc_seq, hidden]`
    pub hidden_states: &'a Tensor,
    /// `[batch, 1, 1, enc_seq]`
    pub attention_mask: &'a Tensor,
}

/// One encoder layer.
pub struct BertLayer {
    /// Self-attention block.
    pub attention: BertAttention,
    /// Cross-attention block, present when the layer is built for it.
    pub crossattention: Option<BertAttention>,
    /// Whether the layer is configured for cross-attention.
    pub add_cross_attention: bool,
    /// Feed-forward first half.
    pub intermediate: BertIntermediate,
    /// Feed-forward second half.
    pub output: BertOutput,
    pre_steps: StepList<LayerPreStep>,
}

impl BertLayer {
    fn new(cfg: &BertConfig, vb: VarBuilder) -> Result<Self> {
        let crossattention = if cfg.add_cross_attention {
            Some(BertAttention::new(cfg, vb.pp("crossattention"))?)
        } else {
            None
        };
        Ok(Self {
            attention: BertAttention::new(cfg, vb.pp("attention"))?,
            crossattention,
            add_cross_attention: cfg.add_cross_attention,
            intermediate: BertIntermediate::new(cfg, vb.pp("intermediate"))?,
            output: BertOutput::new(cfg, vb.pp("output"))?,
            pre_steps: StepList::default(),
        })
    }

    /// Steps run on `(hidden_states, attention_mask)` before the layer.
    #[must_use]
    pub fn pre_steps(&self) -> &StepList<LayerPreStep> {
        &self.pre_steps
    }

    /// Register a step to run before the layer.
    pub fn register_pre_step(&mut self, step: LayerPreStep) -> HookHandle {
        self.pre_steps.register(step)
    }

    /// Remove a previously registered pre-step.
    pub fn remove_pre_step(&mut self, handle: HookHandle) -> bool {
        self.pre_steps.remove(handle)
    }

    /// # Errors
    ///
    /// Returns an error if a pre-step or sublayer fails.
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        attention_mask: &Tensor,
        encoder: Option<EncoderStates<'_>>,
        ctx: &mut ForwardContext,
    ) -> Result<Tensor> {
        let mut hidden_states = hidden_states.clone();
        let mut attention_mask = attention_mask.clone();
        for step in self.pre_steps.iter() {
            step.run(&mut hidden_states, &mut attention_mask)?;
        }

        let mut attn_output = self
            .attention
            .forward(&hidden_states, &attention_mask, None, ctx)?;

        if let (Some(cross), Some(enc)) = (&self.crossattention, encoder) {
            let mut enc_hidden = enc.hidden_states.clone();
            let mut enc_mask = enc.attention_mask.clone();
            adjust_tensors_for_parallel(&attn_output, &mut [&mut enc_hidden, &mut enc_mask])?;
            attn_output = cross.forward(&attn_output, &enc_mask, Some(&enc_hidden), ctx)?;
        }

        let intermediate_output = self.intermediate.forward(&attn_output, ctx)?;
        self.output.forward(&intermediate_output, &attn_output, ctx)
    }
}

/// Stack of encoder layers.
pub struct BertEncoder {
    /// Layers in execution order.
    pub layers: Vec<BertLayer>,
}

impl BertEncoder {
    fn new(cfg: &BertConfig, vb: VarBuilder) -> Result<Self> {
        let mut layers = Vec::with_capacity(cfg.num_hidden_layers);
        for i in 0..cfg.num_hidden_layers {
            layers.push(BertLayer::new(cfg, vb.pp(format!("layer.{i}")))?);
        }
        Ok(Self { layers })
    }

    fn forward(
        &self,
        hidden_states: Tensor,
        attention_mask: &Tensor,
        encoder: Option<EncoderStates<'_>>,
        ctx: &mut ForwardContext,
    ) -> Result<Tensor> {
        let mut hidden_states = hidden_states;
        for layer in &self.layers {
            hidden_states = layer.forward(&hidden_states, attention_mask, encoder, ctx)?;
        }
        Ok(hidden_states)
    }
}

/// `[batch, seq]` 1/0 mask -> additive `[batch, 1, 1, seq]` mask.
fn extended_attention_mask(mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let (batch_size, seq_len) = mask.dims2()?;
    Ok(mask
        .to_dtype(dtype)?
        .affine(10000.0, -10000.0)?
        .reshape((batch_size, 1, 1, seq_len))?)
}

/// BERT encoder with adapter support.
///
/// Construct with [`BertModel::new`], then call
/// [`InitAdapters::init_adapters`](crate::traits::InitAdapters::init_adapters)
/// once to wire in adapter support. Adapters are managed through
/// [`ModelAdapters`](crate::model::ModelAdapters).
pub struct BertModel {
    /// Embedding stage.
    pub embeddings: BertEmbeddings,
    /// Encoder layers.
    pub encoder: BertEncoder,
    config: BertConfig,
    embedding_adapters: Option<EmbeddingAdapters>,
    invertible_adapters: Option<InvertibleAdapters>,
    embedding_steps: StepList<EmbeddingStep>,
    active_setup: Option<Composition>,
    dtype: DType,
    device: Device,
}

impl BertModel {
    /// Build the base model from `vb`, without adapter support.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or a weight is missing.
    pub fn new(config: BertConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            embeddings: BertEmbeddings::new(&config, vb.pp("embeddings"))?,
            encoder: BertEncoder::new(&config, vb.pp("encoder"))?,
            embedding_adapters: None,
            invertible_adapters: None,
            embedding_steps: StepList::default(),
            active_setup: None,
            dtype: vb.dtype(),
            device: vb.device().clone(),
            config,
        })
    }

    /// Model configuration.
    #[must_use]
    pub fn config(&self) -> &BertConfig {
        &self.config
    }

    /// `(index, layer)` pairs in encoder order. Each call walks the encoder afresh.
    pub fn iter_layers(&self) -> impl Iterator<Item = (usize, &BertLayer)> {
        self.encoder.layers.iter().enumerate()
    }

    /// `(index, layer)` pairs in encoder order, mutably.
    pub fn iter_layers_mut(&mut self) -> impl Iterator<Item = (usize, &mut BertLayer)> {
        self.encoder.layers.iter_mut().enumerate()
    }

    /// Append a step run on the embedding output.
    pub fn hook_after_embeddings(&mut self, step: EmbeddingStep) -> HookHandle {
        self.embedding_steps.register(step)
    }

    /// Remove a step added with [`BertModel::hook_after_embeddings`].
    pub fn remove_embedding_hook(&mut self, handle: HookHandle) -> bool {
        self.embedding_steps.remove(handle)
    }

    /// Steps run on the embedding output.
    #[must_use]
    pub fn embedding_steps(&self) -> &StepList<EmbeddingStep> {
        &self.embedding_steps
    }

    /// Invertible adapters, once adapter setup has run.
    #[must_use]
    pub fn invertible_adapters(&self) -> Option<&InvertibleAdapters> {
        self.invertible_adapters.as_ref()
    }

    /// Extra embedding tables, once adapter setup has run.
    #[must_use]
    pub fn embedding_adapters(&self) -> Option<&EmbeddingAdapters> {
        self.embedding_adapters.as_ref()
    }

    fn embedding_adapters_mut(&mut self) -> Result<&mut EmbeddingAdapters> {
        self.embedding_adapters.as_mut().ok_or_else(|| {
            AdapterError::MissingModule("embedding adapters are not initialized".into())
        })
    }

    /// Add a randomly initialized word-embedding table.
    ///
    /// # Errors
    ///
    /// Returns an error if adapter setup has not run or the name is taken.
    pub fn add_embeddings(&mut self, name: &str, vocab_size: usize) -> Result<()> {
        self.embedding_adapters_mut()?.add_embeddings(name, vocab_size)
    }

    /// Use the named table for word embeddings, or the base table with `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if adapter setup has not run or the table is unknown.
    pub fn set_active_embeddings(&mut self, name: Option<&str>) -> Result<()> {
        self.embedding_adapters_mut()?.set_active(name)
    }

    /// Remove a word-embedding table.
    ///
    /// # Errors
    ///
    /// Returns an error if adapter setup has not run, the table is unknown
    /// or active.
    pub fn delete_embeddings(&mut self, name: &str) -> Result<()> {
        self.embedding_adapters_mut()?.delete_embeddings(name)
    }

    fn run_embedding_step(
        &self,
        step: &EmbeddingStep,
        hidden_states: &Tensor,
        ctx: &ForwardContext,
    ) -> Result<Tensor> {
        match step {
            EmbeddingStep::InvertibleAdapters => match &self.invertible_adapters {
                Some(inv) => inv.forward(hidden_states, ctx, false),
                None => Ok(hidden_states.clone()),
            },
            EmbeddingStep::Custom(f) => f(hidden_states),
        }
    }

    /// Encode `input_ids` (`[batch, seq]`).
    ///
    /// `attention_mask` is a `[batch, seq]` 1/0 mask; all tokens attend when
    /// omitted. `encoder_hidden_states` feeds the cross-attention blocks.
    ///
    /// With a parallel composition active the returned batch holds one slice
    /// per parallel branch, in branch order.
    ///
    /// # Errors
    ///
    /// Returns an error if shapes do not line up or an adapter rejects the
    /// active composition.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        encoder_hidden_states: Option<&Tensor>,
    ) -> Result<Tensor> {
        let mut ctx = ForwardContext::new(self.active_setup.clone());

        let word_embeds = match &self.embedding_adapters {
            Some(emb) => emb.forward(input_ids)?,
            None => None,
        };
        let mut hidden_states = self.embeddings.forward(input_ids, word_embeds)?;
        for step in self.embedding_steps.iter() {
            hidden_states = self.run_embedding_step(step, &hidden_states, &ctx)?;
        }

        let (batch_size, seq_len) = input_ids.dims2()?;
        let mask = match attention_mask {
            Some(mask) => extended_attention_mask(mask, self.dtype)?,
            None => Tensor::zeros((batch_size, 1, 1, seq_len), self.dtype, &self.device)?,
        };

        let encoder_mask = match encoder_hidden_states {
            Some(enc) => {
                let (enc_batch, enc_len, _) = enc.dims3()?;
                Some(Tensor::zeros((enc_batch, 1, 1, enc_len), self.dtype, &self.device)?)
            }
            None => None,
        };
        let encoder = encoder_hidden_states
            .zip(encoder_mask.as_ref())
            .map(|(hidden_states, attention_mask)| EncoderStates {
                hidden_states,
                attention_mask,
            });

        self.encoder.forward(hidden_states, &mask, encoder, &mut ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::bottleneck::BottleneckConfig;
    use crate::adapters::invertible::InvertibleAdapterConfig;
    use crate::adapters::lora::LoraConfig;
    use crate::adapters::prefix_tuning::PrefixTuningConfig;
    use crate::model::ModelAdapters;
    use crate::traits::InitAdapters;
    use candle_nn::VarMap;

    fn tiny_config() -> BertConfig {
        BertConfig {
            vocab_size: 50,
            hidden_size: 16,
            num_hidden_layers: 2,
            num_attention_heads: 2,
            intermediate_size: 32,
            max_position_embeddings: 16,
            ..Default::default()
        }
    }

    fn tiny_model(config: BertConfig) -> Result<BertModel> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mut model = BertModel::new(config, vb)?;
        let adapters = model.config().adapters.clone();
        model.init_adapters(&adapters)?;
        Ok(model)
    }

    fn input_ids() -> Result<Tensor> {
        Ok(Tensor::new(&[[1u32, 5, 7, 2], [1, 9, 3, 2]], &Device::Cpu)?)
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        Ok((a - b)?.abs()?.max_all()?.to_scalar::<f32>()?)
    }

    #[test]
    fn test_config_from_hf_json() -> anyhow::Result<()> {
        let json = r#"{
            "vocab_size": 30522,
            "hidden_size": 768,
            "num_hidden_layers": 12,
            "num_attention_heads": 12,
            "intermediate_size": 3072,
            "hidden_act": "gelu",
            "max_position_embeddings": 512,
            "type_vocab_size": 2,
            "layer_norm_eps": 1e-12
        }"#;
        let config: BertConfig = serde_json::from_str(json)?;
        assert_eq!(config, BertConfig::default());
        assert!(config.adapters.is_empty());
        Ok(())
    }

    #[test]
    fn test_config_rejects_uneven_heads() {
        let config = BertConfig {
            hidden_size: 10,
            num_attention_heads: 3,
            ..tiny_config()
        };
        assert!(matches!(config.validate(), Err(AdapterError::InvalidConfig(_))));
    }

    #[test]
    fn test_forward_shape() -> Result<()> {
        let model = tiny_model(tiny_config())?;
        let out = model.forward(&input_ids()?, None, None)?;
        assert_eq!(out.dims(), &[2, 4, 16]);
        Ok(())
    }

    #[test]
    fn test_fresh_adapters_are_identity() -> Result<()> {
        let mut model = tiny_model(tiny_config())?;
        let ids = input_ids()?;
        let base = model.forward(&ids, None, None)?;

        // LoRA B and the bottleneck up projection start at zero
        model.add_adapter("lora", LoraConfig::default().into(), false)?;
        model.add_adapter("bn", BottleneckConfig::default().into(), false)?;
        model.set_active_adapters(Composition::stack(["lora", "bn"]))?;
        let adapted = model.forward(&ids, None, None)?;
        assert!(max_abs_diff(&base, &adapted)? < 1e-5);
        Ok(())
    }

    #[test]
    fn test_masked_positions_do_not_leak() -> Result<()> {
        let model = tiny_model(tiny_config())?;
        let ids = Tensor::new(&[[1u32, 5, 7, 2]], &Device::Cpu)?;
        let other = Tensor::new(&[[1u32, 5, 7, 9]], &Device::Cpu)?;
        let mask = Tensor::new(&[[1u32, 1, 1, 0]], &Device::Cpu)?;

        let a = model.forward(&ids, Some(&mask), None)?.narrow(1, 0, 3)?;
        let b = model.forward(&other, Some(&mask), None)?.narrow(1, 0, 3)?;
        assert!(max_abs_diff(&a, &b)? < 1e-5);
        Ok(())
    }

    /// Give every bottleneck of `name` a random up projection.
    fn randomize_up_projections(model: &mut BertModel, name: &str) -> Result<()> {
        let mut state = model.adapter_state_dict(name)?;
        for (key, tensor) in &mut state {
            if key.ends_with("adapter_up.weight") {
                *tensor = Tensor::randn(0f32, 0.5, tensor.dims(), &Device::Cpu)?;
            }
        }
        model.load_adapter_state_dict(name, &state)
    }

    /// Forward `parallel(a, b)` and check each half of the replicated batch
    /// against a forward with only that branch active.
    fn assert_parallel_matches_single(
        model: &mut BertModel,
        encoder_states: Option<&Tensor>,
    ) -> Result<()> {
        let ids = input_ids()?;
        let mask = Tensor::new(&[[1u32, 1, 1, 0], [1, 1, 1, 1]], &Device::Cpu)?;

        model.set_active_adapters(Composition::parallel(["a", "b"]))?;
        let out = model.forward(&ids, Some(&mask), encoder_states)?;
        assert_eq!(out.dims(), &[4, 4, 16]);

        model.set_active_adapters("a")?;
        let only_a = model.forward(&ids, Some(&mask), encoder_states)?;
        model.set_active_adapters("b")?;
        let only_b = model.forward(&ids, Some(&mask), encoder_states)?;

        assert!(max_abs_diff(&out.narrow(0, 0, 2)?, &only_a)? < 1e-5);
        assert!(max_abs_diff(&out.narrow(0, 2, 2)?, &only_b)? < 1e-5);
        assert!(max_abs_diff(&only_a, &only_b)? > 1e-3);
        Ok(())
    }

    #[test]
    fn test_parallel_replicates_batch() -> Result<()> {
        let mut model = tiny_model(tiny_config())?;
        for name in ["a", "b"] {
            model.add_adapter(name, BottleneckConfig::default().into(), false)?;
            randomize_up_projections(&mut model, name)?;
        }
        assert_parallel_matches_single(&mut model, None)
    }

    #[test]
    fn test_parallel_with_cross_attention() -> Result<()> {
        let config = BertConfig {
            add_cross_attention: true,
            ..tiny_config()
        };
        let mut model = tiny_model(config)?;
        for name in ["a", "b"] {
            model.add_adapter(name, BottleneckConfig::default().into(), false)?;
            randomize_up_projections(&mut model, name)?;
        }
        let encoder_states = Tensor::randn(0f32, 1f32, (2, 6, 16), &Device::Cpu)?;
        assert_parallel_matches_single(&mut model, Some(&encoder_states))
    }

    #[test]
    fn test_lora_rejects_parallel() -> Result<()> {
        let mut model = tiny_model(tiny_config())?;
        model.add_adapter("a", LoraConfig::default().into(), false)?;
        model.add_adapter("b", LoraConfig::default().into(), false)?;
        model.set_active_adapters(Composition::parallel(["a", "b"]))?;
        let result = model.forward(&input_ids()?, None, None);
        assert!(matches!(result, Err(AdapterError::UnsupportedComposition { .. })));
        Ok(())
    }

    #[test]
    fn test_prefix_tuning_changes_output() -> Result<()> {
        let mut model = tiny_model(tiny_config())?;
        let ids = input_ids()?;
        let base = model.forward(&ids, None, None)?;

        let prefix = PrefixTuningConfig {
            prefix_length: 3,
            bottleneck_size: 8,
            ..Default::default()
        };
        model.add_adapter("prefix", prefix.into(), true)?;
        let adapted = model.forward(&ids, None, None)?;
        assert_eq!(adapted.dims(), base.dims());
        assert!(max_abs_diff(&base, &adapted)? > 0.0);
        Ok(())
    }

    #[test]
    fn test_invertible_adapter_runs_after_embeddings() -> Result<()> {
        let mut model = tiny_model(tiny_config())?;
        let ids = input_ids()?;
        let base = model.forward(&ids, None, None)?;

        let config = BottleneckConfig {
            inv_adapter: Some(InvertibleAdapterConfig::default()),
            ..BottleneckConfig::pfeiffer()
        };
        model.add_adapter("lang", config.into(), true)?;
        assert!(model
            .invertible_adapters()
            .is_some_and(|inv| inv.has_adapter("lang")));

        let adapted = model.forward(&ids, None, None)?;
        assert!(max_abs_diff(&base, &adapted)? > 0.0);
        Ok(())
    }

    #[test]
    fn test_embedding_tables() -> Result<()> {
        let mut model = tiny_model(tiny_config())?;
        let ids = input_ids()?;
        let base = model.forward(&ids, None, None)?;

        model.add_embeddings("domain", 50)?;
        model.set_active_embeddings(Some("domain"))?;
        let swapped = model.forward(&ids, None, None)?;
        assert!(max_abs_diff(&base, &swapped)? > 0.0);

        assert!(model.delete_embeddings("domain").is_err());
        model.set_active_embeddings(None)?;
        model.delete_embeddings("domain")?;
        let restored = model.forward(&ids, None, None)?;
        assert!(max_abs_diff(&base, &restored)? < 1e-6);
        Ok(())
    }

    #[test]
    fn test_embeddings_need_setup() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let mut model = BertModel::new(tiny_config(), vb)?;
        assert!(matches!(
            model.add_embeddings("domain", 10),
            Err(AdapterError::MissingModule(_))
        ));
        Ok(())
    }

    #[test]
    fn test_cross_attention_forward() -> Result<()> {
        let config = BertConfig {
            add_cross_attention: true,
            ..tiny_config()
        };
        let model = tiny_model(config)?;
        let encoder_states = Tensor::randn(0f32, 1f32, (2, 6, 16), &Device::Cpu)?;
        let out = model.forward(&input_ids()?, None, Some(&encoder_states))?;
        assert_eq!(out.dims(), &[2, 4, 16]);
        Ok(())
    }

    #[test]
    fn test_custom_embedding_hook() -> Result<()> {
        let mut model = tiny_model(tiny_config())?;
        let ids = input_ids()?;
        let base = model.forward(&ids, None, None)?;

        let handle = model.hook_after_embeddings(EmbeddingStep::Custom(std::sync::Arc::new(
            |h: &Tensor| -> Result<Tensor> { Ok((h * 2.0)?) },
        )));
        let hooked = model.forward(&ids, None, None)?;
        assert!(max_abs_diff(&base, &hooked)? > 0.0);

        assert!(model.remove_embedding_hook(handle));
        let restored = model.forward(&ids, None, None)?;
        assert!(max_abs_diff(&base, &restored)? < 1e-6);
        Ok(())
    }
}
