//! Decoder-only transformer forward pass (Qwen2, Qwen3 and Llama layouts)
//!
//! Runs layer by layer so the residual stream can be read or overwritten at
//! any layer. Besides plain KV-cached generation this supports:
//! - a steering vector added as bias of one layer's MLP down-projection
//! - residual patching: replacing one layer's output at the last position
//! - projecting an arbitrary hidden vector through final norm + LM head

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::{embedding, linear_b, linear_no_bias, Embedding, Linear, RmsNorm, VarBuilder};
use hf_hub::api::sync::ApiRepo;
use rand::distributions::{Distribution, WeightedIndex};
use tracing::{debug, info};

use crate::kv_cache::KVCache;
use crate::masks::{create_causal_mask, create_generation_mask};

/// Subset of HuggingFace `config.json` needed to build the decoder
#[derive(Debug, Clone, serde::Deserialize)]
pub struct DecoderConfig {
    #[serde(default)]
    pub model_type: Option<String>,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    pub num_hidden_layers: usize,
    pub vocab_size: usize,
    #[serde(default)]
    pub head_dim: Option<usize>,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub attention_bias: Option<bool>,
}

fn default_rope_theta() -> f64 {
    10_000.0
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_max_position_embeddings() -> usize {
    32768
}

impl DecoderConfig {
    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads)
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    /// Q/K/V projections carry a bias (Qwen2 default)
    pub fn qkv_bias(&self) -> bool {
        self.attention_bias
            .unwrap_or(self.model_type.as_deref() == Some("qwen2"))
    }

    /// Per-head RMSNorm on queries and keys (Qwen3)
    pub fn qk_norm(&self) -> bool {
        self.model_type.as_deref() == Some("qwen3")
    }
}

struct RotaryEmbedding {
    sin: Tensor,
    cos: Tensor,
}

impl RotaryEmbedding {
    fn new(
        head_dim: usize,
        max_seq_len: usize,
        rope_theta: f64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| 1.0f32 / (rope_theta.powf(i as f64 / head_dim as f64) as f32))
            .collect();
        let inv_freq_len = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, inv_freq_len), device)?;
        // Positions in f32; bf16 cannot represent large indices exactly
        let t = Tensor::arange(0u32, max_seq_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_seq_len, 1))?;
        let freqs = t.matmul(&inv_freq)?;
        Ok(Self {
            sin: freqs.sin()?.to_dtype(dtype)?,
            cos: freqs.cos()?.to_dtype(dtype)?,
        })
    }

    fn apply(&self, q: &Tensor, k: &Tensor, start_pos: usize) -> Result<(Tensor, Tensor)> {
        let (_b, _h, seq_len, _d) = q.dims4()?;
        let cos = self.cos.narrow(0, start_pos, seq_len)?;
        let sin = self.sin.narrow(0, start_pos, seq_len)?;
        let q_embed = candle_nn::rotary_emb::rope(&q.contiguous()?, &cos, &sin)?;
        let k_embed = candle_nn::rotary_emb::rope(&k.contiguous()?, &cos, &sin)?;
        Ok((q_embed, k_embed))
    }
}

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    q_norm: Option<RmsNorm>,
    k_norm: Option<RmsNorm>,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &DecoderConfig) -> Result<Self> {
        let head_dim = config.head_dim();
        let num_heads = config.num_attention_heads;
        let num_kv_heads = config.num_kv_heads();
        let bias = config.qkv_bias();

        let q_proj = linear_b(config.hidden_size, num_heads * head_dim, bias, vb.pp("q_proj"))?;
        let k_proj = linear_b(
            config.hidden_size,
            num_kv_heads * head_dim,
            bias,
            vb.pp("k_proj"),
        )?;
        let v_proj = linear_b(
            config.hidden_size,
            num_kv_heads * head_dim,
            bias,
            vb.pp("v_proj"),
        )?;
        let o_proj = linear_no_bias(num_heads * head_dim, config.hidden_size, vb.pp("o_proj"))?;

        let (q_norm, k_norm) = if config.qk_norm() {
            (
                Some(candle_nn::rms_norm(head_dim, config.rms_norm_eps, vb.pp("q_norm"))?),
                Some(candle_nn::rms_norm(head_dim, config.rms_norm_eps, vb.pp("k_norm"))?),
            )
        } else {
            (None, None)
        };

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            q_norm,
            k_norm,
            num_heads,
            num_kv_heads,
            head_dim,
        })
    }

    /// Attend the new positions in `x` over cached + new keys; appends the
    /// new keys/values to the cache slots.
    fn forward(
        &self,
        x: &Tensor,
        rotary: &RotaryEmbedding,
        start_pos: usize,
        cache_k: &mut Option<Tensor>,
        cache_v: &mut Option<Tensor>,
    ) -> Result<Tensor> {
        let (b, seq_len, _) = x.dims3()?;

        let q = self
            .q_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_heads, self.head_dim))?;
        let k = self
            .k_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?;
        let v = self
            .v_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        let q = match &self.q_norm {
            Some(norm) => norm.forward(&q)?,
            None => q,
        };
        let k = match &self.k_norm {
            Some(norm) => norm.forward(&k)?,
            None => k,
        };
        let (q, k) = rotary.apply(&q.transpose(1, 2)?, &k.transpose(1, 2)?, start_pos)?;

        let (k, v) = match (cache_k.as_ref(), cache_v.as_ref()) {
            (Some(prev_k), Some(prev_v)) => (
                Tensor::cat(&[prev_k, &k], 2)?,
                Tensor::cat(&[prev_v, &v], 2)?,
            ),
            _ => (k, v.contiguous()?),
        };
        *cache_k = Some(k.clone());
        *cache_v = Some(v.clone());

        let k = repeat_kv(k, self.num_heads / self.num_kv_heads)?;
        let v = repeat_kv(v, self.num_heads / self.num_kv_heads)?;
        let total_seq_len = k.dim(2)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn_weights = (q.matmul(&k.transpose(2, 3)?)? * scale)?;
        let mask = if start_pos == 0 {
            create_causal_mask(seq_len, x.device(), x.dtype())?
        } else {
            create_generation_mask(seq_len, total_seq_len, start_pos, x.device(), x.dtype())?
        };
        let attn_weights = attn_weights.broadcast_add(&mask)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_output = attn_weights.matmul(&v)?;

        let attn_output = attn_output.transpose(1, 2)?.reshape((b, seq_len, ()))?;
        Ok(self.o_proj.forward(&attn_output)?)
    }
}

fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (b, num_kv_heads, seq_len, head_dim) = x.dims4()?;
    let x = x.unsqueeze(2)?;
    let x = x.expand((b, num_kv_heads, n_rep, seq_len, head_dim))?;
    Ok(x.reshape((b, num_kv_heads * n_rep, seq_len, head_dim))?)
}

/// SwiGLU MLP; `steering_bias` is added after the down-projection
#[allow(clippy::upper_case_acronyms)]
struct MLP {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
    steering_bias: Option<Tensor>,
}

impl MLP {
    fn load(vb: VarBuilder, config: &DecoderConfig) -> Result<Self> {
        Ok(Self {
            gate_proj: linear_no_bias(
                config.hidden_size,
                config.intermediate_size,
                vb.pp("gate_proj"),
            )?,
            up_proj: linear_no_bias(
                config.hidden_size,
                config.intermediate_size,
                vb.pp("up_proj"),
            )?,
            down_proj: linear_no_bias(
                config.intermediate_size,
                config.hidden_size,
                vb.pp("down_proj"),
            )?,
            steering_bias: None,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x)?)?;
        let up = self.up_proj.forward(x)?;
        let out = self.down_proj.forward(&(gate * up)?)?;
        match &self.steering_bias {
            Some(bias) => Ok(out.broadcast_add(bias)?),
            None => Ok(out),
        }
    }
}

struct DecoderLayer {
    self_attn: Attention,
    mlp: MLP,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn load(vb: VarBuilder, config: &DecoderConfig) -> Result<Self> {
        Ok(Self {
            self_attn: Attention::load(vb.pp("self_attn"), config)?,
            mlp: MLP::load(vb.pp("mlp"), config)?,
            input_layernorm: candle_nn::rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("input_layernorm"),
            )?,
            post_attention_layernorm: candle_nn::rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        rotary: &RotaryEmbedding,
        start_pos: usize,
        cache_k: &mut Option<Tensor>,
        cache_v: &mut Option<Tensor>,
    ) -> Result<Tensor> {
        // Pre-norm
        let residual = x;
        let x = self.input_layernorm.forward(x)?;
        let x = self
            .self_attn
            .forward(&x, rotary, start_pos, cache_k, cache_v)?;
        let x = (residual + x)?;

        let residual = &x;
        let x = self.post_attention_layernorm.forward(&x)?;
        let x = self.mlp.forward(&x)?;
        Ok((residual + x)?)
    }
}

/// Replace the output of decoder layer `layer` at the last position
#[derive(Debug, Clone)]
pub struct ResidualPatch {
    pub layer: usize,
    /// `(hidden_size,)`
    pub value: Tensor,
}

impl ResidualPatch {
    fn apply(&self, hidden: &Tensor) -> Result<Tensor> {
        let (b, seq_len, hidden_size) = hidden.dims3()?;
        let value = self
            .value
            .to_device(hidden.device())?
            .to_dtype(hidden.dtype())?
            .reshape((1, 1, hidden_size))?
            .broadcast_as((b, 1, hidden_size))?
            .contiguous()?;
        if seq_len == 1 {
            return Ok(value);
        }
        Ok(Tensor::cat(&[&hidden.narrow(1, 0, seq_len - 1)?, &value], 1)?)
    }
}

/// Safetensors index for sharded checkpoints
#[derive(Debug, serde::Deserialize)]
struct SafetensorsIndex {
    weight_map: HashMap<String, String>,
}

/// Download the checkpoint's safetensors files (single file or all shards)
pub fn download_weight_files(repo: &ApiRepo) -> Result<Vec<PathBuf>> {
    if let Ok(index_path) = repo.get("model.safetensors.index.json") {
        let index_str = std::fs::read_to_string(&index_path).context("Failed to read index")?;
        let index: SafetensorsIndex = serde_json::from_str(&index_str)?;

        let mut shard_names: Vec<String> = index.weight_map.values().cloned().collect();
        shard_names.sort();
        shard_names.dedup();

        info!("Downloading {} shard files...", shard_names.len());
        shard_names
            .iter()
            .map(|name| {
                repo.get(name)
                    .with_context(|| format!("Failed to download {name}"))
            })
            .collect()
    } else {
        let path = repo
            .get("model.safetensors")
            .context("Failed to download model.safetensors")?;
        Ok(vec![path])
    }
}

/// Causal language model with an inspectable residual stream
pub struct CausalLm {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    /// `None` with tied embeddings
    lm_head: Option<Linear>,
    rotary: RotaryEmbedding,
    config: DecoderConfig,
    device: Device,
    dtype: DType,
}

impl CausalLm {
    /// Build from a var builder rooted at the checkpoint (tensors under `model.`)
    pub fn load(config: DecoderConfig, vb: VarBuilder) -> Result<Self> {
        info!(
            "Building decoder: {} layers, {} hidden, {} vocab",
            config.num_hidden_layers, config.hidden_size, config.vocab_size
        );
        let device = vb.device().clone();
        let dtype = vb.dtype();
        let vb_model = vb.pp("model");

        let embed_tokens = embedding(
            config.vocab_size,
            config.hidden_size,
            vb_model.pp("embed_tokens"),
        )?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            if (i + 1) % 10 == 0 || i == 0 {
                debug!("Loading layer {}/{}", i + 1, config.num_hidden_layers);
            }
            layers.push(DecoderLayer::load(
                vb_model.pp(format!("layers.{i}")),
                &config,
            )?);
        }

        let norm =
            candle_nn::rms_norm(config.hidden_size, config.rms_norm_eps, vb_model.pp("norm"))?;

        let lm_head = if config.tie_word_embeddings {
            None
        } else {
            Some(linear_no_bias(
                config.hidden_size,
                config.vocab_size,
                vb.pp("lm_head"),
            )?)
        };

        let rotary = RotaryEmbedding::new(
            config.head_dim(),
            config.max_position_embeddings,
            config.rope_theta,
            &device,
            dtype,
        )?;

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            rotary,
            config,
            device,
            dtype,
        })
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn d_model(&self) -> usize {
        self.config.hidden_size
    }

    pub fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn new_kv_cache(&self) -> KVCache {
        KVCache::new(self.layers.len())
    }

    /// Add `vector` as bias of layer `layer`'s MLP down-projection.
    ///
    /// `vector` must have shape `(hidden_size,)`.
    pub fn set_steering_vector(&mut self, layer: usize, vector: &Tensor) -> Result<()> {
        let hidden_size = self.config.hidden_size;
        if vector.dims() != [hidden_size] {
            anyhow::bail!(
                "Steering vector shape {:?} doesn't match output features {}",
                vector.dims(),
                hidden_size
            );
        }
        let n_layers = self.layers.len();
        let target = self
            .layers
            .get_mut(layer)
            .with_context(|| format!("Steering layer {layer} out of range (0..{n_layers})"))?;
        target.mlp.steering_bias = Some(vector.to_device(&self.device)?.to_dtype(self.dtype)?);
        info!("Steering bias set on layer {} MLP down_proj", layer);
        Ok(())
    }

    /// Run new tokens through all layers; returns normed hidden states
    /// `[batch, new_seq_len, hidden]`.
    fn forward_hidden(
        &self,
        input_ids: &Tensor,
        kv_cache: &mut KVCache,
        patch: Option<&ResidualPatch>,
    ) -> Result<Tensor> {
        let start_pos = kv_cache.seq_len();
        let new_len = input_ids.dim(1)?;
        if start_pos + new_len > self.config.max_position_embeddings {
            anyhow::bail!(
                "Sequence of {} tokens exceeds max_position_embeddings {}",
                start_pos + new_len,
                self.config.max_position_embeddings
            );
        }

        let mut hidden = self.embed_tokens.forward(input_ids)?;
        for (i, layer) in self.layers.iter().enumerate() {
            let (cache_k, cache_v) = kv_cache.layer_mut(i);
            hidden = layer.forward(&hidden, &self.rotary, start_pos, cache_k, cache_v)?;
            if let Some(patch) = patch.filter(|p| p.layer == i) {
                hidden = patch.apply(&hidden)?;
            }
        }
        Ok(self.norm.forward(&hidden)?)
    }

    /// Logits at the last position `[batch, vocab]`, extending `kv_cache`
    pub fn forward_with_kv_cache(
        &self,
        input_ids: &Tensor,
        kv_cache: &mut KVCache,
    ) -> Result<Tensor> {
        let output = self.forward_hidden(input_ids, kv_cache, None)?;
        let seq_len = output.dim(1)?;
        self.project_to_vocab(&output.i((.., seq_len - 1, ..))?)
    }

    /// Logits at the last position with layer `patch.layer`'s output
    /// overwritten there
    pub fn forward_with_patch(&self, input_ids: &Tensor, patch: &ResidualPatch) -> Result<Tensor> {
        if patch.layer >= self.layers.len() {
            anyhow::bail!(
                "Patch layer {} out of range (0..{})",
                patch.layer,
                self.layers.len()
            );
        }
        let mut kv_cache = self.new_kv_cache();
        let output = self.forward_hidden(input_ids, &mut kv_cache, Some(patch))?;
        let seq_len = output.dim(1)?;
        self.project_to_vocab(&output.i((.., seq_len - 1, ..))?)
    }

    /// Final norm then LM head on a raw residual vector
    pub fn logit_lens(&self, activation: &Tensor) -> Result<Tensor> {
        let normed = self.norm.forward(activation)?;
        self.project_to_vocab(&normed)
    }

    /// LM head only (input already normed); a `(hidden,)` vector yields
    /// `(vocab,)` logits
    pub fn project_to_vocab(&self, hidden: &Tensor) -> Result<Tensor> {
        let is_vector = hidden.rank() == 1;
        let hidden = if is_vector {
            hidden.unsqueeze(0)?
        } else {
            hidden.clone()
        };
        let logits = if let Some(ref lm_head) = self.lm_head {
            lm_head.forward(&hidden)?
        } else {
            hidden.broadcast_matmul(&self.embed_tokens.embeddings().t()?)?
        };
        if is_vector {
            Ok(logits.squeeze(0)?)
        } else {
            Ok(logits)
        }
    }

    /// Autoregressive generation; returns prompt ids followed by new ids.
    ///
    /// Stops after `max_new_tokens` or after emitting a token in
    /// `stop_tokens`, which is kept so chat turns stay closed.
    pub fn generate(
        &self,
        prompt_ids: &[u32],
        max_new_tokens: usize,
        temperature: f64,
        do_sample: bool,
        stop_tokens: &[u32],
    ) -> Result<Vec<u32>> {
        if prompt_ids.is_empty() {
            anyhow::bail!("Cannot generate from an empty prompt");
        }
        let mut kv_cache = self.new_kv_cache();
        let mut tokens = prompt_ids.to_vec();
        let mut input = Tensor::new(prompt_ids, &self.device)?.unsqueeze(0)?;

        for _ in 0..max_new_tokens {
            let logits = self.forward_with_kv_cache(&input, &mut kv_cache)?;
            let next_token = sample_from_logits(&logits, temperature, do_sample)?;
            tokens.push(next_token);
            if stop_tokens.contains(&next_token) {
                break;
            }
            input = Tensor::new(&[next_token], &self.device)?.unsqueeze(0)?;
        }

        debug!(
            "Generated {} tokens after {} prompt tokens",
            tokens.len() - prompt_ids.len(),
            prompt_ids.len()
        );
        Ok(tokens)
    }
}

/// Pick the next token: argmax when `do_sample` is false, otherwise sample
/// from `softmax(logits / temperature)`.
pub fn sample_from_logits(logits: &Tensor, temperature: f64, do_sample: bool) -> Result<u32> {
    let logits = logits.to_dtype(DType::F32)?.flatten_all()?;

    if !do_sample || temperature <= 0.0 {
        let values: Vec<f32> = logits.to_vec1()?;
        let (max_idx, _) = values
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .ok_or_else(|| anyhow::anyhow!("Empty logits"))?;
        return Ok(max_idx as u32);
    }

    let probs = candle_nn::ops::softmax_last_dim(&(logits / temperature)?)?;
    let probs: Vec<f32> = probs.to_vec1()?;
    let dist = WeightedIndex::new(&probs).context("Invalid sampling distribution")?;
    Ok(dist.sample(&mut rand::thread_rng()) as u32)
}

/// Softmax over the last dimension, as f32
pub fn softmax_f32(logits: &Tensor) -> Result<Tensor> {
    Ok(candle_nn::ops::softmax_last_dim(&logits.to_dtype(DType::F32)?)?)
}
