use crate::error::{Error, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::{llama, mistral, phi, qwen2};

/// Causal language model families that can be built from a hub `config.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    Llama,
    Mistral,
    Qwen2,
    Phi,
}

impl Architecture {
    /// Reads `model_type`, falling back to the first entry of `architectures`.
    pub fn detect(config: &serde_json::Value) -> Result<Self> {
        if let Some(model_type) = config.get("model_type").and_then(|v| v.as_str()) {
            return Self::from_model_type(model_type);
        }
        let class = config
            .get("architectures")
            .and_then(|v| v.get(0))
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::UnsupportedArchitecture("<unspecified>".to_string()))?;
        match class {
            "LlamaForCausalLM" => Ok(Architecture::Llama),
            "MistralForCausalLM" => Ok(Architecture::Mistral),
            "Qwen2ForCausalLM" => Ok(Architecture::Qwen2),
            "PhiForCausalLM" => Ok(Architecture::Phi),
            other => Err(Error::UnsupportedArchitecture(other.to_string())),
        }
    }

    fn from_model_type(model_type: &str) -> Result<Self> {
        match model_type {
            "llama" => Ok(Architecture::Llama),
            "mistral" => Ok(Architecture::Mistral),
            "qwen2" => Ok(Architecture::Qwen2),
            "phi" => Ok(Architecture::Phi),
            other => Err(Error::UnsupportedArchitecture(other.to_string())),
        }
    }
}

/// `eos_token_id` from a hub `config.json`, either a single id or a list.
pub fn eos_token_ids(config: &serde_json::Value) -> Vec<u32> {
    let as_id = |v: &serde_json::Value| v.as_u64().and_then(|id| u32::try_from(id).ok());
    match config.get("eos_token_id") {
        Some(serde_json::Value::Array(ids)) => ids.iter().filter_map(as_id).collect(),
        Some(id) => as_id(id).into_iter().collect(),
        None => Vec::new(),
    }
}

pub struct LlamaLm {
    model: llama::Llama,
    cache: llama::Cache,
    config: llama::Config,
    dtype: DType,
    device: Device,
}

pub enum CausalLm {
    Llama(LlamaLm),
    Mistral(mistral::Model),
    Qwen2(qwen2::ModelForCausalLM),
    Phi(phi::Model),
}

impl CausalLm {
    pub fn load(
        arch: Architecture,
        config: serde_json::Value,
        vb: VarBuilder,
        use_flash_attn: bool,
    ) -> Result<Self> {
        let model = match arch {
            Architecture::Llama => {
                let config: llama::LlamaConfig = serde_json::from_value(config)?;
                let config = config.into_config(use_flash_attn);
                let dtype = vb.dtype();
                let device = vb.device().clone();
                let cache = llama::Cache::new(true, dtype, &config, &device)?;
                let model = llama::Llama::load(vb, &config)?;
                CausalLm::Llama(LlamaLm {
                    model,
                    cache,
                    config,
                    dtype,
                    device,
                })
            }
            Architecture::Mistral => {
                let config: mistral::Config = serde_json::from_value(config)?;
                CausalLm::Mistral(mistral::Model::new(&config, vb)?)
            }
            Architecture::Qwen2 => {
                let config: qwen2::Config = serde_json::from_value(config)?;
                CausalLm::Qwen2(qwen2::ModelForCausalLM::new(&config, vb)?)
            }
            Architecture::Phi => {
                let config: phi::Config = serde_json::from_value(config)?;
                CausalLm::Phi(phi::Model::new(&config, vb)?)
            }
        };
        Ok(model)
    }

    /// Logits for the last position of `input` (shape `(1, seq_len)`), flattened to `(vocab,)`.
    pub fn forward(&mut self, input: &Tensor, index_pos: usize) -> Result<Tensor> {
        let logits = match self {
            CausalLm::Llama(lm) => lm.model.forward(input, index_pos, &mut lm.cache)?,
            CausalLm::Mistral(model) => model.forward(input, index_pos)?,
            CausalLm::Qwen2(model) => model.forward(input, index_pos)?,
            // phi tracks its own position in the kv cache
            CausalLm::Phi(model) => model.forward(input)?,
        };
        Ok(logits.flatten_all()?.to_dtype(DType::F32)?)
    }

    /// Drops the kv cache so the next forward starts a fresh sequence.
    pub fn reset(&mut self) -> Result<()> {
        match self {
            CausalLm::Llama(lm) => {
                lm.cache = llama::Cache::new(true, lm.dtype, &lm.config, &lm.device)?;
            }
            CausalLm::Mistral(model) => model.clear_kv_cache(),
            CausalLm::Qwen2(model) => model.clear_kv_cache(),
            CausalLm::Phi(model) => model.clear_kv_cache(),
        }
        Ok(())
    }
}
