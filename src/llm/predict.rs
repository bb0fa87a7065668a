use super::models::{eos_token_ids, CausalLm};
use super::Generator;
use crate::error::{Error, Result};
use crate::settings::LLMCfg;
use candle_core::{Device, Tensor};
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::utils::apply_repeat_penalty;
use std::time::Instant;
use tokenizers::Tokenizer;

const EOS_TOKENS: [&str; 5] = ["</s>", "<|endoftext|>", "<|end_of_text|>", "<|im_end|>", "<eos>"];

/// First end-of-sequence marker known to the tokenizer's vocabulary.
pub fn eos_token(tokenizer: &Tokenizer) -> Option<u32> {
    EOS_TOKENS.iter().find_map(|t| tokenizer.token_to_id(t))
}

/// Ids from the model config, the tokenizer's marker when the config names none.
pub fn eos_tokens(config: &serde_json::Value, tokenizer: &Tokenizer) -> Vec<u32> {
    let ids = eos_token_ids(config);
    if ids.is_empty() {
        eos_token(tokenizer).into_iter().collect()
    } else {
        ids
    }
}

pub struct HubGenerator {
    model: CausalLm,
    device: Device,
    seed: u64,
    temperature: Option<f64>,
    top_p: Option<f64>,
    repeat_penalty: f32,
    repeat_last_n: usize,
    eos_tokens: Vec<u32>,
    span: tracing::Span,
}

impl HubGenerator {
    pub fn new(model: CausalLm, device: Device, cfg: &LLMCfg) -> Self {
        Self {
            model,
            device,
            seed: cfg.seed.unwrap_or_else(rand::random),
            temperature: cfg.temperature,
            top_p: cfg.top_p,
            repeat_penalty: cfg.repeat_penalty,
            repeat_last_n: cfg.repeat_last_n,
            eos_tokens: Vec::new(),
            span: tracing::span!(tracing::Level::TRACE, "generate"),
        }
    }

    pub fn with_eos_tokens(mut self, eos_tokens: Vec<u32>) -> Self {
        self.eos_tokens = eos_tokens;
        self
    }
}

impl Generator for HubGenerator {
    fn generate(&mut self, input: &[u32], max_new_tokens: usize) -> Result<Vec<u32>> {
        let _enter = self.span.enter();
        let mut tokens = input.to_vec();
        if max_new_tokens == 0 {
            return Ok(tokens);
        }
        if tokens.is_empty() {
            return Err(Error::Norm {
                message: "prompt encodes to no tokens".to_string(),
            });
        }

        self.model.reset()?;
        let mut logits_processor = LogitsProcessor::new(self.seed, self.temperature, self.top_p);
        let mut index_pos = 0;
        let mut token_generated = 0;
        let start_gen = Instant::now();

        for index in 0..max_new_tokens {
            let context_size = if index > 0 { 1 } else { tokens.len() };
            let ctxt = &tokens[tokens.len().saturating_sub(context_size)..];
            let input = Tensor::new(ctxt, &self.device)?.unsqueeze(0)?;
            let logits = self.model.forward(&input, index_pos)?;
            let logits = if self.repeat_penalty == 1. {
                logits
            } else {
                let start_at = tokens.len().saturating_sub(self.repeat_last_n);
                apply_repeat_penalty(&logits, self.repeat_penalty, &tokens[start_at..])?
            };
            index_pos += ctxt.len();

            let next_token = logits_processor.sample(&logits)?;
            token_generated += 1;
            tokens.push(next_token);

            if self.eos_tokens.contains(&next_token) {
                break;
            }
        }

        let dt = start_gen.elapsed();
        tracing::debug!(
            "{} tokens generated ({:.2} token/s)",
            token_generated,
            token_generated as f64 / dt.as_secs_f64(),
        );
        Ok(tokens)
    }
}
