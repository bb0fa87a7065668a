pub mod load_llm;
pub mod models;
pub mod predict;
mod util;

use crate::error::{Error, Result};
use crate::settings::LLMCfg;
use candle_core::Device;
use load_llm::ModelSource;
use predict::HubGenerator;
use tokenizers::Tokenizer;

/// Text to token ids and back.
pub trait TextTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
    fn decode(&self, ids: &[u32]) -> Result<String>;
}

/// Continues a token sequence.
///
/// Returns the input ids followed by at most `max_new_tokens` generated ids.
pub trait Generator {
    fn generate(&mut self, input: &[u32], max_new_tokens: usize) -> Result<Vec<u32>>;
}

/// Resolves a tokenizer and a generator for one model, placed on `device`.
pub trait Loader {
    type Tokenizer: TextTokenizer;
    type Generator: Generator;

    fn load(
        &mut self,
        source: &ModelSource,
        device: &Device,
    ) -> Result<(Self::Tokenizer, Self::Generator)>;
}

// `Tokenizer` derefs to `TokenizerImpl`, which owns the inherent encode/decode.
impl TextTokenizer for Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = (**self).encode(text, true).map_err(Error::tokenizer)?;
        Ok(encoding.get_ids().to_vec())
    }

    // Special tokens are kept, the caller prints the raw decoded text.
    fn decode(&self, ids: &[u32]) -> Result<String> {
        (**self).decode(ids, false).map_err(Error::tokenizer)
    }
}

/// Loads pretrained artifacts from the model hub or a local directory.
#[derive(Debug, Clone)]
pub struct HubLoader {
    cfg: LLMCfg,
}

impl HubLoader {
    pub fn new(cfg: LLMCfg) -> Self {
        Self { cfg }
    }
}

impl Loader for HubLoader {
    type Tokenizer = Tokenizer;
    type Generator = HubGenerator;

    fn load(&mut self, source: &ModelSource, device: &Device) -> Result<(Tokenizer, HubGenerator)> {
        let files = source.fetch(&self.cfg.revision)?;
        let tokenizer = load_llm::load_tokenizer(&files)?;
        let dtype = load_llm::dtype(self.cfg.dtype.as_deref(), device)?;
        let config = load_llm::read_config(&files)?;
        let eos_tokens = predict::eos_tokens(&config, &tokenizer);
        let model = load_llm::load_model(config, &files, device, dtype, self.cfg.use_flash_attn)?;
        let generator =
            HubGenerator::new(model, device.clone(), &self.cfg).with_eos_tokens(eos_tokens);
        Ok((tokenizer, generator))
    }
}
