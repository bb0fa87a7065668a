use crate::error::Result;
use crate::session::Mode;
use config::{Config, Environment, File};
use serde::Deserialize;
use validator::Validate;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Settings {
    #[validate]
    pub llm: LLMCfg,
    pub log: LogCfg,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct LLMCfg {
    pub mode: Mode,
    /// Skip accelerator probing and run on the CPU.
    pub cpu: bool,
    /// One of `f32`, `f16`, `bf16`. Picked from the device when unset.
    pub dtype: Option<String>,
    pub revision: String,
    /// Token budget used by the single-prompt mode.
    #[validate(range(max = 100000))]
    pub max_new_tokens: usize,
    pub seed: Option<u64>,
    #[validate(range(min = 0.0))]
    pub temperature: Option<f64>,
    #[validate(range(min = 0.0, max = 1.0))]
    pub top_p: Option<f64>,
    #[validate(range(min = 0.01))]
    pub repeat_penalty: f32,
    pub repeat_last_n: usize,
    pub use_flash_attn: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogCfg {
    pub level: String,
}

impl Settings {
    pub fn new() -> Result<Self> {
        Self::from_file("config/llm")
    }

    pub fn from_file(name: &str) -> Result<Self> {
        let c = Config::builder()
            .set_default("llm.mode", "interactive")?
            .set_default("llm.cpu", false)?
            .set_default("llm.revision", "main")?
            .set_default("llm.max_new_tokens", 50)?
            .set_default("llm.repeat_penalty", 1.0)?
            .set_default("llm.repeat_last_n", 64)?
            .set_default("llm.use_flash_attn", false)?
            .set_default("log.level", "warn")?
            .add_source(File::with_name(name).required(false))
            .add_source(
                Environment::with_prefix("LLM_PROMPT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let settings: Settings = c.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_apply_without_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let name = dir.path().join("absent");
        let settings = Settings::from_file(name.to_str().unwrap()).unwrap();
        assert_eq!(settings.llm.mode, Mode::Interactive);
        assert_eq!(settings.llm.max_new_tokens, 50);
        assert_eq!(settings.llm.revision, "main");
        assert!(settings.llm.temperature.is_none());
        assert_eq!(settings.log.level, "warn");
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("llm.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "[llm]\nmode = \"single\"\ncpu = true\ntemperature = 0.7\nmax_new_tokens = 12"
        )
        .unwrap();

        let settings = Settings::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(settings.llm.mode, Mode::Single);
        assert!(settings.llm.cpu);
        assert_eq!(settings.llm.temperature, Some(0.7));
        assert_eq!(settings.llm.max_new_tokens, 12);
    }

    #[test]
    fn out_of_range_top_p_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("llm.toml");
        std::fs::write(&path, "[llm]\ntop_p = 1.5\n").unwrap();

        let err = Settings::from_file(path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, crate::error::Error::Validation(_)));
    }
}
