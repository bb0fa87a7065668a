#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{message}")]
    Norm { message: String },
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::error::Error),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("model hub error: {0}")]
    Hub(#[from] hf_hub::api::sync::ApiError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("invalid settings: {0}")]
    Validation(#[from] validator::ValidationErrors),
    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("invalid model identifier `{0}`")]
    InvalidModelId(String),
    #[error("invalid token budget `{0}`, expected a non-negative integer")]
    InvalidBudget(String),
    #[error("unsupported model architecture `{0}`")]
    UnsupportedArchitecture(String),
    #[error("model artifact `{0}` not found")]
    MissingArtifact(String),
    #[error("input closed while waiting for {0}")]
    InputClosed(&'static str),
}

impl Error {
    pub fn tokenizer(e: impl std::fmt::Display) -> Self {
        Error::Tokenizer(e.to_string())
    }
}

pub type Result<T> = core::result::Result<T, Error>;
