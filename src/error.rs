use thiserror::Error;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Model loading error: {0}")]
    ModelLoad(String),

    #[error("Adapter error: {0}")]
    Adapter(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Chat template error: {0}")]
    Template(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Hub error: {0}")]
    Hub(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, InferenceError>;
