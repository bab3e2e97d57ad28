use thiserror::Error;

#[derive(Error, Debug)]
pub enum TokenizerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown tokenizer '{0}', expected one of: amino_acid, bpe")]
    UnknownTokenizer(String),

    #[error("The {0} tokenizer requires a vocab file")]
    MissingVocabFile(&'static str),

    #[error("Token not found: {0}")]
    TokenNotFound(String),
}

pub type Result<T> = std::result::Result<T, TokenizerError>;
