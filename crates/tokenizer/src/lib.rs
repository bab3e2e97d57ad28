pub mod error;
pub mod protein;
pub mod vocab;

pub use error::TokenizerError;
pub use protein::{Tokenizer, TokenizerKind};
pub use vocab::Vocab;
