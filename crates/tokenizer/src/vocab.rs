use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::error::{Result, TokenizerError};

pub const PAD_TOKEN: &str = "<pad>";
pub const MASK_TOKEN: &str = "<mask>";
pub const CLS_TOKEN: &str = "<cls>";
pub const SEP_TOKEN: &str = "<sep>";
pub const UNK_TOKEN: &str = "<unk>";

pub const SPECIAL_TOKENS: [&str; 5] = [PAD_TOKEN, MASK_TOKEN, CLS_TOKEN, SEP_TOKEN, UNK_TOKEN];

/// IUPAC amino acid codes, including the ambiguous ones (B, Z, X) and the rare
/// selenocysteine/pyrrolysine residues (U, O).
const IUPAC_CODES: &str = "ABCDEFGHIKLMNOPQRSTUVWXYZ";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vocab {
    pub token_to_id: HashMap<String, u32>,
    pub id_to_token: HashMap<u32, String>,
}

impl Vocab {
    pub fn new() -> Self {
        Self {
            token_to_id: HashMap::new(),
            id_to_token: HashMap::new(),
        }
    }

    /// Special tokens first, then one id per IUPAC residue code.
    pub fn iupac() -> Self {
        let mut vocab = Self::new();
        let tokens = SPECIAL_TOKENS
            .iter()
            .map(|t| t.to_string())
            .chain(IUPAC_CODES.chars().map(|c| c.to_string()));
        for (id, token) in tokens.enumerate() {
            vocab.insert(token, id as u32);
        }
        vocab
    }

    pub fn insert(&mut self, token: String, id: u32) {
        self.token_to_id.insert(token.clone(), id);
        self.id_to_token.insert(id, token);
    }

    pub fn get_id(&self, token: &str) -> Option<u32> {
        self.token_to_id.get(token).copied()
    }

    pub fn get_token(&self, id: u32) -> Option<&String> {
        self.id_to_token.get(&id)
    }

    pub fn require_id(&self, token: &str) -> Result<u32> {
        self.get_id(token)
            .ok_or_else(|| TokenizerError::TokenNotFound(token.to_string()))
    }

    pub fn len(&self) -> usize {
        self.token_to_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_to_id.is_empty()
    }

    /// Largest id + 1. Embedding tables are sized by this, not by `len`, so
    /// vocab files with gaps in their ids still index correctly.
    pub fn id_space(&self) -> usize {
        self.id_to_token.keys().max().map_or(0, |&id| id as usize + 1)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, &self.token_to_id)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let token_to_id: HashMap<String, u32> = serde_json::from_reader(reader)?;

        let mut id_to_token = HashMap::new();
        for (token, id) in &token_to_id {
            id_to_token.insert(*id, token.clone());
        }

        Ok(Self {
            token_to_id,
            id_to_token,
        })
    }
}

impl Default for Vocab {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iupac_vocab_puts_specials_first() {
        let vocab = Vocab::iupac();
        assert_eq!(vocab.get_id(PAD_TOKEN), Some(0));
        assert_eq!(vocab.get_id(UNK_TOKEN), Some(4));
        assert_eq!(vocab.get_id("A"), Some(5));
        assert_eq!(vocab.len(), 30);
        assert_eq!(vocab.id_space(), 30);
    }

    #[test]
    fn save_then_load_keeps_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.json");
        Vocab::iupac().save(&path).unwrap();

        let loaded = Vocab::load(&path).unwrap();
        assert_eq!(loaded.get_id("W"), Vocab::iupac().get_id("W"));
        assert_eq!(loaded.get_token(0).map(String::as_str), Some(PAD_TOKEN));
    }
}
