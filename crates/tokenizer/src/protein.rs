use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::{Result, TokenizerError};
use crate::vocab::{Vocab, CLS_TOKEN, MASK_TOKEN, PAD_TOKEN, SEP_TOKEN, SPECIAL_TOKENS, UNK_TOKEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenizerKind {
    AminoAcid,
    Bpe,
}

impl FromStr for TokenizerKind {
    type Err = TokenizerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "amino_acid" => Ok(Self::AminoAcid),
            "bpe" => Ok(Self::Bpe),
            other => Err(TokenizerError::UnknownTokenizer(other.to_string())),
        }
    }
}

impl fmt::Display for TokenizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AminoAcid => write!(f, "amino_acid"),
            Self::Bpe => write!(f, "bpe"),
        }
    }
}

/// Turns protein sequences into model input ids.
///
/// Every encoded sequence is wrapped as `<cls> ... <sep>`. The amino acid
/// tokenizer maps one residue to one token; the `bpe` tokenizer reads a
/// `{token: id}` vocab file and segments greedily by longest match.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    kind: TokenizerKind,
    vocab: Vocab,
    max_token_chars: usize,
    pad_id: u32,
    mask_id: u32,
    cls_id: u32,
    sep_id: u32,
    unk_id: u32,
}

impl Tokenizer {
    pub fn new(kind: TokenizerKind, vocab_file: Option<&Path>) -> Result<Self> {
        match (kind, vocab_file) {
            (TokenizerKind::AminoAcid, _) => Ok(Self::amino_acid()),
            (TokenizerKind::Bpe, Some(path)) => Self::from_vocab(kind, Vocab::load(path)?),
            (TokenizerKind::Bpe, None) => Err(TokenizerError::MissingVocabFile("bpe")),
        }
    }

    /// Special token ids follow the order of `Vocab::iupac`.
    pub fn amino_acid() -> Self {
        Self {
            kind: TokenizerKind::AminoAcid,
            vocab: Vocab::iupac(),
            max_token_chars: 1,
            pad_id: 0,
            mask_id: 1,
            cls_id: 2,
            sep_id: 3,
            unk_id: 4,
        }
    }

    fn from_vocab(kind: TokenizerKind, vocab: Vocab) -> Result<Self> {
        let max_token_chars = vocab
            .token_to_id
            .keys()
            .filter(|t| !SPECIAL_TOKENS.contains(&t.as_str()))
            .map(|t| t.chars().count())
            .max()
            .unwrap_or(1);

        Ok(Self {
            kind,
            pad_id: vocab.require_id(PAD_TOKEN)?,
            mask_id: vocab.require_id(MASK_TOKEN)?,
            cls_id: vocab.require_id(CLS_TOKEN)?,
            sep_id: vocab.require_id(SEP_TOKEN)?,
            unk_id: vocab.require_id(UNK_TOKEN)?,
            vocab,
            max_token_chars,
        })
    }

    pub fn kind(&self) -> TokenizerKind {
        self.kind
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.id_space()
    }

    pub fn pad_id(&self) -> i64 {
        self.pad_id as i64
    }

    pub fn mask_id(&self) -> i64 {
        self.mask_id as i64
    }

    pub fn unk_id(&self) -> i64 {
        self.unk_id as i64
    }

    /// Ids that masked language modeling must never corrupt.
    pub fn is_special(&self, id: i64) -> bool {
        [self.pad_id, self.mask_id, self.cls_id, self.sep_id, self.unk_id]
            .iter()
            .any(|&s| s as i64 == id)
    }

    pub fn tokenize(&self, sequence: &str) -> Vec<String> {
        let residues: Vec<char> = sequence
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| c.to_ascii_uppercase())
            .collect();

        match self.kind {
            TokenizerKind::AminoAcid => residues.iter().map(|c| c.to_string()).collect(),
            TokenizerKind::Bpe => self.longest_match(&residues),
        }
    }

    fn longest_match(&self, residues: &[char]) -> Vec<String> {
        let mut tokens = Vec::new();
        let mut start = 0;
        while start < residues.len() {
            let longest = self.max_token_chars.min(residues.len() - start);
            let piece = (1..=longest)
                .rev()
                .map(|len| residues[start..start + len].iter().collect::<String>())
                .find(|candidate| self.vocab.get_id(candidate).is_some());

            match piece {
                Some(piece) => {
                    start += piece.chars().count();
                    tokens.push(piece);
                }
                None => {
                    tokens.push(residues[start].to_string());
                    start += 1;
                }
            }
        }
        tokens
    }

    pub fn convert_token_to_id(&self, token: &str) -> i64 {
        self.vocab.get_id(token).unwrap_or(self.unk_id) as i64
    }

    /// Encodes a sequence as `<cls> tokens <sep>`.
    pub fn encode(&self, sequence: &str) -> Vec<i64> {
        let tokens = self.tokenize(sequence);
        let mut ids = Vec::with_capacity(tokens.len() + 2);
        ids.push(self.cls_id as i64);
        ids.extend(tokens.iter().map(|t| self.convert_token_to_id(t)));
        ids.push(self.sep_id as i64);
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn amino_acid_encoding_wraps_with_cls_and_sep() {
        let tokenizer = Tokenizer::amino_acid();
        let ids = tokenizer.encode("mkv");

        assert_eq!(ids.len(), 5);
        assert_eq!(ids[0], 2);
        assert_eq!(ids[4], 3);
        assert_eq!(ids[1], tokenizer.convert_token_to_id("M"));
    }

    #[test]
    fn unknown_residues_map_to_unk() {
        let tokenizer = Tokenizer::amino_acid();
        let ids = tokenizer.encode("A*");
        assert_eq!(ids[2], tokenizer.unk_id());
    }

    #[test]
    fn bpe_segments_by_longest_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.json");
        let mut map: HashMap<&str, u32> = HashMap::new();
        for (id, token) in SPECIAL_TOKENS.iter().enumerate() {
            map.insert(token, id as u32);
        }
        map.insert("M", 5);
        map.insert("K", 6);
        map.insert("MK", 7);
        map.insert("MKV", 8);
        std::fs::write(&path, serde_json::to_string(&map).unwrap()).unwrap();

        let tokenizer = Tokenizer::new(TokenizerKind::Bpe, Some(&path)).unwrap();
        assert_eq!(tokenizer.tokenize("MKVMKK"), vec!["MKV", "MK", "K"]);
        assert_eq!(tokenizer.vocab_size(), 9);
    }

    #[test]
    fn bpe_without_vocab_file_is_rejected() {
        let err = Tokenizer::new(TokenizerKind::Bpe, None).unwrap_err();
        assert!(matches!(err, TokenizerError::MissingVocabFile("bpe")));
    }

    #[test]
    fn kind_parses_from_cli_names() {
        assert_eq!("bpe".parse::<TokenizerKind>().unwrap(), TokenizerKind::Bpe);
        assert!("sentencepiece".parse::<TokenizerKind>().is_err());
        assert_eq!(TokenizerKind::AminoAcid.to_string(), "amino_acid");
    }
}
