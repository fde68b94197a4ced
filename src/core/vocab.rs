//! Vocabulary tables and the tiktoken-format loader.
//!
//! Two immutable, bidirectional tables share one id space:
//!
//! - [`Vocabulary`]: mergeable byte sequences and their ranks. The rank of a
//!   byte sequence is also its token id, so lower ids merge first.
//! - [`SpecialTokenTable`]: literal out-of-band strings (e.g. `<|endoftext|>`)
//!   that are matched verbatim and never take part in merging.
//!
//! # Tiktoken Format
//!
//! Vocabulary files hold one entry per line: a base64-encoded token, a
//! space, and the integer rank.
//!
//! ```text
//! SGVsbG8= 0
//! V29ybGQ= 1
//! ```
//!
//! `SGVsbG8=` decodes to `Hello` (rank 0) and `V29ybGQ=` to `World` (rank 1).

use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine};
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Token id and merge priority. Lower ranks merge first.
pub type Rank = u32;

/// Errors raised while parsing vocabulary data or building the tables.
#[derive(Error, Debug)]
pub enum VocabError {
    #[error("Invalid base64 encoding: {0}")]
    Base64Error(#[from] base64::DecodeError),
    #[error("Invalid line format: {0}")]
    ParseError(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Duplicate token id {id} in {table}")]
    DuplicateTokenId { id: Rank, table: &'static str },
    #[error("Vocabulary is empty")]
    Empty,
    #[error("Special token with id {id} is the empty string")]
    EmptySpecialToken { id: Rank },
    #[error(
        "Hash mismatch for {path:?}: expected sha256 {expected}, got {actual}. \
         The file may be corrupted or for a different encoding."
    )]
    HashMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
}

/// Load a tiktoken BPE vocabulary from raw bytes.
///
/// Blank lines are skipped. The rank is whatever follows the last space.
pub fn load_tiktoken_bpe(data: &[u8]) -> Result<FxHashMap<Vec<u8>, Rank>, VocabError> {
    let mut encoder = FxHashMap::default();

    for (line_no, line) in data.split(|&b| b == b'\n').enumerate() {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            continue;
        }

        let space_pos = line.iter().rposition(|&b| b == b' ').ok_or_else(|| {
            VocabError::ParseError(format!("line {}: missing space separator", line_no + 1))
        })?;

        let token = STANDARD.decode(&line[..space_pos])?;

        let rank_str = std::str::from_utf8(&line[space_pos + 1..]).map_err(|_| {
            VocabError::ParseError(format!("line {}: invalid UTF-8 in rank", line_no + 1))
        })?;
        let rank: Rank = rank_str.trim().parse().map_err(|_| {
            VocabError::ParseError(format!("line {}: invalid rank {:?}", line_no + 1, rank_str))
        })?;

        encoder.insert(token, rank);
    }

    Ok(encoder)
}

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Load a tiktoken BPE vocabulary from a file path.
///
/// If `expected_hash` is given, the file's SHA-256 (hex, case-insensitive)
/// must match it before anything is parsed.
pub fn load_tiktoken_bpe_file(
    path: impl AsRef<Path>,
    expected_hash: Option<&str>,
) -> Result<FxHashMap<Vec<u8>, Rank>, VocabError> {
    let path = path.as_ref();
    let data = std::fs::read(path)?;
    if let Some(expected) = expected_hash {
        let actual = sha256_hex(&data);
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(VocabError::HashMismatch {
                path: path.to_path_buf(),
                expected: expected.to_string(),
                actual,
            });
        }
    }
    load_tiktoken_bpe(&data)
}

/// Immutable byte-sequence ⇄ rank table.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    encoder: FxHashMap<Vec<u8>, Rank>,
    decoder: FxHashMap<Rank, Vec<u8>>,
    max_rank: Rank,
}

impl Vocabulary {
    /// Build the table, rejecting empty input and ranks shared by two byte
    /// sequences (decode would be ambiguous).
    pub fn new(encoder: FxHashMap<Vec<u8>, Rank>) -> Result<Self, VocabError> {
        let mut decoder = FxHashMap::with_capacity_and_hasher(encoder.len(), Default::default());
        for (bytes, &rank) in &encoder {
            if decoder.insert(rank, bytes.clone()).is_some() {
                return Err(VocabError::DuplicateTokenId {
                    id: rank,
                    table: "vocabulary",
                });
            }
        }
        let max_rank = decoder.keys().copied().max().ok_or(VocabError::Empty)?;

        Ok(Self {
            encoder,
            decoder,
            max_rank,
        })
    }

    #[inline]
    pub fn rank(&self, bytes: &[u8]) -> Option<Rank> {
        self.encoder.get(bytes).copied()
    }

    #[inline]
    pub fn bytes(&self, rank: Rank) -> Option<&[u8]> {
        self.decoder.get(&rank).map(Vec::as_slice)
    }

    #[inline]
    pub fn contains_rank(&self, rank: Rank) -> bool {
        self.decoder.contains_key(&rank)
    }

    pub fn len(&self) -> usize {
        self.encoder.len()
    }

    pub fn is_empty(&self) -> bool {
        self.encoder.is_empty()
    }

    pub fn max_rank(&self) -> Rank {
        self.max_rank
    }

    /// The byte sequence → rank map the merge engine reads.
    pub fn encoder(&self) -> &FxHashMap<Vec<u8>, Rank> {
        &self.encoder
    }

    /// Every mergeable byte sequence, sorted bytewise.
    pub fn sorted_token_bytes(&self) -> Vec<Vec<u8>> {
        let mut tokens: Vec<Vec<u8>> = self.encoder.keys().cloned().collect();
        tokens.sort_unstable();
        tokens
    }
}

/// Immutable special-token string ⇄ id table.
#[derive(Debug, Clone, Default)]
pub struct SpecialTokenTable {
    encoder: FxHashMap<String, Rank>,
    decoder: FxHashMap<Rank, String>,
}

impl SpecialTokenTable {
    pub fn new(encoder: FxHashMap<String, Rank>) -> Result<Self, VocabError> {
        let mut decoder = FxHashMap::with_capacity_and_hasher(encoder.len(), Default::default());
        for (token, &id) in &encoder {
            if token.is_empty() {
                return Err(VocabError::EmptySpecialToken { id });
            }
            if decoder.insert(id, token.clone()).is_some() {
                return Err(VocabError::DuplicateTokenId {
                    id,
                    table: "special tokens",
                });
            }
        }
        Ok(Self { encoder, decoder })
    }

    #[inline]
    pub fn id(&self, token: &str) -> Option<Rank> {
        self.encoder.get(token).copied()
    }

    #[inline]
    pub fn token(&self, id: Rank) -> Option<&str> {
        self.decoder.get(&id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.encoder.len()
    }

    pub fn is_empty(&self) -> bool {
        self.encoder.is_empty()
    }

    pub fn max_id(&self) -> Option<Rank> {
        self.decoder.keys().copied().max()
    }

    /// Special token strings in ascending id order.
    pub fn tokens(&self) -> Vec<&str> {
        let mut by_id: Vec<(&Rank, &String)> = self.decoder.iter().collect();
        by_id.sort_unstable_by_key(|(id, _)| **id);
        by_id.into_iter().map(|(_, s)| s.as_str()).collect()
    }

    pub fn encoder(&self) -> &FxHashMap<String, Rank> {
        &self.encoder
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_tiktoken_bpe() {
        // "Hello" base64 = "SGVsbG8="
        // "World" base64 = "V29ybGQ="
        let data = b"SGVsbG8= 0\nV29ybGQ= 1\n";
        let encoder = load_tiktoken_bpe(data).unwrap();

        assert_eq!(encoder.get(b"Hello".as_slice()), Some(&0));
        assert_eq!(encoder.get(b"World".as_slice()), Some(&1));
        assert_eq!(encoder.len(), 2);
    }

    #[test]
    fn test_load_tiktoken_bpe_crlf_and_blank_lines() {
        let data = b"SGVsbG8= 0\r\n\r\nV29ybGQ= 1";
        let encoder = load_tiktoken_bpe(data).unwrap();
        assert_eq!(encoder.get(b"World".as_slice()), Some(&1));
        assert_eq!(encoder.len(), 2);
    }

    #[test]
    fn test_load_tiktoken_bpe_rejects_bad_lines() {
        assert!(matches!(
            load_tiktoken_bpe(b"SGVsbG8=0\n"),
            Err(VocabError::ParseError(_))
        ));
        assert!(matches!(
            load_tiktoken_bpe(b"SGVsbG8= zero\n"),
            Err(VocabError::ParseError(_))
        ));
        assert!(matches!(
            load_tiktoken_bpe(b"!!!! 0\n"),
            Err(VocabError::Base64Error(_))
        ));
    }

    fn write_temp(name: &str, data: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("shardtok-{}-{name}", std::process::id()));
        std::fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn test_load_file_checks_hash() {
        const DATA: &[u8] = b"SGVsbG8= 0\nV29ybGQ= 1\n";
        const DATA_SHA256: &str =
            "598addb01b72cf393c5dabf86b8901a460fe5b8f5d5283879769d7b2328f9ffa";
        let path = write_temp("hash.tiktoken", DATA);

        assert_eq!(sha256_hex(DATA), DATA_SHA256);
        assert_eq!(load_tiktoken_bpe_file(&path, None).unwrap().len(), 2);
        assert_eq!(
            load_tiktoken_bpe_file(&path, Some(DATA_SHA256)).unwrap().len(),
            2
        );
        assert!(load_tiktoken_bpe_file(&path, Some(&DATA_SHA256.to_uppercase())).is_ok());

        let wrong = "0".repeat(64);
        match load_tiktoken_bpe_file(&path, Some(&wrong)) {
            Err(VocabError::HashMismatch {
                path: reported,
                expected,
                actual,
            }) => {
                assert_eq!(reported, path);
                assert_eq!(expected, wrong);
                assert_eq!(actual, DATA_SHA256);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_load_file_missing_is_io_error() {
        let path = std::env::temp_dir().join("shardtok-does-not-exist.tiktoken");
        assert!(matches!(
            load_tiktoken_bpe_file(path, None),
            Err(VocabError::IoError(_))
        ));
    }

    #[test]
    fn test_vocabulary_bidirectional() {
        let mut encoder = FxHashMap::default();
        encoder.insert(b"Hello".to_vec(), 0);
        encoder.insert(b"World".to_vec(), 7);

        let vocab = Vocabulary::new(encoder).unwrap();
        assert_eq!(vocab.rank(b"World"), Some(7));
        assert_eq!(vocab.bytes(0), Some(b"Hello".as_slice()));
        assert_eq!(vocab.bytes(3), None);
        assert_eq!(vocab.max_rank(), 7);
        assert_eq!(
            vocab.sorted_token_bytes(),
            vec![b"Hello".to_vec(), b"World".to_vec()]
        );
    }

    #[test]
    fn test_vocabulary_rejects_duplicate_ranks() {
        let mut encoder = FxHashMap::default();
        encoder.insert(b"a".to_vec(), 1);
        encoder.insert(b"b".to_vec(), 1);
        assert!(matches!(
            Vocabulary::new(encoder),
            Err(VocabError::DuplicateTokenId { id: 1, .. })
        ));
    }

    #[test]
    fn test_vocabulary_rejects_empty() {
        assert!(matches!(
            Vocabulary::new(FxHashMap::default()),
            Err(VocabError::Empty)
        ));
    }

    #[test]
    fn test_special_table_rejects_empty_token() {
        let mut special = FxHashMap::default();
        special.insert(String::new(), 4);
        assert!(matches!(
            SpecialTokenTable::new(special),
            Err(VocabError::EmptySpecialToken { id: 4 })
        ));
    }

    #[test]
    fn test_special_table_sorted_tokens() {
        let mut special = FxHashMap::default();
        special.insert("<|b|>".to_string(), 11);
        special.insert("<|a|>".to_string(), 10);
        let table = SpecialTokenTable::new(special).unwrap();

        assert_eq!(table.tokens(), vec!["<|a|>", "<|b|>"]);
        assert_eq!(table.id("<|b|>"), Some(11));
        assert_eq!(table.token(10), Some("<|a|>"));
        assert_eq!(table.max_id(), Some(11));
    }
}
