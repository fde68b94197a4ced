//! Definitions for the public OpenAI encodings.
//!
//! - `cl100k_base` - GPT-4, GPT-3.5-turbo (~100k tokens)
//! - `o200k_base` - GPT-4o (~200k tokens)
//!
//! Vocabulary files are not bundled. Each definition reads
//! `<dir>/<name>.tiktoken`, where `<dir>` is `$SHARDTOK_VOCAB_DIR` or the
//! current directory, and rejects a file whose SHA-256 is not the published one.

use std::path::PathBuf;

use rustc_hash::FxHashMap;

use super::encoding::{EncodingSpec, TokenizerError, ENDOFTEXT};
use super::vocab::{load_tiktoken_bpe_file, Rank};

/// Environment variable naming the directory that holds `.tiktoken` files.
pub const VOCAB_DIR_ENV: &str = "SHARDTOK_VOCAB_DIR";

pub const FIM_PREFIX: &str = "<|fim_prefix|>";
pub const FIM_MIDDLE: &str = "<|fim_middle|>";
pub const FIM_SUFFIX: &str = "<|fim_suffix|>";
pub const ENDOFPROMPT: &str = "<|endofprompt|>";

/// SHA-256 of the published `cl100k_base.tiktoken`.
pub const CL100K_BASE_SHA256: &str =
    "223921b76ee99bde995b7ff738513eef100fb51d18c93597a113bcffe865b2a7";

/// SHA-256 of the published `o200k_base.tiktoken`.
pub const O200K_BASE_SHA256: &str =
    "446a9538cb6c348e3516120d7c08b09f57c36495e2acfffe59a5bf8b0cfb1a2d";

/// Content pattern for cl100k_base.
pub const CL100K_BASE_PATTERN: &str = r"(?i:'s|'t|'re|'ve|'m|'ll|'d)|[^\r\n\p{L}\p{N}]?\p{L}+|\p{N}{1,3}| ?[^\s\p{L}\p{N}]+[\r\n]*|\s*[\r\n]+|\s+(?!\S)|\s+";

/// Content pattern for o200k_base.
pub const O200K_BASE_PATTERN: &str = concat!(
    r"[^\r\n\p{L}\p{N}]?[\p{Lu}\p{Lt}\p{Lm}\p{Lo}\p{M}]*[\p{Ll}\p{Lm}\p{Lo}\p{M}]+(?i:'s|'t|'re|'ve|'m|'ll|'d)?",
    r"|[^\r\n\p{L}\p{N}]?[\p{Lu}\p{Lt}\p{Lm}\p{Lo}\p{M}]+[\p{Ll}\p{Lm}\p{Lo}\p{M}]*(?i:'s|'t|'re|'ve|'m|'ll|'d)?",
    r"|\p{N}{1,3}",
    r"| ?[^\s\p{L}\p{N}]+[\r\n/]*",
    r"|\s*[\r\n]+",
    r"|\s+(?!\S)",
    r"|\s+",
);

/// Directory searched for vocabulary files.
pub fn vocab_dir() -> PathBuf {
    std::env::var_os(VOCAB_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn vocab_path(name: &str) -> PathBuf {
    vocab_dir().join(format!("{name}.tiktoken"))
}

/// Special tokens for cl100k_base.
pub fn cl100k_base_special_tokens() -> FxHashMap<String, Rank> {
    let mut special = FxHashMap::default();
    special.insert(ENDOFTEXT.to_string(), 100257);
    special.insert(FIM_PREFIX.to_string(), 100258);
    special.insert(FIM_MIDDLE.to_string(), 100259);
    special.insert(FIM_SUFFIX.to_string(), 100260);
    special.insert(ENDOFPROMPT.to_string(), 100276);
    special
}

/// Special tokens for o200k_base.
pub fn o200k_base_special_tokens() -> FxHashMap<String, Rank> {
    let mut special = FxHashMap::default();
    special.insert(ENDOFTEXT.to_string(), 199999);
    special.insert(ENDOFPROMPT.to_string(), 200018);
    special
}

pub fn cl100k_base() -> Result<EncodingSpec, TokenizerError> {
    Ok(EncodingSpec {
        name: "cl100k_base".to_string(),
        pat_str: CL100K_BASE_PATTERN.to_string(),
        mergeable_ranks: load_tiktoken_bpe_file(
            vocab_path("cl100k_base"),
            Some(CL100K_BASE_SHA256),
        )?,
        special_tokens: cl100k_base_special_tokens(),
        explicit_n_vocab: None,
    })
}

pub fn o200k_base() -> Result<EncodingSpec, TokenizerError> {
    Ok(EncodingSpec {
        name: "o200k_base".to_string(),
        pat_str: O200K_BASE_PATTERN.to_string(),
        mergeable_ranks: load_tiktoken_bpe_file(
            vocab_path("o200k_base"),
            Some(O200K_BASE_SHA256),
        )?,
        special_tokens: o200k_base_special_tokens(),
        explicit_n_vocab: None,
    })
}
