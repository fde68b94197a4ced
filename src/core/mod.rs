//! Core tokenization engine for shardtok.
//!
//! This module contains the byte-level BPE implementation with:
//! - Byte-pair merging over a linked list of boundaries (heap-driven for long pieces)
//! - Vocabulary loading from tiktoken format
//! - Special-token segmentation with a per-call allow/deny policy
//! - A registry that builds each named encoding once per process
//!
//! # Architecture
//!
//! The layers, bottom-up:
//!
//! - [`vocab`]: [`Vocabulary`] and [`SpecialTokenTable`], plus the tiktoken loader
//! - [`bpe`]: the merge engine, [`byte_pair_encode`] and friends
//! - [`segment`]: [`Segmenter`], which cuts text at allowed special tokens and
//!   splits the spans between them with the content pattern
//! - [`codec`]: [`CoreBpe`], raw encode/decode with no policy
//! - [`encoding`]: [`Encoding`], the public facade that resolves and enforces
//!   the special-token policy
//! - [`registry`]: named, lazily-built, shared encodings
//!
//! # Performance Notes
//!
//! - **Regexr with JIT** by default, PCRE2 behind the `pcre2` feature
//! - **Rayon parallelism** for batch operations
//! - **FxHashMap** for byte-sequence lookups
//! - **Aho-Corasick** for special token matching
//! - **No shared mutable state** on the encode/decode path

pub mod bpe;
pub mod codec;
pub mod encoding;
pub mod openai_public;
pub mod registry;
pub mod segment;
pub mod vocab;

pub use bpe::{byte_pair_encode, byte_pair_merge, byte_pair_split, MergeError};
pub use codec::CoreBpe;
pub use encoding::{
    sanitize_utf16, DecodeErrors, Encoding, EncodingSpec, SpecialSelection, TokenizerError,
    ENDOFTEXT,
};
pub use openai_public::{CL100K_BASE_PATTERN, O200K_BASE_PATTERN};
pub use registry::{default_registry, get_encoding, list_encoding_names, Registry};
pub use segment::{Segment, SegmentError, Segmenter};
pub use vocab::{
    load_tiktoken_bpe, load_tiktoken_bpe_file, sha256_hex, Rank, SpecialTokenTable, VocabError,
    Vocabulary,
};
