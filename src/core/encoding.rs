use aho_corasick::{AhoCorasick, MatchKind};
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use super::bpe::MergeError;
use super::codec::CoreBpe;
use super::segment::{SegmentError, Segmenter};
use super::vocab::{Rank, SpecialTokenTable, VocabError, Vocabulary};

/// Special token string most encodings use to mark end of text.
pub const ENDOFTEXT: &str = "<|endoftext|>";

#[derive(Error, Debug)]
pub enum TokenizerError {
    #[error(transparent)]
    SegmentError(#[from] SegmentError),
    #[error("Vocabulary error: {0}")]
    VocabError(#[from] VocabError),
    #[error("Corrupt vocabulary: {0}")]
    MergeError(#[from] MergeError),
    #[error(
        "Encountered text corresponding to disallowed special token {token:?}.\n\
         Pass it in `allowed` to encode it as a special token, or leave it out of \
         `disallowed` to encode it as ordinary text."
    )]
    DisallowedSpecial { token: String },
    #[error("Vocabulary size mismatch: {mergeable} mergeable + {special} special != {expected}")]
    VocabSizeMismatch {
        mergeable: usize,
        special: usize,
        expected: usize,
    },
    #[error("Max token value {actual} does not match declared vocabulary size {expected}")]
    MaxTokenMismatch { actual: Rank, expected: usize },
    #[error("Token id {id} is used by both the vocabulary and special token {token:?}")]
    OverlappingIds { id: Rank, token: String },
    #[error("Decoding error: invalid UTF-8 at byte offset {offset}")]
    InvalidUtf8 { offset: usize },
    #[error("{token:?} is not a single token")]
    NotSingleToken { token: String },
    #[error("Unknown token id {0}")]
    UnknownToken(Rank),
    #[error("Unknown encoding {name:?}. Known encodings: {available}")]
    UnknownEncoding { name: String, available: String },
}

/// Which special tokens an encode call refers to.
///
/// Used for both the allowed and the disallowed side; resolved to a concrete
/// set of token strings before anything else happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecialSelection {
    /// Every special token the encoding knows. For the disallowed side this
    /// means every special token not explicitly allowed.
    All,
    /// Exactly these token strings.
    Only(FxHashSet<String>),
}

impl SpecialSelection {
    pub fn all() -> Self {
        Self::All
    }

    pub fn none() -> Self {
        Self::Only(FxHashSet::default())
    }

    pub fn only<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Only(tokens.into_iter().map(Into::into).collect())
    }
}

impl Default for SpecialSelection {
    /// The empty selection, the default for the allowed side.
    fn default() -> Self {
        Self::none()
    }
}

/// How `decode` handles byte sequences that are not valid UTF-8.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DecodeErrors {
    /// Fail with the offset of the first invalid byte.
    Strict,
    /// Substitute U+FFFD for each invalid sequence.
    #[default]
    Replace,
}

/// Everything needed to build an [`Encoding`].
#[derive(Debug, Clone)]
pub struct EncodingSpec {
    pub name: String,
    pub pat_str: String,
    pub mergeable_ranks: FxHashMap<Vec<u8>, Rank>,
    pub special_tokens: FxHashMap<String, Rank>,
    pub explicit_n_vocab: Option<usize>,
}

/// A named byte-level BPE encoding.
///
/// Immutable after construction and safe to share across threads; encode
/// and decode take `&self` and never lock.
///
/// ```ignore
/// let enc = Encoding::new("toy", r"\S+|\s+", ranks, specials, None)?;
/// let ids = enc.encode("hello<|endoftext|>", &SpecialSelection::all(), &SpecialSelection::none())?;
/// assert_eq!(enc.decode(&ids, DecodeErrors::Strict)?, "hello<|endoftext|>");
/// ```
pub struct Encoding {
    name: String,
    core: CoreBpe,
    special_tokens_set: FxHashSet<String>,
    max_token_value: Rank,
}

impl Encoding {
    /// Build an encoding from its parts.
    ///
    /// # Arguments
    /// * `name` - Identifier, used only in diagnostics
    /// * `pat_str` - Content pattern that pre-splits text into pieces
    /// * `mergeable_ranks` - Byte sequence → rank; must hold every single byte
    /// * `special_tokens` - Special token string → id, disjoint from the ranks
    /// * `explicit_n_vocab` - If given, the exact total number of ids
    pub fn new(
        name: &str,
        pat_str: &str,
        mergeable_ranks: FxHashMap<Vec<u8>, Rank>,
        special_tokens: FxHashMap<String, Rank>,
        explicit_n_vocab: Option<usize>,
    ) -> Result<Self, TokenizerError> {
        let vocab = Vocabulary::new(mergeable_ranks)?;
        let special = SpecialTokenTable::new(special_tokens)?;

        for (token, &id) in special.encoder() {
            if vocab.contains_rank(id) {
                return Err(TokenizerError::OverlappingIds {
                    id,
                    token: token.clone(),
                });
            }
        }

        let max_token_value = vocab.max_rank().max(special.max_id().unwrap_or(0));
        if let Some(expected) = explicit_n_vocab {
            if vocab.len() + special.len() != expected {
                return Err(TokenizerError::VocabSizeMismatch {
                    mergeable: vocab.len(),
                    special: special.len(),
                    expected,
                });
            }
            if max_token_value as usize + 1 != expected {
                return Err(TokenizerError::MaxTokenMismatch {
                    actual: max_token_value,
                    expected,
                });
            }
        }

        let special_strings = special.tokens();
        let segmenter = Segmenter::new(pat_str, &special_strings)?;
        let special_tokens_set = special_strings.iter().map(|s| s.to_string()).collect();

        tracing::debug!(
            name,
            mergeable = vocab.len(),
            special = special.len(),
            max_token_value,
            "built encoding"
        );

        Ok(Self {
            name: name.to_string(),
            core: CoreBpe::new(vocab, special, segmenter),
            special_tokens_set,
            max_token_value,
        })
    }

    pub fn from_spec(spec: EncodingSpec) -> Result<Self, TokenizerError> {
        Self::new(
            &spec.name,
            &spec.pat_str,
            spec.mergeable_ranks,
            spec.special_tokens,
            spec.explicit_n_vocab,
        )
    }

    /// Enable or disable JIT compilation for the content pattern.
    pub fn jit(mut self, use_jit: bool) -> Result<Self, TokenizerError> {
        let use_pcre2 = self.core.segmenter().uses_pcre2();
        self.core.segmenter_mut().rebuild(use_jit, use_pcre2)?;
        Ok(self)
    }

    /// Switch the content pattern to the PCRE2 backend (needs the `pcre2`
    /// feature) or back to regexr.
    pub fn pcre2(mut self, use_pcre2: bool) -> Result<Self, TokenizerError> {
        let use_jit = self.core.segmenter().uses_jit();
        self.core.segmenter_mut().rebuild(use_jit, use_pcre2)?;
        Ok(self)
    }

    /// A copy of this encoding with the content pattern recompiled for the
    /// given backend. Tables are copied; `self` is left untouched.
    pub fn with_backend(&self, use_jit: bool, use_pcre2: bool) -> Result<Self, TokenizerError> {
        let special_strings = self.core.special().tokens();
        let segmenter =
            Segmenter::with_options(self.pattern(), &special_strings, use_jit, use_pcre2)?;
        Ok(Self {
            name: self.name.clone(),
            core: CoreBpe::new(
                self.core.vocab().clone(),
                self.core.special().clone(),
                segmenter,
            ),
            special_tokens_set: self.special_tokens_set.clone(),
            max_token_value: self.max_token_value,
        })
    }

    // ====================
    // Encoding
    // ====================

    /// Encode `text`, enforcing the special-token policy.
    ///
    /// Fails with [`TokenizerError::DisallowedSpecial`] if the text contains
    /// a disallowed special token, before encoding anything.
    pub fn encode(
        &self,
        text: &str,
        allowed: &SpecialSelection,
        disallowed: &SpecialSelection,
    ) -> Result<Vec<Rank>, TokenizerError> {
        self.encode_with_tail(text, allowed, disallowed)
            .map(|(tokens, _)| tokens)
    }

    /// Like [`encode`](Self::encode), also returning how many trailing tokens
    /// came from the final piece and could change if text were appended.
    pub fn encode_with_tail(
        &self,
        text: &str,
        allowed: &SpecialSelection,
        disallowed: &SpecialSelection,
    ) -> Result<(Vec<Rank>, usize), TokenizerError> {
        let allowed = self.resolve_allowed(allowed);
        let disallowed = self.resolve_disallowed(disallowed, &allowed);
        if let Some(token) = self.find_special(text, &disallowed)? {
            return Err(TokenizerError::DisallowedSpecial { token });
        }
        Ok(self.core.encode_native(text, &allowed)?)
    }

    /// Encode UTF-16 text that may hold unpaired surrogates.
    ///
    /// Well-formed input encodes exactly like [`encode`](Self::encode).
    /// Otherwise the units are written out as generalized UTF-8 (each lone
    /// surrogate as its 3-byte form), decoded back with U+FFFD for every
    /// invalid byte, and the result is encoded once more.
    pub fn encode_utf16(
        &self,
        units: &[u16],
        allowed: &SpecialSelection,
        disallowed: &SpecialSelection,
    ) -> Result<Vec<Rank>, TokenizerError> {
        match String::from_utf16(units) {
            Ok(text) => self.encode(&text, allowed, disallowed),
            Err(_) => {
                tracing::warn!(
                    encoding = %self.name,
                    "input holds unpaired surrogates; encoding sanitized text"
                );
                self.encode(&sanitize_utf16(units), allowed, disallowed)
            }
        }
    }

    /// Encode with no special-token handling: special token text is
    /// encoded as ordinary text and never rejected.
    pub fn encode_ordinary(&self, text: &str) -> Result<Vec<Rank>, TokenizerError> {
        Ok(self.core.encode_ordinary(text)?)
    }

    /// Look up the id of exactly one token, vocabulary first.
    pub fn encode_single_token(&self, bytes: &[u8]) -> Result<Rank, TokenizerError> {
        self.core
            .encode_single_token(bytes)
            .ok_or_else(|| TokenizerError::NotSingleToken {
                token: String::from_utf8_lossy(bytes).into_owned(),
            })
    }

    /// Batch encode multiple texts in parallel.
    pub fn encode_batch<S: AsRef<str> + Sync>(
        &self,
        texts: &[S],
        allowed: &SpecialSelection,
        disallowed: &SpecialSelection,
    ) -> Result<Vec<Vec<Rank>>, TokenizerError> {
        texts
            .par_iter()
            .map(|text| self.encode(text.as_ref(), allowed, disallowed))
            .collect()
    }

    /// Batch encode multiple texts in parallel, ignoring special tokens.
    pub fn encode_ordinary_batch<S: AsRef<str> + Sync>(
        &self,
        texts: &[S],
    ) -> Result<Vec<Vec<Rank>>, TokenizerError> {
        texts
            .par_iter()
            .map(|text| self.encode_ordinary(text.as_ref()))
            .collect()
    }

    // ====================
    // Decoding
    // ====================

    /// Decode token ids to bytes. Unknown ids are skipped.
    pub fn decode_bytes(&self, tokens: &[Rank]) -> Vec<u8> {
        self.core.decode_bytes(tokens)
    }

    /// Decode token ids to text.
    ///
    /// Merged byte spans need not end on character boundaries, so
    /// [`DecodeErrors::Replace`] is the usual choice.
    pub fn decode(&self, tokens: &[Rank], errors: DecodeErrors) -> Result<String, TokenizerError> {
        let bytes = self.decode_bytes(tokens);
        match errors {
            DecodeErrors::Strict => String::from_utf8(bytes).map_err(|e| {
                TokenizerError::InvalidUtf8 {
                    offset: e.utf8_error().valid_up_to(),
                }
            }),
            DecodeErrors::Replace => Ok(match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
            }),
        }
    }

    /// Bytes of a single token. Unlike [`decode_bytes`](Self::decode_bytes),
    /// an unknown id is an error.
    pub fn decode_single_token_bytes(&self, token: Rank) -> Result<Vec<u8>, TokenizerError> {
        self.core
            .decode_single_token_bytes(token)
            .map(<[u8]>::to_vec)
            .ok_or(TokenizerError::UnknownToken(token))
    }

    /// Batch decode multiple token lists in parallel.
    pub fn decode_batch(
        &self,
        token_lists: &[Vec<Rank>],
        errors: DecodeErrors,
    ) -> Result<Vec<String>, TokenizerError> {
        token_lists
            .par_iter()
            .map(|tokens| self.decode(tokens, errors))
            .collect()
    }

    /// Batch decode multiple token lists to bytes in parallel.
    pub fn decode_bytes_batch(&self, token_lists: &[Vec<Rank>]) -> Vec<Vec<u8>> {
        token_lists
            .par_iter()
            .map(|tokens| self.decode_bytes(tokens))
            .collect()
    }

    // ====================
    // Accessors
    // ====================

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pattern(&self) -> &str {
        self.core.segmenter().pattern()
    }

    /// The largest id across the vocabulary and the special tokens.
    pub fn max_token_value(&self) -> Rank {
        self.max_token_value
    }

    pub fn n_vocab(&self) -> usize {
        self.max_token_value as usize + 1
    }

    pub fn special_tokens_set(&self) -> &FxHashSet<String> {
        &self.special_tokens_set
    }

    pub fn eot_token(&self) -> Option<Rank> {
        self.core.special().id(ENDOFTEXT)
    }

    pub fn is_special_token(&self, token: Rank) -> bool {
        self.core.special().token(token).is_some()
    }

    /// Every mergeable byte sequence, sorted bytewise.
    pub fn token_byte_values(&self) -> Vec<Vec<u8>> {
        self.core.vocab().sorted_token_bytes()
    }

    pub fn core(&self) -> &CoreBpe {
        &self.core
    }

    // ====================
    // Policy
    // ====================

    fn resolve_allowed<'a>(&'a self, allowed: &'a SpecialSelection) -> FxHashSet<&'a str> {
        match allowed {
            SpecialSelection::All => self.special_tokens_set.iter().map(String::as_str).collect(),
            SpecialSelection::Only(set) => set.iter().map(String::as_str).collect(),
        }
    }

    fn resolve_disallowed<'a>(
        &'a self,
        disallowed: &'a SpecialSelection,
        allowed: &FxHashSet<&str>,
    ) -> FxHashSet<&'a str> {
        match disallowed {
            SpecialSelection::All => self
                .special_tokens_set
                .iter()
                .map(String::as_str)
                .filter(|s| !allowed.contains(s))
                .collect(),
            SpecialSelection::Only(set) => set.iter().map(String::as_str).collect(),
        }
    }

    /// Leftmost literal occurrence in `text` of any token in `tokens`.
    ///
    /// Sets made only of this encoding's special tokens go through the
    /// segmenter's prebuilt matcher. Any other string forces a one-off matcher.
    fn find_special(
        &self,
        text: &str,
        tokens: &FxHashSet<&str>,
    ) -> Result<Option<String>, TokenizerError> {
        if tokens.is_empty() {
            return Ok(None);
        }
        if tokens.iter().all(|t| self.special_tokens_set.contains(*t)) {
            return Ok(self
                .core
                .segmenter()
                .find_special_where(text, 0, |token| tokens.contains(token))
                .map(|(_, _, token)| token.to_string()));
        }

        let patterns: Vec<&str> = tokens.iter().copied().filter(|t| !t.is_empty()).collect();
        if patterns.is_empty() {
            return Ok(None);
        }
        let matcher = AhoCorasick::builder()
            .match_kind(MatchKind::LeftmostLongest)
            .build(&patterns)
            .map_err(SegmentError::from)?;
        Ok(matcher
            .find(text)
            .map(|m| patterns[m.pattern().as_usize()].to_string()))
    }
}

impl std::fmt::Debug for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encoding")
            .field("name", &self.name)
            .field("n_vocab", &self.n_vocab())
            .field("special_tokens", &self.special_tokens_set.len())
            .finish()
    }
}

/// Turn UTF-16 units into a `String`, replacing each unpaired surrogate with
/// three U+FFFD (one per byte of its generalized UTF-8 form).
pub fn sanitize_utf16(units: &[u16]) -> String {
    String::from_utf8_lossy(&utf16_to_wtf8(units)).into_owned()
}

/// Write UTF-16 units as UTF-8, encoding unpaired surrogates as 3-byte
/// sequences instead of failing.
fn utf16_to_wtf8(units: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(units.len() * 3);
    for unit in char::decode_utf16(units.iter().copied()) {
        match unit {
            Ok(c) => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
            Err(e) => {
                let cp = e.unpaired_surrogate();
                out.push(0xE0 | (cp >> 12) as u8);
                out.push(0x80 | ((cp >> 6) & 0x3F) as u8);
                out.push(0x80 | (cp & 0x3F) as u8);
            }
        }
    }
    out
}
