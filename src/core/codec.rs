//! Raw encode/decode over the vocabulary, special tokens and segmenter.
//!
//! No policy lives here: the caller hands over an already-resolved set of
//! allowed special tokens, and decode never fails on unknown ids.

use rustc_hash::FxHashSet;

use super::bpe::{byte_pair_encode, MergeError};
use super::segment::Segmenter;
use super::vocab::{Rank, SpecialTokenTable, Vocabulary};

/// The encoding core: tables plus compiled patterns, immutable after build.
pub struct CoreBpe {
    vocab: Vocabulary,
    special: SpecialTokenTable,
    segmenter: Segmenter,
}

impl CoreBpe {
    pub fn new(vocab: Vocabulary, special: SpecialTokenTable, segmenter: Segmenter) -> Self {
        Self {
            vocab,
            special,
            segmenter,
        }
    }

    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    pub fn special(&self) -> &SpecialTokenTable {
        &self.special
    }

    pub fn segmenter(&self) -> &Segmenter {
        &self.segmenter
    }

    pub(crate) fn segmenter_mut(&mut self) -> &mut Segmenter {
        &mut self.segmenter
    }

    /// Encode one content span, appending to `out`.
    ///
    /// Returns the number of tokens produced by the span's last piece.
    fn encode_span(&self, text: &str, out: &mut Vec<Rank>) -> Result<usize, MergeError> {
        let mut last_piece_len = 0;
        for (start, end) in self.segmenter.pieces(text) {
            let piece = text[start..end].as_bytes();
            if let Some(rank) = self.vocab.rank(piece) {
                out.push(rank);
                last_piece_len = 1;
                continue;
            }
            let tokens = byte_pair_encode(piece, self.vocab.encoder())?;
            last_piece_len = tokens.len();
            out.extend(tokens);
        }
        Ok(last_piece_len)
    }

    /// Encode `text`, treating occurrences of `allowed` special tokens as
    /// their reserved ids.
    ///
    /// Returns the tokens and how many trailing tokens came from the last
    /// piece of the final content span. That count is zero when the text
    /// ends in a special token. Tokens before it cannot change if more text
    /// is appended.
    pub fn encode_native(
        &self,
        text: &str,
        allowed: &FxHashSet<&str>,
    ) -> Result<(Vec<Rank>, usize), MergeError> {
        let mut out = Vec::with_capacity(text.len() / 3 + 1);
        let mut last_piece_len = 0;

        for segment in self.segmenter.segments(text, allowed) {
            last_piece_len = self.encode_span(&text[segment.start..segment.end], &mut out)?;
            if let Some(token) = segment.special {
                // The segmenter only reports tokens it was built from.
                if let Some(id) = self.special.id(token) {
                    out.push(id);
                }
                last_piece_len = 0;
            }
        }

        Ok((out, last_piece_len))
    }

    /// Encode `text` with no special-token handling at all.
    pub fn encode_ordinary(&self, text: &str) -> Result<Vec<Rank>, MergeError> {
        let mut out = Vec::with_capacity(text.len() / 3 + 1);
        self.encode_span(text, &mut out)?;
        Ok(out)
    }

    /// Exact lookup of one token's bytes: vocabulary first, then specials.
    pub fn encode_single_token(&self, bytes: &[u8]) -> Option<Rank> {
        if let Some(rank) = self.vocab.rank(bytes) {
            return Some(rank);
        }
        std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| self.special.id(s))
    }

    /// Bytes for a single id, or `None` if neither table knows it.
    pub fn decode_single_token_bytes(&self, token: Rank) -> Option<&[u8]> {
        self.vocab
            .bytes(token)
            .or_else(|| self.special.token(token).map(str::as_bytes))
    }

    /// Concatenated bytes for `tokens`. Unknown ids contribute nothing.
    pub fn decode_bytes(&self, tokens: &[Rank]) -> Vec<u8> {
        let mut result = Vec::with_capacity(tokens.len() * 4);
        for &token in tokens {
            match self.decode_single_token_bytes(token) {
                Some(bytes) => result.extend_from_slice(bytes),
                None => tracing::trace!(token, "skipping unknown token id"),
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap;

    fn make_core() -> CoreBpe {
        let mut encoder = FxHashMap::default();
        for b in 0u8..=255 {
            encoder.insert(vec![b], b as Rank);
        }
        encoder.insert(b"hi".to_vec(), 256);
        encoder.insert(b"by".to_vec(), 257);
        encoder.insert(b"bye".to_vec(), 258);
        encoder.insert(b" b".to_vec(), 259);

        let mut special = FxHashMap::default();
        special.insert("<|endoftext|>".to_string(), 300);
        special.insert("<|pad|>".to_string(), 301);

        let segmenter = Segmenter::new(r" ?\w+|\s+|[^\s\w]+", &["<|endoftext|>", "<|pad|>"]).unwrap();
        CoreBpe::new(
            Vocabulary::new(encoder).unwrap(),
            SpecialTokenTable::new(special).unwrap(),
            segmenter,
        )
    }

    #[test]
    fn test_encode_native_with_allowed_special() {
        let core = make_core();
        let allowed: FxHashSet<&str> = ["<|endoftext|>"].into_iter().collect();
        let (tokens, last) = core.encode_native("hi<|endoftext|>bye", &allowed).unwrap();
        assert_eq!(tokens, vec![256, 300, 258]);
        assert_eq!(last, 1);
    }

    #[test]
    fn test_encode_native_trailing_special_resets_tail() {
        let core = make_core();
        let allowed: FxHashSet<&str> = ["<|pad|>"].into_iter().collect();
        let (tokens, last) = core.encode_native("hi<|pad|>", &allowed).unwrap();
        assert_eq!(tokens, vec![256, 301]);
        assert_eq!(last, 0);
    }

    #[test]
    fn test_encode_native_last_piece_count() {
        let core = make_core();
        let (tokens, last) = core.encode_native("hi xyz", &FxHashSet::default()).unwrap();
        // " xyz" is not a token and has no merges: four byte tokens.
        assert_eq!(tokens, vec![256, b' ' as Rank, b'x' as Rank, b'y' as Rank, b'z' as Rank]);
        assert_eq!(last, 4);
    }

    #[test]
    fn test_encode_ordinary_ignores_specials() {
        let core = make_core();
        let tokens = core.encode_ordinary("<|pad|>").unwrap();
        assert!(!tokens.contains(&301));
        assert_eq!(core.decode_bytes(&tokens), b"<|pad|>");
    }

    #[test]
    fn test_decode_skips_unknown_ids() {
        let core = make_core();
        assert_eq!(core.decode_bytes(&[256, 99_999, 300]), b"hi<|endoftext|>");
        assert_eq!(core.decode_bytes(&[99_999]), b"");
    }

    #[test]
    fn test_single_token_lookups() {
        let core = make_core();
        assert_eq!(core.encode_single_token(b"bye"), Some(258));
        assert_eq!(core.encode_single_token(b"<|pad|>"), Some(301));
        assert_eq!(core.encode_single_token(b"nope"), None);
        assert_eq!(core.decode_single_token_bytes(259), Some(b" b".as_slice()));
        assert_eq!(core.decode_single_token_bytes(1234), None);
    }
}
