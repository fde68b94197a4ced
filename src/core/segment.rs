//! Text segmentation: special-token scanning plus content-pattern splitting.
//!
//! Input text is cut at every *allowed* special-token occurrence. Special
//! tokens that are present but not allowed are ordinary text at this layer;
//! rejecting them is the facade's job. Each plain-text span between
//! special tokens is then split into pieces by the content pattern, so
//! content matches never cross a special-token boundary.

use aho_corasick::{AhoCorasick, Input, MatchKind};
use regexr::{Regex as RegexrRegex, RegexBuilder};
use rustc_hash::FxHashSet;
use thiserror::Error;

#[cfg(feature = "pcre2")]
use pcre2::bytes::Regex as Pcre2Regex;

#[derive(Error, Debug)]
pub enum SegmentError {
    #[error("Regex compilation error (regexr): {0}")]
    RegexrError(#[from] regexr::Error),
    #[cfg(feature = "pcre2")]
    #[error("Regex compilation error (PCRE2): {0}")]
    Pcre2Error(#[from] pcre2::Error),
    #[error("Special token matcher build error: {0}")]
    AhoCorasickError(#[from] aho_corasick::BuildError),
    #[error("PCRE2 feature not enabled. Compile with --features pcre2")]
    Pcre2NotEnabled,
}

/// Content-pattern backend: regexr by default, PCRE2 behind the `pcre2` feature.
enum RegexBackend {
    Regexr(Box<RegexrRegex>),
    #[cfg(feature = "pcre2")]
    Pcre2(Pcre2Regex),
}

impl RegexBackend {
    fn build(pattern: &str, use_jit: bool, use_pcre2: bool) -> Result<Self, SegmentError> {
        if use_pcre2 {
            return Self::build_pcre2(pattern, use_jit);
        }
        let regex = RegexBuilder::new(pattern).jit(use_jit).build()?;
        Ok(RegexBackend::Regexr(Box::new(regex)))
    }

    #[cfg(feature = "pcre2")]
    fn build_pcre2(pattern: &str, use_jit: bool) -> Result<Self, SegmentError> {
        let mut builder = pcre2::bytes::RegexBuilder::new();
        if use_jit {
            builder.jit_if_available(true);
        }
        builder.utf(true);
        builder.ucp(true);
        Ok(RegexBackend::Pcre2(builder.build(pattern)?))
    }

    #[cfg(not(feature = "pcre2"))]
    fn build_pcre2(_pattern: &str, _use_jit: bool) -> Result<Self, SegmentError> {
        Err(SegmentError::Pcre2NotEnabled)
    }

    /// All matches in `text` as `(start, end)` byte offsets.
    fn find_iter(&self, text: &str) -> Vec<(usize, usize)> {
        match self {
            RegexBackend::Regexr(regex) => regex
                .find_iter(text)
                .map(|m| (m.start(), m.end()))
                .collect(),
            #[cfg(feature = "pcre2")]
            RegexBackend::Pcre2(regex) => regex
                .find_iter(text.as_bytes())
                .filter_map(|m| m.ok())
                .map(|m| (m.start(), m.end()))
                .collect(),
        }
    }
}

/// A plain-text span, optionally terminated by an allowed special token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment<'t> {
    pub start: usize,
    pub end: usize,
    /// The special token text found at `end`, if any.
    pub special: Option<&'t str>,
}

/// Splits text into segments and segments into pieces.
pub struct Segmenter {
    content: RegexBackend,
    pattern: String,
    special: Option<AhoCorasick>,
    /// Byte length of the longest special token.
    max_special_len: usize,
    use_jit: bool,
    use_pcre2: bool,
}

impl Segmenter {
    /// Compile the content pattern and the special-token matcher.
    ///
    /// The matcher holds every special token as an exact literal and is
    /// searched with overlapping semantics, so the result never depends on the
    /// order `special_tokens` is given in.
    pub fn new(pattern: &str, special_tokens: &[&str]) -> Result<Self, SegmentError> {
        Self::with_options(pattern, special_tokens, true, false)
    }

    pub fn with_options(
        pattern: &str,
        special_tokens: &[&str],
        use_jit: bool,
        use_pcre2: bool,
    ) -> Result<Self, SegmentError> {
        let content = RegexBackend::build(pattern, use_jit, use_pcre2)?;
        let special = if special_tokens.is_empty() {
            None
        } else {
            Some(
                AhoCorasick::builder()
                    .match_kind(MatchKind::Standard)
                    .build(special_tokens)?,
            )
        };

        Ok(Self {
            content,
            pattern: pattern.to_string(),
            special,
            max_special_len: special_tokens.iter().map(|t| t.len()).max().unwrap_or(0),
            use_jit,
            use_pcre2,
        })
    }

    /// Rebuild the content pattern with a different backend configuration.
    pub(crate) fn rebuild(&mut self, use_jit: bool, use_pcre2: bool) -> Result<(), SegmentError> {
        self.content = RegexBackend::build(&self.pattern, use_jit, use_pcre2)?;
        self.use_jit = use_jit;
        self.use_pcre2 = use_pcre2;
        Ok(())
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn uses_jit(&self) -> bool {
        self.use_jit
    }

    pub fn uses_pcre2(&self) -> bool {
        self.use_pcre2
    }

    /// Split one plain-text span into pieces with the content pattern.
    #[inline]
    pub fn pieces(&self, text: &str) -> Vec<(usize, usize)> {
        self.content.find_iter(text)
    }

    /// Leftmost special token at or after `from` for which `accept` holds.
    ///
    /// Among accepted tokens starting at the same offset the longest wins.
    /// Tokens that are rejected never hide an accepted one, even when they
    /// overlap it.
    pub fn find_special_where<'t, F>(
        &self,
        text: &'t str,
        from: usize,
        accept: F,
    ) -> Option<(usize, usize, &'t str)>
    where
        F: Fn(&str) -> bool,
    {
        let matcher = self.special.as_ref()?;
        if from >= text.len() {
            return None;
        }

        // Overlapping matches arrive in order of end offset, so once a match
        // ends past `best.start + max_special_len` nothing can start at or
        // before `best.start` any more.
        let mut best: Option<(usize, usize)> = None;
        for m in matcher.find_overlapping_iter(Input::new(text).span(from..text.len())) {
            if let Some((start, _)) = best {
                if m.end() > start + self.max_special_len {
                    break;
                }
            }
            if !accept(&text[m.start()..m.end()]) {
                continue;
            }
            best = match best {
                Some((start, end)) if start < m.start() || (start == m.start() && end >= m.end()) => {
                    Some((start, end))
                }
                _ => Some((m.start(), m.end())),
            };
        }
        best.map(|(start, end)| (start, end, &text[start..end]))
    }

    /// Find the next special token at or after `from` whose text is in
    /// `allowed`, looking past any that are not.
    pub fn next_allowed_special<'t>(
        &self,
        text: &'t str,
        from: usize,
        allowed: &FxHashSet<&str>,
    ) -> Option<(usize, usize, &'t str)> {
        if allowed.is_empty() {
            return None;
        }
        self.find_special_where(text, from, |token| allowed.contains(token))
    }

    /// Leftmost special token occurrence in `text`, allowed or not.
    pub fn find_special<'t>(&self, text: &'t str) -> Option<&'t str> {
        self.find_special_where(text, 0, |_| true)
            .map(|(_, _, token)| token)
    }

    /// Iterate over the segments of `text` in order.
    pub fn segments<'s, 't, 'a>(
        &'s self,
        text: &'t str,
        allowed: &'a FxHashSet<&'a str>,
    ) -> Segments<'s, 't, 'a> {
        Segments {
            segmenter: self,
            text,
            allowed,
            cursor: Some(0),
        }
    }
}

/// Iterator returned by [`Segmenter::segments`].
///
/// Always yields at least one segment; the last one has no special token.
pub struct Segments<'s, 't, 'a> {
    segmenter: &'s Segmenter,
    text: &'t str,
    allowed: &'a FxHashSet<&'a str>,
    cursor: Option<usize>,
}

impl<'t> Iterator for Segments<'_, 't, '_> {
    type Item = Segment<'t>;

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.cursor?;
        match self
            .segmenter
            .next_allowed_special(self.text, start, self.allowed)
        {
            Some((special_start, special_end, token)) => {
                self.cursor = Some(special_end);
                Some(Segment {
                    start,
                    end: special_start,
                    special: Some(token),
                })
            }
            None => {
                self.cursor = None;
                Some(Segment {
                    start,
                    end: self.text.len(),
                    special: None,
                })
            }
        }
    }
}
