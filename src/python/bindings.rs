//! Python bindings for shardtok encodings.
//!
//! This module provides PyO3 wrappers around [`Encoding`], exposing the
//! tiktoken-style API (`allowed_special` / `disallowed_special`,
//! `errors="replace"`) while the work stays in Rust.
//!
//! # Thread Safety
//!
//! Encodings are immutable and shared through `Arc`. Batch operations and
//! long encodes release the GIL and run on the Rayon pool.
//!
//! # Example
//!
//! ```python
//! from shardtok import get_encoding
//!
//! enc = get_encoding("cl100k_base")
//! tokens = enc.encode("hello <|endoftext|>", allowed_special="all")
//! text = enc.decode(tokens)
//! ```

use std::borrow::Cow;
use std::sync::Arc;

use pyo3::exceptions::{PyIOError, PyKeyError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyBytes, PyDict, PyString};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::core::{
    get_encoding as core_get_encoding, list_encoding_names as core_list_encoding_names,
    sanitize_utf16, DecodeErrors, Encoding, Rank, SpecialSelection, TokenizerError, VocabError,
};

/// Map a core error to the Python exception tiktoken callers expect.
fn to_py_err(err: TokenizerError) -> PyErr {
    match err {
        TokenizerError::VocabError(VocabError::IoError(e)) => PyIOError::new_err(e.to_string()),
        TokenizerError::NotSingleToken { .. } | TokenizerError::UnknownToken(_) => {
            PyKeyError::new_err(err.to_string())
        }
        other => PyValueError::new_err(other.to_string()),
    }
}

/// Python wrapper for a Rust [`Encoding`].
#[pyclass(name = "Encoding", frozen)]
pub struct PyEncoding {
    inner: Arc<Encoding>,
}

#[pymethods]
impl PyEncoding {
    /// Create an encoding from its parts.
    ///
    /// Args:
    ///     name: Identifier used in diagnostics
    ///     pat_str: Content pattern that pre-splits text into pieces
    ///     mergeable_ranks: Dict of bytes to rank
    ///     special_tokens: Dict of special token strings to ids
    ///     explicit_n_vocab: Optional exact total number of ids
    #[new]
    #[pyo3(signature = (name, pat_str, mergeable_ranks, special_tokens, explicit_n_vocab=None))]
    fn new(
        name: &str,
        pat_str: &str,
        mergeable_ranks: &Bound<'_, PyDict>,
        special_tokens: &Bound<'_, PyDict>,
        explicit_n_vocab: Option<usize>,
    ) -> PyResult<Self> {
        let ranks = parse_mergeable_ranks(mergeable_ranks)?;
        let special = parse_special_tokens(special_tokens)?;
        let inner = Encoding::new(name, pat_str, ranks, special, explicit_n_vocab)
            .map_err(to_py_err)?;
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    #[getter]
    fn name(&self) -> &str {
        self.inner.name()
    }

    #[getter]
    fn max_token_value(&self) -> Rank {
        self.inner.max_token_value()
    }

    #[getter]
    fn n_vocab(&self) -> usize {
        self.inner.n_vocab()
    }

    #[getter]
    fn eot_token(&self) -> Option<Rank> {
        self.inner.eot_token()
    }

    #[getter]
    fn special_tokens_set(&self) -> FxHashSet<String> {
        self.inner.special_tokens_set().clone()
    }

    /// Enable or disable JIT compilation for the content pattern.
    ///
    /// Returns:
    ///     New Encoding with the pattern recompiled
    #[pyo3(signature = (use_jit=true))]
    fn jit(&self, use_jit: bool) -> PyResult<Self> {
        let use_pcre2 = self.inner.core().segmenter().uses_pcre2();
        self.rebuilt(use_jit, use_pcre2)
    }

    /// Switch the content pattern to PCRE2 (requires the `pcre2` feature).
    ///
    /// Raises:
    ///     ValueError: If use_pcre2=True and pcre2 feature is not enabled
    #[pyo3(signature = (use_pcre2=true))]
    fn pcre2(&self, use_pcre2: bool) -> PyResult<Self> {
        let use_jit = self.inner.core().segmenter().uses_jit();
        self.rebuilt(use_jit, use_pcre2)
    }

    /// Encode text to token ids.
    ///
    /// Args:
    ///     text: Input text. Unpaired surrogates are replaced before encoding.
    ///     allowed_special: "all" or a set of special tokens to encode as such
    ///     disallowed_special: "all" or a set of special tokens to reject
    ///
    /// Raises:
    ///     ValueError: If the text contains a disallowed special token
    #[pyo3(signature = (text, *, allowed_special=None, disallowed_special=None))]
    fn encode(
        &self,
        py: Python<'_>,
        text: &Bound<'_, PyString>,
        allowed_special: Option<&Bound<'_, PyAny>>,
        disallowed_special: Option<&Bound<'_, PyAny>>,
    ) -> PyResult<Vec<Rank>> {
        let allowed = parse_selection(allowed_special, SpecialSelection::none())?;
        let disallowed = parse_selection(disallowed_special, SpecialSelection::all())?;
        let inner = &self.inner;

        match text.to_str() {
            Ok(text) => py
                .allow_threads(|| inner.encode(text, &allowed, &disallowed))
                .map_err(to_py_err),
            Err(_) => {
                let units = utf16_units(text)?;
                py.allow_threads(|| inner.encode_utf16(&units, &allowed, &disallowed))
                    .map_err(to_py_err)
            }
        }
    }

    /// Encode text, ignoring special tokens entirely.
    fn encode_ordinary(&self, py: Python<'_>, text: &Bound<'_, PyString>) -> PyResult<Vec<Rank>> {
        let inner = &self.inner;
        match text.to_str() {
            Ok(text) => py
                .allow_threads(|| inner.encode_ordinary(text))
                .map_err(to_py_err),
            Err(_) => {
                let units = utf16_units(text)?;
                let none = SpecialSelection::none();
                py.allow_threads(|| inner.encode_utf16(&units, &none, &none))
                    .map_err(to_py_err)
            }
        }
    }

    /// Encode text and report how many trailing tokens may change if more
    /// text is appended.
    ///
    /// Returns:
    ///     Tuple of (tokens, unstable_tail_len)
    #[pyo3(signature = (text, *, allowed_special=None, disallowed_special=None))]
    fn encode_with_tail(
        &self,
        py: Python<'_>,
        text: &Bound<'_, PyString>,
        allowed_special: Option<&Bound<'_, PyAny>>,
        disallowed_special: Option<&Bound<'_, PyAny>>,
    ) -> PyResult<(Vec<Rank>, usize)> {
        let allowed = parse_selection(allowed_special, SpecialSelection::none())?;
        let disallowed = parse_selection(disallowed_special, SpecialSelection::all())?;
        let text = sanitized(text)?;
        let inner = &self.inner;
        py.allow_threads(|| inner.encode_with_tail(&text, &allowed, &disallowed))
            .map_err(to_py_err)
    }

    /// Encode exactly one token given as str or bytes.
    ///
    /// Raises:
    ///     KeyError: If the input is not a single token
    fn encode_single_token(&self, text_or_bytes: &Bound<'_, PyAny>) -> PyResult<Rank> {
        if let Ok(s) = text_or_bytes.downcast::<PyString>() {
            return self
                .inner
                .encode_single_token(s.to_str()?.as_bytes())
                .map_err(to_py_err);
        }
        let bytes = text_or_bytes.downcast::<PyBytes>()?;
        self.inner
            .encode_single_token(bytes.as_bytes())
            .map_err(to_py_err)
    }

    /// Batch encode multiple texts in parallel.
    #[pyo3(signature = (texts, *, allowed_special=None, disallowed_special=None))]
    fn encode_batch(
        &self,
        py: Python<'_>,
        texts: Vec<Bound<'_, PyString>>,
        allowed_special: Option<&Bound<'_, PyAny>>,
        disallowed_special: Option<&Bound<'_, PyAny>>,
    ) -> PyResult<Vec<Vec<Rank>>> {
        let allowed = parse_selection(allowed_special, SpecialSelection::none())?;
        let disallowed = parse_selection(disallowed_special, SpecialSelection::all())?;
        let texts = texts.iter().map(sanitized).collect::<PyResult<Vec<_>>>()?;
        let inner = &self.inner;
        py.allow_threads(|| inner.encode_batch(&texts, &allowed, &disallowed))
            .map_err(to_py_err)
    }

    /// Batch encode multiple texts in parallel, ignoring special tokens.
    fn encode_ordinary_batch(
        &self,
        py: Python<'_>,
        texts: Vec<Bound<'_, PyString>>,
    ) -> PyResult<Vec<Vec<Rank>>> {
        let texts = texts.iter().map(sanitized).collect::<PyResult<Vec<_>>>()?;
        let inner = &self.inner;
        py.allow_threads(|| inner.encode_ordinary_batch(&texts))
            .map_err(to_py_err)
    }

    /// Decode token ids to a string.
    ///
    /// Args:
    ///     tokens: List of token ids
    ///     errors: "replace" (default) or "strict"
    ///
    /// Raises:
    ///     ValueError: With errors="strict", if the bytes are not valid UTF-8
    #[pyo3(signature = (tokens, errors="replace"))]
    fn decode(&self, tokens: Vec<Rank>, errors: &str) -> PyResult<String> {
        let errors = parse_decode_errors(errors)?;
        self.inner.decode(&tokens, errors).map_err(to_py_err)
    }

    /// Decode token ids to bytes.
    fn decode_bytes<'py>(&self, py: Python<'py>, tokens: Vec<Rank>) -> Bound<'py, PyBytes> {
        PyBytes::new(py, &self.inner.decode_bytes(&tokens))
    }

    /// Bytes of a single token.
    ///
    /// Raises:
    ///     KeyError: If the id is unknown
    fn decode_single_token_bytes<'py>(
        &self,
        py: Python<'py>,
        token: Rank,
    ) -> PyResult<Bound<'py, PyBytes>> {
        let bytes = self
            .inner
            .decode_single_token_bytes(token)
            .map_err(to_py_err)?;
        Ok(PyBytes::new(py, &bytes))
    }

    /// Batch decode multiple token lists in parallel.
    #[pyo3(signature = (token_lists, errors="replace"))]
    fn decode_batch(
        &self,
        py: Python<'_>,
        token_lists: Vec<Vec<Rank>>,
        errors: &str,
    ) -> PyResult<Vec<String>> {
        let errors = parse_decode_errors(errors)?;
        let inner = &self.inner;
        py.allow_threads(|| inner.decode_batch(&token_lists, errors))
            .map_err(to_py_err)
    }

    /// Every mergeable byte sequence, sorted bytewise.
    fn token_byte_values<'py>(&self, py: Python<'py>) -> Vec<Bound<'py, PyBytes>> {
        self.inner
            .token_byte_values()
            .iter()
            .map(|b| PyBytes::new(py, b))
            .collect()
    }

    fn is_special_token(&self, token: Rank) -> bool {
        self.inner.is_special_token(token)
    }

    fn __repr__(&self) -> String {
        format!("<Encoding {:?}>", self.inner.name())
    }
}

impl PyEncoding {
    fn rebuilt(&self, use_jit: bool, use_pcre2: bool) -> PyResult<Self> {
        let inner = self
            .inner
            .with_backend(use_jit, use_pcre2)
            .map_err(to_py_err)?;
        Ok(Self {
            inner: Arc::new(inner),
        })
    }
}

/// Look up a named encoding; each name is built once per process.
///
/// Raises:
///     ValueError: If the name is unknown or its vocabulary is malformed
///     OSError: If the vocabulary file cannot be read
#[pyfunction]
pub fn get_encoding(py: Python<'_>, encoding_name: &str) -> PyResult<PyEncoding> {
    let inner = py
        .allow_threads(|| core_get_encoding(encoding_name))
        .map_err(to_py_err)?;
    Ok(PyEncoding { inner })
}

/// Names of every registered encoding.
#[pyfunction]
pub fn list_encoding_names() -> Vec<String> {
    core_list_encoding_names()
}

/// Parse `"all"` or a collection of strings into a selection.
fn parse_selection(
    value: Option<&Bound<'_, PyAny>>,
    default: SpecialSelection,
) -> PyResult<SpecialSelection> {
    let Some(value) = value else {
        return Ok(default);
    };
    if let Ok(s) = value.downcast::<PyString>() {
        let s = s.to_str()?;
        if s == "all" {
            return Ok(SpecialSelection::All);
        }
        return Err(PyValueError::new_err(format!(
            "expected \"all\" or a collection of special tokens, got {s:?}"
        )));
    }
    if let Ok(set) = value.extract::<FxHashSet<String>>() {
        return Ok(SpecialSelection::Only(set));
    }
    let tokens: Vec<String> = value.extract()?;
    Ok(SpecialSelection::only(tokens))
}

fn parse_decode_errors(errors: &str) -> PyResult<DecodeErrors> {
    match errors {
        "replace" => Ok(DecodeErrors::Replace),
        "strict" => Ok(DecodeErrors::Strict),
        other => Err(PyValueError::new_err(format!(
            "unsupported errors mode {other:?}; use \"replace\" or \"strict\""
        ))),
    }
}

/// UTF-16 code units of a Python string, unpaired surrogates included.
fn utf16_units(text: &Bound<'_, PyString>) -> PyResult<Vec<u16>> {
    let encoded = text.call_method1("encode", ("utf-16-le", "surrogatepass"))?;
    let bytes = encoded.downcast::<PyBytes>()?.as_bytes();
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// The text of a Python string, with unpaired surrogates replaced.
fn sanitized<'a>(text: &'a Bound<'_, PyString>) -> PyResult<Cow<'a, str>> {
    match text.to_str() {
        Ok(text) => Ok(Cow::Borrowed(text)),
        Err(_) => {
            tracing::warn!("input holds unpaired surrogates; encoding sanitized text");
            Ok(Cow::Owned(sanitize_utf16(&utf16_units(text)?)))
        }
    }
}

/// Parse mergeable ranks from a Python dict of bytes to int.
fn parse_mergeable_ranks(ranks: &Bound<'_, PyDict>) -> PyResult<FxHashMap<Vec<u8>, Rank>> {
    let mut result = FxHashMap::with_capacity_and_hasher(ranks.len(), Default::default());
    for (key, value) in ranks.iter() {
        let k = key.downcast::<PyBytes>()?.as_bytes().to_vec();
        let v: Rank = value.extract()?;
        result.insert(k, v);
    }
    Ok(result)
}

/// Parse special tokens from Python dict to FxHashMap.
fn parse_special_tokens(special_tokens: &Bound<'_, PyDict>) -> PyResult<FxHashMap<String, Rank>> {
    let mut result = FxHashMap::default();
    for (key, value) in special_tokens.iter() {
        let k: String = key.extract()?;
        let v: Rank = value.extract()?;
        result.insert(k, v);
    }
    Ok(result)
}
