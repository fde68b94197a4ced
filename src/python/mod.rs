mod bindings;

use crate::core::{CL100K_BASE_PATTERN, ENDOFTEXT, O200K_BASE_PATTERN};
pub use bindings::{get_encoding, list_encoding_names, PyEncoding};

use pyo3::prelude::*;

/// shardtok - byte-level BPE tokenizer with Python bindings
///
/// - tiktoken-compatible `Encoding` with allowed/disallowed special tokens
/// - Regexr with JIT (default), optional PCRE2 (requires `pcre2` feature)
/// - Rayon parallelism for batch operations
/// - Linked-list BPE merging with a heap for long pieces
/// - Named encodings built once per process and shared
#[pymodule]
fn _core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyEncoding>()?;
    m.add_function(wrap_pyfunction!(get_encoding, m)?)?;
    m.add_function(wrap_pyfunction!(list_encoding_names, m)?)?;
    m.add("CL100K_BASE_PATTERN", CL100K_BASE_PATTERN)?;
    m.add("O200K_BASE_PATTERN", O200K_BASE_PATTERN)?;
    m.add("ENDOFTEXT", ENDOFTEXT)?;
    Ok(())
}
