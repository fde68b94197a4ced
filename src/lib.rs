pub mod core;
#[cfg(feature = "python")]
mod python;

pub use core::{
    get_encoding, list_encoding_names, DecodeErrors, Encoding, EncodingSpec, Rank, Registry,
    SpecialSelection, TokenizerError, CL100K_BASE_PATTERN, ENDOFTEXT, O200K_BASE_PATTERN,
};
