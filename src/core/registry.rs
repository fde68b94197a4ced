//! Process-wide lookup of named encodings.
//!
//! Building an encoding parses a vocabulary of 100k+ entries, so each name is
//! constructed at most once and the result is shared. Each name maps to a
//! slot holding its constructor, a completion cell checked without locking,
//! and an init mutex; the cell is checked again under the mutex before
//! constructing. Re-registering a name swaps in a fresh slot, so a cached
//! encoding always comes from the constructor stored beside it.

use std::sync::{Arc, LazyLock, Mutex, OnceLock, PoisonError};

use rustc_hash::FxHashMap;

use super::encoding::{Encoding, EncodingSpec, TokenizerError};
use super::openai_public;

/// Produces the parts of a named encoding.
pub type Constructor = dyn Fn() -> Result<EncodingSpec, TokenizerError> + Send + Sync;

struct Slot {
    constructor: Box<Constructor>,
    ready: OnceLock<Arc<Encoding>>,
    init: Mutex<()>,
}

impl Slot {
    fn new(constructor: Box<Constructor>) -> Self {
        Self {
            constructor,
            ready: OnceLock::new(),
            init: Mutex::new(()),
        }
    }
}

/// Name → constructor table with a construct-once cache.
#[derive(Default)]
pub struct Registry {
    slots: Mutex<FxHashMap<String, Arc<Slot>>>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the public OpenAI encodings.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register("cl100k_base", openai_public::cl100k_base);
        registry.register("o200k_base", openai_public::o200k_base);
        registry
    }

    /// Register (or replace) the constructor for `name`.
    ///
    /// Replacing a constructor drops any encoding already built from the old
    /// one. A construction still running from the old constructor finishes
    /// for its own caller but is never cached under `name`.
    pub fn register<F>(&self, name: &str, constructor: F)
    where
        F: Fn() -> Result<EncodingSpec, TokenizerError> + Send + Sync + 'static,
    {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::new(Slot::new(Box::new(constructor))));
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort_unstable();
        names
    }

    /// Whether `name` has already been constructed.
    pub fn is_loaded(&self, name: &str) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .is_some_and(|slot| slot.ready.get().is_some())
    }

    /// Get the encoding for `name`, constructing it on first use.
    ///
    /// Concurrent first calls construct once; the others wait and share the
    /// result. A failed construction is not cached.
    pub fn get(&self, name: &str) -> Result<Arc<Encoding>, TokenizerError> {
        let found = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned();
        let slot = found.ok_or_else(|| TokenizerError::UnknownEncoding {
            name: name.to_string(),
            available: self.names().join(", "),
        })?;

        if let Some(encoding) = slot.ready.get() {
            return Ok(Arc::clone(encoding));
        }

        let _guard = slot.init.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(encoding) = slot.ready.get() {
            return Ok(Arc::clone(encoding));
        }

        let encoding = Arc::new(Encoding::from_spec((slot.constructor)()?)?);
        tracing::info!(
            name,
            n_vocab = encoding.n_vocab(),
            "constructed named encoding"
        );
        let _ = slot.ready.set(Arc::clone(&encoding));
        Ok(encoding)
    }
}

static DEFAULT_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::with_builtins);

/// The process-wide registry used by [`get_encoding`].
pub fn default_registry() -> &'static Registry {
    &DEFAULT_REGISTRY
}

/// Look up a named encoding in the default registry.
pub fn get_encoding(name: &str) -> Result<Arc<Encoding>, TokenizerError> {
    DEFAULT_REGISTRY.get(name)
}

/// Names known to the default registry.
pub fn list_encoding_names() -> Vec<String> {
    DEFAULT_REGISTRY.names()
}
