//! Per-language tokenizer capabilities and their registry.
//!
//! Ownership model:
//! - A `Tokenizer` is a stateless (or internally immutable) capability that
//!   turns one segment of text into ordered tokens.
//! - `TokenizerRegistry` holds exactly one capability per `(lang, engine)` and
//!   the descriptor it was registered with. Once a run starts the registry is
//!   frozen into an `Arc` and only read by workers.

use std::collections::BTreeMap;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::constants::provenance::TOKENIZE_PREFIX;
use crate::data::Lang;
use crate::errors::PipelineError;
use crate::types::{EngineName, Token, TransformName};

/// Reference engine implementations.
pub mod engines;

pub use engines::{
    CharacterTokenizer, EojeolTokenizer, FnTokenizer, RegexTokenizer, WhitespaceTokenizer,
};
#[cfg(feature = "huggingface")]
pub use engines::PretrainedTokenizer;

/// Text → token sequence capability.
///
/// Implementations must be deterministic for a fixed configuration and must
/// return a non-empty sequence for non-empty input.
pub trait Tokenizer: Send + Sync {
    /// Engine name used in provenance and error messages.
    fn name(&self) -> &str;

    /// Tokenize one segment.
    fn tokenize(&self, text: &str) -> Result<Vec<Token>, PipelineError>;
}

/// Identity and settings of a registered tokenizer.
///
/// The descriptor takes part in the run's configuration checksum, so two
/// registrations that differ only in `config` produce different outputs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizerDescriptor {
    /// Language the capability serves.
    pub lang: Lang,
    /// Engine name within that language.
    pub engine_name: EngineName,
    /// Engine options.
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

impl TokenizerDescriptor {
    /// Descriptor without options.
    pub fn new(lang: Lang, engine_name: impl Into<EngineName>) -> Self {
        Self {
            lang,
            engine_name: engine_name.into(),
            config: BTreeMap::new(),
        }
    }

    /// Builder-style setter for one engine option.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Raw option value.
    pub fn option(&self, key: &str) -> Option<&str> {
        self.config.get(key).map(String::as_str)
    }

    /// Boolean option; anything other than `true`/`1`/`yes` is false.
    pub fn flag(&self, key: &str) -> bool {
        matches!(self.option(key), Some("true" | "1" | "yes"))
    }

    /// Provenance step recorded on tokenized records (`tokenize:ko/character`).
    pub fn provenance_step(&self) -> TransformName {
        format!("{TOKENIZE_PREFIX}{}/{}", self.lang, self.engine_name)
    }
}

/// A capability together with the descriptor it was registered under.
#[derive(Clone)]
pub struct RegisteredTokenizer {
    /// Registration key and settings.
    pub descriptor: TokenizerDescriptor,
    /// Shared capability.
    pub tokenizer: Arc<dyn Tokenizer>,
}

impl std::fmt::Debug for RegisteredTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredTokenizer")
            .field("descriptor", &self.descriptor)
            .field("tokenizer", &self.tokenizer.name())
            .finish()
    }
}

/// `(lang, engine)` → tokenizer capability map.
#[derive(Clone, Debug, Default)]
pub struct TokenizerRegistry {
    entries: IndexMap<(Lang, EngineName), RegisteredTokenizer>,
}

impl TokenizerRegistry {
    /// Registry without capabilities.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in engine for every `(lang, engine)` pair.
    pub fn from_engines(engines: &BTreeMap<Lang, EngineName>) -> Result<Self, PipelineError> {
        let mut registry = Self::new();
        for (lang, engine) in engines {
            registry.register_builtin(TokenizerDescriptor::new(lang.clone(), engine.clone()))?;
        }
        Ok(registry)
    }

    /// Register `tokenizer` under `descriptor`, returning the capability it replaces.
    pub fn register(
        &mut self,
        descriptor: TokenizerDescriptor,
        tokenizer: Arc<dyn Tokenizer>,
    ) -> Option<Arc<dyn Tokenizer>> {
        let key = (descriptor.lang.clone(), descriptor.engine_name.clone());
        self.entries
            .insert(
                key,
                RegisteredTokenizer {
                    descriptor,
                    tokenizer,
                },
            )
            .map(|previous| previous.tokenizer)
    }

    /// Build the built-in engine named by `descriptor` and register it.
    pub fn register_builtin(
        &mut self,
        descriptor: TokenizerDescriptor,
    ) -> Result<Option<Arc<dyn Tokenizer>>, PipelineError> {
        let tokenizer = engines::builtin(&descriptor)?;
        Ok(self.register(descriptor, tokenizer))
    }

    /// Capability for `(lang, engine)`.
    pub fn resolve(&self, lang: &Lang, engine: &str) -> Result<Arc<dyn Tokenizer>, PipelineError> {
        self.entry(lang, engine).map(|entry| Arc::clone(&entry.tokenizer))
    }

    /// Registered entry for `(lang, engine)`.
    pub fn entry(&self, lang: &Lang, engine: &str) -> Result<&RegisteredTokenizer, PipelineError> {
        self.entries
            .get(&(lang.clone(), engine.to_string()))
            .ok_or_else(|| PipelineError::UnknownEngine {
                lang: lang.to_string(),
                engine: engine.to_string(),
            })
    }

    /// Descriptors in registration order.
    pub fn descriptors(&self) -> impl Iterator<Item = &TokenizerDescriptor> {
        self.entries.values().map(|entry| &entry.descriptor)
    }

    /// Registered capabilities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True without registrations.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Freeze the registry for read-only sharing across workers.
    pub fn freeze(self) -> Arc<Self> {
        Arc::new(self)
    }
}
