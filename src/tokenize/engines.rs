use std::fmt;
use std::sync::Arc;

use regex::Regex;

use super::{Tokenizer, TokenizerDescriptor};
use crate::errors::PipelineError;
use crate::types::{EngineName, Token};

/// Whitespace splitting.
pub const WHITESPACE: &str = "whitespace";
/// One token per non-space character.
pub const CHARACTER: &str = "character";
/// Korean space-delimited units.
pub const EOJEOL: &str = "eojeol";
/// Pattern matches.
pub const REGEX: &str = "regex";
/// Local `tokenizer.json` subwords.
pub const PRETRAINED: &str = "pretrained";

/// Pattern used by the `regex` engine when the descriptor sets none.
pub const DEFAULT_REGEX_PATTERN: &str = r"\w+|[^\w\s]";

/// Build the built-in engine named by `descriptor.engine_name`.
///
/// Recognized options: `lowercase` (whitespace, eojeol), `pattern` (regex),
/// `path` (pretrained).
pub fn builtin(descriptor: &TokenizerDescriptor) -> Result<Arc<dyn Tokenizer>, PipelineError> {
    let lowercase = descriptor.flag("lowercase");
    match descriptor.engine_name.as_str() {
        WHITESPACE => Ok(Arc::new(WhitespaceTokenizer { lowercase })),
        CHARACTER => Ok(Arc::new(CharacterTokenizer)),
        EOJEOL => Ok(Arc::new(EojeolTokenizer { lowercase })),
        REGEX => {
            let pattern = descriptor.option("pattern").unwrap_or(DEFAULT_REGEX_PATTERN);
            Ok(Arc::new(RegexTokenizer::new(pattern)?))
        }
        #[cfg(feature = "huggingface")]
        PRETRAINED => {
            let path = descriptor.option("path").ok_or_else(|| {
                PipelineError::Configuration(format!(
                    "pretrained tokenizer for '{}' needs a 'path' option",
                    descriptor.lang
                ))
            })?;
            Ok(Arc::new(PretrainedTokenizer::from_file(path)?))
        }
        other => Err(PipelineError::UnknownEngine {
            lang: descriptor.lang.to_string(),
            engine: other.to_string(),
        }),
    }
}

/// Splits on Unicode whitespace.
#[derive(Clone, Copy, Debug, Default)]
pub struct WhitespaceTokenizer {
    /// Lowercase every token.
    pub lowercase: bool,
}

impl Tokenizer for WhitespaceTokenizer {
    fn name(&self) -> &str {
        WHITESPACE
    }

    fn tokenize(&self, text: &str) -> Result<Vec<Token>, PipelineError> {
        Ok(text
            .split_whitespace()
            .map(|token| {
                if self.lowercase {
                    token.to_lowercase()
                } else {
                    token.to_string()
                }
            })
            .collect())
    }
}

/// One token per Unicode scalar value; whitespace is dropped.
#[derive(Clone, Copy, Debug, Default)]
pub struct CharacterTokenizer;

impl Tokenizer for CharacterTokenizer {
    fn name(&self) -> &str {
        CHARACTER
    }

    fn tokenize(&self, text: &str) -> Result<Vec<Token>, PipelineError> {
        Ok(text
            .chars()
            .filter(|ch| !ch.is_whitespace())
            .map(String::from)
            .collect())
    }
}

/// Korean space-delimited units (eojeol) with leading and trailing
/// punctuation split into separate tokens.
#[derive(Clone, Copy, Debug, Default)]
pub struct EojeolTokenizer {
    /// Lowercase every token.
    pub lowercase: bool,
}

impl Tokenizer for EojeolTokenizer {
    fn name(&self) -> &str {
        EOJEOL
    }

    fn tokenize(&self, text: &str) -> Result<Vec<Token>, PipelineError> {
        let mut tokens = Vec::new();
        for unit in text.split_whitespace() {
            let start = unit
                .char_indices()
                .find(|(_, ch)| !is_punctuation(*ch))
                .map(|(idx, _)| idx);
            let Some(start) = start else {
                tokens.extend(unit.chars().map(String::from));
                continue;
            };
            let end = unit
                .char_indices()
                .rev()
                .find(|(_, ch)| !is_punctuation(*ch))
                .map(|(idx, ch)| idx + ch.len_utf8())
                .unwrap_or(unit.len());

            tokens.extend(unit[..start].chars().map(String::from));
            let core = &unit[start..end];
            tokens.push(if self.lowercase {
                core.to_lowercase()
            } else {
                core.to_string()
            });
            tokens.extend(unit[end..].chars().map(String::from));
        }
        Ok(tokens)
    }
}

fn is_punctuation(ch: char) -> bool {
    ch.is_ascii_punctuation()
        || matches!(
            ch,
            '…' | '。' | '、' | '！' | '？' | '，' | '．' | '·' | '“' | '”' | '‘' | '’' | '「' | '」'
                | '『' | '』' | '《' | '》' | '〈' | '〉' | '（' | '）'
        )
}

/// Tokens are the non-overlapping matches of a pattern.
#[derive(Clone, Debug)]
pub struct RegexTokenizer {
    pattern: Regex,
}

impl RegexTokenizer {
    /// Compile `pattern`; each match becomes a token.
    pub fn new(pattern: &str) -> Result<Self, PipelineError> {
        let pattern = Regex::new(pattern).map_err(|err| {
            PipelineError::Configuration(format!("invalid tokenizer pattern '{pattern}': {err}"))
        })?;
        Ok(Self { pattern })
    }

    /// Source of the compiled pattern.
    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }
}

impl Tokenizer for RegexTokenizer {
    fn name(&self) -> &str {
        REGEX
    }

    fn tokenize(&self, text: &str) -> Result<Vec<Token>, PipelineError> {
        Ok(self
            .pattern
            .find_iter(text)
            .map(|found| found.as_str().to_string())
            .collect())
    }
}

/// Adapter turning a closure into a tokenizer.
pub struct FnTokenizer<F> {
    name: EngineName,
    tokenize: F,
}

impl<F> FnTokenizer<F> {
    /// Tokenizer named `name` calling `tokenize`.
    pub fn new(name: impl Into<EngineName>, tokenize: F) -> Self
    where
        F: Fn(&str) -> Result<Vec<Token>, PipelineError> + Send + Sync,
    {
        Self {
            name: name.into(),
            tokenize,
        }
    }
}

impl<F> fmt::Debug for FnTokenizer<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTokenizer").field("name", &self.name).finish()
    }
}

impl<F> Tokenizer for FnTokenizer<F>
where
    F: Fn(&str) -> Result<Vec<Token>, PipelineError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn tokenize(&self, text: &str) -> Result<Vec<Token>, PipelineError> {
        (self.tokenize)(text)
    }
}

/// Subword tokenizer loaded from a local Hugging Face `tokenizer.json`.
#[cfg(feature = "huggingface")]
pub struct PretrainedTokenizer {
    inner: tokenizers::Tokenizer,
    source: String,
}

#[cfg(feature = "huggingface")]
impl PretrainedTokenizer {
    /// Load a serialized tokenizer.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let inner = tokenizers::Tokenizer::from_file(path).map_err(|err| {
            PipelineError::Configuration(format!(
                "cannot load tokenizer from '{}': {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            inner,
            source: path.display().to_string(),
        })
    }
}

#[cfg(feature = "huggingface")]
impl fmt::Debug for PretrainedTokenizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PretrainedTokenizer")
            .field("source", &self.source)
            .finish()
    }
}

#[cfg(feature = "huggingface")]
impl Tokenizer for PretrainedTokenizer {
    fn name(&self) -> &str {
        PRETRAINED
    }

    fn tokenize(&self, text: &str) -> Result<Vec<Token>, PipelineError> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|err| PipelineError::Tokenizer {
                engine: PRETRAINED.to_string(),
                reason: err.to_string(),
            })?;
        Ok(encoding.get_tokens().to_vec())
    }
}
