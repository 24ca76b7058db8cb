//! Deterministic text cleaning applied to raw records.
//!
//! `normalize` is a pure function of `(content, lang, options)`; resumability
//! relies on it producing byte-identical output across runs.

use unicode_normalization::UnicodeNormalization;

use crate::config::{NormalizerOptions, UnicodeForm};
use crate::constants::provenance::{DECODE_REPAIRED, NORMALIZE_PREFIX};
use crate::data::{Content, Lang, Record};
use crate::errors::PipelineError;

/// Characters removed regardless of category (zero-width space, BOM, soft hyphen,
/// replacement character).
const INVISIBLE_CHARS: [char; 4] = ['\u{200b}', '\u{feff}', '\u{00ad}', '\u{fffd}'];

/// Raw → normalized record transformation.
#[derive(Clone, Debug, Default)]
pub struct Normalizer {
    options: NormalizerOptions,
}

impl Normalizer {
    /// Normalizer applying `options`.
    pub fn new(options: NormalizerOptions) -> Self {
        Self { options }
    }

    /// Active options.
    pub fn options(&self) -> &NormalizerOptions {
        &self.options
    }

    /// Decode and clean a raw record into a normalized record with the same id.
    pub fn normalize(&self, record: &Record) -> Result<Record, PipelineError> {
        let bytes = match record.content() {
            Content::Raw(bytes) => bytes,
            _ => {
                return Err(PipelineError::Configuration(format!(
                    "normalizer expects a raw record, '{}' is {}",
                    record.id(),
                    record.stage()
                )));
            }
        };
        let decoded = decode(bytes).map_err(|reason| PipelineError::Encoding {
            source_id: record.source_id().clone(),
            reason,
        })?;
        let repaired = decoded.repaired
            || decoded.text.contains(&INVISIBLE_CHARS[..])
            || decoded.text.contains('\0');
        let form = self.form_for(record.lang());
        let text = self.normalize_text(&decoded.text, record.lang());

        let mut steps = Vec::with_capacity(2);
        if repaired {
            steps.push(DECODE_REPAIRED.to_string());
        }
        steps.push(format!("{NORMALIZE_PREFIX}{}", form.as_str()));
        Ok(record.derive(record.position(), Content::Text(text), steps))
    }

    /// Clean already-decoded text.
    pub fn normalize_text(&self, text: &str, lang: &Lang) -> String {
        let stripped: String = text
            .chars()
            .filter(|ch| *ch != '\0' && !INVISIBLE_CHARS.contains(ch))
            .collect();
        let composed: String = match self.form_for(lang) {
            UnicodeForm::Nfc => stripped.nfc().collect(),
            UnicodeForm::Nfkc => stripped.nfkc().collect(),
            UnicodeForm::None => stripped,
        };
        let unified = composed.replace("\r\n", "\n").replace('\r', "\n");
        let cleaned: String = if self.options.strip_control {
            unified
                .chars()
                .filter(|ch| !ch.is_control() || *ch == '\n' || *ch == '\t')
                .collect()
        } else {
            unified
        };
        if self.options.collapse_whitespace {
            collapse_layout(&cleaned)
        } else {
            cleaned
        }
    }

    fn form_for(&self, lang: &Lang) -> UnicodeForm {
        match lang {
            Lang::Ko => self.options.korean_form,
            _ => self.options.default_form,
        }
    }
}

/// Decoded text plus whether decoding had to repair the input.
#[derive(Debug, PartialEq, Eq)]
pub struct Decoded {
    /// Decoded text.
    pub text: String,
    /// True when invalid or truncated input was dropped or replaced.
    pub repaired: bool,
}

/// Decode UTF-8 (optionally with BOM) or BOM-marked UTF-16.
///
/// A multi-byte sequence truncated at the very end is dropped and reported as
/// repaired; any other invalid sequence is an error.
pub fn decode(bytes: &[u8]) -> Result<Decoded, String> {
    if let Some(rest) = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        return decode_utf8(rest).map(|decoded| Decoded {
            repaired: true,
            ..decoded
        });
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFF, 0xFE]) {
        return decode_utf16(rest, u16::from_le_bytes);
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        return decode_utf16(rest, u16::from_be_bytes);
    }
    decode_utf8(bytes)
}

fn decode_utf8(bytes: &[u8]) -> Result<Decoded, String> {
    match std::str::from_utf8(bytes) {
        Ok(text) => Ok(Decoded {
            text: text.to_string(),
            repaired: false,
        }),
        Err(err) if err.error_len().is_none() => {
            let valid = &bytes[..err.valid_up_to()];
            Ok(Decoded {
                text: String::from_utf8_lossy(valid).into_owned(),
                repaired: true,
            })
        }
        Err(err) => Err(format!(
            "invalid UTF-8 sequence at byte {} and no byte-order mark for another encoding",
            err.valid_up_to()
        )),
    }
}

fn decode_utf16(bytes: &[u8], unit: fn([u8; 2]) -> u16) -> Result<Decoded, String> {
    if bytes.len() % 2 != 0 {
        return Err("UTF-16 input has an odd number of bytes".to_string());
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| unit([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units)
        .map(|text| Decoded {
            text,
            repaired: true,
        })
        .map_err(|err| format!("invalid UTF-16: {err}"))
}

/// Collapse runs of whitespace into single spaces and trim.
pub fn normalize_inline_whitespace<T: AsRef<str>>(text: T) -> String {
    let mut normalized = String::new();
    let mut seen_space = false;
    for ch in text.as_ref().chars() {
        if ch.is_whitespace() {
            if !seen_space {
                normalized.push(' ');
                seen_space = true;
            }
        } else {
            normalized.push(ch);
            seen_space = false;
        }
    }
    normalized.trim().to_string()
}

/// Collapse each line, keep single line breaks, and reduce blank-line runs to
/// one paragraph break.
fn collapse_layout(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = false;
    for line in text.split('\n') {
        let line = normalize_inline_whitespace(line);
        if line.is_empty() {
            blank_run = true;
            continue;
        }
        if !out.is_empty() {
            out.push_str(if blank_run { "\n\n" } else { "\n" });
        }
        out.push_str(&line);
        blank_run = false;
    }
    out
}
