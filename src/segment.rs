//! Language-aware splitting of normalized documents into segment records.

use crate::config::SegmentMode;
use crate::constants::provenance::{SEGMENT_FALLBACK, SEGMENT_PREFIX};
use crate::data::{Content, Lang, Record, Stage};
use crate::errors::PipelineError;
use crate::normalize::normalize_inline_whitespace;

/// Abbreviations whose trailing dot does not end an English sentence.
const ENGLISH_ABBREVIATIONS: &[&str] = &[
    "mr", "mrs", "ms", "dr", "prof", "sr", "jr", "st", "vs", "etc", "e.g", "i.e", "inc", "ltd",
    "co", "no", "fig", "approx", "dept", "est", "u.s", "a.m", "p.m",
];

/// Capitalized words that usually open a sentence rather than continue a name.
const SENTENCE_STARTERS: &[&str] = &[
    "a", "an", "and", "as", "at", "but", "he", "her", "his", "i", "if", "in", "it", "its", "my",
    "no", "on", "our", "she", "so", "that", "the", "then", "there", "these", "they", "this",
    "those", "we", "what", "when", "yes", "you",
];

/// Sentence-boundary rules selected by language.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ruleset {
    /// Abbreviation, initial, and decimal aware.
    English,
    /// Adds full-width terminators and the ellipsis.
    Korean,
    /// Whitespace/punctuation heuristic for unrecognized languages.
    Generic,
}

impl Ruleset {
    /// Rules for documents tagged `lang`.
    pub fn for_lang(lang: &Lang) -> Self {
        match lang {
            Lang::En => Self::English,
            Lang::Ko => Self::Korean,
            Lang::Other(_) => Self::Generic,
        }
    }

    fn is_terminator(self, ch: char) -> bool {
        match self {
            Self::English => matches!(ch, '.' | '!' | '?'),
            Self::Korean => matches!(ch, '.' | '!' | '?' | '…' | '。' | '！' | '？' | '．'),
            Self::Generic => matches!(ch, '.' | '!' | '?' | '。' | '！' | '？'),
        }
    }

    fn is_boundary(self, chars: &[char], idx: usize) -> bool {
        let ch = chars[idx];
        if !self.is_terminator(ch) {
            return false;
        }
        // Runs like "?!" or "..." end at their last terminator.
        if let Some(next) = chars.get(idx + 1)
            && self.is_terminator(*next)
        {
            return false;
        }
        let mut after = idx + 1;
        while after < chars.len() && is_closer(chars[after]) {
            after += 1;
        }
        // Full-width terminators are not followed by spaces in CJK text.
        let spaced = chars.get(after).is_none_or(|next| next.is_whitespace());
        if !spaced && !matches!(ch, '。' | '！' | '？') {
            return false;
        }
        if ch == '.' {
            if is_decimal_middle(chars, idx) {
                return false;
            }
            if self == Self::English && (is_abbreviation(chars, idx) || is_initial(chars, idx)) {
                return false;
            }
        }
        true
    }
}

fn is_closer(ch: char) -> bool {
    matches!(
        ch,
        '"' | '\'' | ')' | ']' | '}' | '”' | '’' | '」' | '』' | '》' | '〉' | '）'
    )
}

fn is_decimal_middle(chars: &[char], idx: usize) -> bool {
    idx > 0
        && idx + 1 < chars.len()
        && chars[idx - 1].is_ascii_digit()
        && chars[idx + 1].is_ascii_digit()
}

fn preceding_word(chars: &[char], idx: usize) -> String {
    let start = chars[..idx]
        .iter()
        .rposition(|ch| ch.is_whitespace() || is_closer(*ch) || *ch == '(')
        .map(|pos| pos + 1)
        .unwrap_or(0);
    chars[start..idx].iter().collect::<String>().to_lowercase()
}

fn is_abbreviation(chars: &[char], idx: usize) -> bool {
    let word = preceding_word(chars, idx);
    ENGLISH_ABBREVIATIONS.contains(&word.as_str())
}

/// A single capital before `.` is an initial only when a name follows: another
/// initial, or a capitalized word that is not a common sentence opener. The
/// pronoun "I" is never an initial.
fn is_initial(chars: &[char], idx: usize) -> bool {
    if idx == 0 {
        return false;
    }
    let letter = chars[idx - 1];
    let standalone = idx == 1 || matches!(chars[idx - 2], '.' | '(') || chars[idx - 2].is_whitespace();
    if !letter.is_uppercase() || !standalone || letter == 'I' {
        return false;
    }
    let next: Vec<char> = chars[idx + 1..]
        .iter()
        .skip_while(|ch| ch.is_whitespace() || is_closer(**ch))
        .take_while(|ch| !ch.is_whitespace())
        .copied()
        .collect();
    match next.as_slice() {
        [initial, '.'] if initial.is_uppercase() => true,
        [first, ..] if first.is_uppercase() => {
            let word: String = next
                .iter()
                .take_while(|ch| ch.is_alphabetic())
                .collect::<String>()
                .to_lowercase();
            !SENTENCE_STARTERS.contains(&word.as_str())
        }
        _ => false,
    }
}

/// Normalized → segmented record transformation.
#[derive(Clone, Copy, Debug, Default)]
pub struct Segmenter {
    mode: SegmentMode,
}

impl Segmenter {
    /// Segmenter splitting by `mode`.
    pub fn new(mode: SegmentMode) -> Self {
        Self { mode }
    }

    /// Split a normalized record into ordered segment records.
    ///
    /// Segment `i` gets id `"{source_id}#{i}"`. Languages without a dedicated
    /// ruleset fall back to the generic heuristic and record `segment:fallback`.
    pub fn segment(&self, record: &Record) -> Result<Vec<Record>, PipelineError> {
        if record.stage() != Stage::Normalized {
            return Err(PipelineError::Configuration(format!(
                "segmenter expects a normalized record, '{}' is {}",
                record.id(),
                record.stage()
            )));
        }
        let text = record.text().unwrap_or_default();
        let step = match self.mode {
            SegmentMode::Paragraph => format!("{SEGMENT_PREFIX}paragraph"),
            SegmentMode::Sentence => match Ruleset::for_lang(record.lang()) {
                Ruleset::Generic => SEGMENT_FALLBACK.to_string(),
                _ => format!("{SEGMENT_PREFIX}{}", record.lang()),
            },
        };
        Ok(self
            .split(text, record.lang())
            .into_iter()
            .enumerate()
            .map(|(idx, segment)| record.derive(idx, Content::Segment(segment), [step.clone()]))
            .collect())
    }

    /// Split text into segment strings; inline whitespace inside each segment is collapsed.
    pub fn split(&self, text: &str, lang: &Lang) -> Vec<String> {
        let mut segments = Vec::new();
        for block in text.split("\n\n") {
            let block = normalize_inline_whitespace(block);
            if block.is_empty() {
                continue;
            }
            match self.mode {
                SegmentMode::Paragraph => segments.push(block),
                SegmentMode::Sentence => {
                    push_block_sentences(&block, Ruleset::for_lang(lang), &mut segments)
                }
            }
        }
        segments
    }
}

fn push_block_sentences(block: &str, rules: Ruleset, results: &mut Vec<String>) {
    let chars: Vec<char> = block.chars().collect();
    let mut buffer = String::new();
    let mut idx = 0;
    while idx < chars.len() {
        buffer.push(chars[idx]);
        if rules.is_boundary(&chars, idx) {
            while idx + 1 < chars.len() && is_closer(chars[idx + 1]) {
                idx += 1;
                buffer.push(chars[idx]);
            }
            flush(&mut buffer, results);
        }
        idx += 1;
    }
    flush(&mut buffer, results);
}

fn flush(buffer: &mut String, results: &mut Vec<String>) {
    let trimmed = buffer.trim();
    if !trimmed.is_empty() {
        results.push(trimmed.to_string());
    }
    buffer.clear();
}
