use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::data::Lang;

/// Counts for committed documents of one language.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LangStats {
    /// Committed documents.
    pub documents: usize,
    /// Segments across those documents.
    pub segments: usize,
    /// Tokens across those segments.
    pub tokens: usize,
    /// Characters of normalized text.
    pub chars: usize,
}

impl LangStats {
    /// Mean tokens per segment, zero without segments.
    pub fn tokens_per_segment(&self) -> f64 {
        if self.segments == 0 {
            0.0
        } else {
            self.tokens as f64 / self.segments as f64
        }
    }

    fn add(&mut self, other: &LangStats) {
        self.documents += other.documents;
        self.segments += other.segments;
        self.tokens += other.tokens;
        self.chars += other.chars;
    }
}

/// Per-language statistics over the documents committed by a run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CorpusStats {
    /// Counts keyed by language.
    pub per_lang: BTreeMap<Lang, LangStats>,
}

impl CorpusStats {
    /// Count one committed document.
    pub fn record_document(&mut self, lang: &Lang, chars: usize, segments: usize, tokens: usize) {
        self.per_lang.entry(lang.clone()).or_default().add(&LangStats {
            documents: 1,
            segments,
            tokens,
            chars,
        });
    }

    /// Add another run's counts.
    pub fn merge(&mut self, other: &CorpusStats) {
        for (lang, stats) in &other.per_lang {
            self.per_lang.entry(lang.clone()).or_default().add(stats);
        }
    }

    /// Counts for one language.
    pub fn lang(&self, lang: &Lang) -> Option<&LangStats> {
        self.per_lang.get(lang)
    }

    /// Sum over all languages.
    pub fn totals(&self) -> LangStats {
        let mut totals = LangStats::default();
        for stats in self.per_lang.values() {
            totals.add(stats);
        }
        totals
    }

    /// Document balance across languages.
    pub fn language_mix(&self) -> Option<LanguageMix> {
        let counts: BTreeMap<Lang, usize> = self
            .per_lang
            .iter()
            .map(|(lang, stats)| (lang.clone(), stats.documents))
            .collect();
        language_mix(&counts)
    }
}

/// Aggregate balance metrics for per-language document counts.
#[derive(Clone, Debug, PartialEq)]
pub struct LanguageMix {
    /// Documents across all languages.
    pub total: usize,
    /// Languages with a count.
    pub languages: usize,
    /// Smallest per-language count.
    pub min: usize,
    /// Largest per-language count.
    pub max: usize,
    /// Share of the largest language.
    pub max_share: f64,
    /// Share of the smallest language.
    pub min_share: f64,
    /// `max / min`, infinite when a language has zero documents.
    pub ratio: f64,
    /// Shares in language order.
    pub per_lang: Vec<LangShare>,
}

/// Per-language share of committed documents.
#[derive(Clone, Debug, PartialEq)]
pub struct LangShare {
    /// Language tag.
    pub lang: Lang,
    /// Committed documents.
    pub count: usize,
    /// Fraction of all documents.
    pub share: f64,
}

/// Compute balance metrics from per-language counts.
pub fn language_mix(counts: &BTreeMap<Lang, usize>) -> Option<LanguageMix> {
    let min = *counts.values().min()?;
    let max = *counts.values().max()?;
    let total: usize = counts.values().sum();
    let share = |count: usize| {
        if total == 0 {
            0.0
        } else {
            count as f64 / total as f64
        }
    };
    let ratio = if min == 0 {
        f64::INFINITY
    } else {
        max as f64 / min as f64
    };
    let mut per_lang: Vec<LangShare> = counts
        .iter()
        .map(|(lang, count)| LangShare {
            lang: lang.clone(),
            count: *count,
            share: share(*count),
        })
        .collect();
    per_lang.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.lang.cmp(&b.lang)));
    Some(LanguageMix {
        total,
        languages: counts.len(),
        min,
        max,
        max_share: share(max),
        min_share: share(min),
        ratio,
        per_lang,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_mix_reports_imbalance() {
        let mut counts = BTreeMap::new();
        counts.insert(Lang::Ko, 6);
        counts.insert(Lang::En, 2);
        let mix = language_mix(&counts).unwrap();
        assert_eq!(mix.total, 8);
        assert_eq!(mix.languages, 2);
        assert!((mix.max_share - 0.75).abs() < 1e-6);
        assert!((mix.ratio - 3.0).abs() < 1e-6);
        assert_eq!(mix.per_lang[0].lang, Lang::Ko);
        assert!(language_mix(&BTreeMap::new()).is_none());
    }

    #[test]
    fn stats_accumulate_and_merge() {
        let mut left = CorpusStats::default();
        left.record_document(&Lang::En, 12, 2, 4);
        let mut right = CorpusStats::default();
        right.record_document(&Lang::En, 5, 1, 2);
        right.record_document(&Lang::Ko, 3, 1, 3);
        left.merge(&right);

        let en = left.lang(&Lang::En).unwrap();
        assert_eq!((en.documents, en.segments, en.tokens, en.chars), (2, 3, 6, 17));
        assert!((en.tokens_per_segment() - 2.0).abs() < 1e-6);
        assert_eq!(left.totals().documents, 3);
        let mix = left.language_mix().unwrap();
        assert!((mix.min_share - 1.0 / 3.0).abs() < 1e-6);
    }
}
