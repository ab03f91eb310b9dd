//! Keyword-anchored mention windows over filing text.
//!
//! Three keyword classes are scanned in priority order (NCT id, title,
//! intervention names). Each hit becomes one bounded window of text centred
//! on the match; hits of the same class that sit close together collapse
//! into a single window, and a hit that falls inside a window already
//! produced is skipped. The scan is lazy: windows are produced as the
//! caller pulls them, and a filing with no hits yields nothing.

use std::collections::BTreeSet;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::trace;

use trialink_common::{FilingRef, KeywordClass, MentionWindow, TrialStub};

/// Intervention words too generic to anchor a window.
const GENERIC_TOKENS: &[&str] = &[
    "placebo", "tablet", "tablets", "capsule", "capsules", "injection", "injectable",
    "oral", "dose", "doses", "dosing", "daily", "weekly", "drug", "control", "standard",
    "care", "matching", "vehicle", "saline", "solution", "subcutaneous", "intravenous",
    "infusion", "cream", "therapy", "treatment", "usual", "arm", "group", "low", "high",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractorConfig {
    /// Upper bound on a window's text, in bytes of UTF-8.
    #[serde(default = "default_max_window_chars")]
    pub max_window_chars: usize,
    /// Context captured on each side of a window, in bytes.
    #[serde(default = "default_context_chars")]
    pub context_chars: usize,
    /// Hits of one class closer than this are merged into one window.
    #[serde(default = "default_merge_distance")]
    pub merge_distance: usize,
    /// Titles shorter than this are too ambiguous to search for verbatim.
    #[serde(default = "default_min_title_chars")]
    pub min_title_chars: usize,
}

fn default_max_window_chars() -> usize { 2000 }
fn default_context_chars() -> usize { 200 }
fn default_merge_distance() -> usize { 300 }
fn default_min_title_chars() -> usize { 24 }

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            max_window_chars: default_max_window_chars(),
            context_chars: default_context_chars(),
            merge_distance: default_merge_distance(),
            min_title_chars: default_min_title_chars(),
        }
    }
}

// ── Keyword patterns ─────────────────────────────────────────────────────────

fn case_insensitive(pattern: &str) -> Option<Regex> {
    RegexBuilder::new(pattern).case_insensitive(true).build().ok()
}

/// Word-bounded, case-insensitive match of the registry id.
fn nct_pattern(trial: &TrialStub) -> Option<Regex> {
    let id = trial.registry_id.trim();
    if id.is_empty() {
        return None;
    }
    case_insensitive(&format!(r"\b{}\b", regex::escape(id)))
}

/// Parenthesised acronyms of four or more characters, e.g. `(SURMOUNT-1)`.
fn title_acronyms(title: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = title;
    while let Some(open) = rest.find('(') {
        let after = &rest[open + 1..];
        let Some(close) = after.find(')') else { break };
        let inner = after[..close].trim();
        let is_acronym = inner.chars().count() >= 4
            && !inner.contains(char::is_whitespace)
            && inner.chars().all(|c| c.is_alphanumeric() || c == '-')
            && inner.chars().any(|c| c.is_uppercase());
        if is_acronym {
            out.push(inner.to_string());
        }
        rest = &after[close + 1..];
    }
    out
}

/// Full title with flexible whitespace, plus any acronyms it defines.
fn title_pattern(trial: &TrialStub, min_title_chars: usize) -> Option<Regex> {
    let mut alternatives = Vec::new();

    let title = trial.title.trim();
    let acronyms = title_acronyms(title);

    // Filings quote the title without the registry's acronym suffix
    let mut bare = title.to_string();
    for acronym in &acronyms {
        bare = bare.replace(&format!("({})", acronym), " ");
    }
    if bare.trim().chars().count() >= min_title_chars {
        let words: Vec<String> = bare.split_whitespace().map(regex::escape).collect();
        alternatives.push(words.join(r"\s+"));
    }
    for acronym in acronyms {
        alternatives.push(format!(r"\b{}\b", regex::escape(&acronym)));
    }

    if alternatives.is_empty() {
        return None;
    }
    case_insensitive(&alternatives.join("|"))
}

/// Distinctive tokens of the trial's intervention names.
pub fn drug_tokens(trial: &TrialStub) -> Vec<String> {
    let tokens: BTreeSet<String> = trial
        .interventions
        .iter()
        .flat_map(|name| name.split(|c: char| !c.is_alphanumeric() && c != '-'))
        .map(|t| t.trim_matches('-').to_lowercase())
        .filter(|t| t.chars().count() >= 4)
        .filter(|t| !t.chars().all(|c| c.is_ascii_digit()))
        .filter(|t| !GENERIC_TOKENS.contains(&t.as_str()))
        .collect();
    tokens.into_iter().collect()
}

fn drug_pattern(trial: &TrialStub) -> Option<Regex> {
    let tokens = drug_tokens(trial);
    if tokens.is_empty() {
        return None;
    }
    let alternation = tokens.iter().map(|t| regex::escape(t)).collect::<Vec<_>>().join("|");
    case_insensitive(&format!(r"\b(?:{})\b", alternation))
}

fn keyword_patterns(trial: &TrialStub, config: &ExtractorConfig) -> Vec<(KeywordClass, Regex)> {
    KeywordClass::PRIORITY
        .iter()
        .filter_map(|class| {
            let re = match class {
                KeywordClass::NctId => nct_pattern(trial),
                KeywordClass::TitleFragment => title_pattern(trial, config.min_title_chars),
                KeywordClass::DrugName => drug_pattern(trial),
            };
            re.map(|re| (*class, re))
        })
        .collect()
}

// ── Boundaries ───────────────────────────────────────────────────────────────

fn floor_boundary(s: &str, mut i: usize) -> usize {
    i = i.min(s.len());
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_boundary(s: &str, mut i: usize) -> usize {
    i = i.min(s.len());
    while !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

// ── Extraction ───────────────────────────────────────────────────────────────

pub struct MentionExtractor {
    config: ExtractorConfig,
}

impl MentionExtractor {
    pub fn new(config: ExtractorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// Lazily scans `content` of `filing` for mentions of `trial`.
    pub fn extract<'a>(
        &self,
        filing: &'a FilingRef,
        content: &'a str,
        trial: &TrialStub,
    ) -> Mentions<'a> {
        Mentions {
            patterns: keyword_patterns(trial, &self.config),
            config: self.config.clone(),
            filing,
            content,
            trial_id: trial.registry_id.clone(),
            class_idx: 0,
            cursor: 0,
            emitted: Vec::new(),
        }
    }
}

impl Default for MentionExtractor {
    fn default() -> Self {
        Self::new(ExtractorConfig::default())
    }
}

/// Iterator over the mention windows of one filing for one trial.
///
/// Finite and single-pass: once exhausted it stays exhausted.
pub struct Mentions<'a> {
    patterns: Vec<(KeywordClass, Regex)>,
    config: ExtractorConfig,
    filing: &'a FilingRef,
    content: &'a str,
    trial_id: String,
    class_idx: usize,
    cursor: usize,
    /// Spans of windows already yielded.
    emitted: Vec<(usize, usize)>,
}

impl Mentions<'_> {
    fn window(&self, class: KeywordClass, hit_start: usize, hit_end: usize) -> MentionWindow {
        let content = self.content;
        let max = self.config.max_window_chars.max(1);
        let hit_len = hit_end - hit_start;

        let (start, end) = if hit_len >= max {
            (hit_start, hit_start + max)
        } else {
            let pad = (max - hit_len) / 2;
            (hit_start.saturating_sub(pad), (hit_end + pad).min(content.len()))
        };
        // Shrinking to boundaries keeps the window within the bound
        let start = ceil_boundary(content, start);
        let end = floor_boundary(content, end).max(start);

        let before_start = ceil_boundary(content, start.saturating_sub(self.config.context_chars));
        let after_end = floor_boundary(content, end + self.config.context_chars).max(end);

        trace!(class = class.as_str(), start, end, "mention window");
        MentionWindow {
            id: format!("{}:{}:{}", self.filing.accession_id, class.as_str(), start),
            filing_id: self.filing.accession_id.clone(),
            trial_id: self.trial_id.clone(),
            keyword_class: class,
            span: (start, end),
            text: content[start..end].to_string(),
            context_before: content[before_start..start].to_string(),
            context_after: content[end..after_end].to_string(),
        }
    }
}

impl Iterator for Mentions<'_> {
    type Item = MentionWindow;

    fn next(&mut self) -> Option<MentionWindow> {
        loop {
            let (class, re) = self.patterns.get(self.class_idx)?;
            let class = *class;

            let Some(first) = re.find_at(self.content, self.cursor).filter(|m| !m.is_empty()) else {
                self.class_idx += 1;
                self.cursor = 0;
                continue;
            };

            let (start, mut end) = (first.start(), first.end());
            self.cursor = end;
            while let Some(next) = re.find_at(self.content, self.cursor) {
                let close = next.start().saturating_sub(end) < self.config.merge_distance;
                let fits = next.end() - start <= self.config.max_window_chars;
                if next.is_empty() || !close || !fits {
                    break;
                }
                end = next.end();
                self.cursor = end;
            }

            // A hit already inside a higher-priority window adds nothing
            if self.emitted.iter().any(|(s, e)| *s <= start && end <= *e) {
                continue;
            }
            let window = self.window(class, start, end);
            self.emitted.push(window.span);
            return Some(window);
        }
    }
}

impl std::iter::FusedIterator for Mentions<'_> {}

/// Orders windows by class priority, then by position within their filing.
pub fn sort_by_priority(windows: &mut [MentionWindow]) {
    windows.sort_by(|a, b| {
        a.keyword_class
            .cmp(&b.keyword_class)
            .then_with(|| a.filing_id.cmp(&b.filing_id))
            .then_with(|| a.span.0.cmp(&b.span.0))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use trialink_common::{FormType, SponsorClass};

    fn stub() -> TrialStub {
        TrialStub {
            registry_id: "NCT04184622".into(),
            title: "A Study of Tirzepatide in Participants With Obesity (SURMOUNT-1)".into(),
            sponsor_name: "Eli Lilly and Company".into(),
            condition: Some("Obesity".into()),
            start_date: None,
            study_type: "INTERVENTIONAL".into(),
            sponsor_class: SponsorClass::Industry,
            phase: Some("PHASE3".into()),
            interventions: vec!["Tirzepatide".into(), "Placebo".into()],
        }
    }

    fn filing() -> FilingRef {
        FilingRef {
            accession_id: "0000059478-23-000012".into(),
            form_type: FormType::TenK,
            filed_at: None,
            source_url: "https://www.sec.gov/x.htm".into(),
            cik: None,
            filer_name: None,
        }
    }

    fn small() -> MentionExtractor {
        MentionExtractor::new(ExtractorConfig {
            max_window_chars: 120,
            context_chars: 20,
            merge_distance: 40,
            min_title_chars: 24,
        })
    }

    #[test]
    fn test_nct_window_contains_id_and_respects_bound() {
        let text = format!("{} In trial nct04184622 we observed weight loss. {}", "x ".repeat(200), "y ".repeat(200));
        let f = filing();
        let windows: Vec<_> = small().extract(&f, &text, &stub()).collect();
        let nct: Vec<_> = windows.iter().filter(|w| w.keyword_class == KeywordClass::NctId).collect();
        assert_eq!(nct.len(), 1);
        assert!(nct[0].text.to_uppercase().contains("NCT04184622"));
        assert!(nct[0].text.len() <= 120);
        assert_eq!(&text[nct[0].span.0..nct[0].span.1], nct[0].text);
    }

    #[test]
    fn test_no_keywords_yields_nothing() {
        let f = filing();
        let mut it = small().extract(&f, "Revenue grew in the fourth quarter.", &stub());
        assert!(it.next().is_none());
        assert!(it.next().is_none());
    }

    #[test]
    fn test_nct_id_is_word_bounded() {
        let f = filing();
        let text = "Reference NCT041846229 is a different trial.";
        assert_eq!(small().extract(&f, text, &stub()).count(), 0);
    }

    #[test]
    fn test_title_matches_across_line_breaks_and_acronym() {
        let f = filing();
        let text = "We completed A Study of Tirzepatide in\nParticipants   With Obesity last year. \
                    Separately, surmount-1 results were published.";
        let windows: Vec<_> = MentionExtractor::default().extract(&f, text, &stub()).collect();
        let titles = windows.iter().filter(|w| w.keyword_class == KeywordClass::TitleFragment).count();
        assert_eq!(titles, 1, "close hits merge into one window");
        // The drug name only occurs inside the title window
        assert!(windows.iter().all(|w| w.keyword_class != KeywordClass::DrugName));
    }

    #[test]
    fn test_close_hits_merge_far_hits_split() {
        let f = filing();
        let near = format!("tirzepatide {} tirzepatide", "a".repeat(10));
        let far = format!("tirzepatide {} tirzepatide", "b ".repeat(200));
        assert_eq!(small().extract(&f, &near, &stub()).count(), 1);
        assert_eq!(small().extract(&f, &far, &stub()).count(), 2);
    }

    #[test]
    fn test_windows_come_in_priority_order() {
        let f = filing();
        let text = format!("tirzepatide {} NCT04184622", "c ".repeat(100));
        let classes: Vec<_> = small().extract(&f, &text, &stub()).map(|w| w.keyword_class).collect();
        assert_eq!(classes, vec![KeywordClass::NctId, KeywordClass::DrugName]);
    }

    #[test]
    fn test_windows_snap_to_char_boundaries() {
        let f = filing();
        let text = format!("{}NCT04184622{}", "é".repeat(100), "ü".repeat(100));
        let w = small().extract(&f, &text, &stub()).next().unwrap();
        assert!(w.text.contains("NCT04184622"));
        assert!(w.text.len() <= 120);
        assert!(w.context_before.len() <= 20);
    }

    #[test]
    fn test_drug_tokens_skip_generic_words() {
        let mut t = stub();
        t.interventions = vec!["Semaglutide 2.4 mg injection".into(), "Matching placebo".into(), "BI 456906".into()];
        assert_eq!(drug_tokens(&t), vec!["semaglutide".to_string()]);
    }

    #[test]
    fn test_title_acronyms() {
        assert_eq!(title_acronyms("Effect of X (SURMOUNT-1) in adults (T2D)"), vec!["SURMOUNT-1"]);
        assert!(title_acronyms("No acronym (in prose here)").is_empty());
    }

    #[test]
    fn test_short_title_is_not_searched_verbatim() {
        let mut t = stub();
        t.title = "Obesity Study".into();
        let f = filing();
        let classes: Vec<_> = small().extract(&f, "An obesity study was run.", &t).map(|w| w.keyword_class).collect();
        assert!(classes.is_empty());
    }

    #[test]
    fn test_drug_hit_inside_nct_window_is_skipped() {
        let mut t = stub();
        t.registry_id = "NCT05036135".into();
        t.interventions = vec!["Imatinib".into()];
        let f = filing();
        let text = "Our trial NCT05036135 evaluates Imatinib 400 mg once daily in adults.";
        let windows: Vec<_> = MentionExtractor::default().extract(&f, text, &t).collect();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].keyword_class, KeywordClass::NctId);
        assert!(windows[0].text.contains("Imatinib 400 mg once daily"));
    }

    #[test]
    fn test_sort_by_priority() {
        let f = filing();
        let text = format!("tirzepatide {} NCT04184622", "d ".repeat(100));
        let mut windows: Vec<_> = small().extract(&f, &text, &stub()).collect();
        windows.reverse();
        sort_by_priority(&mut windows);
        assert_eq!(windows[0].keyword_class, KeywordClass::NctId);
    }
}
