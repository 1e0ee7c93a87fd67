//! Rule-based taxonomy classifier: category (IT / Non-IT) plus a three level domain.

use std::path::Path;

use anyhow::{bail, Context, Result};
use jobhub_core::{Category, NormalizedRecord, TaxonomyResult};
use regex::Regex;
use serde::Deserialize;

pub const CRATE_NAME: &str = "jobhub-taxonomy";

/// Rules compiled into the binary, used when the workspace carries no override.
pub const DEFAULT_RULES: &str = include_str!("../rules/taxonomy.yaml");

/// Rule file `version` this classifier understands.
pub const RULES_VERSION: u32 = 1;

#[derive(Debug, Clone, Deserialize)]
struct RulesFile {
    version: u32,
    it_threshold: f64,
    confidence: ConfidenceRules,
    it_fallback: String,
    non_it_fallback: String,
    it_signals: TermRules,
    #[serde(default)]
    it_buckets: Vec<BucketRule>,
    #[serde(default)]
    non_it_buckets: Vec<BucketRule>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ConfidenceRules {
    pub it_base: f64,
    pub it_per_signal: f64,
    pub it_per_bucket: f64,
    pub non_it_base: f64,
    pub non_it_per_bucket: f64,
    pub other_floor: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct TermRules {
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    phrases: Vec<String>,
    #[serde(default)]
    patterns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct BucketRule {
    name: String,
    #[serde(flatten)]
    terms: TermRules,
    #[serde(default = "default_weight")]
    weight: f64,
    #[serde(default)]
    refinements: Vec<RefinementRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct RefinementRule {
    when_any: Vec<String>,
    l2: String,
    #[serde(default)]
    l3: Vec<LeafRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct LeafRule {
    when_any: Vec<String>,
    l3: String,
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone)]
enum Matcher {
    Word(Regex),
    Literal(String),
}

#[derive(Debug, Clone)]
struct Term {
    matcher: Matcher,
    weight: f64,
}

impl Term {
    fn keyword(raw: &str) -> Result<Self> {
        let term = raw.trim().to_lowercase();
        let weight = if term.chars().all(char::is_alphanumeric) {
            1.0
        } else {
            2.0
        };
        Ok(Self {
            matcher: word_or_literal(&term)?,
            weight,
        })
    }

    fn phrase(raw: &str) -> Result<Self> {
        let term = raw.trim().to_lowercase();
        Ok(Self {
            matcher: word_or_literal(&term)?,
            weight: 2.0,
        })
    }

    fn pattern(raw: &str) -> Result<Self> {
        let regex = Regex::new(raw).with_context(|| format!("compiling pattern {raw:?}"))?;
        Ok(Self {
            matcher: Matcher::Word(regex),
            weight: 2.0,
        })
    }

    fn matches(&self, text: &str) -> bool {
        match &self.matcher {
            Matcher::Word(regex) => regex.is_match(text),
            Matcher::Literal(needle) => text.contains(needle.as_str()),
        }
    }
}

/// Terms made of word characters match on word boundaries; anything with
/// special syntax (`.net`, `c++`) matches as a plain substring.
fn word_or_literal(term: &str) -> Result<Matcher> {
    let wordish = term
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '/'));
    let edges_are_words = term.chars().next().is_some_and(char::is_alphanumeric)
        && term.chars().last().is_some_and(char::is_alphanumeric);
    if wordish && edges_are_words {
        let body = term
            .split_whitespace()
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(r"\s+");
        let regex = Regex::new(&format!(r"\b{body}\b"))
            .with_context(|| format!("compiling term {term:?}"))?;
        Ok(Matcher::Word(regex))
    } else {
        Ok(Matcher::Literal(term.to_string()))
    }
}

#[derive(Debug, Clone)]
struct TermSet(Vec<Term>);

impl TermSet {
    fn compile(rules: &TermRules) -> Result<Self> {
        let mut terms = Vec::new();
        for keyword in &rules.keywords {
            terms.push(Term::keyword(keyword)?);
        }
        for phrase in &rules.phrases {
            terms.push(Term::phrase(phrase)?);
        }
        for pattern in &rules.patterns {
            terms.push(Term::pattern(pattern)?);
        }
        Ok(Self(terms))
    }

    fn from_words(words: &[String]) -> Result<Self> {
        words
            .iter()
            .map(|w| Term::keyword(w))
            .collect::<Result<Vec<_>>>()
            .map(Self)
    }

    /// Each term counts once, however often it occurs.
    fn score(&self, text: &str) -> f64 {
        self.0
            .iter()
            .filter(|t| t.matches(text))
            .map(|t| t.weight)
            .sum()
    }

    fn any(&self, text: &str) -> bool {
        self.0.iter().any(|t| t.matches(text))
    }
}

#[derive(Debug, Clone)]
struct Refinement {
    when: TermSet,
    l2: String,
    leaves: Vec<(TermSet, String)>,
}

#[derive(Debug, Clone)]
struct Bucket {
    name: String,
    terms: TermSet,
    weight: f64,
    refinements: Vec<Refinement>,
}

impl Bucket {
    fn compile(rule: &BucketRule) -> Result<Self> {
        let refinements = rule
            .refinements
            .iter()
            .map(|r| {
                let leaves = r
                    .l3
                    .iter()
                    .map(|leaf| Ok((TermSet::from_words(&leaf.when_any)?, leaf.l3.clone())))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Refinement {
                    when: TermSet::from_words(&r.when_any)?,
                    l2: r.l2.clone(),
                    leaves,
                })
            })
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("compiling refinements for bucket {}", rule.name))?;
        Ok(Self {
            name: rule.name.clone(),
            terms: TermSet::compile(&rule.terms)
                .with_context(|| format!("compiling bucket {}", rule.name))?,
            weight: rule.weight,
            refinements,
        })
    }

    fn refine(&self, text: &str) -> (Option<String>, Option<String>) {
        for refinement in &self.refinements {
            if refinement.when.any(text) {
                let l3 = refinement
                    .leaves
                    .iter()
                    .find(|(when, _)| when.any(text))
                    .map(|(_, l3)| l3.clone());
                return (Some(refinement.l2.clone()), l3);
            }
        }
        (None, None)
    }
}

/// Highest score wins; the first declared bucket wins ties. `None` when
/// nothing scored.
fn pick_bucket<'a>(buckets: &'a [Bucket], text: &str) -> Option<(&'a Bucket, f64)> {
    let mut best: Option<(&Bucket, f64)> = None;
    for bucket in buckets {
        let score = bucket.terms.score(text) * bucket.weight;
        if score > 0.0 && best.map_or(true, |(_, s)| score > s) {
            best = Some((bucket, score));
        }
    }
    best
}

/// Free-text fields the classifier reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaxonomyInput {
    pub title: Option<String>,
    pub skills: Option<String>,
    pub position: Option<String>,
    pub employment_type: Option<String>,
    pub description: Option<String>,
    pub industry: Option<String>,
}

impl TaxonomyInput {
    /// Description falls back to skills and industry falls back to the
    /// existing category when the record carries neither.
    pub fn from_record(record: &NormalizedRecord) -> Self {
        Self {
            title: record.title.clone(),
            skills: record.skills.clone(),
            position: record.position.clone(),
            employment_type: record.employment_type.clone(),
            description: record
                .get("description")
                .map(str::to_string)
                .or_else(|| record.skills.clone()),
            industry: record
                .get("industry")
                .map(str::to_string)
                .or_else(|| record.category_primary.clone()),
        }
    }

    fn text(&self) -> String {
        [
            &self.title,
            &self.skills,
            &self.position,
            &self.employment_type,
            &self.description,
            &self.industry,
        ]
        .into_iter()
        .flatten()
        .map(|s| s.to_lowercase())
        .collect::<Vec<_>>()
        // Not whitespace, so phrase terms never span two fields.
        .join(" | ")
    }
}

#[derive(Debug, Clone)]
pub struct Classifier {
    it_threshold: f64,
    confidence: ConfidenceRules,
    it_fallback: String,
    non_it_fallback: String,
    it_signals: TermSet,
    it_buckets: Vec<Bucket>,
    non_it_buckets: Vec<Bucket>,
}

impl Classifier {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let rules: RulesFile = serde_yaml::from_str(yaml).context("parsing taxonomy rules")?;
        if rules.version != RULES_VERSION {
            bail!(
                "unsupported taxonomy rules version {} (expected {RULES_VERSION})",
                rules.version
            );
        }
        Ok(Self {
            it_threshold: rules.it_threshold,
            confidence: rules.confidence,
            it_fallback: rules.it_fallback,
            non_it_fallback: rules.non_it_fallback,
            it_signals: TermSet::compile(&rules.it_signals).context("compiling it_signals")?,
            it_buckets: rules
                .it_buckets
                .iter()
                .map(Bucket::compile)
                .collect::<Result<_>>()?,
            non_it_buckets: rules
                .non_it_buckets
                .iter()
                .map(Bucket::compile)
                .collect::<Result<_>>()?,
        })
    }

    pub fn embedded() -> Result<Self> {
        Self::from_yaml_str(DEFAULT_RULES)
    }

    /// Loads `rules/taxonomy.yaml` under the workspace root when present.
    pub async fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("rules").join("taxonomy.yaml");
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Self::embedded();
        }
        let yaml = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&yaml).with_context(|| format!("loading {}", path.display()))
    }

    /// Pure function of the input text.
    pub fn classify(&self, input: &TaxonomyInput) -> TaxonomyResult {
        let text = input.text();
        let c = &self.confidence;
        let it_score = self.it_signals.score(&text);

        if it_score >= self.it_threshold {
            return match pick_bucket(&self.it_buckets, &text) {
                Some((bucket, score)) => {
                    let (l2, l3) = bucket.refine(&text);
                    TaxonomyResult {
                        category_primary: Category::It,
                        domain_l1: bucket.name.clone(),
                        domain_l2: l2,
                        domain_l3: l3,
                        tax_confidence: round2(
                            c.it_base + c.it_per_signal * it_score + c.it_per_bucket * score,
                        ),
                    }
                }
                None => TaxonomyResult {
                    category_primary: Category::It,
                    domain_l1: self.it_fallback.clone(),
                    domain_l2: None,
                    domain_l3: None,
                    tax_confidence: round2(c.it_base + c.it_per_signal * it_score)
                        .max(c.other_floor),
                },
            };
        }

        match pick_bucket(&self.non_it_buckets, &text) {
            Some((bucket, score)) => {
                let (l2, l3) = bucket.refine(&text);
                TaxonomyResult {
                    category_primary: Category::NonIt,
                    domain_l1: bucket.name.clone(),
                    domain_l2: l2,
                    domain_l3: l3,
                    tax_confidence: round2(c.non_it_base + c.non_it_per_bucket * score),
                }
            }
            None => TaxonomyResult {
                category_primary: Category::NonIt,
                domain_l1: self.non_it_fallback.clone(),
                domain_l2: None,
                domain_l3: None,
                tax_confidence: c.other_floor,
            },
        }
    }

    pub fn classify_record(&self, record: &NormalizedRecord) -> TaxonomyResult {
        self.classify(&TaxonomyInput::from_record(record))
    }
}

fn round2(value: f64) -> f64 {
    (value.clamp(0.0, 1.0) * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(title: &str, skills: &str) -> TaxonomyInput {
        TaxonomyInput {
            title: Some(title.into()),
            skills: Some(skills.into()),
            ..Default::default()
        }
    }

    #[test]
    fn embedded_rules_compile() {
        let classifier = Classifier::embedded().unwrap();
        assert_eq!(classifier.it_buckets.len(), 8);
        assert_eq!(classifier.non_it_buckets.len(), 14);
    }

    #[test]
    fn python_backend_refines_to_framework() {
        let classifier = Classifier::embedded().unwrap();
        let result = classifier.classify(&input("Software Engineer", "python, django"));
        assert_eq!(result.category_primary, Category::It);
        assert_eq!(result.domain_l1, "Backend");
        assert_eq!(result.domain_l2.as_deref(), Some("Python"));
        assert_eq!(result.domain_l3.as_deref(), Some("Django"));
        assert!(result.tax_confidence > 0.5 && result.tax_confidence <= 1.0);
    }

    #[test]
    fn special_syntax_terms_count_double() {
        let classifier = Classifier::embedded().unwrap();
        let result = classifier.classify(&input("Officer", "c#"));
        assert_eq!(result.category_primary, Category::It);
        assert_eq!(result.domain_l1, "Backend");
        assert_eq!(result.domain_l2.as_deref(), Some(".NET"));
    }

    #[test]
    fn lone_engineer_is_not_it() {
        let classifier = Classifier::embedded().unwrap();
        let result = classifier.classify(&TaxonomyInput {
            title: Some("Civil Engineer".into()),
            industry: Some("Construction".into()),
            ..Default::default()
        });
        assert_eq!(result.category_primary, Category::NonIt);
        assert_eq!(result.domain_l1, "Engineering");
        assert_eq!(result.domain_l2.as_deref(), Some("Civil"));
    }

    #[test]
    fn words_match_on_boundaries_only() {
        let classifier = Classifier::embedded().unwrap();
        // "javascript" must not count as "java"
        let result = classifier.classify(&input("Javascript Developer", "react"));
        assert_eq!(result.domain_l1, "Frontend");
        assert_eq!(result.domain_l2.as_deref(), Some("React"));
    }

    #[test]
    fn empty_text_falls_to_floor() {
        let classifier = Classifier::embedded().unwrap();
        let result = classifier.classify(&TaxonomyInput::default());
        assert_eq!(result.category_primary, Category::NonIt);
        assert_eq!(result.domain_l1, "Non-IT-Other");
        assert_eq!(result.domain_l2, None);
        assert_eq!(result.tax_confidence, 0.35);
    }

    #[test]
    fn classification_is_deterministic() {
        let classifier = Classifier::embedded().unwrap();
        let a = classifier.classify(&input("Sales Executive", "negotiation"));
        let b = classifier.classify(&input("Sales Executive", "negotiation"));
        assert_eq!(a, b);
        assert_eq!(a.domain_l1, "Sales");
    }

    #[test]
    fn record_input_falls_back_to_skills_and_category() {
        let record = NormalizedRecord {
            skills: Some("accounting".into()),
            category_primary: Some("Non-IT".into()),
            ..Default::default()
        };
        let input = TaxonomyInput::from_record(&record);
        assert_eq!(input.description.as_deref(), Some("accounting"));
        assert_eq!(input.industry.as_deref(), Some("Non-IT"));
    }

    #[tokio::test]
    async fn workspace_override_is_used_when_present() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("rules")).unwrap();
        std::fs::write(
            dir.path().join("rules/taxonomy.yaml"),
            r#"
version: 1
it_threshold: 1
confidence: { it_base: 0.5, it_per_signal: 0.1, it_per_bucket: 0.1, non_it_base: 0.4, non_it_per_bucket: 0.1, other_floor: 0.3 }
it_fallback: IT-Other
non_it_fallback: Non-IT-Other
it_signals: { keywords: [cobol] }
it_buckets:
  - name: Legacy
    keywords: [cobol]
"#,
        )
        .unwrap();
        let classifier = Classifier::from_workspace_root(dir.path()).await.unwrap();
        let result = classifier.classify(&input("Cobol maintainer", ""));
        assert_eq!(result.domain_l1, "Legacy");

        let fallback = Classifier::from_workspace_root(&dir.path().join("missing"))
            .await
            .unwrap();
        assert_eq!(fallback.it_buckets.len(), 8);
    }

    #[test]
    fn unknown_rules_version_is_rejected() {
        let yaml = DEFAULT_RULES.replacen("version: 1", "version: 2", 1);
        let err = Classifier::from_yaml_str(&yaml).unwrap_err();
        assert!(err.to_string().contains("version 2"), "{err}");
    }

    #[test]
    fn phrases_do_not_span_fields() {
        let phrase = TermSet::compile(&TermRules {
            phrases: vec!["software engineer".into()],
            ..Default::default()
        })
        .unwrap();
        let split = input("Senior Software", "Engineer mindset");
        assert_eq!(phrase.score(&split.text()), 0.0);
        let joined = input("Senior Software Engineer", "");
        assert_eq!(phrase.score(&joined.text()), 2.0);
    }
}
