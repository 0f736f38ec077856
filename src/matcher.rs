//! Blocking and pairwise match scoring.
//!
//! Matching reduces the O(n²) comparison problem in two steps: records are
//! bucketed by a cheap blocking key, then every pair inside a block is
//! scored with a weighted combination of field-level similarities. Pairs
//! scoring above the configured threshold become [`MatchResult`]s; pairs
//! below it are dropped, not retained as non-matches.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{OnceLock, RwLock};
use std::thread;

use crossbeam_channel::bounded;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{AurumError, AurumResult, DataQualityError, ValidationError};
use crate::record::SourceRecord;
use crate::value::AttributeValue;

/// A field similarity at or above this floor counts as having contributed
/// positively to the pair (and lands in `matched_fields`). Part of the
/// scoring contract, not configuration.
const FIELD_MATCH_FLOOR: f64 = 0.9;

const REGEX_CACHE_MAX: usize = 256;

static REGEX_CACHE: OnceLock<RwLock<HashMap<String, regex::Regex>>> = OnceLock::new();

fn cached_regex(pattern: &str) -> Result<regex::Regex, ValidationError> {
    let cache = REGEX_CACHE.get_or_init(|| RwLock::new(HashMap::new()));

    {
        let guard = cache.read().unwrap_or_else(|e| e.into_inner());
        if let Some(re) = guard.get(pattern) {
            return Ok(re.clone());
        }
    }

    let compiled = regex::Regex::new(pattern).map_err(|e| ValidationError::InvalidExtractPattern {
        reason: format!("invalid regex '{pattern}': {e}"),
    })?;

    let mut guard = cache.write().unwrap_or_else(|e| e.into_inner());

    if guard.len() >= REGEX_CACHE_MAX {
        // Keep the cache bounded to avoid unbounded memory usage.
        guard.clear();
    }

    // Another thread may have inserted it while we compiled.
    guard
        .entry(pattern.to_string())
        .or_insert_with(|| compiled.clone());
    Ok(compiled)
}

/// How the blocking key is derived from the blocking attribute's value.
///
/// This is a recall/cost tradeoff: too coarse a key explodes block sizes,
/// too fine a key separates true matches into different blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BlockingStrategy {
    /// Trimmed, lower-cased attribute value.
    Exact,

    /// Lower-cased first `len` characters of the trimmed value.
    Prefix { len: usize },

    /// First capture group of `pattern` applied to the value, lower-cased
    /// (e.g. the domain part of an email address).
    Extract { pattern: String },
}

/// Which attribute records are bucketed by, and how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockingConfig {
    /// Attribute the key is derived from.
    pub attribute: String,

    /// Key derivation strategy.
    pub strategy: BlockingStrategy,
}

impl BlockingConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.attribute.trim().is_empty() {
            return Err(ValidationError::EmptyBlockingAttribute);
        }
        match &self.strategy {
            BlockingStrategy::Exact => Ok(()),
            BlockingStrategy::Prefix { len } => {
                if *len == 0 {
                    Err(ValidationError::ZeroPrefixLength)
                } else {
                    Ok(())
                }
            }
            BlockingStrategy::Extract { pattern } => cached_regex(pattern).map(|_| ()),
        }
    }

    /// Computes the blocking key for a record.
    ///
    /// # Errors
    ///
    /// Returns a [`DataQualityError`] (wrapped) when the record is missing
    /// the blocking attribute or the key comes out empty; the record is
    /// excluded from matching, never fatal to the batch.
    pub fn key_for(&self, record: &SourceRecord) -> AurumResult<String> {
        let Some(value) = record.non_null_attr(&self.attribute) else {
            return Err(DataQualityError::MissingBlockingAttribute {
                record_id: record.record_id.clone(),
                attribute: self.attribute.clone(),
            }
            .into());
        };

        let raw = match value {
            AttributeValue::String(s) => s.trim().to_lowercase(),
            other => other.to_string().to_lowercase(),
        };

        let key = match &self.strategy {
            BlockingStrategy::Exact => raw,
            BlockingStrategy::Prefix { len } => raw.chars().take(*len).collect(),
            BlockingStrategy::Extract { pattern } => {
                let re = cached_regex(pattern)?;
                re.captures(&raw)
                    .and_then(|caps| caps.get(1))
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default()
            }
        };

        if key.is_empty() {
            return Err(DataQualityError::EmptyBlockingKey {
                record_id: record.record_id.clone(),
                attribute: self.attribute.clone(),
            }
            .into());
        }

        Ok(key)
    }
}

/// Field-level similarity function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMethod {
    /// Jaro-Winkler string similarity; good for names and short free text.
    JaroWinkler,

    /// Jaccard overlap of lower-cased whitespace tokens.
    TokenOverlap,

    /// Case-insensitive equality; the exact-match boost for emails and
    /// external ids.
    Exact,
}

/// One attribute's contribution to the pair score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchField {
    /// Attribute to compare.
    pub attribute: String,

    /// Relative weight in the combined score. Must be positive.
    pub weight: f64,

    /// Similarity function applied to the attribute's values.
    pub method: SimilarityMethod,
}

/// Matcher configuration: blocking key, scored fields, and threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatcherConfig {
    /// Blocking key derivation.
    pub blocking: BlockingConfig,

    /// Fields contributing to the pair score.
    pub fields: Vec<MatchField>,

    /// Pairs scoring strictly above this value become matches.
    pub threshold: f64,

    /// Worker threads for block scoring. 1 disables parallelism.
    pub workers: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            blocking: BlockingConfig {
                attribute: "name".to_string(),
                strategy: BlockingStrategy::Prefix { len: 3 },
            },
            fields: vec![
                MatchField {
                    attribute: "name".to_string(),
                    weight: 0.5,
                    method: SimilarityMethod::JaroWinkler,
                },
                MatchField {
                    attribute: "email".to_string(),
                    weight: 0.5,
                    method: SimilarityMethod::Exact,
                },
            ],
            threshold: 0.8,
            workers: 4,
        }
    }
}

impl MatcherConfig {
    /// Fail-fast validation; a bad matcher configuration aborts the batch.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.blocking.validate()?;
        if self.fields.is_empty() {
            return Err(ValidationError::NoMatchFields);
        }
        for field in &self.fields {
            if field.weight <= 0.0 || !field.weight.is_finite() {
                return Err(ValidationError::NonPositiveWeight {
                    attribute: field.attribute.clone(),
                    weight: field.weight,
                });
            }
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(ValidationError::ThresholdOutOfRange {
                value: self.threshold,
            });
        }
        Ok(())
    }
}

/// An above-threshold candidate pair.
///
/// The pair is unordered; it is stored canonically with
/// `record_a < record_b` so the same pair always compares equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    /// Lexicographically smaller record id of the pair.
    pub record_a: String,

    /// Lexicographically larger record id of the pair.
    pub record_b: String,

    /// Combined similarity in [0, 1].
    pub score: f64,

    /// Attributes whose similarity reached the match floor.
    pub matched_fields: BTreeSet<String>,
}

impl MatchResult {
    fn new(a: &str, b: &str, score: f64, matched_fields: BTreeSet<String>) -> Self {
        let (record_a, record_b) = if a <= b { (a, b) } else { (b, a) };
        Self {
            record_a: record_a.to_string(),
            record_b: record_b.to_string(),
            score,
            matched_fields,
        }
    }
}

/// A record excluded from matching, with the reason, for operator review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedRecord {
    /// Id of the excluded record.
    pub record_id: String,

    /// Human-readable exclusion reason.
    pub reason: String,
}

/// Output of one matching pass over a batch.
#[derive(Debug, Clone, Default)]
pub struct MatchOutcome {
    /// Above-threshold pairs, sorted by canonical pair order.
    pub matches: Vec<MatchResult>,

    /// Records excluded for data-quality reasons.
    pub skipped: Vec<SkippedRecord>,

    /// Number of pairwise comparisons performed.
    pub compared_pairs: usize,
}

fn token_set(s: &str) -> BTreeSet<String> {
    s.split_whitespace().map(str::to_lowercase).collect()
}

fn numeric_eq(a: &AttributeValue, b: &AttributeValue) -> Option<bool> {
    match (a.as_float(), b.as_float()) {
        (Some(x), Some(y)) => Some((x - y).abs() <= f64::EPSILON * x.abs().max(y.abs()).max(1.0)),
        _ => None,
    }
}

/// Similarity of two non-null values under a method. Symmetric.
fn similarity(a: &AttributeValue, b: &AttributeValue, method: SimilarityMethod) -> f64 {
    // Non-string scalars carry no useful edit distance; they compare by
    // equality under every method.
    if let Some(eq) = numeric_eq(a, b) {
        return if eq { 1.0 } else { 0.0 };
    }

    match (a, b) {
        (AttributeValue::String(x), AttributeValue::String(y)) => {
            let x = x.trim().to_lowercase();
            let y = y.trim().to_lowercase();
            match method {
                SimilarityMethod::JaroWinkler => strsim::jaro_winkler(&x, &y),
                SimilarityMethod::TokenOverlap => {
                    let tx = token_set(&x);
                    let ty = token_set(&y);
                    let intersection = tx.intersection(&ty).count();
                    let union = tx.union(&ty).count();
                    if union == 0 {
                        0.0
                    } else {
                        intersection as f64 / union as f64
                    }
                }
                SimilarityMethod::Exact => {
                    if x == y {
                        1.0
                    } else {
                        0.0
                    }
                }
            }
        }
        _ => {
            if a == b {
                1.0
            } else {
                0.0
            }
        }
    }
}

/// Scores one pair of records over the configured fields.
///
/// Only fields both records define (non-null) contribute; a pair with no
/// comparable field scores 0. The score is symmetric in its arguments.
#[must_use]
pub fn score_pair(
    a: &SourceRecord,
    b: &SourceRecord,
    fields: &[MatchField],
) -> (f64, BTreeSet<String>) {
    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;
    let mut matched_fields = BTreeSet::new();

    for field in fields {
        let (Some(va), Some(vb)) = (
            a.non_null_attr(&field.attribute),
            b.non_null_attr(&field.attribute),
        ) else {
            continue;
        };

        let sim = similarity(va, vb, field.method);
        weighted_sum += field.weight * sim;
        weight_total += field.weight;
        if sim >= FIELD_MATCH_FLOOR {
            matched_fields.insert(field.attribute.clone());
        }
    }

    if weight_total <= 0.0 {
        return (0.0, matched_fields);
    }
    (weighted_sum / weight_total, matched_fields)
}

fn score_block(records: &[SourceRecord], block: &[usize], cfg: &MatcherConfig) -> Vec<MatchResult> {
    let mut out = Vec::new();
    for (i, &ai) in block.iter().enumerate() {
        for &bi in &block[i + 1..] {
            let a = &records[ai];
            let b = &records[bi];
            let (score, matched_fields) = score_pair(a, b, &cfg.fields);
            if score > cfg.threshold {
                out.push(MatchResult::new(
                    &a.record_id,
                    &b.record_id,
                    score,
                    matched_fields,
                ));
            }
        }
    }
    out
}

fn score_blocks(
    records: &[SourceRecord],
    blocks: &[Vec<usize>],
    cfg: &MatcherConfig,
) -> Vec<MatchResult> {
    let workers = cfg.workers.max(1).min(blocks.len());
    if workers <= 1 {
        return blocks
            .iter()
            .flat_map(|block| score_block(records, block, cfg))
            .collect();
    }

    // Fan blocks out to a bounded worker pool; block comparisons share no
    // mutable state, so each worker scores independently and the results
    // are collected behind the barrier below.
    let (task_tx, task_rx) = bounded::<&Vec<usize>>(blocks.len());
    let (result_tx, result_rx) = bounded::<Vec<MatchResult>>(blocks.len());

    thread::scope(|scope| {
        for i in 0..workers {
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            thread::Builder::new()
                .name(format!("aurum-match-{i}"))
                .spawn_scoped(scope, move || {
                    while let Ok(block) = task_rx.recv() {
                        let _ = result_tx.send(score_block(records, block, cfg));
                    }
                })
                .expect("failed to spawn aurum match worker");
        }
        drop(result_tx);

        for block in blocks {
            let _ = task_tx.send(block);
        }
        drop(task_tx);

        result_rx.iter().flatten().collect()
    })
}

/// Runs blocking and pairwise scoring over a batch.
///
/// Records missing the blocking attribute are skipped and reported, not
/// fatal. The returned matches are sorted by canonical pair order, so the
/// output is deterministic regardless of worker scheduling.
///
/// # Errors
///
/// Returns a [`ValidationError`] (wrapped) when the matcher configuration
/// is invalid; that aborts the batch.
pub fn match_batch(records: &[SourceRecord], cfg: &MatcherConfig) -> AurumResult<MatchOutcome> {
    cfg.validate()?;

    let mut blocks: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    let mut skipped = Vec::new();

    for (idx, record) in records.iter().enumerate() {
        match cfg.blocking.key_for(record) {
            Ok(key) => blocks.entry(key).or_default().push(idx),
            Err(AurumError::DataQuality(err)) => {
                warn!(record_id = %record.record_id, error = %err, "record excluded from matching");
                skipped.push(SkippedRecord {
                    record_id: record.record_id.clone(),
                    reason: err.to_string(),
                });
            }
            Err(other) => return Err(other),
        }
    }

    let blocks: Vec<Vec<usize>> = blocks
        .into_values()
        .filter(|members| members.len() > 1)
        .collect();
    let compared_pairs = blocks.iter().map(|b| b.len() * (b.len() - 1) / 2).sum();

    let mut matches = score_blocks(records, &blocks, cfg);
    matches.sort_by(|x, y| {
        x.record_a
            .cmp(&y.record_a)
            .then_with(|| x.record_b.cmp(&y.record_b))
    });

    debug!(
        records = records.len(),
        blocks = blocks.len(),
        compared_pairs,
        matches = matches.len(),
        skipped = skipped.len(),
        "matching pass complete"
    );

    Ok(MatchOutcome {
        matches,
        skipped,
        compared_pairs,
    })
}
