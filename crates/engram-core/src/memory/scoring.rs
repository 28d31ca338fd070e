//! Importance and relevance scoring
//!
//! Pure functions over row attributes; the injected clock supplies "now"
//! so tests can pin time. Importance is recomputed on every write that
//! touches a memory row; relevance is computed per query.

use std::collections::HashMap;

/// Tunable scoring weights and time constants
#[derive(Debug, Clone)]
pub struct ScoringParams {
    /// Reference access count N for the log-frequency term
    pub ref_access_count: u64,
    /// Default recency time constant, milliseconds
    pub default_tau_ms: i64,
    /// Per-category overrides of the time constant
    pub tau_per_category: HashMap<String, i64>,
    /// Weight of the access-frequency term in importance
    pub w_frequency: f64,
    /// Weight of the recency term in importance
    pub w_recency: f64,
    /// Constant added for pinned rows (importance saturates at 1)
    pub pinned_bonus: f64,
    /// Unit boost applied by metadata priority tags
    pub priority_boost: f64,
    /// Relevance: weight of semantic similarity
    pub w_similarity: f64,
    /// Relevance: weight of recency
    pub w_rel_recency: f64,
    /// Relevance: weight of stored importance
    pub w_importance: f64,
    /// Relevance: weight of the pinned flag
    pub w_pinned: f64,
}

impl Default for ScoringParams {
    fn default() -> Self {
        Self {
            ref_access_count: 100,
            default_tau_ms: 7 * 24 * 60 * 60 * 1000,
            tau_per_category: HashMap::new(),
            w_frequency: 0.25,
            w_recency: 0.25,
            pinned_bonus: 1.0,
            priority_boost: 0.1,
            w_similarity: 0.5,
            w_rel_recency: 0.2,
            w_importance: 0.2,
            w_pinned: 0.1,
        }
    }
}

impl ScoringParams {
    /// Time constant for a category
    pub fn tau_ms(&self, category: &str) -> i64 {
        self.tau_per_category
            .get(category)
            .copied()
            .unwrap_or(self.default_tau_ms)
            .max(1)
    }
}

/// Bounded boost derived from a metadata priority tag
pub fn priority_boost(metadata: &serde_json::Value, unit: f64) -> f64 {
    match metadata.get("priority").and_then(serde_json::Value::as_str) {
        Some("critical") => 1.5 * unit,
        Some("high") => unit,
        Some("low") => -0.5 * unit,
        _ => 0.0,
    }
}

/// Whether the metadata pins the row
pub fn is_pinned(metadata: &serde_json::Value) -> bool {
    metadata
        .get("pinned")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
}

/// Importance in [0, 1]: base plus weighted access-frequency and recency
/// contributions, a saturating pinned constant, and bounded priority boosts
pub fn importance(
    params: &ScoringParams,
    base: f64,
    access_count: i64,
    age_ms: i64,
    category: &str,
    metadata: &serde_json::Value,
) -> f64 {
    let frequency = if params.ref_access_count == 0 {
        0.0
    } else {
        let ac = access_count.max(0) as f64;
        (1.0 + ac).ln() / (1.0 + params.ref_access_count as f64).ln()
    };
    let tau = params.tau_ms(category) as f64;
    let recency = (-(age_ms.max(0) as f64) / tau).exp();
    let pinned = if is_pinned(metadata) {
        params.pinned_bonus
    } else {
        0.0
    };
    let boost = priority_boost(metadata, params.priority_boost);

    (base + params.w_frequency * frequency + params.w_recency * recency + pinned + boost)
        .clamp(0.0, 1.0)
}

/// Relevance for a query: strictly increasing in similarity and stored
/// importance, strictly decreasing in age
pub fn relevance(
    params: &ScoringParams,
    similarity: f32,
    age_ms: i64,
    category: &str,
    importance: f64,
    metadata: &serde_json::Value,
) -> f64 {
    let sim = (f64::from(similarity).clamp(-1.0, 1.0) + 1.0) / 2.0;
    let tau = params.tau_ms(category) as f64;
    let recency = (-(age_ms.max(0) as f64) / tau).exp();
    let pinned = if is_pinned(metadata) { 1.0 } else { 0.0 };

    params.w_similarity * sim
        + params.w_rel_recency * recency
        + params.w_importance * importance
        + params.w_pinned * pinned
}
