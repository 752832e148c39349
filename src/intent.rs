//! Intent Analyzer (C4).
//!
//! `analyze` resolves the last user turn to an [`IntentResult`] through a
//! four-layer cache, consulted in order, cheapest first: an exact hash of
//! the turn text, a near-duplicate match against recently seen turns, a
//! bounded call to a small/fast provider profile, and finally a pure
//! keyword fallback that never fails. `wants_to_stop`/`wants_rollback` on
//! the result let the RVR-B executor short-circuit without spending a
//! turn on tool selection.

use crate::provider::{ContentDelta, ProviderAdapter, ProviderRequest, StreamEvent};
use crate::types::{Complexity, ContentBlock, IntentResult, IntentSource, Message};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// How long a cached result (exact or near-duplicate) stays valid.
fn cache_ttl() -> chrono::Duration {
    chrono::Duration::seconds(300)
}

/// Default bound on the model-call layer before falling back to keywords.
const DEFAULT_MODEL_TIMEOUT: Duration = Duration::from_millis(200);

/// Two turns are considered near-duplicates when their keyword sets
/// overlap at least this much (Jaccard similarity).
const NEAR_DUPLICATE_THRESHOLD: f32 = 0.8;

/// Cap on how many recent turns the near-duplicate layer remembers.
const NEAR_DUPLICATE_HISTORY: usize = 64;

struct CacheEntry {
    result: IntentResult,
    cached_at: DateTime<Utc>,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        Utc::now() - self.cached_at > cache_ttl()
    }
}

struct NearDuplicateEntry {
    keywords: HashSet<String>,
    entry: CacheEntry,
}

/// Resolves user intent through the cache/model/keyword cascade described
/// above. Cheap to clone via `Arc` and share across sessions — the caches
/// are keyed on turn content, not session identity.
pub struct IntentAnalyzer {
    exact_cache: DashMap<u64, CacheEntry>,
    near_duplicates: RwLock<Vec<NearDuplicateEntry>>,
    model: Arc<dyn ProviderAdapter>,
    model_name: String,
    model_timeout: Duration,
}

impl IntentAnalyzer {
    pub fn new(model: Arc<dyn ProviderAdapter>, model_name: impl Into<String>) -> Self {
        Self {
            exact_cache: DashMap::new(),
            near_duplicates: RwLock::new(Vec::new()),
            model,
            model_name: model_name.into(),
            model_timeout: DEFAULT_MODEL_TIMEOUT,
        }
    }

    pub fn with_model_timeout(mut self, timeout: Duration) -> Self {
        self.model_timeout = timeout;
        self
    }

    /// Resolve the intent of the conversation's last user turn. Never
    /// fails: the keyword layer is a total function, so worst case this
    /// returns a low-confidence [`IntentSource::KeywordFallback`] result.
    pub async fn analyze(&self, messages: &[Message]) -> IntentResult {
        let text = last_user_text(messages);
        let is_follow_up = messages.iter().filter(|m| m.role == crate::types::MessageRole::User).count() > 1;

        if text.trim().is_empty() {
            return keyword_fallback("", is_follow_up);
        }

        let hash = hash_text(&text);
        if let Some(hit) = self.exact_cache.get(&hash) {
            if !hit.is_expired() {
                let mut result = hit.result.clone();
                result.source = IntentSource::ExactCache;
                return result;
            }
        }
        self.exact_cache.remove(&hash);

        let keywords = keyword_set(&text);
        if let Some(result) = self.check_near_duplicate(&keywords) {
            self.exact_cache.insert(hash, CacheEntry { result: result.clone(), cached_at: Utc::now() });
            return result;
        }

        if let Some(result) = self.call_model(&text, is_follow_up).await {
            self.store(hash, keywords, result.clone());
            return result;
        }

        let result = keyword_fallback(&text, is_follow_up);
        self.store(hash, keywords, result.clone());
        result
    }

    fn check_near_duplicate(&self, keywords: &HashSet<String>) -> Option<IntentResult> {
        let guard = self.near_duplicates.read().unwrap();
        for candidate in guard.iter().rev() {
            if candidate.entry.is_expired() {
                continue;
            }
            if jaccard(keywords, &candidate.keywords) >= NEAR_DUPLICATE_THRESHOLD {
                let mut result = candidate.entry.result.clone();
                result.source = IntentSource::NearDuplicateCache;
                return Some(result);
            }
        }
        None
    }

    fn store(&self, hash: u64, keywords: HashSet<String>, result: IntentResult) {
        self.exact_cache.insert(hash, CacheEntry { result: result.clone(), cached_at: Utc::now() });

        let mut guard = self.near_duplicates.write().unwrap();
        if guard.len() >= NEAR_DUPLICATE_HISTORY {
            guard.remove(0);
        }
        guard.push(NearDuplicateEntry { keywords, entry: CacheEntry { result, cached_at: Utc::now() } });
    }

    /// Run the small-model layer under a bounded timeout; `None` on
    /// timeout, provider error, or an unparseable response, so the caller
    /// always has a keyword fallback to reach for.
    async fn call_model(&self, text: &str, is_follow_up: bool) -> Option<IntentResult> {
        let request = ProviderRequest {
            model: self.model_name.clone(),
            messages: vec![Message::user(format!(
                "Classify the user's turn. Respond as JSON only: {{\"complexity\": \"simple|medium|complex\", \
                 \"skill_groups\": [], \"skip_memory\": false, \"wants_to_stop\": false, \"wants_rollback\": false}}. \
                 Turn: {text}"
            ))],
            tools: Vec::new(),
            max_tokens: Some(128),
            temperature: Some(0.0),
        };

        let call = async {
            let mut stream = self.model.send(request).await.ok()?;
            let mut collected = String::new();
            while let Some(event) = stream.next().await {
                match event {
                    Ok(StreamEvent::ContentBlockDelta { delta: ContentDelta::TextDelta(text), .. }) => {
                        collected.push_str(&text);
                    }
                    Ok(StreamEvent::MessageStop) => break,
                    Ok(_) => continue,
                    Err(_) => return None,
                }
            }
            parse_model_response(&collected, is_follow_up)
        };

        tokio::time::timeout(self.model_timeout, call).await.ok().flatten()
    }
}

#[derive(serde::Deserialize)]
struct ModelIntentResponse {
    complexity: Complexity,
    #[serde(default)]
    skill_groups: Vec<String>,
    #[serde(default)]
    skip_memory: bool,
    #[serde(default)]
    wants_to_stop: bool,
    #[serde(default)]
    wants_rollback: bool,
}

fn parse_model_response(raw: &str, is_follow_up: bool) -> Option<IntentResult> {
    let parsed: ModelIntentResponse = serde_json::from_str(raw.trim()).ok()?;
    Some(IntentResult {
        complexity: parsed.complexity,
        skill_groups: parsed.skill_groups.into_iter().collect(),
        skip_memory: parsed.skip_memory,
        wants_to_stop: parsed.wants_to_stop,
        is_follow_up,
        wants_rollback: parsed.wants_rollback,
        source: IntentSource::ModelCall,
    })
}

fn last_user_text(messages: &[Message]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role == crate::types::MessageRole::User)
        .map(|m| {
            m.content
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text(t) => Some(t.text.clone()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

fn hash_text(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.trim().to_lowercase().hash(&mut hasher);
    hasher.finish()
}

fn keyword_set(text: &str) -> HashSet<String> {
    text.to_lowercase().split_whitespace().map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string()).filter(|w| !w.is_empty()).collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f32 / union as f32
    }
}

const STOP_KEYWORDS: &[&str] = &["stop", "cancel", "abort", "halt", "quit", "nevermind"];
const ROLLBACK_KEYWORDS: &[&str] = &["rollback", "revert", "undo"];
const SIMPLE_WORD_CEILING: usize = 12;

/// Pure, never-failing fallback: a handful of keyword checks plus a
/// crude length heuristic for complexity. Always runs with no cache
/// layer or model call, so `analyze` always has something to return.
fn keyword_fallback(text: &str, is_follow_up: bool) -> IntentResult {
    let lower = text.to_lowercase();
    let wants_to_stop = STOP_KEYWORDS.iter().any(|k| lower.contains(k));
    let wants_rollback = !wants_to_stop && ROLLBACK_KEYWORDS.iter().any(|k| lower.contains(k));
    let complexity = if text.split_whitespace().count() <= SIMPLE_WORD_CEILING {
        Complexity::Simple
    } else {
        Complexity::Medium
    };

    IntentResult {
        complexity,
        skill_groups: HashSet::new(),
        skip_memory: false,
        wants_to_stop,
        is_follow_up,
        wants_rollback,
        source: IntentSource::KeywordFallback,
    }
}
