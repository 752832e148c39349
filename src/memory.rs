//! Memory & Playbook Injectors (C9).
//!
//! Two collaborators feed the context pipeline's `UserContext` phase:
//! [`MemoryFusion`], which blends markdown, keyword-FTS, and semantic
//! recall into one deduplicated block per [`crate::config::MemoryFusionWeights`],
//! and [`PlaybookStore`], which holds reusable playbooks through a
//! draft/approved/rejected lifecycle and contributes only approved ones
//! to a turn's prompt. Both implement [`crate::context::ContextInjector`],
//! whose `render` is synchronous — `refresh` does the async retrieval
//! ahead of a turn and caches the rendered block for `render` to read.

use crate::config::MemoryFusionWeights;
use crate::context::{CacheClass, ContextInjector, InjectorPhase};
use crate::store::{MarkdownMemoryStore, RetrievedMemory, VectorStore};
use crate::types::Conversation;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};

const FUSION_TOKEN_BUDGET: usize = 800;
const DEDUP_JACCARD_THRESHOLD: f32 = 0.85;

fn word_set(text: &str) -> HashSet<String> {
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

/// Deduplicate `hits` by pairwise Jaccard similarity over word sets,
/// keeping the first (highest-scored, since callers sort before calling)
/// occurrence of any near-duplicate cluster.
fn dedup_by_similarity(hits: Vec<RetrievedMemory>) -> Vec<RetrievedMemory> {
    let mut kept: Vec<(HashSet<String>, RetrievedMemory)> = Vec::new();
    for hit in hits {
        let words = word_set(&hit.text);
        let is_duplicate = kept.iter().any(|(kept_words, _)| jaccard(kept_words, &words) >= DEDUP_JACCARD_THRESHOLD);
        if !is_duplicate {
            kept.push((words, hit));
        }
    }
    kept.into_iter().map(|(_, hit)| hit).collect()
}

/// Blends the three memory sources: read every markdown entry (weight
/// `markdown`), keyword-search it (weight `keyword_fts`), and
/// semantically search the vector store (weight `semantic`), combining
/// each hit's raw score by its source's weight before ranking and
/// deduplicating across all three.
pub struct MemoryFusion {
    markdown: Arc<dyn MarkdownMemoryStore>,
    vector: Arc<dyn VectorStore>,
    weights: MemoryFusionWeights,
    cached_render: RwLock<String>,
}

impl MemoryFusion {
    pub fn new(markdown: Arc<dyn MarkdownMemoryStore>, vector: Arc<dyn VectorStore>, weights: MemoryFusionWeights) -> Self {
        Self { markdown, vector, weights, cached_render: RwLock::new(String::new()) }
    }

    /// Run the three-source fusion for `query` and cache the rendered
    /// block. Called once ahead of a turn (skipped entirely when the
    /// turn's intent result sets `skip_memory`).
    pub async fn refresh(&self, query: &str, limit: usize) -> crate::error::Result<()> {
        let markdown_hits: Vec<RetrievedMemory> = self
            .markdown
            .read_all()
            .await?
            .into_iter()
            .map(|h| RetrievedMemory { score: h.score * self.weights.markdown, ..h })
            .collect();

        let keyword_hits: Vec<RetrievedMemory> = self
            .markdown
            .keyword_search(query, limit)
            .await?
            .into_iter()
            .map(|h| RetrievedMemory { score: h.score * self.weights.keyword_fts, ..h })
            .collect();

        let semantic_hits: Vec<RetrievedMemory> =
            self.vector.query(query, limit).await?.into_iter().map(|h| RetrievedMemory { score: h.score * self.weights.semantic, ..h }).collect();

        let mut all: Vec<RetrievedMemory> = markdown_hits.into_iter().chain(keyword_hits).chain(semantic_hits).collect();
        all.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        let deduped = dedup_by_similarity(all);

        let rendered = if deduped.is_empty() {
            String::new()
        } else {
            deduped.iter().take(limit).map(|h| format!("- ({}) {}", h.source, h.text)).collect::<Vec<_>>().join("\n")
        };

        *self.cached_render.write().unwrap() = rendered;
        Ok(())
    }
}

impl ContextInjector for MemoryFusion {
    fn name(&self) -> &str {
        "memory_fusion"
    }

    fn phase(&self) -> InjectorPhase {
        InjectorPhase::UserContext
    }

    fn token_budget(&self) -> usize {
        FUSION_TOKEN_BUDGET
    }

    fn cache_class(&self) -> CacheClass {
        CacheClass::Dynamic
    }

    fn render(&self, _conversation: &Conversation) -> String {
        self.cached_render.read().unwrap().clone()
    }
}

/// A playbook's approval lifecycle. Only `Approved` playbooks are
/// injected into a turn's prompt; `Draft` entries await review and
/// `Rejected` ones are retained for audit but never surfaced again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybookStatus {
    Draft,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Playbook {
    pub id: String,
    pub title: String,
    pub body: String,
    pub status: PlaybookStatus,
    pub tags: HashSet<String>,
    pub created_at: DateTime<Utc>,
}

impl Playbook {
    pub fn draft(id: impl Into<String>, title: impl Into<String>, body: impl Into<String>, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            body: body.into(),
            status: PlaybookStatus::Draft,
            tags: tags.into_iter().map(Into::into).collect(),
            created_at: Utc::now(),
        }
    }
}

const PLAYBOOK_TOKEN_BUDGET: usize = 600;

/// Holds playbooks through their review lifecycle and, as a
/// [`ContextInjector`], contributes only `Approved` playbooks matching
/// the turn's query tags. Post-session extraction proposes new drafts
/// from a completed session's tool invocation history; those sit in
/// `Draft` until a human (or a future automated reviewer) approves or
/// rejects them — the injector never surfaces them until then, so a bad
/// extraction can't immediately contaminate the next turn's prompt.
pub struct PlaybookStore {
    playbooks: DashMap<String, Playbook>,
    matched: RwLock<Vec<String>>,
}

impl PlaybookStore {
    pub fn new() -> Self {
        Self { playbooks: DashMap::new(), matched: RwLock::new(Vec::new()) }
    }

    pub fn add(&self, playbook: Playbook) {
        self.playbooks.insert(playbook.id.clone(), playbook);
    }

    pub fn approve(&self, id: &str) -> bool {
        self.set_status(id, PlaybookStatus::Approved)
    }

    pub fn reject(&self, id: &str) -> bool {
        self.set_status(id, PlaybookStatus::Rejected)
    }

    fn set_status(&self, id: &str, status: PlaybookStatus) -> bool {
        self.playbooks.get_mut(id).map(|mut entry| entry.status = status).is_some()
    }

    /// Two-layer query: an exact tag match first (cheap, precise), then
    /// falling back to a keyword match over title/body if nothing
    /// matched on tags, so a playbook without a matching tag can still
    /// surface via its content.
    pub fn query(&self, skill_groups: &HashSet<String>, text: &str) -> Vec<Playbook> {
        let approved: Vec<Playbook> = self.playbooks.iter().filter(|e| e.status == PlaybookStatus::Approved).map(|e| e.value().clone()).collect();

        let tag_matches: Vec<Playbook> = approved.iter().filter(|p| !p.tags.is_disjoint(skill_groups)).cloned().collect();
        if !tag_matches.is_empty() {
            return tag_matches;
        }

        let query_words = word_set(text);
        approved.into_iter().filter(|p| !word_set(&p.body).is_disjoint(&query_words) || !word_set(&p.title).is_disjoint(&query_words)).collect()
    }

    /// Refresh the cached injector output for this turn's skill groups
    /// and query text.
    pub fn refresh(&self, skill_groups: &HashSet<String>, text: &str) {
        let matches = self.query(skill_groups, text);
        *self.matched.write().unwrap() = matches.into_iter().map(|p| format!("### {}\n{}", p.title, p.body)).collect();
    }

    /// Propose a draft playbook from a completed session's successful
    /// tool sequence, tagged by its skill groups. Extraction never
    /// auto-approves — a draft only becomes visible to future turns once
    /// [`PlaybookStore::approve`] is called.
    pub fn extract_draft(&self, title: impl Into<String>, steps: &[String], tags: impl IntoIterator<Item = impl Into<String>>) -> Playbook {
        let body = steps.iter().enumerate().map(|(i, step)| format!("{}. {step}", i + 1)).collect::<Vec<_>>().join("\n");
        let id = format!("draft-{}", uuid::Uuid::new_v4());
        let playbook = Playbook::draft(id, title, body, tags);
        self.add(playbook.clone());
        playbook
    }
}

impl Default for PlaybookStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextInjector for PlaybookStore {
    fn name(&self) -> &str {
        "playbooks"
    }

    fn phase(&self) -> InjectorPhase {
        InjectorPhase::UserContext
    }

    fn token_budget(&self) -> usize {
        PLAYBOOK_TOKEN_BUDGET
    }

    fn cache_class(&self) -> CacheClass {
        CacheClass::Session
    }

    fn render(&self, _conversation: &Conversation) -> String {
        self.matched.read().unwrap().join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryMarkdownStore, InMemoryVectorStore};

    #[test]
    fn jaccard_of_identical_sets_is_one() {
        let a = word_set("dark mode preference");
        let b = word_set("dark mode preference");
        assert_eq!(jaccard(&a, &b), 1.0);
    }

    #[test]
    fn dedup_collapses_near_duplicate_hits() {
        let hits = vec![
            RetrievedMemory { text: "user prefers dark mode".into(), score: 0.9, source: "markdown".into() },
            RetrievedMemory { text: "user prefers dark mode theme".into(), score: 0.5, source: "keyword".into() },
            RetrievedMemory { text: "completely unrelated fact".into(), score: 0.4, source: "semantic".into() },
        ];
        let deduped = dedup_by_similarity(hits);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].text, "user prefers dark mode");
    }

    #[tokio::test]
    async fn fusion_refresh_renders_weighted_and_deduped_sources() {
        let markdown = Arc::new(InMemoryMarkdownStore::new());
        markdown.add("note-1", "the user prefers dark mode themes");
        let vector = Arc::new(InMemoryVectorStore::new());
        vector.upsert("note-1-dup", "the user prefers dark mode themes").await.unwrap();

        let fusion = MemoryFusion::new(markdown, vector, MemoryFusionWeights::default());
        fusion.refresh("dark mode", 10).await.unwrap();

        let conversation = Conversation::new();
        let rendered = fusion.render(&conversation);
        assert!(rendered.contains("dark mode themes"));
        assert_eq!(rendered.lines().count(), 1, "near-duplicate vector hit should be deduped away");
    }

    #[tokio::test]
    async fn fusion_refresh_is_empty_when_nothing_matches() {
        let markdown = Arc::new(InMemoryMarkdownStore::new());
        let vector = Arc::new(InMemoryVectorStore::new());
        let fusion = MemoryFusion::new(markdown, vector, MemoryFusionWeights::default());
        fusion.refresh("anything", 10).await.unwrap();

        let conversation = Conversation::new();
        assert_eq!(fusion.render(&conversation), "");
    }

    #[test]
    fn playbook_draft_is_not_returned_until_approved() {
        let store = PlaybookStore::new();
        let draft = store.extract_draft("Deploy rollback", &["run tests".into(), "tag release".into()], ["ops"]);

        let results = store.query(&["ops".to_string()].into_iter().collect(), "");
        assert!(results.is_empty());

        store.approve(&draft.id);
        let results = store.query(&["ops".to_string()].into_iter().collect(), "");
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn playbook_query_falls_back_to_keyword_match_without_tag_overlap() {
        let store = PlaybookStore::new();
        let draft = store.extract_draft("Rollback deploy", &["revert the release".into()], ["ops"]);
        store.approve(&draft.id);

        let results = store.query(&HashSet::new(), "how do I revert a release");
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn rejected_playbook_never_surfaces() {
        let store = PlaybookStore::new();
        let draft = store.extract_draft("Bad idea", &["do something risky".into()], ["ops"]);
        store.reject(&draft.id);

        let results = store.query(&["ops".to_string()].into_iter().collect(), "");
        assert!(results.is_empty());
    }

    #[test]
    fn playbook_injector_renders_refreshed_matches() {
        let store = PlaybookStore::new();
        let draft = store.extract_draft("Deploy rollback", &["run tests".into()], ["ops"]);
        store.approve(&draft.id);
        store.refresh(&["ops".to_string()].into_iter().collect(), "");

        let conversation = Conversation::new();
        assert!(store.render(&conversation).contains("Deploy rollback"));
    }
}
