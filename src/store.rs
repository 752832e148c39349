//! Boundary collaborator traits (C9 dependencies).
//!
//! The memory/playbook injectors (C9) don't know or care whether a
//! conversation lives in Postgres, a vector index is Qdrant or pgvector,
//! or markdown memory files sit on local disk versus an object store.
//! These traits are the seam; the in-memory implementations here are
//! reference/test doubles, mirroring how [`crate::context::ScratchpadStore`]
//! separates the compression policy from its backing store.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

/// Persists and retrieves full conversation transcripts, keyed by
/// conversation id, independent of the in-process [`crate::types::Conversation`]
/// a session holds live.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn save(&self, conversation: &crate::types::Conversation) -> crate::error::Result<()>;
    async fn load(&self, id: &crate::types::ConversationId) -> crate::error::Result<Option<crate::types::Conversation>>;
}

/// One hit from a semantic/keyword retrieval, pre-normalized so the
/// fusion stage can score sources against each other without knowing
/// their backing index.
#[derive(Debug, Clone)]
pub struct RetrievedMemory {
    pub text: String,
    pub score: f32,
    pub source: String,
}

/// Embedding-backed similarity search over long-term memory.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn query(&self, text: &str, limit: usize) -> crate::error::Result<Vec<RetrievedMemory>>;
    async fn upsert(&self, id: &str, text: &str) -> crate::error::Result<()>;
}

/// Keyword/full-text search plus raw markdown memory file access — the
/// two cheaper sources the fusion stage weighs alongside the vector
/// store.
#[async_trait]
pub trait MarkdownMemoryStore: Send + Sync {
    async fn keyword_search(&self, query: &str, limit: usize) -> crate::error::Result<Vec<RetrievedMemory>>;
    async fn read_all(&self) -> crate::error::Result<Vec<RetrievedMemory>>;
}

/// Discovers which named skills/playbooks are available for an agent —
/// the collaborator the tool selector's intent-matched layer would
/// eventually consult to learn a capability's tags, kept as its own seam
/// so skill sourcing (filesystem glob, registry service, etc.) stays
/// swappable.
#[async_trait]
pub trait SkillDiscovery: Send + Sync {
    async fn discover(&self, agent_id: &str) -> crate::error::Result<Vec<String>>;
}

/// In-memory [`ConversationStore`], sufficient for tests and single-
/// process deployments.
#[derive(Default)]
pub struct InMemoryConversationStore {
    conversations: DashMap<String, crate::types::Conversation>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn save(&self, conversation: &crate::types::Conversation) -> crate::error::Result<()> {
        self.conversations.insert(conversation.id.to_string(), conversation.clone());
        Ok(())
    }

    async fn load(&self, id: &crate::types::ConversationId) -> crate::error::Result<Option<crate::types::Conversation>> {
        Ok(self.conversations.get(&id.to_string()).map(|entry| entry.clone()))
    }
}

/// In-memory vector store using word-overlap as a cheap stand-in for
/// cosine similarity — enough to exercise the fusion stage's scoring and
/// dedup logic without an embedding model.
#[derive(Default)]
pub struct InMemoryVectorStore {
    entries: DashMap<String, String>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn overlap_score(query: &str, candidate: &str) -> f32 {
        let query_words: std::collections::HashSet<&str> = query.split_whitespace().collect();
        let candidate_words: std::collections::HashSet<&str> = candidate.split_whitespace().collect();
        if query_words.is_empty() || candidate_words.is_empty() {
            return 0.0;
        }
        let overlap = query_words.intersection(&candidate_words).count();
        overlap as f32 / query_words.len() as f32
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn query(&self, text: &str, limit: usize) -> crate::error::Result<Vec<RetrievedMemory>> {
        let mut hits: Vec<RetrievedMemory> = self
            .entries
            .iter()
            .map(|entry| RetrievedMemory { text: entry.value().clone(), score: Self::overlap_score(text, entry.value()), source: "vector".to_string() })
            .filter(|hit| hit.score > 0.0)
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn upsert(&self, id: &str, text: &str) -> crate::error::Result<()> {
        self.entries.insert(id.to_string(), text.to_string());
        Ok(())
    }
}

/// In-memory markdown store: entries are just strings, keyword search is
/// a plain substring-overlap count.
#[derive(Default)]
pub struct InMemoryMarkdownStore {
    entries: DashMap<String, String>,
}

impl InMemoryMarkdownStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, id: impl Into<String>, text: impl Into<String>) {
        self.entries.insert(id.into(), text.into());
    }
}

#[async_trait]
impl MarkdownMemoryStore for InMemoryMarkdownStore {
    async fn keyword_search(&self, query: &str, limit: usize) -> crate::error::Result<Vec<RetrievedMemory>> {
        let query_words: std::collections::HashSet<String> = query.split_whitespace().map(|w| w.to_lowercase()).collect();
        let mut hits: Vec<RetrievedMemory> = self
            .entries
            .iter()
            .filter_map(|entry| {
                let text = entry.value();
                let matches = query_words.iter().filter(|w| text.to_lowercase().contains(w.as_str())).count();
                if matches == 0 {
                    return None;
                }
                Some(RetrievedMemory { text: text.clone(), score: matches as f32 / query_words.len().max(1) as f32, source: "keyword".to_string() })
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn read_all(&self) -> crate::error::Result<Vec<RetrievedMemory>> {
        Ok(self.entries.iter().map(|entry| RetrievedMemory { text: entry.value().clone(), score: 1.0, source: "markdown".to_string() }).collect())
    }
}

/// In-memory skill discovery backed by a static, agent-keyed registry —
/// enough for tests; a production deployment would glob a skills
/// directory or call a registry service instead.
#[derive(Default)]
pub struct StaticSkillDiscovery {
    skills: DashMap<String, Vec<String>>,
}

impl StaticSkillDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, agent_id: impl Into<String>, skills: Vec<String>) {
        self.skills.insert(agent_id.into(), skills);
    }
}

#[async_trait]
impl SkillDiscovery for StaticSkillDiscovery {
    async fn discover(&self, agent_id: &str) -> crate::error::Result<Vec<String>> {
        Ok(self.skills.get(agent_id).map(|entry| entry.clone()).unwrap_or_default())
    }
}

pub type SharedConversationStore = Arc<dyn ConversationStore>;
pub type SharedVectorStore = Arc<dyn VectorStore>;
pub type SharedMarkdownStore = Arc<dyn MarkdownMemoryStore>;
pub type SharedSkillDiscovery = Arc<dyn SkillDiscovery>;
