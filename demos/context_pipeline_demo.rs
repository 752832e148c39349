//! Context pipeline example
//!
//! Wires a memory-fusion injector and a playbook injector into a
//! `ContextPipeline` alongside a plain system-identity injector, seeds
//! the backing stores, and prints the assembled system message to show
//! phase ordering and per-injector token budgeting in action.

use agent_exec_core::{
    CacheClass, ContextInjector, ContextPipeline, Conversation, InMemoryMarkdownStore, InMemoryVectorStore, InjectorPhase, Message, MemoryFusion,
    Playbook, PlaybookStore,
};
use std::sync::Arc;

struct SystemIdentity;

impl ContextInjector for SystemIdentity {
    fn name(&self) -> &str {
        "system_identity"
    }

    fn phase(&self) -> InjectorPhase {
        InjectorPhase::System
    }

    fn token_budget(&self) -> usize {
        200
    }

    fn cache_class(&self) -> CacheClass {
        CacheClass::Stable
    }

    fn render(&self, _conversation: &Conversation) -> String {
        "You are a helpful, safety-conscious coding assistant.".to_string()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let markdown = Arc::new(InMemoryMarkdownStore::new());
    markdown.add("prefs", "User prefers Rust over Python for new services.");
    let vector = Arc::new(InMemoryVectorStore::new());
    vector.upsert("note-1", "the user prefers dark mode in every editor theme").await?;

    let memory = MemoryFusion::new(markdown, vector, Default::default());
    memory.refresh("editor theme preferences", 5).await?;

    let playbooks = PlaybookStore::new();
    let steps = vec!["run tests".to_string(), "deploy to staging".to_string(), "watch error rate".to_string()];
    let rollout = playbooks.extract_draft("safe rollout", &steps, ["deploy"]);
    playbooks.approve(&rollout.id);
    playbooks.refresh(&["deploy".to_string()].into_iter().collect(), "");

    let mut pipeline = ContextPipeline::new();
    pipeline.register(Box::new(SystemIdentity));
    pipeline.register(Box::new(memory));
    pipeline.register(Box::new(playbooks));

    let conversation = Conversation::new();
    let system_message = pipeline.assemble_system_message(&conversation);

    println!("total registered budget: {} tokens", pipeline.total_budget());
    if let Message { content, .. } = system_message {
        for block in content {
            if let agent_exec_core::ContentBlock::Text(text) = block {
                println!("{}", text.text);
            }
        }
    }

    Ok(())
}
