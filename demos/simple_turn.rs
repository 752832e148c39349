//! Simple turn example
//!
//! Drives one RVR-B turn with no tools registered at all, showing the
//! minimum wiring needed to get from a user message to a completed
//! session: a capability registry, a tool selector with nothing in it,
//! a single provider target, and a session to hold the conversation.

use agent_exec_core::{
    CapabilityRegistry, Message, OpenAiCompatibleAdapter, ProviderRouter, RouterTarget, RuntimeConfig, RvrbExecutor, Session, SessionId, SessionState,
    ToolSelector,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let capabilities = Arc::new(CapabilityRegistry::new());
    let tool_selector = Arc::new(ToolSelector::new(capabilities));

    let adapter = Arc::new(OpenAiCompatibleAdapter::new("local", "http://localhost:11434/v1", None));
    let target = Arc::new(RouterTarget::new("primary", adapter));
    let router = Arc::new(ProviderRouter::new(vec![target]));

    let config = Arc::new(RuntimeConfig::default());
    let executor = RvrbExecutor::new(router, "primary", "qwen3:8b", tool_selector, config.thresholds.clone());

    let session = Session::new(SessionId::new(), config);
    session.push_message(Message::user("What's the capital of France? Please be brief.")).await;

    let outcome = session.run_turn(&executor, None).await?;
    println!("terminated with {:?} after {} turn(s)", outcome.reason, outcome.turns);

    if session.state().await == SessionState::Completed {
        for message in session.history_snapshot().await {
            println!("{:?}: {:?}", message.role, message.content);
        }
    }

    Ok(())
}
