//! Tool turn example
//!
//! Registers a capability and its matching tool implementation, so the
//! selector's core layer exposes it to every turn regardless of intent,
//! and runs turns until the executor reports `EndTurn`.

use agent_exec_core::{
    tool, CapabilityRegistry, Capability, Message, OpenAiCompatibleAdapter, ProviderRouter, RouterTarget, RuntimeConfig, RvrbExecutor, Session, SessionId,
    ToolSelector,
};
use serde_json::json;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let capabilities = Arc::new(CapabilityRegistry::new());
    capabilities.register(Capability::core("add", "Add two numbers"));

    let tool_selector = Arc::new(ToolSelector::new(capabilities));
    tool_selector.register_tool(Arc::new(
        tool("add", "Add two numbers")
            .param("a", "number")
            .param("b", "number")
            .build(|args| async move {
                let a = args["a"].as_f64().unwrap_or(0.0);
                let b = args["b"].as_f64().unwrap_or(0.0);
                Ok(json!({ "sum": a + b }))
            }),
    ));

    let adapter = Arc::new(OpenAiCompatibleAdapter::new("local", "http://localhost:11434/v1", None));
    let target = Arc::new(RouterTarget::new("primary", adapter));
    let router = Arc::new(ProviderRouter::new(vec![target]));

    let config = Arc::new(RuntimeConfig::default());
    let executor = RvrbExecutor::new(router, "primary", "qwen3:8b", tool_selector, config.thresholds.clone());

    let session = Session::new(SessionId::new(), config);
    session.push_message(Message::user("What is 17 plus 25?")).await;

    let outcome = session.run_turn(&executor, None).await?;
    println!("terminated with {:?} after {} turn(s)", outcome.reason, outcome.turns);

    for message in session.history_snapshot().await {
        println!("{:?}: {:?}", message.role, message.content);
    }

    Ok(())
}
