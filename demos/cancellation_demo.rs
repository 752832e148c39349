//! Cancellation example
//!
//! Starts a turn in the background, then requests a stop partway
//! through. The executor's loop polls `CancelSignal` between turns and
//! before each tool call, so this shows a session actually landing in
//! `Stopped` rather than running to completion once cancellation fires.

use agent_exec_core::{
    tool, CapabilityRegistry, Capability, Message, OpenAiCompatibleAdapter, ProviderRouter, RouterTarget, RuntimeConfig, RvrbExecutor, Session, SessionId,
    ToolSelector,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let capabilities = Arc::new(CapabilityRegistry::new());
    capabilities.register(Capability::core("slow_task", "a tool that takes a while"));

    let tool_selector = Arc::new(ToolSelector::new(capabilities));
    tool_selector.register_tool(Arc::new(tool("slow_task", "a tool that takes a while").build(|_args| async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok(json!({ "done": true }))
    })));

    let adapter = Arc::new(OpenAiCompatibleAdapter::new("local", "http://localhost:11434/v1", None));
    let target = Arc::new(RouterTarget::new("primary", adapter));
    let router = Arc::new(ProviderRouter::new(vec![target]));

    let config = Arc::new(RuntimeConfig::default());
    let executor = Arc::new(RvrbExecutor::new(router, "primary", "qwen3:8b", tool_selector, config.thresholds.clone()));

    let session = Arc::new(Session::new(SessionId::new(), config));
    session.push_message(Message::user("Run the slow task a few times in a row.")).await;

    let run_session = session.clone();
    let run_executor = executor.clone();
    let handle = tokio::spawn(async move { run_session.run_turn(&run_executor, None).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("requesting stop...");
    session.request_stop();

    let outcome = handle.await??;
    println!("session landed in {:?} via {:?}", outcome.state, outcome.reason);

    Ok(())
}
