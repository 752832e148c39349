//! Human-in-the-loop turn example
//!
//! Registers a capability tagged `safety`, so any failing call to it
//! escalates instead of backtracking. Runs the turn and the HITL
//! rendezvous concurrently: the session sends a `HitlRequest` down an
//! mpsc channel, and this demo's "operator" answers it from the other
//! end, mirroring how a transport connection would relay the question to
//! a real human.

use agent_exec_core::{
    tool, CapabilityRegistry, Capability, HitlRequest, HitlResponse, Message, OpenAiCompatibleAdapter, ProviderRouter, RouterTarget, RuntimeConfig,
    RvrbExecutor, Session, SessionId, SessionState, ToolSelector,
};
use serde_json::json;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let capabilities = Arc::new(CapabilityRegistry::new());
    capabilities.register(Capability::core("delete_file", "delete a file from disk").with_tags(["safety"]));

    let tool_selector = Arc::new(ToolSelector::new(capabilities));
    tool_selector.register_tool(Arc::new(
        tool("delete_file", "delete a file from disk")
            .param("path", "string")
            .build(|_args| async move { Err(agent_exec_core::Error::other("permission denied")) }),
    ));

    let adapter = Arc::new(OpenAiCompatibleAdapter::new("local", "http://localhost:11434/v1", None));
    let target = Arc::new(RouterTarget::new("primary", adapter));
    let router = Arc::new(ProviderRouter::new(vec![target]));

    let config = Arc::new(RuntimeConfig::default());
    let executor = RvrbExecutor::new(router, "primary", "qwen3:8b", tool_selector, config.thresholds.clone());

    let session = Arc::new(Session::new(SessionId::new(), config));
    session.push_message(Message::user("Delete /tmp/scratch.txt for me.")).await;

    let (hitl_tx, mut hitl_rx) = tokio::sync::mpsc::channel::<HitlRequest>(1);

    let operator = tokio::spawn(async move {
        if let Some(request) = hitl_rx.recv().await {
            println!("operator sees escalated question: {}", request.question);
            let _ = request.reply.send(HitlResponse::Approved("go ahead".to_string()));
        }
    });

    // `run_turn` itself doesn't know about `await_hitl` — a real transport
    // loop calls it once `run_turn` reports `WaitingHitl`, then decides
    // whether to resume the session based on the answer.
    let outcome = session.run_turn(&executor, None).await?;
    println!("turn ended with {:?}", outcome.reason);

    if session.state().await == SessionState::WaitingHitl {
        let response = session.await_hitl(&hitl_tx, "delete_file failed with 'permission denied' — proceed anyway?").await;
        println!("operator responded: {response:?}");
    }

    operator.await?;
    Ok(())
}
