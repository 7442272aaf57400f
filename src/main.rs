//! `agentflow` - a conversational agent runtime that drives tool
//! operations through an approval-gated, schedulable lifecycle.
//!
//! This binary wires the lifecycle engine to stub collaborators and
//! walks it through a scripted conversation so the state machine can be
//! observed end to end without a real chat transport or LLM behind it.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use agentflow_core::contracts::AutoApproveClassifier;
use agentflow_core::model::{InteractionType, MessageRole, SessionId};
use agentflow_core::persistence::InMemoryStore;
use agentflow_core::registry::ToolRegistry;
use agentflow_core::runtime::AgentRuntime;
use agentflow_core::RuntimeConfig;

use crate::demo_collaborators::{EchoLlmClient, KeywordClassifier, KeywordTriggerDetector};
use crate::demo_tools::{NearDepositTool, NearSwapMonitorTool, TweetTool};

mod demo_collaborators;
mod demo_tools;

/// agentflow - scripted demo of the tool-operation lifecycle engine
#[derive(Parser)]
#[command(name = "agentflow")]
#[command(about = "Scripted demo of the tool-operation lifecycle engine")]
#[command(version)]
struct Cli {
    /// Auto-approve every operation instead of waiting on keyword replies
    #[arg(long)]
    auto_approve: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let store = Arc::new(InMemoryStore::new());
    let registry = ToolRegistry::new();
    let tools: Vec<Arc<dyn agentflow_core::contracts::ToolBody>> = vec![
        Arc::new(TweetTool),
        Arc::new(NearDepositTool),
        Arc::new(NearSwapMonitorTool::new()),
    ];

    let llm = Arc::new(EchoLlmClient);
    let trigger_detector = Arc::new(KeywordTriggerDetector);
    let classifier: Arc<dyn agentflow_core::contracts::Classifier> = if cli.auto_approve {
        Arc::new(AutoApproveClassifier)
    } else {
        Arc::new(KeywordClassifier)
    };

    let runtime = AgentRuntime::new(store, registry, tools, llm, trigger_detector, classifier, RuntimeConfig::default());
    runtime.start().await;

    let session_id = SessionId::new();
    let welcome = runtime.start_new_session(session_id).await?;
    println!("assistant> {welcome}");

    let script = [
        "schedule 3 tweets about rust, one per minute",
        "approve",
        "deposit 5 near",
        "swap 10 near for usdc when price >= 3.0",
    ];

    for line in script {
        println!("user> {line}");
        let response = runtime
            .get_response(session_id, line, MessageRole::User, InteractionType::Chat)
            .await?;
        println!("assistant> {response}");
    }

    let history = runtime.get_history(session_id).await?;
    println!("\n--- {} messages logged for session {session_id} ---", history.len());

    runtime.cleanup().await;
    Ok(())
}
