//! `grantwell chat`: Run one turn and print its push events.

use anyhow::Context;
use grantwell_agent::{PushEvent, PushEventKind, TurnController, TurnInput, TurnRequest};
use grantwell_config::AppConfig;
use grantwell_core::AgentType;
use grantwell_core::event::EventBus;
use grantwell_core::message::ConversationId;
use grantwell_memory::Stores;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct ChatArgs {
    pub agent: AgentType,
    pub message: String,
    pub conversation: Option<String>,
    pub user: String,
    pub json: bool,
}

pub async fn run(args: ChatArgs) -> anyhow::Result<()> {
    let config = AppConfig::load().context("Failed to load config")?;
    if !config.has_api_key() {
        anyhow::bail!("No API key configured. Set GRANTWELL_API_KEY or api_key in config.toml");
    }

    let provider = grantwell_providers::build_from_config(&config)?;
    let stores = Stores::open(&config.storage).await?;
    let controller = Arc::new(TurnController::from_config(
        &config,
        provider,
        stores.memory.clone(),
        stores.history.clone(),
        Arc::new(EventBus::default()),
    )?);

    let request = TurnRequest {
        agent_type: args.agent,
        conversation_id: args.conversation.as_deref().map(ConversationId::from),
        user_id: args.user,
        input: TurnInput::text(args.message),
    };

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let (tx, mut rx) = mpsc::channel(controller.settings().event_buffer);
    let turn = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.run_with_cancel(request, tx, cancel).await })
    };

    let mut stdout = std::io::stdout();
    while let Some(event) = rx.recv().await {
        let line = if args.json {
            Some(format!("{}\n", serde_json::to_string(&event)?))
        } else {
            render(&event)
        };
        if let Some(line) = line {
            stdout.write_all(line.as_bytes())?;
            stdout.flush()?;
        }
    }

    let outcome = turn.await.context("Turn task failed")?;
    stores.close().await;

    if !outcome.success {
        anyhow::bail!(
            "Turn failed: {}",
            outcome.error.unwrap_or_else(|| "unknown error".into())
        );
    }
    Ok(())
}

/// Human-readable form of one push event. Text deltas print inline.
fn render(event: &PushEvent) -> Option<String> {
    match &event.kind {
        PushEventKind::Connected {
            conversation_id,
            agent_type,
        } => Some(format!("[{agent_type}] conversation {conversation_id}\n")),
        PushEventKind::Iteration { .. } | PushEventKind::ThinkingDelta { .. } => None,
        PushEventKind::TextDelta { text, .. } => Some(text.clone()),
        PushEventKind::ToolUse { name, input, .. } => Some(format!("\n  -> {name} {input}\n")),
        PushEventKind::ToolResult {
            name,
            success,
            error,
            ..
        } => Some(match (success, error) {
            (true, _) => format!("  <- {name} ok\n"),
            (false, Some(e)) => format!("  <- {name} failed: {e}\n"),
            (false, None) => format!("  <- {name} failed\n"),
        }),
        PushEventKind::Completion {
            iterations, usage, ..
        } => Some(match usage {
            Some(u) => format!(
                "\n\nDone in {iterations} iteration(s), {} in / {} out tokens\n",
                u.input_tokens, u.output_tokens
            ),
            None => format!("\n\nDone in {iterations} iteration(s)\n"),
        }),
        PushEventKind::Warning { message, .. } => Some(format!("\n\nWarning: {message}\n")),
        PushEventKind::Error { kind, message, .. } => {
            Some(format!("\n\nError ({kind}): {message}\n"))
        }
    }
}
