use anyhow::Result;
use clap::{Parser, ValueEnum};
use coordination::{CoordinationContext, CoordinationEvent};
use shared::domain::ModalityKind;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

mod config;

#[derive(Parser, Debug)]
struct Args {
    /// Backend base url; overrides console.toml and env.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    conversation: Option<String>,
    /// Message to send once connected.
    #[arg(long)]
    message: Option<String>,
    /// Modality to switch to once connected.
    #[arg(long, value_enum)]
    modality: Option<ModalityArg>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModalityArg {
    Text,
    Voice,
    Video,
}

impl From<ModalityArg> for ModalityKind {
    fn from(value: ModalityArg) -> Self {
        match value {
            ModalityArg::Text => ModalityKind::Text,
            ModalityArg::Voice => ModalityKind::Voice,
            ModalityArg::Video => ModalityKind::Video,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let mut settings = config::load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    if let Some(conversation) = args.conversation {
        settings.conversation_id = conversation;
    }

    let context = CoordinationContext::new(settings.into_coordination_config());
    let mut events = context.subscribe_events();
    context.connect()?;

    if let Err(err) = context.hydrate().await {
        warn!("history hydration failed, starting empty: {err:#}");
    }
    for entry in context.transcript() {
        println!("[{:?}] {}", entry.role, entry.content);
    }

    if let Some(modality) = args.modality {
        context.switch_modality(modality.into()).await?;
    }
    if let Some(message) = &args.message {
        context.send_user_message(message)?;
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            received = events.recv() => match received {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("event stream lagged, skipped {skipped}");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    context.dispose().await;
    Ok(())
}

fn print_event(event: &CoordinationEvent) {
    match event {
        CoordinationEvent::ConnectionStateChanged(status) => {
            println!("connection: {status:?}");
        }
        CoordinationEvent::ThinkingChanged(is_thinking) => {
            if *is_thinking {
                println!("assistant is thinking...");
            }
        }
        CoordinationEvent::TranscriptUpdated(entry) => {
            if !entry.is_streaming {
                println!("[{:?}] {}", entry.role, entry.content);
            }
        }
        CoordinationEvent::UndoQueueChanged(items) => {
            for item in items {
                println!(
                    "undo: {} ({:?}, {}s window)",
                    item.title, item.status, item.undo_duration_seconds
                );
            }
        }
        CoordinationEvent::ModalityStateChanged(snapshot) => {
            println!("modality: {:?} {:?}", snapshot.kind, snapshot.status);
        }
        CoordinationEvent::PendingApprovalsChanged(approvals) => {
            for approval in approvals {
                println!(
                    "approval pending: {} (agent {}, risk {:?})",
                    approval.title, approval.agent, approval.risk_level
                );
            }
        }
        CoordinationEvent::UiCommands(commands) => {
            for command in commands {
                println!("ui command: {}", command.command);
            }
        }
        CoordinationEvent::Error(error) => {
            println!("error: {error}");
        }
    }
}
