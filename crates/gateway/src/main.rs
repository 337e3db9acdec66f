use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use gateway::logging::setup_logging;
use gateway::{ChatOrchestrator, ChatReply, ChatRequest, GatewayConfig, StreamEvent};
use llm::Message;
use std::io::Write;
use std::path::PathBuf;
use tracing::debug;

/// Run one chat turn through the gateway and print the result
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Gateway configuration file (JSON)
    #[arg(long)]
    config: PathBuf,

    /// Model id from the configuration's model catalog
    #[arg(short = 'm', long)]
    model: String,

    /// System prompt
    #[arg(long)]
    system: Option<String>,

    /// Print one final JSON response instead of SSE frames
    #[arg(long)]
    no_stream: bool,

    /// Enable verbose logging (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// The user message
    message: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.verbose);

    let config = GatewayConfig::load_from_path(&args.config)?;
    let orchestrator = ChatOrchestrator::from_config(config);
    let request = ChatRequest::new(args.model, vec![Message::user(args.message)])
        .with_system_prompt(args.system.unwrap_or_default())
        .streaming(!args.no_stream);

    match orchestrator.handle(request).await? {
        ChatReply::Complete(completion) => {
            println!("{}", serde_json::to_string_pretty(&completion)?);
        }
        ChatReply::Stream(mut handle) => {
            debug!("Streaming turn {}", handle.turn_id());
            let mut stdout = std::io::stdout();
            let mut failure = None;
            loop {
                let envelope = tokio::select! {
                    envelope = handle.next() => envelope,
                    _ = tokio::signal::ctrl_c() => {
                        handle.cancel();
                        continue;
                    }
                };
                let Some(envelope) = envelope else {
                    break;
                };
                if let StreamEvent::Error { code, message } = &envelope.event {
                    failure = Some(format!("{code}: {message}"));
                }
                write!(stdout, "{}", envelope.to_sse()?).context("Failed to write event")?;
                stdout.flush()?;
            }
            if let Some(failure) = failure {
                anyhow::bail!("Turn failed: {failure}");
            }
        }
    }

    Ok(())
}
