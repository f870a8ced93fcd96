use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use assistline::audio::file::FileBackend;
use assistline::protocol::StreamEvent;
use assistline::recovery::ArtifactRecoveryClient;
use assistline::{
    BackendClient, ChatEvent, ChatRequest, ClientConfig, StreamOutcome, StreamTransport, TurnMode,
    VoiceConfig, VoiceEvent, VoiceSession,
};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

type CliResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

#[derive(Debug, Parser)]
#[command(name = "assistline", about = "Text and voice client for the assistant backend")]
struct Cli {
    #[arg(long, env = "ASSISTLINE_BASE_URL", default_value = "http://localhost:8000")]
    base_url: String,

    #[arg(long, env = "ASSISTLINE_TOKEN")]
    token: Option<String>,

    #[arg(long, env = "ASSISTLINE_DOMAIN_ID")]
    domain_id: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Stream one text conversation turn. Ctrl-C cancels it.
    Chat {
        query: String,
        #[arg(long)]
        session_id: Option<String>,
    },
    /// Run a voice session over raw 24 kHz PCM16 files.
    Voice {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long)]
        push_to_talk: bool,
        #[arg(long, env = "ASSISTLINE_REALTIME_URL")]
        realtime_url: Option<String>,
        #[arg(long, env = "ASSISTLINE_MODEL")]
        model: Option<String>,
        #[arg(long, env = "ASSISTLINE_VOICE")]
        voice: Option<String>,
    },
    /// List artifacts created in the recent past.
    Artifacts {
        #[arg(long, default_value_t = 120)]
        window_secs: u64,
    },
}

#[tokio::main]
async fn main() -> CliResult<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("assistline=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let client = BackendClient::new(ClientConfig {
        base_url: cli.base_url,
        token: cli.token,
    });

    match cli.command {
        Command::Chat { query, session_id } => {
            run_chat(client, query, session_id, cli.domain_id).await
        }
        Command::Voice {
            input,
            output,
            push_to_talk,
            realtime_url,
            model,
            voice,
        } => {
            let defaults = VoiceConfig::default();
            let config = VoiceConfig {
                realtime_url: realtime_url.unwrap_or(defaults.realtime_url),
                model: model.unwrap_or(defaults.model),
                voice: voice.unwrap_or(defaults.voice),
                mode: if push_to_talk {
                    TurnMode::PushToTalk
                } else {
                    TurnMode::Auto
                },
                domain_id: cli.domain_id,
                ..defaults
            };
            run_voice(client, FileBackend::new(input, output), config).await
        }
        Command::Artifacts { window_secs } => run_artifacts(client, window_secs).await,
    }
}

async fn run_chat(
    client: BackendClient,
    query: String,
    session_id: Option<String>,
    domain_id: Option<String>,
) -> CliResult<()> {
    let transport = StreamTransport::new(client);
    let mut handle = transport
        .open(ChatRequest {
            user_query: query,
            domain_id,
            session_id,
            ..Default::default()
        })
        .await?;

    let canceller = handle.canceller();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ncancelling...");
            canceller.cancel().await;
        }
    });

    while let Some(event) = handle.next_event().await {
        print_chat_event(&event);
    }
    let outcome = handle.completion().await;
    ctrl_c.abort();

    match outcome? {
        StreamOutcome::Completed(done) => {
            println!("\n{}", done.response);
            for artifact in &done.artifacts {
                println!("  artifact: {} {}", artifact.title, artifact.download_url);
            }
        }
        StreamOutcome::Recovered { message, artifacts } => {
            println!("\n{message}");
            for artifact in &artifacts {
                println!("  artifact: {} {}", artifact.title, artifact.download_url);
            }
        }
        StreamOutcome::Cancelled => println!("\ncancelled"),
    }
    Ok(())
}

fn print_chat_event(event: &ChatEvent) {
    match event {
        ChatEvent::Frame(StreamEvent::Thinking { message }) => {
            eprintln!("[thinking] {}", message.as_deref().unwrap_or(""));
        }
        ChatEvent::Frame(StreamEvent::Status { message, .. }) => eprintln!("[status] {message}"),
        ChatEvent::Frame(StreamEvent::ToolCall { name, .. }) => eprintln!("[tool] {name}"),
        ChatEvent::Frame(StreamEvent::Text { content }) => print!("{content}"),
        ChatEvent::Frame(_) => {}
        ChatEvent::ConnectionSlow { silent_for } => {
            eprintln!("[slow] no data for {}s", silent_for.as_secs());
        }
        ChatEvent::Reconnecting { .. } => eprintln!("[reconnecting]"),
        ChatEvent::Recovering => eprintln!("[stream ended early, checking for artifacts]"),
    }
}

async fn run_voice(client: BackendClient, backend: FileBackend, config: VoiceConfig) -> CliResult<()> {
    let push_to_talk = config.mode == TurnMode::PushToTalk;
    let session = Arc::new(VoiceSession::new(client, Arc::new(backend)));
    let mut events = session.start(config).await;

    if push_to_talk {
        // Hold the talk control for the whole file, then release it.
        session.set_push_to_talk_active(true).await?;
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(VoiceEvent::Ended { reason }) => {
                    eprintln!("[ended] {reason}");
                    break;
                }
                Some(event) => print_voice_event(&event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                if push_to_talk {
                    let _ = session.set_push_to_talk_active(false).await;
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
                session.stop().await;
            }
        }
    }
    Ok(())
}

fn print_voice_event(event: &VoiceEvent) {
    match event {
        VoiceEvent::StateChanged(state) => eprintln!("[state] {state:?}"),
        VoiceEvent::UserTranscript(text) => println!("you: {text}"),
        VoiceEvent::AssistantTranscript(text) => println!("assistant: {text}"),
        VoiceEvent::ToolCallStarted { tool_name, .. } => eprintln!("[tool] {tool_name}"),
        VoiceEvent::ToolCallFinished {
            tool_name,
            succeeded,
            ..
        } => eprintln!("[tool] {tool_name} finished (ok: {succeeded})"),
        VoiceEvent::Error(message) => eprintln!("[error] {message}"),
        other => tracing::debug!(event = ?other, "voice event"),
    }
}

async fn run_artifacts(client: BackendClient, window_secs: u64) -> CliResult<()> {
    let recovery = ArtifactRecoveryClient::new(client);
    let artifacts = recovery.recover(Duration::from_secs(window_secs)).await?;
    if artifacts.is_empty() {
        println!("no artifacts in the last {window_secs}s");
    }
    for artifact in artifacts {
        println!(
            "{}\t{}\t{}\t{}",
            artifact.id, artifact.kind, artifact.title, artifact.download_url
        );
    }
    Ok(())
}
