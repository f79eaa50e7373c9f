use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::fmt::time::ChronoLocal;
use voxblast_core::{Notification, QuizSession};
use voxblast_core::{Collaborators, SessionState};
use voxblast_service::audio_sink::CpalSink;
use voxblast_service::config::Config;
use voxblast_service::console::{ConsoleRecognizer, run_console};
use voxblast_service::round_loader::FileRoundSource;
use voxblast_service::tts::OpenAiSynthesizer;

#[derive(Parser)]
#[command(version, about = "Spoken quiz rounds against the clock")]
struct Cli {
    /// JSON file with the rounds to play, in order
    #[arg(required_unless_present = "list_devices")]
    rounds: Option<PathBuf>,
    /// Print the available output devices and exit
    #[arg(long)]
    list_devices: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- 1. Parse Command-Line Arguments ---
    let args = Cli::parse();
    if args.list_devices {
        println!("{}", voxblast_native_utils::device::get_available_outputs()?);
        return Ok(());
    }

    // --- 2. Load Configuration ---
    let config = Config::from_env().context("Failed to load application configuration")?;

    // --- 3. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(ChronoLocal::rfc_3339())
        .init();
    tracing::info!("Configuration loaded successfully. Starting voxblast...");

    let Some(rounds_path) = args.rounds else {
        anyhow::bail!("A rounds file is required");
    };
    let source = FileRoundSource::new(rounds_path);

    // --- 4. Collaborators ---
    let cue = match &config.cue_sound_path {
        Some(path) => {
            let audio = std::fs::read(path)
                .with_context(|| format!("Failed to read cue sound: {}", path.display()))?;
            Some(Arc::<[u8]>::from(audio))
        }
        None => None,
    };
    let sink = Arc::new(
        CpalSink::open(config.output_device.clone()).context("Failed to open audio output")?,
    );
    let recognizer = Arc::new(ConsoleRecognizer::default());
    let synthesizer = Arc::new(OpenAiSynthesizer::new(
        config.openai_api_key.clone(),
        config.tts_model.clone(),
    ));

    // --- 5. Session ---
    let (session, mut notifications) = QuizSession::new(
        config.session_config(),
        Collaborators {
            synthesizer,
            sink,
            recognizer: recognizer.clone(),
            cue,
        },
    );
    let handle = session.handle();

    // Renders phase changes for the player.
    let mut states = handle.subscribe();
    let renderer = tokio::spawn(async move {
        let mut last = SessionState::default();
        while states.changed().await.is_ok() {
            let state = states.borrow_and_update().clone();
            render(&last, &state);
            last = state;
        }
    });

    let reporter = tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            match notification {
                Notification::RoundComplete { round_id, correct } => {
                    tracing::info!("Round {} complete, correct: {}", round_id, correct);
                }
                Notification::SessionComplete {
                    correct_count,
                    total_scored,
                } => {
                    println!("Final score: {}/{}", correct_count, total_scored);
                }
                Notification::SessionStuck { idle_for } => {
                    tracing::warn!(
                        "Session looks stuck ({:?} without progress). Type :skip or :quit.",
                        idle_for
                    );
                }
            }
        }
    });

    let console = tokio::spawn(run_console(recognizer, handle.clone()));
    println!("Type what you hear yourself say, then :submit. :skip gives up a round, :quit ends.");

    let run = session.run(&source);
    tokio::pin!(run);
    let finished = tokio::select! {
        result = &mut run => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };
    let result = match finished {
        Some(result) => result,
        None => {
            tracing::info!("Received Ctrl-C, shutting down...");
            handle.stop();
            run.await
        }
    };

    console.abort();
    renderer.abort();
    let _ = reporter.await;

    let summary = result.context("Session failed")?;
    tracing::info!("Shutting down... {:?}", summary);
    Ok(())
}

fn render(last: &SessionState, state: &SessionState) {
    if last.phase != state.phase {
        println!("[{:?}] enemy {:?}", state.phase, state.enemy_visual);
    }
    if state.last_intermission != last.last_intermission {
        if let Some(snapshot) = &state.last_intermission {
            println!("  {} -> {}", snapshot.prompt, snapshot.answer);
        }
    }
}
