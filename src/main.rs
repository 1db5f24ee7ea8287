use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use murmur::console::{self, ConsoleInput};
use murmur::pipeline::{Sentence, run_synthesis};
use murmur::voice::{
    AudioRecorder, DeviceSink, PlaybackEngine, SpeechToText, TextToSpeech, Transcriber,
    VoiceProfile,
};
use murmur::{Config, Session, UiCommand, UiUpdate};

/// murmur - ask out loud, hear the answer as it is written
#[derive(Parser)]
#[command(name = "murmur", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Write logs to this file instead of stderr
    #[arg(long, env = "MURMUR_LOG_FILE")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Ask one question, speak the answer, then exit
    Ask {
        /// Question text
        question: String,
    },
    /// Record from the capture command and report what was captured
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// Also transcribe the recording
        #[arg(long)]
        transcribe: bool,
    },
    /// Synthesize text and play it through the playback engine
    TestTts {
        /// Text to speak
        #[arg(default_value = "你好！这是一段语音合成测试。")]
        text: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.verbose, cli.log_file.as_ref()) {
        eprintln!("failed to set up logging: {e}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8, log_file: Option<&PathBuf>) -> anyhow::Result<()> {
    let filter = match verbose {
        0 => "warn,murmur=info",
        1 => "info,murmur=debug",
        2 => "debug",
        _ => "trace",
    };
    let builder = tracing_subscriber::fmt().with_env_filter(EnvFilter::new(filter));

    // The console owns stdout, so logs go to stderr or a file
    match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load()?;
    tracing::debug!(?config.llm, ?config.playback, "loaded configuration");

    match cli.command {
        Some(Command::Ask { question }) => ask_once(&config, question).await,
        Some(Command::TestMic {
            duration,
            transcribe,
        }) => test_mic(&config, duration, transcribe).await,
        Some(Command::TestTts { text }) => test_tts(&config, &text).await,
        None => run_console(&config).await,
    }
}

/// Run one turn and print the reply
async fn ask_once(config: &Config, question: String) -> anyhow::Result<()> {
    let (updates_tx, mut updates_rx) = mpsc::channel(16);
    let session = Session::from_config(config, updates_tx)?;
    tokio::spawn(async move { while updates_rx.recv().await.is_some() {} });

    let reply = session.ask(question).await?;
    println!("{reply}");
    Ok(())
}

/// Interactive console until `/quit` or end of input
async fn run_console(config: &Config) -> anyhow::Result<()> {
    let (updates_tx, updates_rx) = mpsc::channel(64);
    let session = Session::from_config(config, updates_tx)?;
    let printer = tokio::spawn(print_updates(updates_rx));

    println!("{}", console::help_text(config.voice.tts_provider));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let command = match console::parse_line(&line) {
            ConsoleInput::Command(command) => command,
            ConsoleInput::ToggleRecording => {
                if session.is_recording().await {
                    println!("(transcribing...)");
                    UiCommand::AudioStop
                } else {
                    println!("(recording, /rec again to stop)");
                    UiCommand::AudioStart
                }
            }
            ConsoleInput::History => {
                println!("{}", console::format_history(&session.history()));
                continue;
            }
            ConsoleInput::Help => {
                println!("{}", console::help_text(config.voice.tts_provider));
                continue;
            }
            ConsoleInput::Quit => break,
            ConsoleInput::Empty => continue,
            ConsoleInput::Invalid(message) => {
                println!("{message} (try /help)");
                continue;
            }
        };

        if let Err(e) = session.dispatch(command).await {
            tracing::warn!(error = %e, "command failed");
            println!("error: {e}");
        }
    }

    session.cancel_turn();
    drop(session);
    printer.abort();
    Ok(())
}

async fn print_updates(mut updates: mpsc::Receiver<UiUpdate>) {
    while let Some(update) = updates.recv().await {
        match update {
            UiUpdate::Transcript(text) => println!("you (voice): {text}"),
            UiUpdate::History(history) => {
                if let Some(last) = history.last() {
                    println!("assistant: {}", last.content);
                }
            }
            UiUpdate::TurnFailed(message) => println!("turn failed: {message}"),
        }
    }
}

/// Record for a fixed time through the capture command
async fn test_mic(config: &Config, duration: u64, transcribe: bool) -> anyhow::Result<()> {
    println!(
        "Recording for {duration} seconds with: {}",
        config.voice.capture_command.join(" ")
    );
    println!("Speak now!\n");

    let mut recorder = AudioRecorder::new(config.voice.capture_command.clone());
    recorder.start()?;
    tokio::time::sleep(Duration::from_secs(duration)).await;
    recorder.stop().await?;

    let audio = recorder.buffer();
    println!("Captured {} bytes of {}", audio.len(), config.voice.capture_format);

    if audio.is_empty() {
        println!("\nNothing was captured. Check that the capture command works:");
        println!("  1. Run: {} > test.wav", config.voice.capture_command.join(" "));
        println!("  2. Run: pactl info | grep 'Default Source'");
        return Ok(());
    }

    if transcribe {
        let stt = SpeechToText::from_config(config)?;
        let text = stt.transcribe(audio, &config.voice.capture_format).await?;
        println!("Transcript: {text}");
    }

    Ok(())
}

/// Synthesize one sentence and play it through the engine
async fn test_tts(config: &Config, text: &str) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let synth = Arc::new(TextToSpeech::from_config(config)?);
    let sink = Arc::new(DeviceSink::open(config.playback.sample_rate)?);
    let cancel = CancellationToken::new();

    let (sentence_tx, sentence_rx) = mpsc::channel(1);
    let (audio_tx, audio_rx) = mpsc::channel(config.pipeline.audio_capacity.max(1));

    sentence_tx
        .send(Sentence {
            index: 0,
            text: text.to_string(),
        })
        .await?;
    drop(sentence_tx);

    let profile = VoiceProfile {
        voice: config.voice.voice.clone(),
        emotion: config.voice.emotion.clone(),
        speed: config.voice.speed,
    };
    let engine = PlaybackEngine::new(audio_rx, sink, config.playback.clone(), cancel.clone());

    let (synthesized, played) = tokio::join!(
        run_synthesis(synth, profile, sentence_rx, audio_tx, cancel),
        engine.run()
    );
    synthesized?;
    played?;

    println!("\n---");
    println!("If you heard the speech, TTS is working!");
    Ok(())
}
