use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use duet::frontend::discord::DiscordGateway;
use duet::frontend::twitch::{TwitchChat, relay};
use duet::frontend::{ChatPlatformGateway, FrontEnd, FrontEndSettings};
use duet::history::ChatLog;
use duet::orchestrator::{
    ConsoleReply, FrontEndCommand, InputSource, MicrophoneInput, ProcessOrchestrator, TypedInput,
    interrupted, run_input_loop,
};
use duet::signal::{InputMode, SignalName};
use duet::turn::SpeakReply;
use duet::voice::{
    AudioCapture, SpeechDestination, VoiceActivityClassifier, WebRtcClassifier, f32_to_pcm16,
};
use duet::{Config, Error};

/// duet - a voice-chat companion that takes turns with everyone in the room
#[derive(Parser)]
#[command(name = "duet", version, about)]
struct Cli {
    /// Config file (defaults to ~/.config/duet/config.toml)
    #[arg(short, long, global = true, env = "DUET_CONFIG")]
    config: Option<PathBuf>,

    /// Conversation history file
    #[arg(long, global = true)]
    history: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Launch the front-end, wait for the handshake, then run the local loop
    Run {
        /// Directory for handshake records
        #[arg(long)]
        signal_dir: Option<PathBuf>,
        /// Seconds to wait for each handshake record
        #[arg(long)]
        handshake_timeout: Option<u64>,
    },
    /// Run the chat-platform front-end (normally launched by `run`)
    FrontEnd {
        /// Directory for handshake records
        #[arg(long)]
        signal_dir: Option<PathBuf>,
    },
    /// Answer Twitch chat and log every message
    Twitch {
        /// Channel to join (overrides the config file)
        #[arg(long)]
        channel: Option<String>,
    },
    /// Talk locally without a front-end
    Chat {
        /// Input mode; asked interactively when omitted
        #[arg(short, long)]
        mode: Option<InputMode>,
    },
    /// Show handshake records
    Signals {
        /// Directory for handshake records
        #[arg(long)]
        signal_dir: Option<PathBuf>,
        /// Remove every record (recovery after a crash)
        #[arg(long)]
        clear: bool,
    },
    /// Test microphone input and voice detection
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,duet=info",
        1 => "info,duet=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let error = e.downcast_ref::<Error>();
            if !matches!(error, Some(Error::Interrupted)) {
                tracing::error!("fatal: {e:#}");
            }
            ExitCode::from(error.map_or(1, Error::exit_code))
        }
    }
}

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(path) = &cli.history {
        config.history_path = Some(path.clone());
    }

    match cli.command.unwrap_or(Command::Run {
        signal_dir: None,
        handshake_timeout: None,
    }) {
        Command::Run {
            signal_dir,
            handshake_timeout,
        } => {
            if let Some(dir) = signal_dir {
                config.signals.dir = dir;
            }
            if let Some(secs) = handshake_timeout {
                config.signals.handshake_timeout = Duration::from_secs(secs);
            }
            config.validate()?;
            orchestrate(&config, front_end_args(cli.config.as_deref(), cli.verbose)).await
        }
        Command::FrontEnd { signal_dir } => {
            if let Some(dir) = signal_dir {
                config.signals.dir = dir;
            }
            config.validate()?;
            front_end(&config).await
        }
        Command::Twitch { channel } => {
            if let Some(channel) = channel {
                config.twitch.channel = channel;
            }
            config.validate()?;
            twitch(&config).await
        }
        Command::Chat { mode } => {
            config.validate()?;
            chat(&config, mode).await
        }
        Command::Signals { signal_dir, clear } => {
            if let Some(dir) = signal_dir {
                config.signals.dir = dir;
            }
            show_signals(&config, clear)
        }
        Command::TestMic { duration } => test_mic(&config, duration).await,
    }
}

/// Arguments the front-end child inherits
fn front_end_args(config: Option<&Path>, verbose: u8) -> Vec<OsString> {
    let mut args = Vec::new();
    if let Some(path) = config {
        args.push("--config".into());
        args.push(path.as_os_str().to_owned());
    }
    if verbose > 0 {
        args.push(format!("-{}", "v".repeat(usize::from(verbose))).into());
    }
    args
}

/// Build the local input source for a mode
fn open_local_input(config: &Config, mode: InputMode) -> duet::Result<Box<dyn InputSource>> {
    Ok(match mode {
        InputMode::Text => Box::new(TypedInput::stdin()),
        InputMode::Voice => {
            let segmenter = config.segmenter(config.segmenter.vad.sample_rate)?;
            Box::new(MicrophoneInput::start(segmenter, config.segmenter.scan_interval)?)
        }
    })
}

fn console_reply(config: &Config) -> anyhow::Result<ConsoleReply> {
    let synthesizer = config.synthesizer().context("failed to set up speech synthesis")?;
    Ok(ConsoleReply::new(
        config.responder.persona.name.clone(),
        SpeakReply::new(synthesizer, SpeechDestination::LocalPlayback),
    ))
}

#[allow(clippy::future_not_send)]
async fn orchestrate(config: &Config, extra_args: Vec<OsString>) -> anyhow::Result<()> {
    let pipeline = config.pipeline().context("failed to set up the turn pipeline")?;
    let dispatcher = console_reply(config)?;
    let signals = config.signal_channel()?;
    let front_end = FrontEndCommand::current_exe(signals.dir(), extra_args)?;

    tracing::info!(
        signal_dir = %signals.dir().display(),
        persona = %config.responder.persona.name,
        "starting duet"
    );

    let orchestrator = ProcessOrchestrator::new(signals, front_end, config.signals.handshake_timeout);
    orchestrator
        .run(|mode| open_local_input(config, mode), &pipeline, &dispatcher)
        .await?;
    Ok(())
}

async fn front_end(config: &Config) -> anyhow::Result<()> {
    let token = config.api_keys.discord.clone().unwrap_or_default();
    let (gateway, events) = DiscordGateway::connect(&token).await?;

    let segmenter = config.segmenter(gateway.sample_rate())?;
    let pipeline = Arc::new(config.pipeline().context("failed to set up the turn pipeline")?);
    let synthesizer = config.synthesizer().context("failed to set up speech synthesis")?;
    let settings = FrontEndSettings {
        scan_interval: config.platform_scan_interval,
        persona_name: config.responder.persona.name.clone(),
    };

    let front_end = FrontEnd::new(
        gateway,
        config.signal_channel()?,
        segmenter,
        pipeline,
        synthesizer,
        settings,
    )?;
    front_end.run(events).await?;
    Ok(())
}

async fn twitch(config: &Config) -> anyhow::Result<()> {
    let pipeline = config.pipeline().context("failed to set up the turn pipeline")?;
    let (chat, messages) = TwitchChat::connect(&config.twitch_settings()).await?;
    let log = ChatLog::new(config.twitch.chat_log.clone());

    tokio::select! {
        () = relay(&chat, messages, &pipeline, Some(&log)) => {}
        () = interrupted() => tracing::info!("interrupted"),
    }

    pipeline.save_history().await?;
    Ok(())
}

#[allow(clippy::future_not_send)]
async fn chat(config: &Config, mode: Option<InputMode>) -> anyhow::Result<()> {
    let pipeline = config.pipeline().context("failed to set up the turn pipeline")?;
    let dispatcher = console_reply(config)?;

    // one reader owns stdin for the whole chat
    let mut typed = None;
    let mode = match mode {
        Some(mode) => mode,
        None => {
            let mut reader = TypedInput::stdin();
            let mode = ask_mode(&mut reader).await?;
            typed = Some(reader);
            mode
        }
    };
    tracing::info!(%mode, "local chat started, say or type \"exit\" to stop");

    let mut input: Box<dyn InputSource> = match (mode, typed) {
        (InputMode::Text, Some(reader)) => Box::new(reader),
        _ => open_local_input(config, mode)?,
    };
    let result = tokio::select! {
        result = run_input_loop(input.as_mut(), &pipeline, &dispatcher, None) => result,
        () = interrupted() => Err(Error::Interrupted),
    };

    if let Err(e) = pipeline.save_history().await {
        tracing::warn!(error = %e, "failed to save history");
    }
    Ok(result?)
}

async fn ask_mode(reader: &mut TypedInput) -> anyhow::Result<InputMode> {
    loop {
        let Some(line) = reader.read_line("Choose input mode (voice/text): ").await? else {
            anyhow::bail!("stdin closed before an input mode was chosen");
        };
        match line.parse() {
            Ok(mode) => return Ok(mode),
            Err(_) => println!("Please type 'voice' or 'text'."),
        }
    }
}

fn show_signals(config: &Config, clear: bool) -> anyhow::Result<()> {
    let signals = config.signal_channel()?;
    println!("Signal directory: {}", signals.dir().display());

    for name in SignalName::ALL {
        let state = match signals.read_value(name)? {
            Some(value) if value.is_empty() => "present".to_string(),
            Some(value) => format!("present ({value})"),
            None => "absent".to_string(),
        };
        println!("  {:<18} {state}", name.as_str());
    }

    if clear {
        for name in SignalName::ALL {
            if signals.clear(name)? {
                println!("Removed {}", name.as_str());
            }
        }
    }

    Ok(())
}

/// Test microphone input with a level meter and per-frame voice detection
#[allow(clippy::future_not_send)]
async fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let vad = config.segmenter.vad;
    let mut classifier = WebRtcClassifier::new(vad)?;
    let mut capture = AudioCapture::new(vad.sample_rate)?;
    capture.start()?;

    println!("Sample rate: {} Hz, {} ms frames", vad.sample_rate, vad.frame_ms);
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let samples = capture.take_samples();

        let energy = calculate_rms(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        let pcm = f32_to_pcm16(&samples);
        let frames = pcm.chunks_exact(classifier.frame_bytes());
        let total = frames.len();
        let mut speech = 0;
        for frame in frames {
            if classifier.is_speech(frame)? {
                speech += 1;
            }
        }

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | speech {speech:>3}/{total:<3} | [{meter}]",
            i + 1,
            energy,
            peak,
        );
    }

    capture.stop();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If speech frames stay at 0 while talking, try a lower");
    println!("`aggressiveness` under [segmenter] in the config file.");

    Ok(())
}

/// Calculate RMS energy
#[allow(clippy::cast_precision_loss)]
fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}
