use std::path::PathBuf;
use std::thread;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::Receiver;
use tracing::{debug, info, warn};

use speech_engine::{create_driver, DriverKind, DriverProxy};
use speech_types::{Notification, PropertyValue};

mod config;

use config::SpeechConfig;

#[derive(Parser)]
#[command(name = "speech-dispatch")]
#[command(about = "Queue-based text to speech front end", long_about = None)]
struct Cli {
    /// Driver to use (auto, espeak, dummy); overrides the config file
    #[arg(long, global = true)]
    driver: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct VoiceArgs {
    /// Voice id, as listed by `voices`
    #[arg(long)]
    voice: Option<String>,
    /// Speaking rate in words per minute
    #[arg(long)]
    rate: Option<f64>,
    /// Volume, 0.0 to 1.0
    #[arg(long)]
    volume: Option<f64>,
    #[arg(long)]
    pitch: Option<f64>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Speak text aloud")]
    Say {
        #[arg(required = true)]
        text: Vec<String>,
        /// Utterance name reported in notifications
        #[arg(long)]
        name: Option<String>,
        #[command(flatten)]
        voice_args: VoiceArgs,
    },
    #[command(about = "Synthesize text into an audio file")]
    Save {
        #[arg(required = true)]
        text: Vec<String>,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long)]
        name: Option<String>,
        #[command(flatten)]
        voice_args: VoiceArgs,
    },
    #[command(about = "List the voices offered by the driver")]
    Voices,
}

fn resolve_driver(flag: Option<&str>, config: &SpeechConfig) -> Result<DriverKind> {
    let name = flag.or(config.driver.as_deref()).unwrap_or("auto");
    DriverKind::from_str(name)
        .ok_or_else(|| anyhow!("unknown driver \"{name}\" (expected auto, espeak or dummy)"))
}

/// Queue the configured defaults merged with the command-line overrides, so
/// they apply before the utterance.
fn apply_voice_args(proxy: &DriverProxy, config: &SpeechConfig, args: &VoiceArgs) -> Result<()> {
    let voice = args.voice.clone().or_else(|| config.defaults.voice.clone());
    let rate = args.rate.or(config.defaults.rate);
    let volume = args.volume.or(config.defaults.volume);
    let pitch = args.pitch.or(config.defaults.pitch);

    if let Some(voice) = voice {
        proxy.set_property("voice", PropertyValue::Text(voice))?;
    }
    if let Some(rate) = rate {
        proxy.set_property("rate", PropertyValue::Number(rate))?;
    }
    if let Some(volume) = volume {
        proxy.set_property("volume", PropertyValue::Number(volume))?;
    }
    if let Some(pitch) = pitch {
        proxy.set_property("pitch", PropertyValue::Number(pitch))?;
    }
    Ok(())
}

fn spawn_event_logger(rx: Receiver<Notification>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for event in rx {
            match &event {
                Notification::Error { name, message } => {
                    warn!("speech error ({:?}): {}", name, message);
                }
                Notification::StartedWord { .. } => {}
                _ => debug!("{} ({:?})", event.topic(), event.name()),
            }
        }
    })
}

fn print_voices(proxy: &DriverProxy) -> Result<()> {
    let value = proxy.get_property("voices")?;
    let voices = value
        .as_voices()
        .ok_or_else(|| anyhow!("driver returned a non-catalog value for \"voices\""))?;
    for voice in voices {
        println!(
            "{:<12} {:<24} {}",
            voice.id,
            voice.name,
            voice.languages.join(",")
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = config::load_config();
    let kind = resolve_driver(cli.driver.as_deref(), &config)?;

    let (tx, rx) = crossbeam_channel::unbounded();
    let proxy = DriverProxy::new(Box::new(tx), |handle| create_driver(kind, handle))?;
    let logger = spawn_event_logger(rx);

    match cli.command {
        Commands::Say {
            text,
            name,
            voice_args,
        } => {
            apply_voice_args(&proxy, &config, &voice_args)?;
            proxy.say(text.join(" "), name);
            proxy.run_and_wait()?;
        }
        Commands::Save {
            text,
            output,
            name,
            voice_args,
        } => {
            apply_voice_args(&proxy, &config, &voice_args)?;
            proxy.save_to_file(text.join(" "), &output, name);
            proxy.run_and_wait()?;
            info!("wrote {}", output.display());
        }
        Commands::Voices => print_voices(&proxy)?,
    }

    // dropping the proxy destroys the driver and closes the event channel
    drop(proxy);
    let _ = logger.join();
    Ok(())
}
