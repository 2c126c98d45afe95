mod catalog;
mod command;
mod completion;
mod editor;
mod engine;
mod error;
mod model;
mod playback;
mod ranking;
mod session;
mod synth;
mod terminal;

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser};
use reqwest::blocking::Client;
use tracing_subscriber::EnvFilter;

use crate::catalog::VoiceCatalog;
use crate::engine::{KittenEngine, RetryPolicy, SynthesisEngine, load_with_retry};
use crate::model::{ModelArtifacts, ModelSelection, VoiceTable, build_http_client, ensure_model_cached};
use crate::playback::{DEFAULT_PLAY_GAIN, DEFAULT_SAMPLE_RATE, PlaybackOptions, PlayerMode};
use crate::session::{Session, SessionSettings, initial_voice};
use crate::synth::{
    DEFAULT_MAX_CHARS, DEFAULT_TRIM_TAIL, PhonemizerMode, SynthesisConfig, detect_phonemizer,
};
use crate::terminal::stdin_key_source;

#[derive(Debug, Parser)]
#[command(name = "voice-console")]
#[command(about = "Interactive text-to-speech console for KittenTTS ONNX models")]
struct Cli {
    /// Speak this text once and exit
    #[arg(long)]
    text: Option<String>,
    /// Initial voice name
    #[arg(long)]
    voice: Option<String>,
    #[arg(long, help = "Write audio to a file (not implemented; audio is played instead)")]
    output: Option<PathBuf>,
    #[arg(long, help = "List available voices sorted by language and exit")]
    list_voices: bool,
    #[arg(long, help = "Stay in the interactive console after speaking --text")]
    interactive: bool,
    #[command(flatten)]
    model: ModelSelection,
    #[command(flatten)]
    synthesis: SynthesisArgs,
    #[command(flatten)]
    playback: PlaybackArgs,
}

#[derive(Debug, Clone, Args)]
struct SynthesisArgs {
    #[arg(long, default_value_t = 1.0)]
    speed: f32,
    #[arg(long, default_value_t = DEFAULT_MAX_CHARS)]
    max_chars: usize,
    #[arg(long, default_value_t = DEFAULT_TRIM_TAIL)]
    trim_tail: usize,
    #[arg(long, help = "Fixed style row; defaults to the row matching the token count")]
    style_index: Option<usize>,
    #[arg(long, value_enum, default_value_t = PhonemizerMode::EspeakNg)]
    phonemizer: PhonemizerMode,
}

impl SynthesisArgs {
    fn config(&self) -> SynthesisConfig {
        SynthesisConfig {
            speed: self.speed,
            max_chars: self.max_chars,
            trim_tail: self.trim_tail,
            style_index: self.style_index,
        }
    }
}

#[derive(Debug, Clone, Args)]
struct PlaybackArgs {
    #[arg(long, value_enum, default_value_t = PlayerMode::Auto)]
    player: PlayerMode,
    #[arg(
        long,
        default_value_t = DEFAULT_PLAY_GAIN,
        help = "Playback gain multiplier applied before speaker output"
    )]
    gain: f32,
    #[arg(
        long,
        default_value_t = false,
        help = "Allow clipping instead of automatically limiting playback gain"
    )]
    allow_clipping: bool,
    #[arg(long, default_value_t = DEFAULT_SAMPLE_RATE)]
    sample_rate: u32,
}

impl PlaybackArgs {
    fn options(&self) -> PlaybackOptions {
        PlaybackOptions {
            player: self.player,
            sample_rate: self.sample_rate,
            gain: self.gain,
            allow_clipping: self.allow_clipping,
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

/// Model files and the voice catalog derived from them.
struct LoadedVoices {
    artifacts: ModelArtifacts,
    voice_table: Arc<VoiceTable>,
    catalog: VoiceCatalog,
}

fn load_voices(client: &Client, model: &ModelSelection) -> Result<LoadedVoices> {
    let cache_root = model.resolve_cache_dir()?;
    let repo_id = model.resolve_repo_id();
    let artifacts = ensure_model_cached(client, &cache_root, &repo_id)?;
    tracing::info!(
        repo = %artifacts.repo_id,
        cache = %artifacts.cache_dir.display(),
        "model files ready"
    );
    let voice_table = Arc::new(VoiceTable::load(&artifacts.voices_path)?);
    let catalog = voice_table.catalog(&artifacts.config.voice_aliases);
    Ok(LoadedVoices {
        artifacts,
        voice_table,
        catalog,
    })
}

fn load_engine(cli: &Cli, client: &Client) -> Result<(LoadedVoices, KittenEngine)> {
    let ort_runtime = cli.model.resolve_ort_runtime_config();
    let voices = load_voices(client, &cli.model)?;
    let phonemizer = detect_phonemizer(cli.synthesis.phonemizer)?;
    let engine = KittenEngine::load(
        &voices.artifacts,
        Arc::clone(&voices.voice_table),
        &ort_runtime,
        phonemizer,
        cli.synthesis.config(),
        cli.playback.options(),
    )?;
    Ok((voices, engine))
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let client = build_http_client()?;
    let mut stdout = io::stdout();

    if cli.list_voices {
        let voices = load_voices(&client, &cli.model)?;
        if voices.catalog.is_empty() {
            writeln!(stdout, "No voices available.")?;
        }
        for voice in voices.catalog.sorted_for_display() {
            writeln!(stdout, "{} ({})", voice.name, voice.language)?;
        }
        return Ok(());
    }

    writeln!(stdout, "Welcome to the KittenTTS voice console!")?;
    writeln!(stdout, "Loading model...")?;
    stdout.flush()?;

    let (voices, mut engine) =
        load_with_retry(RetryPolicy::default(), &mut stdout, |attempt| {
            tracing::debug!(attempt, "loading model");
            load_engine(&cli, &client)
        })?;
    writeln!(stdout, "Model loaded successfully!")?;

    if let Some(path) = &cli.output {
        writeln!(
            stdout,
            "Note: writing audio to '{}' is not implemented yet; playing it instead.",
            path.display()
        )?;
    }

    let catalog = &voices.catalog;
    let Some(voice) = initial_voice(catalog, cli.voice.as_deref(), &mut stdout)? else {
        writeln!(stdout, "No voices available. Exiting...")?;
        return Ok(());
    };

    if let Some(text) = &cli.text {
        engine
            .speak(text, &voice)
            .with_context(|| format!("failed speaking text with voice '{}'", voice.name))?;
        if !cli.interactive {
            return Ok(());
        }
    }

    let mut keys = stdin_key_source();
    let mut session = Session::new(
        catalog,
        &mut engine,
        voice,
        SessionSettings::default(),
        io::stdout(),
    );
    session.greet()?;
    session.run(keys.as_mut())?;
    tracing::debug!(
        voice = %session.active_voice().name,
        wav_output = session.settings().wav_output,
        "console closed"
    );
    Ok(())
}
