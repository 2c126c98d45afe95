use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::catalog::VoiceRecord;
use crate::model::{ModelArtifacts, VoiceTable};
use crate::playback::{PlaybackOptions, play_audio};
use crate::synth::{OrtRuntimeConfig, Phonemizer, SynthesisConfig, Synthesizer};

pub const MAX_LOAD_ATTEMPTS: u32 = 3;
pub const LOAD_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Speaks text with a given voice. Calls block until playback has finished.
pub trait SynthesisEngine {
    fn speak(&mut self, text: &str, voice: &VoiceRecord) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: MAX_LOAD_ATTEMPTS,
            delay: LOAD_RETRY_DELAY,
        }
    }
}

/// Runs `load` until it succeeds or `policy.attempts` is exhausted. Every
/// failed attempt except the last is reported on `out`; the last failure is
/// returned to the caller.
pub fn load_with_retry<T, W, F>(policy: RetryPolicy, out: &mut W, mut load: F) -> Result<T>
where
    W: Write,
    F: FnMut(u32) -> Result<T>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match load(attempt) {
            Ok(loaded) => return Ok(loaded),
            Err(err) if attempt < attempts => {
                let message = format!("{err:#}");
                tracing::warn!(attempt, attempts, error = %message, "model load failed");
                writeln!(out, "Failed to load model (attempt {attempt}/{attempts}): {err:#}")?;
                writeln!(out, "Retrying...")?;
                out.flush()?;
                std::thread::sleep(policy.delay);
                attempt += 1;
            }
            Err(err) => {
                return Err(err.context(format!("model failed to load after {attempts} attempts")));
            }
        }
    }
}

/// KittenTTS ONNX synthesis followed by playback through an external player.
pub struct KittenEngine {
    synthesizer: Synthesizer,
    phonemizer: Box<dyn Phonemizer>,
    synthesis: SynthesisConfig,
    playback: PlaybackOptions,
}

impl KittenEngine {
    pub fn load(
        artifacts: &ModelArtifacts,
        voice_table: Arc<VoiceTable>,
        ort_runtime: &OrtRuntimeConfig,
        phonemizer: Box<dyn Phonemizer>,
        synthesis: SynthesisConfig,
        playback: PlaybackOptions,
    ) -> Result<Self> {
        synthesis.validate()?;
        let synthesizer = Synthesizer::new(artifacts, voice_table, ort_runtime)?;
        tracing::info!(
            model = %artifacts.model_path.display(),
            phonemizer = phonemizer.name(),
            "synthesis engine ready"
        );
        Ok(Self {
            synthesizer,
            phonemizer,
            synthesis,
            playback,
        })
    }
}

impl SynthesisEngine for KittenEngine {
    fn speak(&mut self, text: &str, voice: &VoiceRecord) -> Result<()> {
        let audio = self.synthesizer.synthesize(
            text,
            voice,
            self.synthesis,
            self.phonemizer.as_ref(),
        )?;
        tracing::debug!(samples = audio.len(), voice = %voice.name, "synthesized");
        play_audio(&audio, &self.playback)
            .with_context(|| format!("failed playing audio for voice '{}'", voice.name))
    }
}
