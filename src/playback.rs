use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, bail};
use clap::ValueEnum;

use crate::synth::executable_in_path;

pub const DEFAULT_SAMPLE_RATE: u32 = 24_000;
pub const DEFAULT_PLAY_GAIN: f32 = 2.5;
const MIN_OUTPUT_GAIN: f32 = 0.1;
const MAX_OUTPUT_GAIN: f32 = 8.0;
const SAFE_PLAYBACK_PEAK: f32 = 0.98;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PlayerMode {
    Auto,
    Ffplay,
    PwPlay,
}

#[derive(Debug, Clone, Copy)]
pub struct PlaybackOptions {
    pub player: PlayerMode,
    pub sample_rate: u32,
    pub gain: f32,
    pub allow_clipping: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Player {
    Ffplay,
    PwPlay,
}

impl Player {
    fn program(self) -> &'static str {
        match self {
            Self::Ffplay => "ffplay",
            Self::PwPlay => "pw-play",
        }
    }

    fn command(self, wav: &Path) -> Command {
        let mut command = Command::new(self.program());
        if self == Self::Ffplay {
            command.args(["-autoexit", "-nodisp", "-loglevel", "error"]);
        }
        command.arg(wav);
        command
    }
}

fn detect_player(mode: PlayerMode) -> Result<Player> {
    let candidates: &[Player] = match mode {
        PlayerMode::Auto => &[Player::Ffplay, Player::PwPlay],
        PlayerMode::Ffplay => &[Player::Ffplay],
        PlayerMode::PwPlay => &[Player::PwPlay],
    };
    match candidates
        .iter()
        .copied()
        .find(|player| executable_in_path(player.program()))
    {
        Some(player) => Ok(player),
        None if matches!(mode, PlayerMode::Auto) => {
            bail!("no supported audio player found. Install 'ffplay' or 'pw-play'")
        }
        None => bail!("player '{}' not found on PATH", candidates[0].program()),
    }
}

/// Scales `audio` by `gain`, lowering the gain when needed to keep the peak
/// under [`SAFE_PLAYBACK_PEAK`] unless clipping is allowed. Returns the scaled
/// samples and the gain that was actually applied.
fn apply_playback_gain(audio: &[f32], gain: f32, allow_clipping: bool) -> Result<(Vec<f32>, f32)> {
    if !gain.is_finite() || !(MIN_OUTPUT_GAIN..=MAX_OUTPUT_GAIN).contains(&gain) {
        bail!("gain must be between {MIN_OUTPUT_GAIN} and {MAX_OUTPUT_GAIN}");
    }

    let peak = audio
        .iter()
        .fold(0.0_f32, |acc, sample| acc.max(sample.abs()));
    let mut applied_gain = gain;
    if !allow_clipping && peak > 0.0 {
        applied_gain = applied_gain.min(SAFE_PLAYBACK_PEAK / peak);
    }

    let gained = if (applied_gain - 1.0).abs() < f32::EPSILON {
        audio.to_vec()
    } else {
        audio.iter().map(|sample| *sample * applied_gain).collect()
    };
    Ok((gained, applied_gain))
}

fn write_temp_wav(path: &Path, sample_rate: u32, audio: &[f32]) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .with_context(|| format!("failed creating wav file {}", path.display()))?;
    for sample in audio {
        let scaled = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        writer.write_sample(scaled)?;
    }
    writer.finalize()?;
    Ok(())
}

pub fn play_audio(audio: &[f32], options: &PlaybackOptions) -> Result<()> {
    let player = detect_player(options.player)?;
    let (playback_audio, applied_gain) =
        apply_playback_gain(audio, options.gain, options.allow_clipping)?;
    if !options.allow_clipping && applied_gain + f32::EPSILON < options.gain {
        tracing::info!(
            requested = options.gain,
            applied = applied_gain,
            "playback gain limited to avoid clipping"
        );
    }

    let temp_file = tempfile::Builder::new()
        .prefix("voice-console-play-")
        .suffix(".wav")
        .tempfile()
        .context("failed creating temporary wav file for playback")?;
    write_temp_wav(temp_file.path(), options.sample_rate, &playback_audio)?;

    let status = player
        .command(temp_file.path())
        .status()
        .with_context(|| format!("failed to launch {}", player.program()))?;
    if !status.success() {
        bail!("audio player exited with failure status: {status}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_playback_gain_limits_when_clipping_not_allowed() {
        let audio = vec![0.8_f32, -0.8];
        let (scaled, applied) = apply_playback_gain(&audio, 2.5, false).expect("gain should work");
        assert!(applied < 2.5);
        let peak = scaled
            .iter()
            .fold(0.0_f32, |acc, sample| acc.max(sample.abs()));
        assert!(peak <= SAFE_PLAYBACK_PEAK + 1e-6);
    }

    #[test]
    fn apply_playback_gain_honors_gain_when_clipping_allowed() {
        let audio = vec![0.5_f32, -0.25];
        let (scaled, applied) = apply_playback_gain(&audio, 2.0, true).expect("gain should work");
        assert_eq!(applied, 2.0);
        assert!((scaled[0] - 1.0).abs() < 1e-6);
        assert!((scaled[1] + 0.5).abs() < 1e-6);
    }

    #[test]
    fn apply_playback_gain_rejects_out_of_range_gain() {
        assert!(apply_playback_gain(&[0.1], 0.0, false).is_err());
        assert!(apply_playback_gain(&[0.1], f32::INFINITY, true).is_err());
    }

    #[test]
    fn temp_wav_is_pcm16_mono() {
        let file = tempfile::Builder::new().suffix(".wav").tempfile().unwrap();
        write_temp_wav(file.path(), DEFAULT_SAMPLE_RATE, &[0.0, 0.5, -2.0]).unwrap();
        let reader = hound::WavReader::open(file.path()).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, DEFAULT_SAMPLE_RATE);
        assert_eq!(spec.bits_per_sample, 16);
        let samples: Vec<i16> = reader.into_samples::<i16>().map(Result::unwrap).collect();
        assert_eq!(samples, vec![0, i16::MAX / 2, -i16::MAX]);
    }

    #[test]
    fn ffplay_runs_headless() {
        let command = Player::Ffplay.command(Path::new("/tmp/x.wav"));
        let args: Vec<_> = command.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, vec!["-autoexit", "-nodisp", "-loglevel", "error", "/tmp/x.wav"]);
        assert_eq!(Player::PwPlay.command(Path::new("a.wav")).get_args().count(), 1);
    }
}
