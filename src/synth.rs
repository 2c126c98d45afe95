use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::ValueEnum;
use ndarray::{Array1, Axis};
use once_cell::sync::{Lazy, OnceCell};
use ort::{
    ep, inputs,
    session::{Session, builder::GraphOptimizationLevel},
    value::Tensor,
};
use regex::Regex;

use crate::catalog::VoiceRecord;
use crate::model::{ModelArtifacts, VoiceTable};

pub const DEFAULT_MAX_CHARS: usize = 400;
pub const DEFAULT_TRIM_TAIL: usize = 5_000;
const CUDA_MEMORY_LIMIT: usize = 2 << 30;
const ORT_THREADS: usize = 1;
const MAX_INPUT_TOKENS: usize = 510;
const MAX_INPUT_CHARS: usize = 20_000;
const MAX_CHUNKS: usize = 256;
const MAX_CHUNK_CHARS: usize = 2_000;
const SPEED_RANGE: std::ops::RangeInclusive<f32> = 0.5..=2.0;
const TOKEN_PAD_ID: i64 = 0;

static TOKEN_SPLIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\w+|[^\w\s]").expect("valid regex"));
static SENTENCE_SPLIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?]+").expect("valid regex"));
static SPACES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));
static ORT_INIT: OnceCell<()> = OnceCell::new();

#[derive(Debug, Clone, Default)]
pub struct OrtRuntimeConfig {
    pub ort_lib: Option<PathBuf>,
    pub cuda_lib_dir: Option<PathBuf>,
    pub cudnn_lib_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
pub struct SynthesisConfig {
    pub speed: f32,
    pub max_chars: usize,
    pub trim_tail: usize,
    /// Fixed style row; by default the row matching the chunk's token count.
    pub style_index: Option<usize>,
}

impl SynthesisConfig {
    pub fn validate(&self) -> Result<()> {
        if !SPEED_RANGE.contains(&self.speed) {
            bail!(
                "speed {} is outside {}..={}",
                self.speed,
                SPEED_RANGE.start(),
                SPEED_RANGE.end()
            );
        }
        if !(1..=MAX_CHUNK_CHARS).contains(&self.max_chars) {
            bail!("max chars per chunk must be within 1..={MAX_CHUNK_CHARS}");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PhonemizerMode {
    Auto,
    EspeakNg,
    Espeak,
}

pub trait Phonemizer {
    fn name(&self) -> &str;
    fn phonemize(&self, text: &str, language: &str) -> Result<String>;
}

#[derive(Debug)]
struct EspeakPhonemizer {
    program: &'static str,
}

impl Phonemizer for EspeakPhonemizer {
    fn name(&self) -> &str {
        self.program
    }

    fn phonemize(&self, text: &str, language: &str) -> Result<String> {
        let output = Command::new(self.program)
            .args(["-q", "--ipa=3", "-v", language, text])
            .output()
            .with_context(|| format!("could not run {}", self.program))?;
        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let phonemes = String::from_utf8(output.stdout)
            .with_context(|| format!("{} printed non-utf8 phonemes", self.program))?;
        match phonemes.trim() {
            "" => bail!("{} printed no phonemes for '{text}'", self.program),
            trimmed => Ok(trimmed.to_string()),
        }
    }
}

pub fn detect_phonemizer(mode: PhonemizerMode) -> Result<Box<dyn Phonemizer>> {
    let candidates: &[&'static str] = match mode {
        PhonemizerMode::Auto => &["espeak-ng", "espeak"],
        PhonemizerMode::EspeakNg => &["espeak-ng"],
        PhonemizerMode::Espeak => &["espeak"],
    };
    match candidates.iter().find(|program| executable_in_path(program)) {
        Some(&program) => Ok(Box::new(EspeakPhonemizer { program })),
        None => bail!(
            "no espeak phonemizer found on PATH (tried: {})",
            candidates.join(", ")
        ),
    }
}

pub fn executable_in_path(command: &str) -> bool {
    let Some(path_var) = std::env::var_os("PATH") else {
        return false;
    };
    let names = executable_names(command);
    std::env::split_paths(&path_var).any(|dir| names.iter().any(|name| dir.join(name).is_file()))
}

fn executable_names(command: &str) -> Vec<String> {
    let mut names = vec![command.to_string()];
    if cfg!(windows) {
        let exts = std::env::var("PATHEXT").unwrap_or_else(|_| ".exe;.bat;.cmd".to_string());
        names.extend(
            exts.split(';')
                .map(str::trim)
                .filter(|ext| !ext.is_empty())
                .map(|ext| format!("{command}{}", ext.to_ascii_lowercase())),
        );
    }
    names
}

const SYMBOL_PAD: &str = "$";
const SYMBOL_PUNCTUATION: &str = ";:,.!?¡¿—…\"«»\"\" ";
const SYMBOL_LETTERS: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const SYMBOL_IPA: &str = "ɑɐɒæɓʙβɔɕçɗɖðʤəɘɚɛɜɝɞɟʄɡɠɢʛɦɧħɥʜɨɪʝɭɬɫɮʟɱɯɰŋɳɲɴøɵɸθœɶʘɹɺɾɻʀʁɽʂʃʈʧʉʊʋⱱʌɣɤʍχʎʏʑʐʒʔʡʕʢǀǁǂǃˈˌːˑʼʴʰʱʲʷˠˤ˞↓↑→↗↘'̩'ᵻ";

#[derive(Debug)]
struct SymbolTable {
    ids: HashMap<char, i64>,
}

impl SymbolTable {
    fn new() -> Self {
        let ids = [SYMBOL_PAD, SYMBOL_PUNCTUATION, SYMBOL_LETTERS, SYMBOL_IPA]
            .concat()
            .chars()
            .zip(0_i64..)
            .collect();
        Self { ids }
    }

    /// Words and punctuation marks are re-joined with single spaces, and
    /// characters outside the table are dropped.
    fn tokenize(&self, phonemes: &str) -> Vec<i64> {
        let spaced = TOKEN_SPLIT_RE
            .find_iter(phonemes)
            .map(|piece| piece.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        spaced.chars().filter_map(|ch| self.ids.get(&ch).copied()).collect()
    }
}

pub struct Synthesizer {
    session: Session,
    voice_table: Arc<VoiceTable>,
    symbols: SymbolTable,
    speed_priors: HashMap<String, f32>,
    aliases: HashMap<String, String>,
}

impl Synthesizer {
    pub fn new(
        artifacts: &ModelArtifacts,
        voice_table: Arc<VoiceTable>,
        ort_runtime: &OrtRuntimeConfig,
    ) -> Result<Self> {
        init_ort(ort_runtime)?;
        let session = build_session(&artifacts.model_path)?;
        Ok(Self {
            session,
            voice_table,
            symbols: SymbolTable::new(),
            speed_priors: artifacts.config.speed_priors.clone(),
            aliases: artifacts.config.voice_aliases.clone(),
        })
    }

    pub fn synthesize(
        &mut self,
        text: &str,
        voice: &VoiceRecord,
        config: SynthesisConfig,
        phonemizer: &dyn Phonemizer,
    ) -> Result<Vec<f32>> {
        config.validate()?;
        let chunks = prepare_chunks(text, config.max_chars)?;
        let canonical = self.resolve_voice(&voice.name)?;

        let mut audio = Vec::new();
        for chunk in &chunks {
            let phonemes = phonemizer
                .phonemize(chunk, &voice.language)
                .with_context(|| format!("{} could not phonemize '{chunk}'", phonemizer.name()))?;
            audio.extend(self.synthesize_chunk(chunk, &phonemes, &canonical, config)?);
        }
        Ok(audio)
    }

    fn resolve_voice(&self, voice: &str) -> Result<String> {
        let canonical = self.aliases.get(voice).map_or(voice, String::as_str);
        if !self.voice_table.contains(canonical) {
            bail!("voice '{voice}' is not in the loaded voice table");
        }
        Ok(canonical.to_string())
    }

    fn synthesize_chunk(
        &mut self,
        chunk: &str,
        phonemes: &str,
        voice: &str,
        config: SynthesisConfig,
    ) -> Result<Vec<f32>> {
        let tokens = self.symbols.tokenize(phonemes);
        match tokens.len() {
            0 => bail!("no model tokens for chunk '{chunk}'"),
            n if n > MAX_INPUT_TOKENS => bail!(
                "chunk '{chunk}' needs {n} tokens, the model takes {MAX_INPUT_TOKENS}. \
                 Lower --max-chars"
            ),
            _ => {}
        }

        let row = resolve_style_index(
            self.voice_table.style_rows(voice)?,
            config.style_index,
            tokens.len(),
        );
        let style = self.voice_table.style_row(voice, row)?.to_vec();
        let speed = config.speed * self.speed_priors.get(voice).copied().unwrap_or(1.0);

        let padded: Vec<i64> = std::iter::once(TOKEN_PAD_ID)
            .chain(tokens)
            .chain(std::iter::once(TOKEN_PAD_ID))
            .collect();
        let outputs = self.session.run(inputs![
            "input_ids" => Tensor::from_array(Array1::from_vec(padded).insert_axis(Axis(0)))?,
            "style" => Tensor::from_array(Array1::from_vec(style).insert_axis(Axis(0)))?,
            "speed" => Tensor::from_array(Array1::from_elem(1, speed))?
        ])?;

        if outputs.len() == 0 {
            bail!("model produced no waveform");
        }
        let (_, samples) = outputs[0]
            .try_extract_tensor::<f32>()
            .context("waveform output is not an f32 tensor")?;
        let keep = samples.len().saturating_sub(config.trim_tail);
        Ok(samples[..keep].to_vec())
    }
}

/// Single-threaded CUDA session. CUDA is required; there is no CPU fallback.
fn build_session(model_path: &Path) -> Result<Session> {
    let cuda = ep::CUDA::default()
        .with_device_id(0)
        .with_memory_limit(CUDA_MEMORY_LIMIT)
        .with_conv_algorithm_search(ep::cuda::ConvAlgorithmSearch::Heuristic)
        .with_conv_max_workspace(false)
        .build()
        .error_on_failure();

    Session::builder()?
        .with_no_environment_execution_providers()?
        .with_intra_threads(ORT_THREADS)?
        .with_inter_threads(ORT_THREADS)?
        .with_intra_op_spinning(false)?
        .with_memory_pattern(false)?
        .with_deterministic_compute(true)?
        .with_execution_providers([cuda])
        .context("CUDA execution provider unavailable (needs CUDA 12 and cuDNN)")?
        .with_optimization_level(GraphOptimizationLevel::Level1)?
        .commit_from_file(model_path)
        .with_context(|| format!("failed to load onnx model from {}", model_path.display()))
}

/// Style row for a chunk of `token_count` tokens: an explicit index wins,
/// otherwise the row matching the token count. Both are clamped to the table.
fn resolve_style_index(rows: usize, explicit: Option<usize>, token_count: usize) -> usize {
    let max_index = rows.saturating_sub(1);
    explicit.unwrap_or(token_count).min(max_index)
}

fn prepare_chunks(text: &str, max_chars: usize) -> Result<Vec<String>> {
    let cleaned = clean_text_basic(text);
    if cleaned.is_empty() {
        bail!("nothing to say");
    }
    if cleaned.len() > MAX_INPUT_CHARS {
        bail!("text is {} chars, the limit is {MAX_INPUT_CHARS}", cleaned.len());
    }

    let chunks = chunk_text(&cleaned, max_chars);
    match chunks.len() {
        0 => bail!("no speakable text after chunking"),
        n if n > MAX_CHUNKS => bail!("text splits into {n} chunks, the limit is {MAX_CHUNKS}"),
        _ => Ok(chunks),
    }
}

#[cfg(target_os = "windows")]
const ORT_LIBRARY: &str = "onnxruntime.dll";
#[cfg(target_os = "macos")]
const ORT_LIBRARY: &str = "libonnxruntime.dylib";
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const ORT_LIBRARY: &str = "libonnxruntime.so";

/// Loads the ONNX Runtime library once per process. `--ort-lib` wins over
/// `ORT_DYLIB_PATH`, which wins over the platform library name.
fn init_ort(config: &OrtRuntimeConfig) -> Result<()> {
    ORT_INIT.get_or_try_init(|| -> Result<()> {
        let (cuda, cudnn) = (config.cuda_lib_dir.as_deref(), config.cudnn_lib_dir.as_deref());
        if cuda.is_some() || cudnn.is_some() {
            ep::cuda::preload_dylibs(cuda, cudnn)
                .context("failed preloading CUDA/cuDNN shared libraries")?;
        }

        let library = match (&config.ort_lib, std::env::var_os("ORT_DYLIB_PATH")) {
            (Some(path), _) => path.clone(),
            (None, Some(env_path)) => PathBuf::from(env_path),
            (None, None) => PathBuf::from(ORT_LIBRARY),
        };
        tracing::debug!(path = %library.display(), "loading onnx runtime");

        let environment = ort::init_from(&library)
            .with_context(|| format!("no usable ONNX Runtime at {}", library.display()))?;
        let _ = environment.with_name("voice-console").commit();
        Ok(())
    })?;
    Ok(())
}

fn clean_text_basic(text: &str) -> String {
    SPACES_RE.replace_all(text.trim(), " ").to_string()
}

fn with_trailing_pause(text: &str) -> String {
    let text = text.trim();
    match text.chars().last() {
        None | Some('.' | '!' | '?' | ',' | ';' | ':') => text.to_string(),
        Some(_) => format!("{text},"),
    }
}

fn chunk_text(text: &str, max_len: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    for sentence in SENTENCE_SPLIT_RE
        .split(text)
        .map(str::trim)
        .filter(|sentence| !sentence.is_empty())
    {
        if sentence.len() <= max_len {
            chunks.push(with_trailing_pause(sentence));
            continue;
        }

        let mut words = sentence.split_whitespace();
        let Some(first) = words.next() else {
            continue;
        };
        let mut current = first.to_string();
        for word in words {
            if current.len() + 1 + word.len() > max_len {
                chunks.push(with_trailing_pause(&current));
                current = word.to_string();
            } else {
                current.push(' ');
                current.push_str(word);
            }
        }
        chunks.push(with_trailing_pause(&current));
    }
    chunks
}
