use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, ValueEnum};
use directories::ProjectDirs;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zip::ZipArchive;

use crate::catalog::{VoiceCatalog, VoiceRecord, language_for_voice};
use crate::synth::OrtRuntimeConfig;

pub const DEFAULT_REPO_ID: &str = "KittenML/kitten-tts-nano-0.8-fp32";
const MAX_NPY_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum ModelPreset {
    #[value(name = "nano-0.8-int8")]
    Nano08Int8,
    #[value(name = "nano-0.8-fp32")]
    Nano08Fp32,
    #[value(name = "micro-0.8")]
    Micro08,
    #[value(name = "mini-0.8")]
    Mini08,
}

impl ModelPreset {
    pub fn repo_id(self) -> &'static str {
        match self {
            Self::Nano08Int8 => "KittenML/kitten-tts-nano-0.8-int8",
            Self::Nano08Fp32 => "KittenML/kitten-tts-nano-0.8-fp32",
            Self::Micro08 => "KittenML/kitten-tts-micro-0.8",
            Self::Mini08 => "KittenML/kitten-tts-mini-0.8",
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct ModelSelection {
    #[arg(long, value_enum)]
    pub model: Option<ModelPreset>,
    #[arg(long)]
    pub repo_id: Option<String>,
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,
    #[arg(
        long,
        help = "Path to libonnxruntime shared library for dynamic loading"
    )]
    pub ort_lib: Option<PathBuf>,
    #[arg(long, help = "Directory containing CUDA runtime shared libraries")]
    pub cuda_lib_dir: Option<PathBuf>,
    #[arg(long, help = "Directory containing cuDNN shared libraries")]
    pub cudnn_lib_dir: Option<PathBuf>,
}

impl ModelSelection {
    pub fn resolve_repo_id(&self) -> String {
        self.repo_id
            .clone()
            .or_else(|| self.model.map(|preset| preset.repo_id().to_string()))
            .unwrap_or_else(|| DEFAULT_REPO_ID.to_string())
    }

    pub fn resolve_cache_dir(&self) -> Result<PathBuf> {
        match &self.cache_dir {
            Some(dir) => Ok(dir.clone()),
            None => ProjectDirs::from("io", "KittenML", "voice-console")
                .map(|dirs| dirs.cache_dir().to_path_buf())
                .ok_or_else(|| anyhow!("could not determine platform cache directory")),
        }
    }

    pub fn resolve_ort_runtime_config(&self) -> OrtRuntimeConfig {
        OrtRuntimeConfig {
            ort_lib: self.ort_lib.clone(),
            cuda_lib_dir: self.cuda_lib_dir.clone(),
            cudnn_lib_dir: self.cudnn_lib_dir.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ModelConfig {
    #[serde(rename = "type")]
    pub model_type: String,
    pub model_file: String,
    pub voices: String,
    #[serde(default)]
    pub speed_priors: HashMap<String, f32>,
    #[serde(default)]
    pub voice_aliases: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
struct CacheManifest<'a> {
    repo_id: &'a str,
    fetched_at_unix: u64,
    model_file: &'a str,
    voices_file: &'a str,
}

#[derive(Debug)]
pub struct ModelArtifacts {
    pub repo_id: String,
    pub cache_dir: PathBuf,
    pub model_path: PathBuf,
    pub voices_path: PathBuf,
    pub config: ModelConfig,
}

#[derive(Debug)]
struct VoiceStyle {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl VoiceStyle {
    fn row(&self, index: usize) -> Result<&[f32]> {
        if self.cols == 0 {
            bail!("voice style has no columns");
        }
        self.data
            .chunks_exact(self.cols)
            .take(self.rows)
            .nth(index)
            .ok_or_else(|| anyhow!("style row {index} is past the last row ({})", self.rows))
    }
}

/// Style embeddings keyed by canonical voice name.
#[derive(Debug)]
pub struct VoiceTable {
    voices: BTreeMap<String, VoiceStyle>,
}

impl VoiceTable {
    pub fn load(path: &Path) -> Result<Self> {
        let mut archive = File::open(path)
            .map_err(anyhow::Error::from)
            .and_then(|file| Ok(ZipArchive::new(file)?))
            .with_context(|| format!("voices file {} is not a readable npz archive", path.display()))?;

        let mut voices = BTreeMap::new();
        for index in 0..archive.len() {
            let entry = archive.by_index(index)?;
            let Some(key) = entry.name().strip_suffix(".npy").map(str::to_string) else {
                continue;
            };
            let style =
                read_style(entry).with_context(|| format!("failed parsing npy entry: {key}.npy"))?;
            voices.insert(key, style);
        }

        if voices.is_empty() {
            bail!("{} holds no .npy voice styles", path.display());
        }
        Ok(Self { voices })
    }

    pub fn contains(&self, voice: &str) -> bool {
        self.voices.contains_key(voice)
    }

    pub fn style_rows(&self, voice: &str) -> Result<usize> {
        Ok(self.style(voice)?.rows)
    }

    pub fn style_row(&self, voice: &str, index: usize) -> Result<&[f32]> {
        self.style(voice)?.row(index)
    }

    fn style(&self, voice: &str) -> Result<&VoiceStyle> {
        self.voices
            .get(voice)
            .ok_or_else(|| anyhow!("voice '{voice}' not found in voices archive"))
    }

    /// Console catalog: config aliases first (sorted), then canonical names.
    /// Aliases pointing at voices missing from the archive are skipped.
    pub fn catalog(&self, aliases: &HashMap<String, String>) -> VoiceCatalog {
        let mut aliases: Vec<_> = aliases
            .iter()
            .filter(|(_, canonical)| self.contains(canonical))
            .collect();
        aliases.sort();
        let alias_records = aliases
            .into_iter()
            .map(|(alias, canonical)| VoiceRecord::new(alias.clone(), language_for_voice(canonical)));
        let canonical_records = self
            .voices
            .keys()
            .map(|name| VoiceRecord::new(name.clone(), language_for_voice(name)));
        VoiceCatalog::new(alias_records.chain(canonical_records))
    }
}

fn read_style(entry: impl Read) -> Result<VoiceStyle> {
    let mut raw = Vec::new();
    entry.take(MAX_NPY_ENTRY_BYTES + 1).read_to_end(&mut raw)?;
    if raw.len() as u64 > MAX_NPY_ENTRY_BYTES {
        bail!("entry exceeds maximum allowed size ({MAX_NPY_ENTRY_BYTES} bytes)");
    }
    let (rows, cols, data) = parse_npy_f32(&raw)?;
    Ok(VoiceStyle { rows, cols, data })
}

/// Config file names must be a single plain path component.
fn safe_file_name(value: &str) -> Result<&str> {
    let mut components = Path::new(value).components();
    let single = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    if !single || value.contains('\\') {
        bail!("unsafe file path in model config: '{value}'");
    }
    Ok(value)
}

fn cache_model_dir(cache_root: &Path, repo_id: &str) -> PathBuf {
    let digest = Sha256::digest(repo_id.as_bytes());
    let sanitized = repo_id.replace(
        |c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')),
        "_",
    );
    cache_root
        .join("models")
        .join(format!("{sanitized}_{}", hex::encode(&digest[..8])))
}

pub fn ensure_model_cached(client: &Client, cache_root: &Path, repo_id: &str) -> Result<ModelArtifacts> {
    let model_dir = cache_model_dir(cache_root, repo_id);
    fs::create_dir_all(&model_dir)
        .with_context(|| format!("failed creating cache dir {}", model_dir.display()))?;

    let mut downloaded = false;
    let mut fetch = |file_name: &str| -> Result<PathBuf> {
        let path = model_dir.join(file_name);
        if !path.exists() {
            tracing::info!(repo_id, file_name, "downloading model file");
            download_repo_file(client, repo_id, file_name, &path)
                .with_context(|| format!("failed downloading {file_name} for {repo_id}"))?;
            downloaded = true;
        }
        Ok(path)
    };
    let config = read_config(&fetch("config.json")?)?;
    let model_path = fetch(safe_file_name(&config.model_file)?)?;
    let voices_path = fetch(safe_file_name(&config.voices)?)?;

    let manifest_path = model_dir.join("manifest.json");
    if downloaded || !manifest_path.exists() {
        write_manifest(&manifest_path, repo_id, &config)?;
    }

    Ok(ModelArtifacts {
        repo_id: repo_id.to_string(),
        cache_dir: model_dir,
        model_path,
        voices_path,
        config,
    })
}

fn read_config(path: &Path) -> Result<ModelConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed reading config at {}", path.display()))?;
    let config: ModelConfig = serde_json::from_str(&raw)
        .with_context(|| format!("failed parsing config at {}", path.display()))?;
    if !matches!(config.model_type.as_str(), "ONNX1" | "ONNX2") {
        bail!(
            "unsupported model type '{}': expected ONNX1 or ONNX2",
            config.model_type
        );
    }
    Ok(config)
}

fn write_manifest(path: &Path, repo_id: &str, config: &ModelConfig) -> Result<()> {
    let fetched_at_unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();
    let manifest = CacheManifest {
        repo_id,
        fetched_at_unix,
        model_file: &config.model_file,
        voices_file: &config.voices,
    };
    fs::write(path, serde_json::to_vec_pretty(&manifest)?)
        .with_context(|| format!("failed writing manifest at {}", path.display()))
}

fn download_repo_file(client: &Client, repo_id: &str, file_name: &str, dest: &Path) -> Result<()> {
    let url = format!("https://huggingface.co/{repo_id}/resolve/main/{file_name}?download=true");
    let dir = dest
        .parent()
        .ok_or_else(|| anyhow!("download target {} has no parent directory", dest.display()))?;

    let mut response = client
        .get(&url)
        .send()
        .with_context(|| format!("http request failed for {url}"))?
        .error_for_status()
        .with_context(|| format!("download failed for {url}"))?;

    // Removed on drop unless persisted.
    let mut partial = tempfile::Builder::new()
        .prefix(file_name)
        .suffix(".part")
        .tempfile_in(dir)
        .with_context(|| format!("failed creating temp file in {}", dir.display()))?;
    let bytes = io::copy(&mut response, partial.as_file_mut())
        .with_context(|| format!("failed writing {file_name} to {}", partial.path().display()))?;
    partial.as_file_mut().flush()?;
    partial
        .persist(dest)
        .with_context(|| format!("failed moving download into {}", dest.display()))?;
    tracing::debug!(file_name, bytes, "download complete");
    Ok(())
}

pub fn build_http_client() -> Result<Client> {
    Client::builder()
        .user_agent(concat!("voice-console/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(120))
        .build()
        .context("failed building HTTP client")
}

#[derive(Debug, PartialEq, Eq)]
struct NpyHeader {
    descr: String,
    fortran_order: bool,
    shape: Vec<usize>,
}

impl NpyHeader {
    fn parse(dict: &str) -> Result<Self> {
        let descr = dict_value(dict, "descr")?
            .trim_matches(['\'', '"'])
            .to_string();
        let fortran_order = match dict_value(dict, "fortran_order")? {
            "False" => false,
            "True" => true,
            other => bail!("invalid fortran_order '{other}' in npy header"),
        };
        let tuple = dict_value(dict, "shape")?;
        let shape = tuple
            .strip_prefix('(')
            .and_then(|inner| inner.strip_suffix(')'))
            .ok_or_else(|| anyhow!("npy shape is not a tuple: {tuple}"))?
            .split(',')
            .map(str::trim)
            .filter(|dim| !dim.is_empty())
            .map(|dim| {
                dim.parse::<usize>()
                    .with_context(|| format!("invalid npy dimension '{dim}'"))
            })
            .collect::<Result<_>>()?;
        Ok(Self {
            descr,
            fortran_order,
            shape,
        })
    }
}

fn dict_value<'a>(dict: &'a str, key: &str) -> Result<&'a str> {
    let marker = format!("'{key}':");
    let start = dict
        .find(&marker)
        .ok_or_else(|| anyhow!("npy header missing '{key}' field"))?
        + marker.len();
    let rest = dict[start..].trim_start();
    let end = if rest.starts_with('(') {
        rest.find(')').map(|close| close + 1)
    } else {
        rest.find([',', '}'])
    };
    Ok(rest[..end.unwrap_or(rest.len())].trim())
}

fn parse_npy_f32(bytes: &[u8]) -> Result<(usize, usize, Vec<f32>)> {
    let Some(rest) = bytes.strip_prefix(b"\x93NUMPY") else {
        bail!("invalid npy magic header");
    };
    let (len_width, rest) = match rest {
        [] | [_] => bail!("npy payload too small"),
        [1, _, rest @ ..] => (2, rest),
        [2 | 3, _, rest @ ..] => (4, rest),
        [major, ..] => bail!("unsupported npy version {major}"),
    };
    if rest.len() < len_width {
        bail!("npy payload too small");
    }
    let (len_bytes, rest) = rest.split_at(len_width);
    let header_len = len_bytes
        .iter()
        .rev()
        .fold(0usize, |acc, byte| (acc << 8) | usize::from(*byte));
    if rest.len() < header_len {
        bail!("npy header length exceeds payload size");
    }
    let (dict, data_bytes) = rest.split_at(header_len);
    let header =
        NpyHeader::parse(std::str::from_utf8(dict).context("npy header is not valid utf-8")?)?;

    if header.descr != "<f4" {
        bail!("unsupported npy dtype '{}', expected '<f4'", header.descr);
    }
    if header.fortran_order {
        bail!("fortran-ordered npy arrays are not supported");
    }
    // Kokoro-style archives store (rows, 1, cols); the middle axis is squeezed.
    let (rows, cols) = match header.shape.as_slice() {
        [rows, cols] | [rows, 1, cols] => (*rows, *cols),
        shape => bail!("expected 2D style tensor shape, got {shape:?}"),
    };
    let expected = rows
        .checked_mul(cols)
        .and_then(|items| items.checked_mul(4))
        .ok_or_else(|| anyhow!("npy shape overflow for {rows}x{cols}"))?;
    if data_bytes.len() != expected {
        bail!(
            "npy data size mismatch: expected {expected} bytes, got {}",
            data_bytes.len()
        );
    }

    let data = data_bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    Ok((rows, cols, data))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn npy(header: &str, values: &[f32]) -> Vec<u8> {
        let mut bytes = b"\x93NUMPY\x01\x00".to_vec();
        bytes.extend_from_slice(&(header.len() as u16).to_le_bytes());
        bytes.extend_from_slice(header.as_bytes());
        for value in values {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes
    }

    fn selection() -> ModelSelection {
        ModelSelection {
            model: None,
            repo_id: None,
            cache_dir: None,
            ort_lib: None,
            cuda_lib_dir: None,
            cudnn_lib_dir: None,
        }
    }

    fn table(names: &[&str]) -> VoiceTable {
        VoiceTable {
            voices: names
                .iter()
                .map(|name| {
                    let style = VoiceStyle {
                        rows: 2,
                        cols: 2,
                        data: vec![0.0, 0.1, 1.0, 1.1],
                    };
                    (name.to_string(), style)
                })
                .collect(),
        }
    }

    #[test]
    fn model_selection_defaults_to_nano_fp32() {
        assert_eq!(selection().resolve_repo_id(), DEFAULT_REPO_ID);
    }

    #[test]
    fn repo_id_overrides_model_preset() {
        let selection = ModelSelection {
            model: Some(ModelPreset::Micro08),
            repo_id: Some("KittenML/custom".to_string()),
            ..selection()
        };
        assert_eq!(selection.resolve_repo_id(), "KittenML/custom");
    }

    #[test]
    fn cache_dir_is_stable_and_sanitized() {
        let root = Path::new("/tmp/voice-console");
        let a = cache_model_dir(root, "KittenML/kitten-tts-nano-0.8-int8");
        let b = cache_model_dir(root, "KittenML/kitten-tts-nano-0.8-int8");
        assert_eq!(a, b);
        let leaf = a.file_name().unwrap().to_string_lossy().into_owned();
        assert!(leaf.starts_with("KittenML_kitten-tts-nano-0.8-int8_"));
        assert_ne!(a, cache_model_dir(root, "KittenML/kitten-tts-mini-0.8"));
    }

    #[test]
    fn rejects_nested_model_paths() {
        assert!(safe_file_name("model.onnx").is_ok());
        assert!(safe_file_name("../model.onnx").is_err());
        assert!(safe_file_name("sub/model.onnx").is_err());
        assert!(safe_file_name("/etc/passwd").is_err());
    }

    #[test]
    fn parses_npy_with_squeezed_axis() {
        let header = "{'descr': '<f4', 'fortran_order': False, 'shape': (2, 1, 2), }";
        let (rows, cols, data) = parse_npy_f32(&npy(header, &[1.0, 2.0, 3.0, 4.0])).unwrap();
        assert_eq!((rows, cols), (2, 2));
        assert_eq!(data, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn rejects_npy_size_mismatch_and_dtype() {
        let header = "{'descr': '<f4', 'fortran_order': False, 'shape': (2, 2), }";
        assert!(parse_npy_f32(&npy(header, &[1.0])).is_err());
        let header = "{'descr': '<f8', 'fortran_order': False, 'shape': (1, 1), }";
        assert!(parse_npy_f32(&npy(header, &[1.0, 1.0])).is_err());
    }

    #[test]
    fn npy_header_dict_is_parsed() {
        let header = NpyHeader::parse("{'descr': '<f4', 'fortran_order': False, 'shape': (400, 256), }")
            .unwrap();
        assert_eq!(
            header,
            NpyHeader {
                descr: "<f4".to_string(),
                fortran_order: false,
                shape: vec![400, 256],
            }
        );
        assert!(NpyHeader::parse("{'descr': '<f4', 'shape': (1,), }").is_err());
        assert!(NpyHeader::parse("{'descr': '<f4', 'fortran_order': False, 'shape': (a, 2), }").is_err());
    }

    #[test]
    fn rejects_fortran_order_and_bad_magic() {
        let header = "{'descr': '<f4', 'fortran_order': True, 'shape': (1, 1), }";
        assert!(parse_npy_f32(&npy(header, &[1.0])).is_err());
        assert!(parse_npy_f32(b"NUMPY\x01\x00").is_err());
        assert!(parse_npy_f32(b"\x93NUMPY\x01").is_err());
    }

    #[test]
    fn style_rows_are_bounds_checked() {
        let table = table(&["expr-voice-2-f"]);
        assert_eq!(table.style_rows("expr-voice-2-f").unwrap(), 2);
        assert_eq!(table.style_row("expr-voice-2-f", 1).unwrap(), &[1.0, 1.1]);
        assert!(table.style_row("expr-voice-2-f", 2).is_err());
        assert!(table.style_row("missing", 0).is_err());
    }

    #[test]
    fn catalog_lists_aliases_then_canonical_voices() {
        let table = table(&["bm_lewis", "expr-voice-2-f"]);
        let aliases = HashMap::from([
            ("Lewis".to_string(), "bm_lewis".to_string()),
            ("Bella".to_string(), "expr-voice-2-f".to_string()),
            ("Ghost".to_string(), "expr-voice-9-m".to_string()),
        ]);
        let catalog = table.catalog(&aliases);
        let records: Vec<_> = catalog
            .records()
            .iter()
            .map(|v| (v.name.as_str(), v.language.as_str()))
            .collect();
        assert_eq!(
            records,
            vec![
                ("Bella", "en-us"),
                ("Lewis", "en-gb"),
                ("bm_lewis", "en-gb"),
                ("expr-voice-2-f", "en-us"),
            ]
        );
    }
}
