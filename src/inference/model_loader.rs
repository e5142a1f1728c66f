//! GGUF model header inspection.
//!
//! Reads the fixed header and the scalar metadata entries of a GGUF file to
//! learn the architecture parameters (layers, heads, dimensions, vocabulary)
//! needed to size the execution context and report its memory footprint.
//! Tensor data is never touched here.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// "GGUF" read as a little-endian u32.
const GGUF_MAGIC: u32 = 0x4655_4747;

const GGUF_MIN_VERSION: u32 = 2;
const GGUF_MAX_VERSION: u32 = 3;

/// Upper bound on metadata entries; anything larger is a corrupt header.
const MAX_KV: u64 = 1_000_000;

/// Upper bound on a single metadata string.
const MAX_STRING_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ModelLoaderError {
    #[error("Model file not found: {0}")]
    FileNotFound(String),

    #[error("Invalid GGUF format: {0}")]
    InvalidFormat(String),

    #[error("Unsupported GGUF version {0}")]
    UnsupportedVersion(u32),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Metadata extracted from a GGUF model file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// Model architecture name (e.g., "llama", "qwen2").
    pub architecture: String,

    /// GGUF container version.
    pub version: u32,

    /// Number of tensors declared in the header.
    pub n_tensors: u64,

    /// Number of transformer layers.
    pub n_layers: usize,

    /// Number of attention heads.
    pub n_heads: usize,

    /// Number of KV heads (for GQA/MQA, may differ from n_heads).
    pub n_kv_heads: usize,

    /// Dimension per attention head.
    pub head_dim: usize,

    /// Vocabulary size.
    pub n_vocab: usize,

    /// Context length the model was trained with.
    pub context_length: usize,

    /// File size in bytes.
    pub file_size: u64,
}

impl ModelMetadata {
    /// KV cache size per token in bytes (FP16, K+V).
    pub fn kv_bytes_per_token(&self) -> usize {
        let per_layer = 2 * self.n_kv_heads * self.head_dim * 2;
        per_layer * self.n_layers
    }

    /// Total KV cache size for a given context length.
    pub fn kv_cache_size(&self, context_length: usize) -> usize {
        self.kv_bytes_per_token() * context_length
    }
}

/// Scalar metadata values we care about. Arrays are reduced to their length.
#[derive(Debug, Clone)]
enum MetaValue {
    Int(u64),
    Str(String),
    ArrayLen(u64),
    Other,
}

/// Load model metadata from a GGUF file.
///
/// Missing architecture keys fall back to a small llama-style layout so
/// that hand-built or truncated test files still load.
pub fn load_metadata(path: &Path) -> Result<ModelMetadata, ModelLoaderError> {
    if !path.exists() {
        return Err(ModelLoaderError::FileNotFound(path.display().to_string()));
    }

    let file_size = std::fs::metadata(path)?.len();
    let mut reader = BufReader::new(File::open(path)?);

    let magic = read_u32(&mut reader)?;
    if magic != GGUF_MAGIC {
        return Err(ModelLoaderError::InvalidFormat(format!(
            "bad magic 0x{magic:08x}"
        )));
    }

    let version = read_u32(&mut reader)?;
    if !(GGUF_MIN_VERSION..=GGUF_MAX_VERSION).contains(&version) {
        return Err(ModelLoaderError::UnsupportedVersion(version));
    }

    let n_tensors = read_u64(&mut reader)?;
    let n_kv = read_u64(&mut reader)?;
    if n_kv > MAX_KV {
        return Err(ModelLoaderError::InvalidFormat(format!(
            "metadata count {n_kv} exceeds {MAX_KV}"
        )));
    }

    let mut kv = HashMap::new();
    for _ in 0..n_kv {
        let key = read_string(&mut reader)?;
        let value_type = read_u32(&mut reader)?;
        let value = read_value(&mut reader, value_type)?;
        debug!(key = %key, ?value, "GGUF metadata");
        kv.insert(key, value);
    }

    let metadata = build_metadata(&kv, version, n_tensors, file_size);

    info!(
        arch = %metadata.architecture,
        version,
        layers = metadata.n_layers,
        heads = metadata.n_heads,
        kv_heads = metadata.n_kv_heads,
        head_dim = metadata.head_dim,
        vocab = metadata.n_vocab,
        file_size,
        "Loaded model metadata"
    );

    Ok(metadata)
}

fn build_metadata(
    kv: &HashMap<String, MetaValue>,
    version: u32,
    n_tensors: u64,
    file_size: u64,
) -> ModelMetadata {
    let architecture = match kv.get("general.architecture") {
        Some(MetaValue::Str(s)) => s.clone(),
        _ => "llama".to_string(),
    };

    let int = |suffix: &str, default: usize| -> usize {
        match kv.get(&format!("{architecture}.{suffix}")) {
            Some(MetaValue::Int(v)) if *v > 0 => *v as usize,
            _ => default,
        }
    };

    let n_layers = int("block_count", 22);
    let n_heads = int("attention.head_count", 32);
    let n_kv_heads = int("attention.head_count_kv", n_heads);
    let n_embd = int("embedding_length", 2048);
    let context_length = int("context_length", 2048);
    let n_vocab = match kv.get("tokenizer.ggml.tokens") {
        Some(MetaValue::ArrayLen(n)) if *n > 0 => *n as usize,
        _ => 32000,
    };

    ModelMetadata {
        architecture,
        version,
        n_tensors,
        n_layers,
        n_heads,
        n_kv_heads,
        head_dim: n_embd / n_heads.max(1),
        n_vocab,
        context_length,
        file_size,
    }
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32, ModelLoaderError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64, ModelLoaderError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_string<R: Read>(r: &mut R) -> Result<String, ModelLoaderError> {
    let len = read_u64(r)?;
    if len > MAX_STRING_BYTES {
        return Err(ModelLoaderError::InvalidFormat(format!(
            "string length {len} exceeds {MAX_STRING_BYTES}"
        )));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf)
        .map_err(|_| ModelLoaderError::InvalidFormat("metadata string is not UTF-8".into()))
}

fn skip<R: Read>(r: &mut R, n: u64) -> Result<(), ModelLoaderError> {
    let copied = io::copy(&mut r.by_ref().take(n), &mut io::sink())?;
    if copied != n {
        return Err(ModelLoaderError::InvalidFormat("truncated metadata".into()));
    }
    Ok(())
}

/// Byte width of a fixed-size GGUF value type, `None` for string/array.
fn scalar_width(value_type: u32) -> Result<Option<u64>, ModelLoaderError> {
    match value_type {
        0 | 1 | 7 => Ok(Some(1)),
        2 | 3 => Ok(Some(2)),
        4 | 5 | 6 => Ok(Some(4)),
        10 | 11 | 12 => Ok(Some(8)),
        8 | 9 => Ok(None),
        other => Err(ModelLoaderError::InvalidFormat(format!(
            "unknown value type {other}"
        ))),
    }
}

fn read_value<R: Read>(r: &mut R, value_type: u32) -> Result<MetaValue, ModelLoaderError> {
    match value_type {
        // u32 / i32
        4 | 5 => Ok(MetaValue::Int(read_u32(r)? as u64)),
        // u64 / i64
        10 | 11 => Ok(MetaValue::Int(read_u64(r)?)),
        8 => Ok(MetaValue::Str(read_string(r)?)),
        9 => {
            let elem_type = read_u32(r)?;
            let len = read_u64(r)?;
            match scalar_width(elem_type)? {
                Some(width) => skip(r, width.saturating_mul(len))?,
                None if elem_type == 8 => {
                    for _ in 0..len {
                        let n = read_u64(r)?;
                        skip(r, n)?;
                    }
                }
                None => {
                    return Err(ModelLoaderError::InvalidFormat(
                        "nested metadata arrays are not supported".into(),
                    ))
                }
            }
            Ok(MetaValue::ArrayLen(len))
        }
        other => {
            let width = scalar_width(other)?.unwrap_or(0);
            skip(r, width)?;
            Ok(MetaValue::Other)
        }
    }
}

/// Serialise a minimal GGUF header. Used by tests and the benches to build
/// throw-away model files.
pub fn write_test_header<W: io::Write>(
    w: &mut W,
    architecture: &str,
    ints: &[(&str, u32)],
    n_vocab: u64,
) -> io::Result<()> {
    let put_str = |w: &mut W, s: &str| -> io::Result<()> {
        w.write_all(&(s.len() as u64).to_le_bytes())?;
        w.write_all(s.as_bytes())
    };

    w.write_all(&GGUF_MAGIC.to_le_bytes())?;
    w.write_all(&GGUF_MAX_VERSION.to_le_bytes())?;
    w.write_all(&0u64.to_le_bytes())?;
    w.write_all(&(ints.len() as u64 + 2).to_le_bytes())?;

    put_str(w, "general.architecture")?;
    w.write_all(&8u32.to_le_bytes())?;
    put_str(w, architecture)?;

    for (key, value) in ints {
        put_str(w, &format!("{architecture}.{key}"))?;
        w.write_all(&4u32.to_le_bytes())?;
        w.write_all(&value.to_le_bytes())?;
    }

    // Token list: only the length matters to the reader.
    put_str(w, "tokenizer.ggml.tokens")?;
    w.write_all(&9u32.to_le_bytes())?;
    w.write_all(&8u32.to_le_bytes())?;
    w.write_all(&n_vocab.to_le_bytes())?;
    for _ in 0..n_vocab {
        put_str(w, "t")?;
    }
    Ok(())
}
