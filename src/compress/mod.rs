//! Heuristic GZIP compression for file payloads.
//!
//! Serial links are slow enough that shrinking text pays for itself, but
//! recompressing media only burns time. The filter decides per file from the
//! extension, a binary-content check, and a Shannon-entropy sample, falling
//! back to a trial compression of the first 4 KiB for unknown content.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::Result;

/// GZIP magic number, used to identify compressed payloads on receipt.
pub const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

const SAMPLE_SIZE: usize = 4096;
const ENTROPY_THRESHOLD: f64 = 7.5;
const BINARY_FRACTION: f64 = 0.10;
const TRIAL_RATIO: f64 = 0.85;

/// Formats that are already entropy-coded; recompressing them is wasted work.
fn is_compressed_extension(ext: &str) -> bool {
    matches!(
        ext,
        "zip" | "gz" | "xz" | "zst" | "7z" | "rar" | "bz2" | "lz4" | "tgz"
            | "jpg" | "jpeg" | "png" | "gif" | "webp" | "heic" | "avif"
            | "mp3" | "aac" | "m4a" | "ogg" | "opus" | "flac"
            | "mp4" | "mkv" | "avi" | "mov" | "webm"
            | "pdf" | "docx" | "xlsx" | "pptx" | "epub"
            | "apk" | "jar" | "dmg"
    )
}

/// Formats that are reliably text and compress well.
fn is_text_extension(ext: &str) -> bool {
    matches!(
        ext,
        "txt" | "java" | "xml" | "json" | "html" | "htm" | "css" | "js" | "ts"
            | "py" | "rb" | "php" | "c" | "cpp" | "h" | "hpp" | "cs" | "go" | "rs"
            | "md" | "yaml" | "yml" | "ini" | "cfg" | "conf" | "toml" | "properties"
            | "sql" | "sh" | "bat" | "ps1" | "log" | "csv" | "tsv"
    )
}

fn extension(name: &str) -> String {
    std::path::Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

/// Shannon entropy in bits per byte: 0 for constant data, 8 for uniform noise.
pub fn shannon_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut freq = [0u64; 256];
    for &b in data {
        freq[b as usize] += 1;
    }
    let len = data.len() as f64;
    let mut entropy = 0.0f64;
    for &count in &freq {
        if count > 0 {
            let p = count as f64 / len;
            entropy -= p * p.log2();
        }
    }
    entropy
}

/// A sample is binary-like when more than 10% of its bytes are NUL, DEL, or
/// C0 controls other than tab, newline, and carriage return.
fn is_binary_like(data: &[u8]) -> bool {
    let sample = &data[..data.len().min(SAMPLE_SIZE)];
    if sample.is_empty() {
        return false;
    }
    let suspicious = sample
        .iter()
        .filter(|&&b| b == 0x7F || (b < 0x20 && b != b'\t' && b != b'\n' && b != b'\r'))
        .count();
    suspicious as f64 / sample.len() as f64 > BINARY_FRACTION
}

pub fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

pub fn is_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == GZIP_MAGIC[0] && data[1] == GZIP_MAGIC[1]
}

/// Decide whether compressing `data` is worth it and do so if it is.
///
/// Returns the bytes to put on the wire and whether they are compressed.
/// Compression is only ever chosen when it strictly shrinks the payload.
pub fn compress_if_beneficial(name: &str, data: &[u8]) -> (Vec<u8>, bool) {
    if data.is_empty() {
        return (data.to_vec(), false);
    }

    let ext = extension(name);
    if is_compressed_extension(&ext) {
        return (data.to_vec(), false);
    }

    if is_text_extension(&ext) && !is_binary_like(data) {
        return gzip_if_smaller(data);
    }

    let sample = &data[..data.len().min(SAMPLE_SIZE)];
    if is_binary_like(data) && shannon_entropy(sample) > ENTROPY_THRESHOLD {
        return (data.to_vec(), false);
    }

    match gzip(sample) {
        Ok(trial) if (trial.len() as f64) < (sample.len() as f64) * TRIAL_RATIO => {
            gzip_if_smaller(data)
        }
        _ => (data.to_vec(), false),
    }
}

fn gzip_if_smaller(data: &[u8]) -> (Vec<u8>, bool) {
    match gzip(data) {
        Ok(compressed) if compressed.len() < data.len() => (compressed, true),
        _ => (data.to_vec(), false),
    }
}
