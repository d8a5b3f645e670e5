//! Value compression with automatic codec selection.
//!
//! Every value is first serialized to JSON. The manager then tries each
//! codec and keeps the smallest output, tagging it so decompression can
//! dispatch without guessing:
//!
//! - `Deflate`: zlib stream (flate2), the fast general-purpose choice.
//! - `Zstd`: zstandard at a higher effort, for large text payloads.
//! - `Pattern`: a compact descriptor for repeated text or arithmetic number
//!   sequences, itself deflated.
//!
//! When even the best candidate is not smaller than `min_compression_ratio`
//! of the serialized size, the serialized bytes are kept as-is (`Codec::None`).

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use gridcalc_primitives::Value;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::StorageConfig;
use crate::error::{Result, StorageError};

/// Serialized payloads below this size are never worth a codec pass.
const MIN_COMPRESSIBLE_BYTES: usize = 64;
/// Minimum text length considered for the repeated-pattern encoding.
const MIN_PATTERN_TEXT_LEN: usize = 6;
/// Minimum array length considered for the arithmetic-sequence encoding.
const MIN_SEQUENCE_LEN: usize = 3;

/// Codec tag stored alongside compressed bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Codec {
    None,
    Deflate,
    Zstd,
    Pattern,
}

impl Codec {
    fn label(self) -> &'static str {
        match self {
            Codec::None => "raw",
            Codec::Deflate => "deflate",
            Codec::Zstd => "zstd",
            Codec::Pattern => "pattern",
        }
    }
}

/// Compressed representation of one serialized value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedBlob {
    codec: Codec,
    original_size: usize,
    data: Vec<u8>,
}

impl CompressedBlob {
    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Size of the JSON serialization this blob was produced from.
    pub fn original_size(&self) -> usize {
        self.original_size
    }

    pub fn compressed_size(&self) -> usize {
        self.data.len()
    }

    /// compressed / original; below 1.0 means the codec saved space.
    pub fn ratio(&self) -> f64 {
        self.data.len() as f64 / self.original_size.max(1) as f64
    }

    pub fn space_saved(&self) -> usize {
        self.original_size.saturating_sub(self.data.len())
    }
}

/// Descriptor used by the pattern codec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum PatternCode {
    Repeat {
        pattern: String,
        count: usize,
        remainder: String,
    },
    Sequence {
        start: f64,
        step: f64,
        count: usize,
    },
}

impl PatternCode {
    fn detect(value: &Value) -> Option<Self> {
        let code = match value {
            Value::Text(text) => Self::detect_repeat(text)?,
            Value::Array(items) => Self::detect_sequence(items)?,
            _ => return None,
        };
        // Only lossless encodings are usable.
        (code.expand() == *value).then_some(code)
    }

    fn detect_repeat(text: &str) -> Option<Self> {
        let bytes = text.as_bytes();
        let len = bytes.len();
        if len < MIN_PATTERN_TEXT_LEN {
            return None;
        }
        let period = periods(bytes)
            .take_while(|p| *p <= len / 2)
            .find(|p| text.is_char_boundary(*p))?;
        let count = len / period;
        Some(PatternCode::Repeat {
            pattern: text[..period].to_string(),
            count,
            remainder: text[count * period..].to_string(),
        })
    }

    fn detect_sequence(items: &[Value]) -> Option<Self> {
        if items.len() < MIN_SEQUENCE_LEN {
            return None;
        }
        let numbers: Vec<f64> = items
            .iter()
            .map(|v| match v {
                Value::Number(n) => Some(*n),
                _ => None,
            })
            .collect::<Option<_>>()?;
        let step = numbers[1] - numbers[0];
        numbers
            .windows(2)
            .all(|w| w[1] - w[0] == step)
            .then_some(PatternCode::Sequence {
                start: numbers[0],
                step,
                count: numbers.len(),
            })
    }

    fn expand(&self) -> Value {
        match self {
            PatternCode::Repeat {
                pattern,
                count,
                remainder,
            } => {
                let mut text = pattern.repeat(*count);
                text.push_str(remainder);
                Value::Text(text)
            }
            PatternCode::Sequence { start, step, count } => Value::Array(
                (0..*count)
                    .map(|i| Value::Number(start + step * i as f64))
                    .collect(),
            ),
        }
    }
}

/// Per-codec counts of stored blobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CodecUsage {
    pub none: u64,
    pub deflate: u64,
    pub zstd: u64,
    pub pattern: u64,
}

impl CodecUsage {
    fn record(&mut self, codec: Codec) {
        match codec {
            Codec::None => self.none += 1,
            Codec::Deflate => self.deflate += 1,
            Codec::Zstd => self.zstd += 1,
            Codec::Pattern => self.pattern += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CompressionStats {
    pub compressions: u64,
    pub decompressions: u64,
    pub total_original_bytes: u64,
    pub total_compressed_bytes: u64,
    pub usage: CodecUsage,
}

impl CompressionStats {
    /// Overall compressed / original ratio, 1.0 when nothing was stored.
    pub fn overall_ratio(&self) -> f64 {
        if self.total_original_bytes == 0 {
            1.0
        } else {
            self.total_compressed_bytes as f64 / self.total_original_bytes as f64
        }
    }

    pub fn bytes_saved(&self) -> u64 {
        self.total_original_bytes
            .saturating_sub(self.total_compressed_bytes)
    }
}

/// Chooses and applies the best codec per value.
#[derive(Debug)]
pub struct CompressionManager {
    enabled: bool,
    level: u32,
    min_ratio: f64,
    stats: Mutex<CompressionStats>,
}

impl Default for CompressionManager {
    fn default() -> Self {
        Self::from_config(&StorageConfig::default())
    }
}

impl CompressionManager {
    pub fn new(level: u32, min_ratio: f64) -> Self {
        Self {
            enabled: true,
            level: level.min(9),
            min_ratio,
            stats: Mutex::new(CompressionStats::default()),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            enabled: config.compression_enabled,
            ..Self::new(config.compression_level, config.min_compression_ratio)
        }
    }

    /// Serialize and compress a value with the smallest beneficial codec.
    pub fn compress(&self, value: &Value) -> Result<CompressedBlob> {
        let raw = serde_json::to_vec(value)?;
        let original_size = raw.len();

        let best = if self.enabled && original_size >= MIN_COMPRESSIBLE_BYTES {
            self.candidates(value, &raw)?
                .into_iter()
                .min_by_key(CompressedBlob::compressed_size)
        } else {
            None
        };

        let blob = match best {
            Some(blob) if blob.ratio() < self.min_ratio => blob,
            _ => CompressedBlob {
                codec: Codec::None,
                original_size,
                data: raw,
            },
        };

        let mut stats = self.stats.lock();
        stats.compressions += 1;
        stats.total_original_bytes += original_size as u64;
        stats.total_compressed_bytes += blob.data.len() as u64;
        stats.usage.record(blob.codec);
        drop(stats);

        tracing::trace!(
            codec = blob.codec.label(),
            original = original_size,
            compressed = blob.data.len(),
            "compressed value"
        );
        Ok(blob)
    }

    /// Restore the value a blob was produced from.
    pub fn decompress(&self, blob: &CompressedBlob) -> Result<Value> {
        let value = match blob.codec {
            Codec::None => serde_json::from_slice(&blob.data)?,
            Codec::Deflate => serde_json::from_slice(&inflate(&blob.data)?)?,
            Codec::Zstd => serde_json::from_slice(&unzstd(&blob.data)?)?,
            Codec::Pattern => {
                let code: PatternCode = serde_json::from_slice(&inflate(&blob.data)?)?;
                code.expand()
            }
        };
        self.stats.lock().decompressions += 1;
        Ok(value)
    }

    /// Every applicable codec's output for `value`, ignoring the ratio margin.
    pub fn benchmark(&self, value: &Value) -> Result<Vec<CompressedBlob>> {
        let raw = serde_json::to_vec(value)?;
        self.candidates(value, &raw)
    }

    pub fn statistics(&self) -> CompressionStats {
        *self.stats.lock()
    }

    pub fn reset_statistics(&self) {
        *self.stats.lock() = CompressionStats::default();
    }

    fn candidates(&self, value: &Value, raw: &[u8]) -> Result<Vec<CompressedBlob>> {
        let original_size = raw.len();
        let mut out = vec![
            CompressedBlob {
                codec: Codec::Deflate,
                original_size,
                data: deflate(raw, self.level)?,
            },
            CompressedBlob {
                codec: Codec::Zstd,
                original_size,
                data: zstd::stream::encode_all(raw, self.zstd_level())?,
            },
        ];
        if let Some(code) = PatternCode::detect(value) {
            out.push(CompressedBlob {
                codec: Codec::Pattern,
                original_size,
                data: deflate(&serde_json::to_vec(&code)?, self.level)?,
            });
        }
        Ok(out)
    }

    fn zstd_level(&self) -> i32 {
        (self.level as i32 * 2 + 1).clamp(1, 19)
    }
}

/// Every period of `bytes` in increasing order, walking the border chain
/// of the KMP prefix function. Linear in the input length.
fn periods(bytes: &[u8]) -> impl Iterator<Item = usize> + '_ {
    let len = bytes.len();
    let mut prefix = vec![0_usize; len];
    for i in 1..len {
        let mut k = prefix[i - 1];
        while k > 0 && bytes[i] != bytes[k] {
            k = prefix[k - 1];
        }
        if bytes[i] == bytes[k] {
            k += 1;
        }
        prefix[i] = k;
    }
    let mut border = prefix.last().copied().unwrap_or(0);
    std::iter::from_fn(move || {
        if border == 0 {
            return None;
        }
        let period = len - border;
        border = prefix[border - 1];
        Some(period)
    })
}

fn deflate(bytes: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level));
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| StorageError::Corrupt {
            codec: Codec::Deflate.label(),
            reason: e.to_string(),
        })?;
    Ok(out)
}

fn unzstd(data: &[u8]) -> Result<Vec<u8>> {
    zstd::stream::decode_all(data).map_err(|e| StorageError::Corrupt {
        codec: Codec::Zstd.label(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_values_stay_raw() {
        let manager = CompressionManager::default();
        let blob = manager.compress(&Value::Number(1.0)).unwrap();
        assert_eq!(blob.codec(), Codec::None);
        assert_eq!(manager.decompress(&blob).unwrap(), Value::Number(1.0));
    }

    #[test]
    fn test_repeated_text_compresses_losslessly() {
        let manager = CompressionManager::default();
        let text = Value::text("abc".repeat(400) + "ab");
        let blob = manager.compress(&text).unwrap();
        assert_ne!(blob.codec(), Codec::None);
        assert!(blob.ratio() < 0.9);
        assert_eq!(manager.decompress(&blob).unwrap(), text);
    }

    #[test]
    fn test_pattern_detection() {
        let code = PatternCode::detect(&Value::text("xyxyxyx")).unwrap();
        assert_eq!(
            code,
            PatternCode::Repeat {
                pattern: "xy".into(),
                count: 3,
                remainder: "x".into()
            }
        );

        let seq = Value::Array((0..50).map(|i| Value::Number(f64::from(i) * 2.0)).collect());
        assert_eq!(
            PatternCode::detect(&seq),
            Some(PatternCode::Sequence {
                start: 0.0,
                step: 2.0,
                count: 50
            })
        );
        assert_eq!(PatternCode::detect(&Value::text("abcdefg")), None);
    }

    #[test]
    fn test_periods_in_increasing_order() {
        assert_eq!(periods(b"abaabaab").collect::<Vec<_>>(), vec![3, 6]);
        assert_eq!(periods(b"aaaa").collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(periods(b"abcd").count(), 0);
        assert_eq!(periods(b"").count(), 0);
    }

    #[test]
    fn test_repeat_detection_respects_char_boundaries() {
        // "é" is two bytes, so a one-byte period is not usable.
        let code = PatternCode::detect(&Value::text("éééé")).unwrap();
        assert_eq!(
            code,
            PatternCode::Repeat {
                pattern: "é".into(),
                count: 4,
                remainder: String::new()
            }
        );
    }

    #[test]
    fn test_long_aperiodic_tail_is_fast() {
        let manager = CompressionManager::default();
        let text = Value::text("a".repeat(200_000) + "b");
        let started = std::time::Instant::now();
        let blob = manager.compress(&text).unwrap();
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert_eq!(manager.decompress(&blob).unwrap(), text);
    }

    #[test]
    fn test_non_finite_numbers_roundtrip() {
        let manager = CompressionManager::default();
        for value in [
            Value::Number(f64::INFINITY),
            Value::Array(vec![Value::Number(f64::NEG_INFINITY); 30]),
        ] {
            let blob = manager.compress(&value).unwrap();
            assert_eq!(manager.decompress(&blob).unwrap(), value);
        }
    }

    #[test]
    fn test_arithmetic_sequence_roundtrip() {
        let manager = CompressionManager::default();
        let seq = Value::Array((1..=500).map(|i| Value::Number(f64::from(i))).collect());
        let blob = manager.compress(&seq).unwrap();
        assert!(blob.compressed_size() < blob.original_size());
        assert_eq!(manager.decompress(&blob).unwrap(), seq);
    }

    #[test]
    fn test_benchmark_reports_every_codec() {
        let manager = CompressionManager::default();
        let blobs = manager.benchmark(&Value::text("ab".repeat(100))).unwrap();
        let codecs: Vec<Codec> = blobs.iter().map(CompressedBlob::codec).collect();
        assert_eq!(codecs, vec![Codec::Deflate, Codec::Zstd, Codec::Pattern]);
        assert_eq!(manager.statistics().compressions, 0);
    }

    #[test]
    fn test_disabled_manager_stores_raw() {
        let config = StorageConfig {
            compression_enabled: false,
            ..StorageConfig::default()
        };
        let manager = CompressionManager::from_config(&config);
        let blob = manager.compress(&Value::text("z".repeat(1000))).unwrap();
        assert_eq!(blob.codec(), Codec::None);
    }

    #[test]
    fn test_corrupt_data_is_an_error() {
        let manager = CompressionManager::default();
        let blob = CompressedBlob {
            codec: Codec::Deflate,
            original_size: 10,
            data: vec![1, 2, 3],
        };
        assert!(manager.decompress(&blob).is_err());
    }

    #[test]
    fn test_statistics_track_usage() {
        let manager = CompressionManager::default();
        manager.compress(&Value::Boolean(true)).unwrap();
        manager.compress(&Value::text("q".repeat(2000))).unwrap();
        let stats = manager.statistics();
        assert_eq!(stats.compressions, 2);
        assert_eq!(stats.usage.none, 1);
        assert!(stats.bytes_saved() > 1000);

        manager.reset_statistics();
        assert_eq!(manager.statistics(), CompressionStats::default());
    }
}
