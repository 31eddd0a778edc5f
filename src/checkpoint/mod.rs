//! LLaMA2 float32 checkpoint loader
//!
//! A checkpoint is a 28-byte header of seven little-endian `i32`
//! (`dim, hidden_dim, n_layers, n_heads, n_kv_heads, vocab_size, seq_len`)
//! followed by the weights as one flat run of little-endian `f32`, grouped
//! in the order listed by [`WeightGroup::LAYOUT`].
//!
//! The sign of the header's `vocab_size` encodes whether the classifier is
//! shared with the embedding table: positive means shared, negative means a
//! separate classifier follows the legacy rotary tables.
//!
//! [`Checkpoint::open`] memory-maps the file and, on little-endian hosts,
//! reinterprets the float section in place so every weight tensor is a
//! zero-copy view into the mapping.

use std::{fs::File, path::Path};

use memmap2::Mmap;
use tracing::{debug, info};

use crate::{
    config::Config,
    error::{InferError, Result},
    tensor::Tensor,
};

mod test_factory;
pub use test_factory::CheckpointBuilder;

/// Header size in bytes: seven `i32`
pub const HEADER_LEN: usize = 7 * std::mem::size_of::<i32>();

/// One contiguous group of floats in the checkpoint weight section
///
/// Per-layer groups store all layers back to back (`n_layers` tensors of
/// [`WeightGroup::shape`] each).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WeightGroup {
    /// Token embedding table
    Embedding,
    /// Attention RMS norm gains
    RmsAtt,
    /// Query projections
    Query,
    /// Key projections
    Key,
    /// Value projections
    Value,
    /// Attention output projections
    WeightO,
    /// Feed-forward RMS norm gains
    RmsFfn,
    /// FFN gate projections
    Weight1,
    /// FFN down projections
    Weight2,
    /// FFN up projections
    Weight3,
    /// Final RMS norm gain
    RmsFinal,
    /// Unused legacy rotary table (real part)
    FreqCisReal,
    /// Unused legacy rotary table (imaginary part)
    FreqCisImag,
    /// Output projection; absent when shared with the embedding table
    Classifier,
}

impl WeightGroup {
    /// All groups in file order
    pub const LAYOUT: [WeightGroup; 14] = [
        Self::Embedding,
        Self::RmsAtt,
        Self::Query,
        Self::Key,
        Self::Value,
        Self::WeightO,
        Self::RmsFfn,
        Self::Weight1,
        Self::Weight2,
        Self::Weight3,
        Self::RmsFinal,
        Self::FreqCisReal,
        Self::FreqCisImag,
        Self::Classifier,
    ];

    /// True for groups stored once per layer
    #[must_use]
    pub fn is_per_layer(self) -> bool {
        matches!(
            self,
            Self::RmsAtt
                | Self::Query
                | Self::Key
                | Self::Value
                | Self::WeightO
                | Self::RmsFfn
                | Self::Weight1
                | Self::Weight2
                | Self::Weight3
        )
    }

    /// Shape of one tensor of this group, `(out_features, in_features)`
    #[must_use]
    pub fn shape(self, config: &Config) -> (usize, usize) {
        let dim = config.dim;
        let q_dim = config.n_heads * config.head_size();
        match self {
            Self::Embedding | Self::Classifier => (config.vocab_size, dim),
            Self::RmsAtt | Self::RmsFfn | Self::RmsFinal => (1, dim),
            Self::Query => (q_dim, dim),
            Self::Key | Self::Value => (config.kv_dim(), dim),
            Self::WeightO => (dim, q_dim),
            Self::Weight1 | Self::Weight3 => (config.hidden_dim, dim),
            Self::Weight2 => (dim, config.hidden_dim),
            Self::FreqCisReal | Self::FreqCisImag => (config.seq_len, config.head_size() / 2),
        }
    }

    /// Number of floats the group occupies in a checkpoint
    ///
    /// # Errors
    ///
    /// Returns `FormatError` if the count does not fit in `usize`
    pub fn float_count(self, config: &Config, shared_weights: bool) -> Result<usize> {
        if self == Self::Classifier && shared_weights {
            return Ok(0);
        }
        let (rows, cols) = self.shape(config);
        let copies = if self.is_per_layer() { config.n_layers } else { 1 };
        rows.checked_mul(cols)
            .and_then(|n| n.checked_mul(copies))
            .ok_or_else(|| InferError::FormatError {
                reason: format!(
                    "{self:?} of {copies} x {rows}x{cols} floats overflows the address space"
                ),
            })
    }
}

/// Total floats a checkpoint for `config` must contain
///
/// # Errors
///
/// Returns `FormatError` if the total does not fit in `usize`
pub fn expected_weight_count(config: &Config, shared_weights: bool) -> Result<usize> {
    WeightGroup::LAYOUT.iter().try_fold(0usize, |total, group| {
        let count = group.float_count(config, shared_weights)?;
        total.checked_add(count).ok_or_else(|| InferError::FormatError {
            reason: "Checkpoint layout size overflows the address space".to_string(),
        })
    })
}

/// Parse the seven-integer header
///
/// Returns the validated config and the shared-classifier flag.
///
/// # Errors
///
/// Returns `FormatError` if `bytes` is shorter than [`HEADER_LEN`] and
/// `InvalidConfiguration` for negative sizes or a config that fails
/// [`Config::validate`].
pub fn parse_header(bytes: &[u8]) -> Result<(Config, bool)> {
    if bytes.len() < HEADER_LEN {
        return Err(InferError::FormatError {
            reason: format!(
                "Checkpoint too small: {} bytes (need at least {HEADER_LEN})",
                bytes.len()
            ),
        });
    }

    let mut fields = [0i32; 7];
    for (field, chunk) in fields.iter_mut().zip(bytes[..HEADER_LEN].chunks_exact(4)) {
        *field = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    let [dim, hidden_dim, n_layers, n_heads, n_kv_heads, vocab_size, seq_len] = fields;

    let positive = |name: &str, value: i32| {
        usize::try_from(value).map_err(|_| {
            InferError::InvalidConfiguration(format!("{name} must be positive, got {value}"))
        })
    };

    let shared_weights = vocab_size > 0;
    let config = Config {
        dim: positive("dim", dim)?,
        hidden_dim: positive("hidden_dim", hidden_dim)?,
        n_layers: positive("n_layers", n_layers)?,
        n_heads: positive("n_heads", n_heads)?,
        n_kv_heads: positive("n_kv_heads", n_kv_heads)?,
        vocab_size: vocab_size.unsigned_abs() as usize,
        seq_len: positive("seq_len", seq_len)?,
    };
    config.validate()?;

    debug!(?config, shared_weights, "Parsed checkpoint header");
    Ok((config, shared_weights))
}

enum WeightBuffer {
    /// Float section read in place from the mapping
    Mapped { mmap: Mmap, floats: usize },
    /// Decoded copy (big-endian hosts, in-memory bytes)
    Heap(Vec<f32>),
}

/// Loaded checkpoint: header plus the weight buffer every view borrows
pub struct Checkpoint {
    config: Config,
    shared_weights: bool,
    buffer: WeightBuffer,
}

impl std::fmt::Debug for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkpoint")
            .field("config", &self.config)
            .field("shared_weights", &self.shared_weights)
            .field("mapped", &self.is_mapped())
            .field("weights", &self.weights().len())
            .finish()
    }
}

impl Checkpoint {
    /// Memory-map a checkpoint file
    ///
    /// # Errors
    ///
    /// Returns `IoError` if the file cannot be opened or mapped,
    /// `FormatError` for a short header or truncated weights, and
    /// `InvalidConfiguration` for a bad header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| InferError::IoError {
            message: format!("Failed to open {}: {e}", path.display()),
        })?;

        let file_len = file
            .metadata()
            .map_err(|e| InferError::IoError {
                message: format!("Failed to stat {}: {e}", path.display()),
            })?
            .len();
        if file_len < HEADER_LEN as u64 {
            return Err(InferError::FormatError {
                reason: format!(
                    "{}: {file_len} bytes is too small for a checkpoint header",
                    path.display()
                ),
            });
        }

        // SAFETY: Memory mapping is safe as long as the file isn't modified
        // while mapped. We only read from the mapping, never write.
        let mmap = unsafe {
            Mmap::map(&file).map_err(|e| InferError::IoError {
                message: format!("Failed to mmap {}: {e}", path.display()),
            })?
        };

        let (config, shared_weights) = parse_header(&mmap)?;
        let floats = (mmap.len() - HEADER_LEN) / 4;
        check_weight_count(&config, shared_weights, floats)?;

        let buffer = if cfg!(target_endian = "little") {
            // The mapping is page aligned and HEADER_LEN is a multiple of 4
            bytemuck::try_cast_slice::<u8, f32>(&mmap[HEADER_LEN..HEADER_LEN + floats * 4])
                .map_err(|e| InferError::FormatError {
                    reason: format!("Weight section is not f32 aligned: {e:?}"),
                })?;
            WeightBuffer::Mapped { mmap, floats }
        } else {
            WeightBuffer::Heap(decode_floats(&mmap[HEADER_LEN..]))
        };

        let checkpoint = Self {
            config,
            shared_weights,
            buffer,
        };
        info!(
            path = %path.display(),
            dim = config.dim,
            n_layers = config.n_layers,
            vocab_size = config.vocab_size,
            seq_len = config.seq_len,
            mapped = checkpoint.is_mapped(),
            "Loaded checkpoint"
        );
        Ok(checkpoint)
    }

    /// Decode a checkpoint held in memory
    ///
    /// The floats are copied into a heap buffer, so `bytes` need not be
    /// aligned.
    ///
    /// # Errors
    ///
    /// Same as [`Checkpoint::open`], minus I/O errors.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (config, shared_weights) = parse_header(bytes)?;
        let weights = decode_floats(&bytes[HEADER_LEN..]);
        check_weight_count(&config, shared_weights, weights.len())?;

        Ok(Self {
            config,
            shared_weights,
            buffer: WeightBuffer::Heap(weights),
        })
    }

    /// Hyperparameters from the header
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// True if the classifier is the embedding table
    #[must_use]
    pub fn shared_weights(&self) -> bool {
        self.shared_weights
    }

    /// True if the weights are read in place from a memory mapping
    #[must_use]
    pub fn is_mapped(&self) -> bool {
        matches!(self.buffer, WeightBuffer::Mapped { .. })
    }

    /// The whole float section
    #[must_use]
    pub fn weights(&self) -> &[f32] {
        match &self.buffer {
            // `open` only builds `Mapped` after this exact cast succeeded, and
            // the mapping never moves, so the fallback is unreachable
            WeightBuffer::Mapped { mmap, floats } => {
                bytemuck::try_cast_slice(&mmap[HEADER_LEN..HEADER_LEN + floats * 4])
                    .unwrap_or(&[])
            },
            WeightBuffer::Heap(weights) => weights,
        }
    }

    /// Cursor over the float section, starting at the embedding table
    #[must_use]
    pub fn cursor(&self) -> WeightCursor<'_> {
        WeightCursor::new(self.weights())
    }
}

fn check_weight_count(config: &Config, shared_weights: bool, available: usize) -> Result<()> {
    let expected = expected_weight_count(config, shared_weights)?;
    if available < expected {
        return Err(InferError::FormatError {
            reason: format!(
                "Checkpoint truncated: {available} weights present, layout needs {expected}"
            ),
        });
    }
    if available > expected {
        debug!(
            extra = available - expected,
            "Ignoring trailing floats after checkpoint weights"
        );
    }
    Ok(())
}

fn decode_floats(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Sequential reader handing out bounded ranges of a weight buffer
#[derive(Debug, Clone)]
pub struct WeightCursor<'a> {
    weights: &'a [f32],
    offset: usize,
}

impl<'a> WeightCursor<'a> {
    /// Start reading `weights` from the beginning
    #[must_use]
    pub fn new(weights: &'a [f32]) -> Self {
        Self { weights, offset: 0 }
    }

    /// Floats consumed so far
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Next `len` floats
    ///
    /// # Errors
    ///
    /// Returns `FormatError` if fewer than `len` floats remain
    pub fn take(&mut self, len: usize) -> Result<&'a [f32]> {
        let past_end = || InferError::FormatError {
            reason: format!(
                "Weight range of {len} floats at {} past end of buffer ({} floats)",
                self.offset,
                self.weights.len()
            ),
        };
        let end = self.offset.checked_add(len).ok_or_else(past_end)?;
        if end > self.weights.len() {
            return Err(past_end());
        }
        let range = &self.weights[self.offset..end];
        self.offset = end;
        Ok(range)
    }

    /// Next `rows * cols` floats as a view
    ///
    /// # Errors
    ///
    /// Returns `FormatError` if the buffer is too short
    pub fn take_tensor(&mut self, rows: usize, cols: usize) -> Result<Tensor<'a>> {
        let len = rows.checked_mul(cols).ok_or_else(|| InferError::FormatError {
            reason: format!("Weight tensor {rows}x{cols} overflows the address space"),
        })?;
        let data = self.take(len)?;
        Tensor::view(data, rows, cols)
    }

    /// Next `count` consecutive views of shape `(rows, cols)`
    ///
    /// # Errors
    ///
    /// Returns `FormatError` if the buffer is too short
    pub fn take_layers(&mut self, count: usize, rows: usize, cols: usize) -> Result<Vec<Tensor<'a>>> {
        (0..count).map(|_| self.take_tensor(rows, cols)).collect()
    }

    /// Step over `len` floats
    ///
    /// # Errors
    ///
    /// Returns `FormatError` if fewer than `len` floats remain
    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.take(len).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> Config {
        Config {
            dim: 4,
            hidden_dim: 8,
            n_layers: 2,
            n_heads: 2,
            n_kv_heads: 1,
            vocab_size: 5,
            seq_len: 4,
        }
    }

    #[test]
    fn test_expected_weight_count() {
        let config = tiny_config();
        // embedding 20, per layer 4+16+8+8+16+4+32+32+32 = 152, final 4, legacy 2*4
        assert_eq!(expected_weight_count(&config, true).expect("test"), 20 + 2 * 152 + 4 + 8);
        assert_eq!(
            expected_weight_count(&config, false).expect("test"),
            20 + 2 * 152 + 4 + 8 + 20
        );
    }

    #[test]
    fn test_parse_header_shared_flag() {
        let bytes = CheckpointBuilder::new(tiny_config()).build();
        let (config, shared) = parse_header(&bytes).expect("test");
        assert_eq!(config, tiny_config());
        assert!(shared);

        let bytes = CheckpointBuilder::new(tiny_config()).shared(false).build();
        let (config, shared) = parse_header(&bytes).expect("test");
        assert_eq!(config.vocab_size, 5);
        assert!(!shared);
    }

    #[test]
    fn test_parse_header_too_short() {
        let err = parse_header(&[0u8; 12]).unwrap_err();
        assert!(matches!(err, InferError::FormatError { .. }));
    }

    #[test]
    fn test_parse_header_negative_dim() {
        let mut bytes = CheckpointBuilder::new(tiny_config()).build();
        bytes[0..4].copy_from_slice(&(-4i32).to_le_bytes());
        assert!(matches!(
            parse_header(&bytes).unwrap_err(),
            InferError::InvalidConfiguration(_)
        ));
    }

    #[test]
    fn test_parse_header_invalid_divisibility() {
        let mut bytes = CheckpointBuilder::new(tiny_config()).build();
        // n_heads = 3 does not divide dim = 4
        bytes[12..16].copy_from_slice(&3i32.to_le_bytes());
        assert!(matches!(
            parse_header(&bytes).unwrap_err(),
            InferError::InvalidConfiguration(_)
        ));
    }

    fn header_bytes(fields: [i32; 7]) -> Vec<u8> {
        fields.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    #[test]
    fn test_from_bytes_oversized_header() {
        // Passes Config::validate, but the per-layer query block alone is
        // 2^30 * 2^30 * 2^30 floats
        let mut bytes = header_bytes([1 << 30, 1 << 30, 1 << 30, 1 << 29, 1 << 29, 5, 4]);
        bytes.extend_from_slice(&[0u8; 64]);

        let (config, _) = parse_header(&bytes).expect("test");
        assert!(matches!(
            expected_weight_count(&config, true).unwrap_err(),
            InferError::FormatError { .. }
        ));
        assert!(matches!(
            Checkpoint::from_bytes(&bytes).unwrap_err(),
            InferError::FormatError { .. }
        ));
    }

    #[test]
    fn test_from_bytes_layout_sum_overflow() {
        // On 64-bit targets query, key, value and output are 2^62 floats
        // each, so only the running total overflows
        let fields = [1 << 30, 1, 4, 1 << 29, 1 << 29, 5, 4];
        let mut bytes = header_bytes(fields);
        bytes.extend_from_slice(&[0u8; 64]);
        assert!(matches!(
            Checkpoint::from_bytes(&bytes).unwrap_err(),
            InferError::FormatError { .. }
        ));
    }

    #[test]
    fn test_cursor_rejects_overflowing_ranges() {
        let weights = [1.0, 2.0];
        let mut cursor = WeightCursor::new(&weights);
        cursor.skip(1).expect("test");
        assert!(matches!(
            cursor.take(usize::MAX).unwrap_err(),
            InferError::FormatError { .. }
        ));
        assert!(matches!(
            cursor.take_tensor(usize::MAX, 2).unwrap_err(),
            InferError::FormatError { .. }
        ));
        assert_eq!(cursor.offset(), 1);
    }

    #[test]
    fn test_from_bytes_truncated() {
        let bytes = CheckpointBuilder::new(tiny_config()).build();
        let err = Checkpoint::from_bytes(&bytes[..bytes.len() - 4]).unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_from_bytes_heap() {
        let bytes = CheckpointBuilder::new(tiny_config())
            .fill_with(|_, _, i| i as f32)
            .build();
        let checkpoint = Checkpoint::from_bytes(&bytes).expect("test");
        assert!(!checkpoint.is_mapped());
        assert_eq!(
            checkpoint.weights().len(),
            expected_weight_count(&tiny_config(), true).expect("test")
        );
        // First embedding floats are the flat indices
        assert_eq!(&checkpoint.weights()[..3], &[0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_cursor_bounds() {
        let weights = [1.0, 2.0, 3.0, 4.0, 5.0];
        let mut cursor = WeightCursor::new(&weights);
        assert_eq!(cursor.take(2).expect("test"), &[1.0, 2.0]);
        cursor.skip(1).expect("test");
        let t = cursor.take_tensor(1, 2).expect("test");
        assert!(t.is_view());
        assert_eq!(t.data(), &[4.0, 5.0]);
        assert_eq!(cursor.offset(), 5);
        assert!(matches!(
            cursor.take(1).unwrap_err(),
            InferError::FormatError { .. }
        ));
    }

    #[test]
    fn test_take_layers() {
        let weights: Vec<f32> = (0..12).map(|i| i as f32).collect();
        let mut cursor = WeightCursor::new(&weights);
        let layers = cursor.take_layers(3, 2, 2).expect("test");
        assert_eq!(layers.len(), 3);
        assert_eq!(layers[2].data(), &[8.0, 9.0, 10.0, 11.0]);
        assert!(cursor.take_layers(1, 1, 1).is_err());
    }
}
