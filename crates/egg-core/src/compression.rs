//! Single-shot LZ4 block compression with a keep-or-discard policy.

use std::borrow::Cow;

use tracing::debug;

use crate::error::{EggError, EggResult};

/// Decides when a compressed block is worth storing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionPolicy {
    pub enabled: bool,
    /// Inputs shorter than this are always stored raw.
    pub min_input_size: usize,
    /// Compressed output must be at most `input * numerator / denominator`.
    pub max_ratio: (usize, usize),
}

impl CompressionPolicy {
    /// Store every entry raw.
    pub const fn disabled() -> Self {
        Self {
            enabled: false,
            min_input_size: 10 * 1024,
            max_ratio: (3, 4),
        }
    }

    fn accepts(&self, input_len: usize, output_len: usize) -> bool {
        let (num, den) = self.max_ratio;
        let limit = (input_len as u128) * (num as u128) / (den.max(1) as u128);
        output_len > 0 && input_len >= self.min_input_size && (output_len as u128) <= limit
    }
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            ..Self::disabled()
        }
    }
}

/// Compress `raw` if the policy considers it worthwhile.
///
/// Returns the bytes to store and whether they are compressed. A failed or
/// unprofitable compression falls back to the input untouched.
pub fn compress<'a>(raw: &'a [u8], policy: &CompressionPolicy) -> (Cow<'a, [u8]>, bool) {
    if !policy.enabled || raw.len() < policy.min_input_size {
        return (Cow::Borrowed(raw), false);
    }

    let mut output = vec![0u8; lz4_flex::block::get_maximum_output_size(raw.len())];
    match lz4_flex::block::compress_into(raw, &mut output) {
        Ok(len) if policy.accepts(raw.len(), len) => {
            output.truncate(len);
            (Cow::Owned(output), true)
        }
        Ok(len) => {
            debug!(input = raw.len(), output = len, "compression not worth keeping");
            (Cow::Borrowed(raw), false)
        }
        Err(e) => {
            debug!(input = raw.len(), error = %e, "compression failed, storing raw");
            (Cow::Borrowed(raw), false)
        }
    }
}

/// Upper bound on how much one LZ4 block byte can expand.
const MAX_EXPANSION: usize = 255;

/// Inverse of [`compress`]: the output must be exactly `uncompressed_size` bytes.
pub fn decompress(stored: &[u8], uncompressed_size: usize) -> EggResult<Vec<u8>> {
    if uncompressed_size > stored.len().saturating_mul(MAX_EXPANSION) {
        return Err(EggError::corrupt(format!(
            "{} LZ4 bytes cannot expand to {uncompressed_size}",
            stored.len()
        )));
    }

    let decompressed = lz4_flex::block::decompress(stored, uncompressed_size)
        .map_err(|e| EggError::corrupt(format!("LZ4 decompression failed: {e}")))?;

    if decompressed.len() != uncompressed_size {
        return Err(EggError::corrupt(format!(
            "LZ4 decompression size mismatch: expected {uncompressed_size}, got {}",
            decompressed.len()
        )));
    }

    Ok(decompressed)
}
