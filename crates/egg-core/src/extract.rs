//! Copy or decompress a single entry into a sink.

use std::io::Write;

use tracing::debug;

use crate::compression;
use crate::error::EggResult;
use crate::reader::{ArchiveIndex, Entry};

/// Bytes handed to the sink per write.
pub const EXTRACT_CHUNK_SIZE: usize = 4 * 1024;

/// Write the decoded content of `entry` to `sink`, returning the byte count.
///
/// Raw entries are copied straight out of the archive buffer. A compressed
/// entry is a single LZ4 block, so it is decoded whole into memory before the
/// chunked write, and must decode to exactly its recorded size. An entry whose
/// range falls outside `index` is rejected as corrupt.
pub fn extract(index: &ArchiveIndex<'_>, entry: &Entry, sink: &mut impl Write) -> EggResult<u64> {
    let stored = index.content(entry)?;
    debug!(name = %entry.name, stored = stored.len(), compressed = entry.compressed, "extracting");

    if entry.compressed {
        let decoded = compression::decompress(stored, entry.uncompressed_size as usize)?;
        write_chunked(&decoded, sink)
    } else {
        write_chunked(stored, sink)
    }
}

fn write_chunked(bytes: &[u8], sink: &mut impl Write) -> EggResult<u64> {
    for chunk in bytes.chunks(EXTRACT_CHUNK_SIZE) {
        sink.write_all(chunk)?;
    }
    Ok(bytes.len() as u64)
}
