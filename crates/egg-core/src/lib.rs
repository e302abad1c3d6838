//! EGG archive format.
//!
//! An EGG archive bundles many named files into one blob:
//!
//! ```text
//! [header: 40 bytes][content 0][pad]...[content n-1][pad][TOC: n * 16 bytes][filename records]
//! ```
//!
//! All integers are little-endian. Content blocks start on 8-byte boundaries,
//! and the TOC and filename records are emitted in case-insensitive name order.

use zerocopy::byteorder::little_endian::{U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

pub mod compression;
pub mod error;
pub mod extract;
pub mod reader;
pub mod writer;

pub use compression::CompressionPolicy;
pub use error::{EggError, EggResult};
pub use reader::{extract_by_name, list, ArchiveIndex, EggReader, Entry};
pub use writer::{
    build, build_from_paths, ArchiveBuilder, BuildEvent, BuildOptions, BuildSummary,
};

/// Magic bytes 'EGGA' to identify the file format.
pub const EGG_MAGIC: [u8; 4] = *b"EGGA";

pub const FORMAT_VERSION: u16 = 1;

/// Size of the fixed header. The first file's content starts right after it.
pub const HEADER_SIZE: usize = 40;

pub const TOC_ENTRY_SIZE: usize = 16;

/// Content blocks, the TOC and the filename block all start on this boundary.
pub const ALIGNMENT: usize = 8;

/// Longest name a filename record can hold (its length is a single byte).
pub const MAX_NAME_LEN: usize = u8::MAX as usize;

// Header fields patched once the rest of the archive has been written.
pub const OFFSET_OF_FILE_COUNT: u64 = 16;
pub const OFFSET_OF_FILENAME_OFFSET: u64 = 20;
pub const OFFSET_OF_TOC_OFFSET: u64 = 24;

/// TOC flag bit: content is an LZ4 block.
pub const TOC_FLAG_COMPRESSED: u32 = 0x01;

/// Number of zero bytes needed after `position` to reach the next aligned offset.
pub const fn padding_for(position: u64) -> u64 {
    let align = ALIGNMENT as u64;
    (align - position % align) % align
}

/// Case-insensitive name ordering, byte-wise on ASCII-folded names.
pub fn compare_names(a: &str, b: &str) -> std::cmp::Ordering {
    a.bytes()
        .map(|c| c.to_ascii_lowercase())
        .cmp(b.bytes().map(|c| c.to_ascii_lowercase()))
}

/// Key used for case-insensitive name lookup.
pub fn lookup_key(name: &str) -> String {
    name.to_ascii_lowercase()
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, AsBytes, FromZeroes, Unaligned)]
pub struct EggHeader {
    pub magic: [u8; 4],
    pub version: U16,
    pub flags: U16,
    pub timestamp: U64,
    pub file_count: U32,
    pub filename_offset: U32,
    pub toc_offset: U32,
    pub reserved: U32,
    pub padding: [u8; 8],
}

impl EggHeader {
    /// Header with offsets and file count left at zero, to be patched later.
    pub fn new(timestamp: u64) -> Self {
        Self {
            magic: EGG_MAGIC,
            version: U16::new(FORMAT_VERSION),
            flags: U16::new(0),
            timestamp: U64::new(timestamp),
            file_count: U32::new(0),
            filename_offset: U32::new(0),
            toc_offset: U32::new(0),
            reserved: U32::new(0),
            padding: [0; 8],
        }
    }
}

impl Default for EggHeader {
    fn default() -> Self {
        Self::new(0)
    }
}

/// One record of the table of contents.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, AsBytes, FromZeroes, Unaligned)]
pub struct TocEntry {
    pub content_offset: U32,
    pub compressed_size: U32,
    pub uncompressed_size: U32,
    pub flags: U32,
}

impl TocEntry {
    pub fn new(
        content_offset: u32,
        compressed_size: u32,
        uncompressed_size: u32,
        compressed: bool,
    ) -> Self {
        Self {
            content_offset: U32::new(content_offset),
            compressed_size: U32::new(compressed_size),
            uncompressed_size: U32::new(uncompressed_size),
            flags: U32::new(if compressed { TOC_FLAG_COMPRESSED } else { 0 }),
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.flags.get() & TOC_FLAG_COMPRESSED != 0
    }
}
