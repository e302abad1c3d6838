//! Archive encoder.
//!
//! Content is streamed in input order, each block padded to 8 bytes. The TOC
//! and filename block follow in case-insensitive name order, and finally the
//! header's offsets and file count are patched in place.

use std::fs::{self, File};
use std::io::{BufWriter, Cursor, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};
use zerocopy::AsBytes;

use crate::compression::{self, CompressionPolicy};
use crate::error::{EggError, EggResult};
use crate::{
    compare_names, padding_for, EggHeader, TocEntry, MAX_NAME_LEN, OFFSET_OF_FILENAME_OFFSET,
    OFFSET_OF_FILE_COUNT, OFFSET_OF_TOC_OFFSET,
};

/// Seconds between 1601-01-01 (FILETIME epoch) and 1970-01-01.
const FILETIME_UNIX_OFFSET_SECS: u64 = 11_644_473_600;

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Build timestamp stored in the header. `None` uses the current time.
    pub timestamp: Option<u64>,
    pub compression: CompressionPolicy,
}

impl BuildOptions {
    fn resolve_timestamp(&self) -> u64 {
        self.timestamp.unwrap_or_else(current_filetime)
    }
}

/// Current time as 100ns ticks since 1601-01-01 UTC.
pub fn current_filetime() -> u64 {
    let since_unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (since_unix.as_secs() + FILETIME_UNIX_OFFSET_SECS) * 10_000_000
        + u64::from(since_unix.subsec_nanos() / 100)
}

/// Where an input's bytes come from.
#[derive(Debug, Clone)]
enum SourceData {
    Memory(Vec<u8>),
    File(PathBuf),
}

#[derive(Debug, Clone)]
struct Source {
    name: String,
    data: SourceData,
}

impl Source {
    fn load(&self) -> EggResult<std::borrow::Cow<'_, [u8]>> {
        match &self.data {
            SourceData::Memory(bytes) => Ok(bytes.as_slice().into()),
            SourceData::File(path) => fs::read(path)
                .map(Into::into)
                .map_err(|source| EggError::SourceRead {
                    name: self.name.clone(),
                    source,
                }),
        }
    }
}

/// Reported once per input after its content has been written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildEvent {
    /// Position of the input in the order it was added.
    pub index: usize,
    pub name: String,
    pub original_size: u32,
    pub stored_size: u32,
    pub compressed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildSummary {
    pub file_count: u32,
    pub toc_offset: u32,
    pub filename_offset: u32,
    pub archive_size: u64,
}

/// Per-file bookkeeping between the content pass and the TOC pass.
struct FileInfo<'a> {
    name: &'a str,
    toc: TocEntry,
}

#[derive(Debug, Clone, Default)]
pub struct ArchiveBuilder {
    sources: Vec<Source>,
    options: BuildOptions,
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: BuildOptions) -> Self {
        Self {
            sources: Vec::new(),
            options,
        }
    }

    pub fn add_bytes(&mut self, name: impl Into<String>, data: impl Into<Vec<u8>>) -> &mut Self {
        self.sources.push(Source {
            name: name.into(),
            data: SourceData::Memory(data.into()),
        });
        self
    }

    /// Add a file that is read only when the archive is written.
    pub fn add_file(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> &mut Self {
        self.sources.push(Source {
            name: name.into(),
            data: SourceData::File(path.into()),
        });
        self
    }

    /// Encode the archive into memory.
    pub fn build(&self) -> EggResult<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::new());
        self.write(&mut cursor, |_| {})?;
        Ok(cursor.into_inner())
    }

    /// Encode to a file. A partially written file is removed on error; a
    /// file that could not be opened is left alone.
    pub fn write_to_path(
        &self,
        path: impl AsRef<Path>,
        on_event: impl FnMut(&BuildEvent),
    ) -> EggResult<BuildSummary> {
        let path = path.as_ref();
        self.validate()?;

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        let result = self
            .write(&mut writer, on_event)
            .and_then(|summary| writer.flush().map(|_| summary).map_err(Into::into));
        drop(writer);

        if result.is_err() {
            if let Err(e) = fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "unable to remove partial archive");
            }
        }
        result
    }

    /// Encode to `writer`, which must be positioned at the start of the archive.
    ///
    /// `on_event` is called after each input's content is written. On error
    /// the writer holds a partial archive that must be discarded.
    pub fn write<W: Write + Seek>(
        &self,
        writer: &mut W,
        mut on_event: impl FnMut(&BuildEvent),
    ) -> EggResult<BuildSummary> {
        self.validate()?;
        let file_count = to_u32(self.sources.len(), "file count")?;

        let header = EggHeader::new(self.options.resolve_timestamp());
        writer.write_all(header.as_bytes())?;
        let mut position = header.as_bytes().len() as u64;
        debug_assert_eq!(padding_for(position), 0);

        let mut files = Vec::with_capacity(self.sources.len());
        for (index, source) in self.sources.iter().enumerate() {
            let raw = source.load()?;
            let original_size = to_u32(raw.len(), &source.name)?;
            let (stored, compressed) = compression::compress(&raw, &self.options.compression);
            let stored_size = stored.len() as u32;

            let content_offset = to_u32(position, "archive")?;
            writer.write_all(&stored)?;
            position += u64::from(stored_size);

            let padding = padding_for(position);
            writer.write_all(&[0u8; 8][..padding as usize])?;
            position += padding;
            debug!(name = %source.name, content_offset, padding, "wrote content");

            let event = BuildEvent {
                index,
                name: source.name.clone(),
                original_size,
                stored_size,
                compressed,
            };
            if compressed {
                info!(name = %event.name, original_size, stored_size, "added (compressed)");
            } else {
                info!(name = %event.name, original_size, "added");
            }
            on_event(&event);

            files.push(FileInfo {
                name: &source.name,
                toc: TocEntry::new(content_offset, stored_size, original_size, compressed),
            });
        }

        files.sort_by(|a, b| compare_names(a.name, b.name));

        let toc_offset = to_u32(position, "archive")?;
        for file in &files {
            writer.write_all(file.toc.as_bytes())?;
        }
        position += (files.len() * std::mem::size_of::<TocEntry>()) as u64;

        let filename_offset = to_u32(position, "archive")?;
        for file in &files {
            let name = file.name.as_bytes();
            writer.write_all(&[name.len() as u8])?;
            writer.write_all(name)?;
            writer.write_all(&[0])?;
            position += name.len() as u64 + 2;
        }
        to_u32(position, "archive")?;

        patch_u32(writer, OFFSET_OF_TOC_OFFSET, toc_offset)?;
        patch_u32(writer, OFFSET_OF_FILENAME_OFFSET, filename_offset)?;
        patch_u32(writer, OFFSET_OF_FILE_COUNT, file_count)?;
        writer.seek(SeekFrom::Start(position))?;

        Ok(BuildSummary {
            file_count,
            toc_offset,
            filename_offset,
            archive_size: position,
        })
    }

    /// Reject inputs that can never be encoded before any bytes are written.
    fn validate(&self) -> EggResult<()> {
        if self.sources.is_empty() {
            return Err(EggError::EmptyInput);
        }
        for source in &self.sources {
            let len = source.name.len();
            if len > MAX_NAME_LEN {
                return Err(EggError::NameTooLong {
                    name: source.name.clone(),
                    len,
                });
            }
            if source.name.contains('\0') {
                return Err(EggError::InvalidName(source.name.clone()));
            }
        }
        Ok(())
    }
}

fn to_u32(value: impl TryInto<u32>, what: &str) -> EggResult<u32> {
    value
        .try_into()
        .map_err(|_| EggError::TooLarge(what.to_string()))
}

fn patch_u32<W: Write + Seek>(writer: &mut W, offset: u64, value: u32) -> EggResult<()> {
    writer.seek(SeekFrom::Start(offset))?;
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

/// Encode named in-memory buffers with the default options.
pub fn build<N, D>(sources: impl IntoIterator<Item = (N, D)>) -> EggResult<Vec<u8>>
where
    N: Into<String>,
    D: Into<Vec<u8>>,
{
    let mut builder = ArchiveBuilder::new();
    for (name, data) in sources {
        builder.add_bytes(name, data);
    }
    builder.build()
}

/// Encode files into an archive at `output`. Each entry is named after its
/// input path, with `\` normalised to `/`.
pub fn build_from_paths<P: AsRef<Path>>(
    output: impl AsRef<Path>,
    inputs: &[P],
    options: BuildOptions,
    on_event: impl FnMut(&BuildEvent),
) -> EggResult<BuildSummary> {
    let mut builder = ArchiveBuilder::with_options(options);
    for input in inputs {
        let input = input.as_ref();
        builder.add_file(input.to_string_lossy().replace('\\', "/"), input);
    }
    builder.write_to_path(output, on_event)
}
