use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapOptions};
use tracing::{debug, warn};
use zerocopy::FromBytes;

use crate::error::{EggError, EggResult};
use crate::{
    extract, lookup_key, EggHeader, TocEntry, EGG_MAGIC, FORMAT_VERSION, HEADER_SIZE,
    TOC_ENTRY_SIZE, TOC_FLAG_COMPRESSED,
};

/// A validated archive member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    /// Position in TOC order.
    pub index: u32,
    pub content_offset: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub compressed: bool,
}

impl Entry {
    pub fn compression_label(&self) -> &'static str {
        if self.compressed {
            "LZ4"
        } else {
            "None"
        }
    }

    /// Byte range of the stored content within its archive.
    pub fn content_range(&self) -> std::ops::Range<usize> {
        let start = self.content_offset as usize;
        start..start.saturating_add(self.compressed_size as usize)
    }
}

/// Read-only view of a validated archive buffer.
///
/// Entries keep the on-disk TOC order. Every offset and size has been checked
/// against the buffer; an [`Entry`] from elsewhere is bounds-checked again
/// before its content is sliced.
#[derive(Debug, Clone)]
pub struct ArchiveIndex<'a> {
    data: &'a [u8],
    header: EggHeader,
    entries: Vec<Entry>,
    lookup: HashMap<String, usize>,
}

impl<'a> ArchiveIndex<'a> {
    /// Validate `data` and build the index. Any inconsistency rejects the
    /// whole archive.
    pub fn parse(data: &'a [u8]) -> EggResult<Self> {
        let header = parse_header(data)?;
        let length = data.len() as u64;

        let file_count = u64::from(header.file_count.get());
        let filename_offset = u64::from(header.filename_offset.get());
        let toc_offset = u64::from(header.toc_offset.get());

        if filename_offset > length {
            return Err(EggError::corrupt(format!(
                "filename block offset {filename_offset} is past the end ({length} bytes)"
            )));
        }
        if toc_offset > length {
            return Err(EggError::corrupt(format!(
                "TOC offset {toc_offset} is past the end ({length} bytes)"
            )));
        }
        // u32 * 16 + u32 cannot overflow u64
        let toc_end = toc_offset + file_count * TOC_ENTRY_SIZE as u64;
        if toc_end > length {
            return Err(EggError::corrupt(format!(
                "TOC of {file_count} entries at {toc_offset} runs past the end ({length} bytes)"
            )));
        }
        // every filename record takes at least two bytes
        if filename_offset + file_count * 2 > length {
            return Err(EggError::corrupt(format!(
                "filename block of {file_count} records at {filename_offset} runs past the end"
            )));
        }

        let toc_bytes = &data[toc_offset as usize..toc_end as usize];
        let names = parse_filenames(data, filename_offset as usize, file_count as usize)?;

        let mut entries = Vec::with_capacity(names.len());
        let mut lookup = HashMap::with_capacity(names.len());
        for (i, (name, record)) in names
            .into_iter()
            .zip(toc_bytes.chunks_exact(TOC_ENTRY_SIZE))
            .enumerate()
        {
            let toc = TocEntry::read_from(record)
                .ok_or_else(|| EggError::corrupt(format!("TOC entry {i} is short")))?;
            let entry = validate_entry(i, name, &toc, length)?;
            lookup.entry(lookup_key(&entry.name)).or_insert(i);
            entries.push(entry);
        }

        debug!(
            entries = entries.len(),
            toc_offset,
            filename_offset,
            "parsed archive index"
        );

        Ok(Self {
            data,
            header,
            entries,
            lookup,
        })
    }

    pub fn header(&self) -> &EggHeader {
        &self.header
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Entry> {
        self.entries.get(index)
    }

    /// Case-insensitive exact match. With duplicate names the first entry in
    /// on-disk order wins.
    pub fn find(&self, name: &str) -> Option<usize> {
        self.lookup.get(&lookup_key(name)).copied()
    }

    pub fn entry_by_name(&self, name: &str) -> Option<&Entry> {
        self.find(name).map(|i| &self.entries[i])
    }

    /// Entry names in TOC order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    /// Stored (possibly compressed) bytes of `entry`.
    pub fn content(&self, entry: &Entry) -> EggResult<&'a [u8]> {
        let range = entry.content_range();
        self.data.get(range.clone()).ok_or_else(|| {
            EggError::corrupt(format!(
                "content of {:?} ({range:?}) is outside the {}-byte archive",
                entry.name,
                self.data.len()
            ))
        })
    }

    pub fn extract(&self, entry: &Entry, sink: &mut impl Write) -> EggResult<u64> {
        extract::extract(self, entry, sink)
    }

    /// Decoded bytes of `entry`.
    pub fn read(&self, entry: &Entry) -> EggResult<Vec<u8>> {
        let mut out = Vec::with_capacity(self.content(entry)?.len());
        self.extract(entry, &mut out)?;
        Ok(out)
    }

    pub fn extract_by_name(&self, name: &str) -> EggResult<Vec<u8>> {
        let entry = self
            .entry_by_name(name)
            .ok_or_else(|| EggError::NotFound(name.to_string()))?;
        self.read(entry)
    }
}

fn parse_header(data: &[u8]) -> EggResult<EggHeader> {
    if data.len() < HEADER_SIZE {
        return Err(EggError::Truncated { len: data.len() });
    }
    let header = EggHeader::read_from_prefix(data).ok_or(EggError::Truncated { len: data.len() })?;
    if header.magic != EGG_MAGIC {
        return Err(EggError::BadMagic);
    }
    if header.version.get() != FORMAT_VERSION {
        warn!(version = header.version.get(), "unknown archive format version");
    }
    Ok(header)
}

/// Walk `count` records of `len:u8, name[len], 0`.
fn parse_filenames(data: &[u8], offset: usize, count: usize) -> EggResult<Vec<String>> {
    let mut names = Vec::with_capacity(count);
    let mut cursor = offset;
    for i in 0..count {
        let len = *data.get(cursor).ok_or_else(|| {
            EggError::corrupt(format!("filename record {i} starts past the end"))
        })? as usize;
        let start = cursor + 1;
        let terminator = start + len;
        match data.get(terminator) {
            None => {
                return Err(EggError::corrupt(format!(
                    "filename record {i} runs past the end"
                )))
            }
            Some(0) => {}
            Some(_) => {
                return Err(EggError::corrupt(format!(
                    "filename record {i} is not terminated at its declared length {len}"
                )))
            }
        }
        let raw = &data[start..terminator];
        if raw.contains(&0) {
            return Err(EggError::corrupt(format!(
                "filename record {i} ends before its declared length {len}"
            )));
        }
        names.push(String::from_utf8_lossy(raw).into_owned());
        cursor = terminator + 1;
    }
    Ok(names)
}

fn validate_entry(i: usize, name: String, toc: &TocEntry, length: u64) -> EggResult<Entry> {
    let content_offset = toc.content_offset.get();
    let compressed_size = toc.compressed_size.get();
    let uncompressed_size = toc.uncompressed_size.get();
    let flags = toc.flags.get();

    if u64::from(content_offset) + u64::from(compressed_size) > length {
        return Err(EggError::corrupt(format!(
            "content of {name:?} ({compressed_size} bytes at {content_offset}) runs past the end"
        )));
    }
    let compressed = toc.is_compressed();
    if compressed && compressed_size > uncompressed_size {
        return Err(EggError::corrupt(format!(
            "{name:?} is compressed to {compressed_size} bytes, more than its {uncompressed_size}"
        )));
    }
    if !compressed && compressed_size != uncompressed_size {
        return Err(EggError::corrupt(format!(
            "{name:?} is stored raw but sizes differ ({compressed_size} != {uncompressed_size})"
        )));
    }
    if flags & !TOC_FLAG_COMPRESSED != 0 {
        warn!(name = %name, flags, "ignoring unknown TOC flag bits");
    }

    Ok(Entry {
        name,
        index: i as u32,
        content_offset,
        compressed_size,
        uncompressed_size,
        compressed,
    })
}

enum Backing {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

/// An archive file opened read-only.
pub struct EggReader {
    path: PathBuf,
    backing: Backing,
}

impl EggReader {
    /// Map the archive, or read it whole when mapping is not possible. Only
    /// the header is checked here; [`EggReader::index`] validates the rest.
    pub fn open<P: AsRef<Path>>(path: P) -> EggResult<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        debug!(path = %path.display(), size, "opening archive");

        // SAFETY: the map is read-only; the archive must not be modified
        // while it is open.
        let backing = match (size > 0).then(|| unsafe { MmapOptions::new().map(&file) }) {
            Some(Ok(mmap)) => Backing::Mapped(mmap),
            Some(Err(e)) => {
                debug!(error = %e, "unable to map archive, reading it instead");
                Backing::Owned(fs::read(path)?)
            }
            None => Backing::Owned(Vec::new()),
        };

        let reader = Self {
            path: path.to_path_buf(),
            backing,
        };
        parse_header(reader.bytes())?;
        Ok(reader)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.backing {
            Backing::Mapped(mmap) => &mmap[..],
            Backing::Owned(bytes) => bytes.as_slice(),
        }
    }

    pub fn index(&self) -> EggResult<ArchiveIndex<'_>> {
        ArchiveIndex::parse(self.bytes())
    }

    pub fn list(&self) -> EggResult<Vec<String>> {
        list(self.bytes())
    }

    pub fn extract_by_name(&self, name: &str) -> EggResult<Vec<u8>> {
        extract_by_name(self.bytes(), name)
    }
}

/// Entry names of `archive` in TOC order. Content is not read.
pub fn list(archive: &[u8]) -> EggResult<Vec<String>> {
    let index = ArchiveIndex::parse(archive)?;
    Ok(index.entries.into_iter().map(|e| e.name).collect())
}

pub fn extract_by_name(archive: &[u8], name: &str) -> EggResult<Vec<u8>> {
    ArchiveIndex::parse(archive)?.extract_by_name(name)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::writer::{ArchiveBuilder, BuildOptions};
    use crate::{OFFSET_OF_FILENAME_OFFSET, OFFSET_OF_FILE_COUNT, OFFSET_OF_TOC_OFFSET};

    fn sample() -> Vec<u8> {
        let mut builder = ArchiveBuilder::with_options(BuildOptions {
            timestamp: Some(0),
            ..BuildOptions::default()
        });
        builder.add_bytes("foo.txt", b"foo".to_vec());
        builder.add_bytes("bar.txt", b"bar bar".to_vec());
        builder.build().unwrap()
    }

    fn read_u32(bytes: &[u8], offset: u64) -> u32 {
        let at = offset as usize;
        u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
    }

    fn write_u32(bytes: &mut [u8], offset: u64, value: u32) {
        let at = offset as usize;
        bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn assert_corrupt(bytes: &[u8]) {
        let err = ArchiveIndex::parse(bytes).unwrap_err();
        assert!(matches!(err, EggError::CorruptArchive(_)), "got {err:?}");
    }

    #[test]
    fn parses_entries_in_disk_order() {
        let bytes = sample();
        let index = ArchiveIndex::parse(&bytes).unwrap();
        assert_eq!(index.names(), vec!["bar.txt", "foo.txt"]);
        assert_eq!(index.get(1).unwrap().index, 1);
        assert_eq!(index.header().version.get(), 1);
        assert_eq!(index.content(index.get(0).unwrap()).unwrap(), b"bar bar");
    }

    #[test]
    fn lookup_ignores_case() {
        let bytes = sample();
        let index = ArchiveIndex::parse(&bytes).unwrap();
        assert_eq!(index.find("Foo.TXT"), Some(1));
        assert_eq!(index.find("foo"), None);
        assert!(matches!(
            index.extract_by_name("nope").unwrap_err(),
            EggError::NotFound(_)
        ));
    }

    #[test]
    fn first_duplicate_wins() {
        let mut builder = ArchiveBuilder::new();
        builder.add_bytes("dup", b"one".to_vec());
        builder.add_bytes("DUP", b"two".to_vec());
        let bytes = builder.build().unwrap();
        let index = ArchiveIndex::parse(&bytes).unwrap();
        assert_eq!(index.find("Dup"), Some(0));
    }

    #[test]
    fn short_buffer_is_truncated() {
        let bytes = sample();
        let err = ArchiveIndex::parse(&bytes[..HEADER_SIZE - 1]).unwrap_err();
        assert!(matches!(err, EggError::Truncated { len: 39 }));
        assert!(matches!(
            ArchiveIndex::parse(&[]).unwrap_err(),
            EggError::Truncated { len: 0 }
        ));
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut bytes = sample();
        bytes[3] = b'B';
        assert!(matches!(
            ArchiveIndex::parse(&bytes).unwrap_err(),
            EggError::BadMagic
        ));
    }

    #[test]
    fn offsets_past_end_are_rejected() {
        let mut bytes = sample();
        let len = bytes.len() as u32;
        write_u32(&mut bytes, OFFSET_OF_TOC_OFFSET, len + 1);
        assert_corrupt(&bytes);

        let mut bytes = sample();
        write_u32(&mut bytes, OFFSET_OF_FILENAME_OFFSET, u32::MAX);
        assert_corrupt(&bytes);
    }

    #[test]
    fn huge_file_count_is_rejected() {
        let mut bytes = sample();
        write_u32(&mut bytes, OFFSET_OF_FILE_COUNT, u32::MAX);
        assert_corrupt(&bytes);

        // 0x1000_0000 * 16 wraps to zero in 32-bit arithmetic
        let mut bytes = sample();
        write_u32(&mut bytes, OFFSET_OF_FILE_COUNT, 0x1000_0000);
        assert_corrupt(&bytes);
    }

    #[test]
    fn content_past_end_is_rejected() {
        let mut bytes = sample();
        let toc = u64::from(read_u32(&bytes, OFFSET_OF_TOC_OFFSET));
        write_u32(&mut bytes, toc, u32::MAX - 2);
        assert_corrupt(&bytes);

        let mut bytes = sample();
        write_u32(&mut bytes, toc + 4, u32::MAX);
        write_u32(&mut bytes, toc + 8, u32::MAX);
        assert_corrupt(&bytes);
    }

    #[test]
    fn inconsistent_sizes_are_rejected() {
        let mut bytes = sample();
        let toc = u64::from(read_u32(&bytes, OFFSET_OF_TOC_OFFSET));
        write_u32(&mut bytes, toc + 8, 99);
        assert_corrupt(&bytes);
    }

    #[test]
    fn bad_filename_records_are_rejected() {
        let bytes = sample();
        let names = read_u32(&bytes, OFFSET_OF_FILENAME_OFFSET) as usize;

        // terminator replaced
        let mut broken = bytes.clone();
        broken[names + 1 + 7] = b'!';
        assert_corrupt(&broken);

        // declared length longer than the remaining buffer
        let mut broken = bytes.clone();
        broken[names + 9] = 200;
        assert_corrupt(&broken);

        // declared length shorter than the name
        let mut broken = bytes.clone();
        broken[names] = 3;
        assert_corrupt(&broken);

        // embedded NUL before the declared end
        let mut broken = bytes;
        broken[names + 2] = 0;
        assert_corrupt(&broken);
    }

    #[test]
    fn truncated_archive_is_rejected() {
        let bytes = sample();
        for cut in [bytes.len() - 1, bytes.len() - 8, HEADER_SIZE + 1] {
            assert!(ArchiveIndex::parse(&bytes[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn unknown_flag_bits_are_ignored() {
        let mut bytes = sample();
        let toc = u64::from(read_u32(&bytes, OFFSET_OF_TOC_OFFSET));
        write_u32(&mut bytes, toc + 12, 0x8000_0000);
        let index = ArchiveIndex::parse(&bytes).unwrap();
        assert!(!index.get(0).unwrap().compressed);
        assert_eq!(index.read(index.get(0).unwrap()).unwrap(), b"bar bar");
    }

    #[test]
    fn reserved_header_fields_are_ignored() {
        let mut bytes = sample();
        bytes[6] = 0xff;
        bytes[28..32].copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(ArchiveIndex::parse(&bytes).unwrap().len(), 2);
    }

    #[test]
    fn altered_entry_is_rejected_instead_of_sliced() {
        let bytes = sample();
        let index = ArchiveIndex::parse(&bytes).unwrap();

        let mut entry = index.get(0).unwrap().clone();
        entry.compressed_size = 1_000_000;
        entry.uncompressed_size = 1_000_000;
        assert!(matches!(index.content(&entry), Err(EggError::CorruptArchive(_))));
        assert!(matches!(index.read(&entry), Err(EggError::CorruptArchive(_))));

        let mut entry = index.get(1).unwrap().clone();
        entry.content_offset = u32::MAX;
        entry.compressed_size = u32::MAX;
        let mut sink = Vec::new();
        assert!(matches!(
            index.extract(&entry, &mut sink),
            Err(EggError::CorruptArchive(_))
        ));
        assert!(sink.is_empty());
    }

    #[test]
    fn list_and_extract_by_name() {
        let bytes = sample();
        assert_eq!(list(&bytes).unwrap(), vec!["bar.txt", "foo.txt"]);
        assert_eq!(extract_by_name(&bytes, "BAR.txt").unwrap(), b"bar bar");
    }
}
