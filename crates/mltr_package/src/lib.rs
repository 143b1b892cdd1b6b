//! Binary translation package codec.
//!
//! One file per task (multi-task containers are supported by the format):
//!
//! ```text
//! [header, 16 bytes] [payload block 1] ... [payload block N] [index]
//! ```
//!
//! The header is `magic "MLTR" (4) | version (1) | reserved (3) |
//! index_offset (u64 BE)`. Each index entry is 48 bytes:
//! `task_id (36, NUL-padded ASCII) | size (u32 BE) | offset (u64 BE)`.
//! A payload block is the zlib-deflated compact JSON encoding of a
//! [`TaskData`] record; JSON object keys are ordered maps, so encoding the
//! same record always produces the same bytes.
//!
//! Readers open the file through a read-only memory map. The map and the
//! in-memory index are immutable after `open()`, so lookups are safe to run
//! concurrently without locking. The writer builds the file at a temporary
//! path and renames it into place, so no reader ever observes a partially
//! written package.

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use memmap2::Mmap;
use mltr_types::LanguageCode;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

pub const MAGIC: &[u8; 4] = b"MLTR";
pub const VERSION: u8 = 1;
pub const HEADER_SIZE: usize = 16;
pub const INDEX_ENTRY_SIZE: usize = 48;
pub const TASK_ID_SIZE: usize = 36;

#[derive(Error, Debug)]
pub enum PackageError {
    #[error("Invalid package file magic")]
    BadMagic,

    #[error("Unsupported package version: {0}")]
    UnsupportedVersion(u8),

    #[error("Package index is truncated or malformed")]
    TruncatedIndex,

    #[error("Index entry points outside the payload region")]
    EntryOverflow,

    #[error("Failed to decode payload block: {0}")]
    DecompressFailed(String),

    #[error("Task id exceeds {TASK_ID_SIZE} bytes: {0}")]
    TaskIdTooLong(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where a stored text came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum TextSource {
    #[serde(rename = "TEXT")]
    Text,
    #[serde(rename = "AUDIO")]
    Audio,
}

impl TextSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TextSource::Text => "TEXT",
            TextSource::Audio => "AUDIO",
        }
    }
}

/// All stored texts for one task: source -> language -> text.
///
/// Both source maps are always present, even when empty, so the encoded
/// form of a record is independent of the insertion path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskData {
    pub task_id: String,
    translations: BTreeMap<TextSource, BTreeMap<LanguageCode, String>>,
}

impl TaskData {
    pub fn new(task_id: impl Into<String>) -> Self {
        let mut translations = BTreeMap::new();
        translations.insert(TextSource::Text, BTreeMap::new());
        translations.insert(TextSource::Audio, BTreeMap::new());
        TaskData {
            task_id: task_id.into(),
            translations,
        }
    }

    pub fn add_translation(&mut self, source: TextSource, language: LanguageCode, text: impl Into<String>) {
        self.translations
            .entry(source)
            .or_default()
            .insert(language, text.into());
    }

    pub fn get_translation(&self, source: TextSource, language: LanguageCode) -> Option<&str> {
        self.translations
            .get(&source)
            .and_then(|langs| langs.get(&language))
            .map(String::as_str)
    }

    pub fn languages(&self, source: TextSource) -> impl Iterator<Item = LanguageCode> + '_ {
        self.translations
            .get(&source)
            .into_iter()
            .flat_map(|langs| langs.keys().copied())
    }

    /// Deflates the record into a payload block.
    fn encode(&self) -> Result<Vec<u8>, PackageError> {
        let json = serde_json::to_vec(self)
            .map_err(|e| PackageError::DecompressFailed(format!("JSON encoding failed: {}", e)))?;
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(&json)?;
        Ok(encoder.finish()?)
    }

    /// Inflates and parses a payload block.
    fn decode(data: &[u8]) -> Result<Self, PackageError> {
        let mut decoder = ZlibDecoder::new(data);
        let mut json = Vec::new();
        decoder
            .read_to_end(&mut json)
            .map_err(|e| PackageError::DecompressFailed(e.to_string()))?;
        serde_json::from_slice(&json)
            .map_err(|e| PackageError::DecompressFailed(format!("JSON decoding failed: {}", e)))
    }
}

struct PackageHeader {
    index_offset: u64,
}

impl PackageHeader {
    fn pack(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(MAGIC);
        buf[4] = VERSION;
        // bytes 5..8 reserved
        buf[8..16].copy_from_slice(&self.index_offset.to_be_bytes());
        buf
    }

    fn unpack(data: &[u8]) -> Result<Self, PackageError> {
        if data.len() < HEADER_SIZE || &data[0..4] != MAGIC {
            return Err(PackageError::BadMagic);
        }
        if data[4] != VERSION {
            return Err(PackageError::UnsupportedVersion(data[4]));
        }
        let mut offset_bytes = [0u8; 8];
        offset_bytes.copy_from_slice(&data[8..16]);
        Ok(PackageHeader {
            index_offset: u64::from_be_bytes(offset_bytes),
        })
    }
}

#[derive(Debug, Clone)]
struct IndexEntry {
    task_id: String,
    size: u32,
    offset: u64,
}

impl IndexEntry {
    fn pack(&self) -> Result<[u8; INDEX_ENTRY_SIZE], PackageError> {
        let id_bytes = self.task_id.as_bytes();
        if id_bytes.len() > TASK_ID_SIZE {
            return Err(PackageError::TaskIdTooLong(self.task_id.clone()));
        }
        let mut buf = [0u8; INDEX_ENTRY_SIZE];
        buf[..id_bytes.len()].copy_from_slice(id_bytes);
        buf[36..40].copy_from_slice(&self.size.to_be_bytes());
        buf[40..48].copy_from_slice(&self.offset.to_be_bytes());
        Ok(buf)
    }

    fn unpack(data: &[u8]) -> Result<Self, PackageError> {
        if data.len() < INDEX_ENTRY_SIZE {
            return Err(PackageError::TruncatedIndex);
        }
        let task_id = String::from_utf8_lossy(&data[..TASK_ID_SIZE])
            .trim_end_matches('\0')
            .to_string();
        let mut size_bytes = [0u8; 4];
        size_bytes.copy_from_slice(&data[36..40]);
        let mut offset_bytes = [0u8; 8];
        offset_bytes.copy_from_slice(&data[40..48]);
        Ok(IndexEntry {
            task_id,
            size: u32::from_be_bytes(size_bytes),
            offset: u64::from_be_bytes(offset_bytes),
        })
    }
}

/// Writes a package file containing the given records, in order.
///
/// The file is assembled at a temporary path in the destination directory
/// and atomically renamed into place, replacing any previous package.
pub fn create<P: AsRef<Path>>(path: P, tasks: &[TaskData]) -> Result<(), PackageError> {
    let path = path.as_ref();
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    {
        let file = tmp.as_file_mut();

        // Placeholder header; index_offset is rewritten once known.
        file.write_all(&PackageHeader { index_offset: 0 }.pack())?;

        let mut entries: Vec<IndexEntry> = Vec::with_capacity(tasks.len());
        let mut position = HEADER_SIZE as u64;
        for task in tasks {
            let data = task.encode()?;
            let size = u32::try_from(data.len()).map_err(|_| PackageError::EntryOverflow)?;
            entries.push(IndexEntry {
                task_id: task.task_id.clone(),
                size,
                offset: position,
            });
            file.write_all(&data)?;
            position += data.len() as u64;
        }

        let index_offset = position;
        for entry in &entries {
            file.write_all(&entry.pack()?)?;
        }

        file.seek(SeekFrom::Start(0))?;
        file.write_all(&PackageHeader { index_offset }.pack())?;
        file.flush()?;
    }
    tmp.persist(path).map_err(|e| PackageError::Io(e.error))?;

    debug!(path = %path.display(), records = tasks.len(), "Package file written");
    Ok(())
}

/// Read-only view over a package file.
///
/// The memory map and index are built once in [`open`](Self::open) and
/// never mutated, so a shared reference can be used from any number of
/// threads concurrently.
#[derive(Debug)]
pub struct TranslationPackage {
    mmap: Mmap,
    entries: Vec<IndexEntry>,
    by_id: HashMap<String, usize>,
}

impl TranslationPackage {
    /// Opens a package file and loads its index.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PackageError> {
        let file = File::open(path.as_ref())?;
        // Safety: the map is read-only, and package files are immutable
        // once renamed into place.
        let mmap = unsafe { Mmap::map(&file)? };

        let header = PackageHeader::unpack(&mmap)?;
        let index_offset = usize::try_from(header.index_offset).map_err(|_| PackageError::TruncatedIndex)?;
        if index_offset < HEADER_SIZE || index_offset > mmap.len() {
            return Err(PackageError::TruncatedIndex);
        }
        let index_data = &mmap[index_offset..];
        if index_data.len() % INDEX_ENTRY_SIZE != 0 {
            return Err(PackageError::TruncatedIndex);
        }

        let mut entries = Vec::with_capacity(index_data.len() / INDEX_ENTRY_SIZE);
        let mut by_id = HashMap::with_capacity(entries.capacity());
        for chunk in index_data.chunks_exact(INDEX_ENTRY_SIZE) {
            let entry = IndexEntry::unpack(chunk)?;
            let start = usize::try_from(entry.offset).map_err(|_| PackageError::EntryOverflow)?;
            let end = start
                .checked_add(entry.size as usize)
                .ok_or(PackageError::EntryOverflow)?;
            if start < HEADER_SIZE || end > index_offset {
                return Err(PackageError::EntryOverflow);
            }
            by_id.insert(entry.task_id.clone(), entries.len());
            entries.push(entry);
        }

        Ok(TranslationPackage { mmap, entries, by_id })
    }

    /// Number of records in the package.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record ids in file (insertion) order.
    pub fn task_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.task_id.as_str())
    }

    /// Decodes the record for `task_id`, or `None` when absent.
    /// A single mmap slice plus inflate; no seeks.
    pub fn get_task(&self, task_id: &str) -> Result<Option<TaskData>, PackageError> {
        let Some(&index) = self.by_id.get(task_id) else {
            return Ok(None);
        };
        let entry = &self.entries[index];
        let start = entry.offset as usize;
        let end = start + entry.size as usize;
        TaskData::decode(&self.mmap[start..end]).map(Some)
    }

    /// Looks up one stored text by task, source and language.
    pub fn query_text(
        &self,
        task_id: &str,
        source: TextSource,
        language: LanguageCode,
    ) -> Result<Option<String>, PackageError> {
        Ok(self
            .get_task(task_id)?
            .and_then(|task| task.get_translation(source, language).map(str::to_string)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::tempdir;

    fn sample_task(task_id: &str) -> TaskData {
        let mut task = TaskData::new(task_id);
        task.add_translation(TextSource::Text, LanguageCode::ZhCn, "你好世界");
        task.add_translation(TextSource::Text, LanguageCode::EnUs, "Hello World");
        task.add_translation(TextSource::Audio, LanguageCode::ZhCn, "语音识别的文本");
        task.add_translation(TextSource::Audio, LanguageCode::EnUs, "Speech recognized text");
        task
    }

    #[test]
    fn test_payload_roundtrip() {
        let task = sample_task("550e8400-e29b-41d4-a716-446655440000");
        let encoded = task.encode().unwrap();
        let decoded = TaskData::decode(&encoded).unwrap();
        assert_eq!(decoded, task);
        assert_eq!(
            decoded.languages(TextSource::Text).collect::<Vec<_>>(),
            vec![LanguageCode::ZhCn, LanguageCode::EnUs]
        );
    }

    #[test]
    fn test_create_open_and_query() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("translations.bin");
        let task = sample_task("task-123");
        create(&path, std::slice::from_ref(&task)).unwrap();

        let package = TranslationPackage::open(&path).unwrap();
        assert_eq!(package.len(), 1);
        assert_eq!(
            package
                .query_text("task-123", TextSource::Text, LanguageCode::ZhCn)
                .unwrap()
                .as_deref(),
            Some("你好世界")
        );
        assert_eq!(
            package
                .query_text("task-123", TextSource::Audio, LanguageCode::EnUs)
                .unwrap()
                .as_deref(),
            Some("Speech recognized text")
        );
        assert_eq!(
            package
                .query_text("task-123", TextSource::Text, LanguageCode::JaJp)
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_missing_task_is_absent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("translations.bin");
        create(&path, &[sample_task("task-123")]).unwrap();

        let package = TranslationPackage::open(&path).unwrap();
        assert!(package.get_task("task-999").unwrap().is_none());
    }

    #[test]
    fn test_multi_task_container_preserves_insertion_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("translations.bin");
        let first = sample_task("task-b");
        let mut second = TaskData::new("task-a");
        second.add_translation(TextSource::Text, LanguageCode::FrFr, "Bonjour");
        create(&path, &[first.clone(), second.clone()]).unwrap();

        let package = TranslationPackage::open(&path).unwrap();
        assert_eq!(package.task_ids().collect::<Vec<_>>(), vec!["task-b", "task-a"]);
        assert_eq!(package.get_task("task-b").unwrap().unwrap(), first);
        assert_eq!(package.get_task("task-a").unwrap().unwrap(), second);
    }

    #[test]
    fn test_rewrite_is_byte_identical() {
        let dir = tempdir().unwrap();
        let first_path = dir.path().join("a.bin");
        let second_path = dir.path().join("b.bin");
        let tasks = vec![sample_task("task-123"), sample_task("task-456")];

        create(&first_path, &tasks).unwrap();
        create(&second_path, &tasks).unwrap();

        let first_bytes = std::fs::read(&first_path).unwrap();
        let second_bytes = std::fs::read(&second_path).unwrap();
        assert_eq!(first_bytes, second_bytes, "Same inputs must produce identical files");
    }

    #[test]
    fn test_create_overwrites_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("translations.bin");
        create(&path, &[sample_task("task-123"), sample_task("task-456")]).unwrap();
        create(&path, &[sample_task("task-123")]).unwrap();

        let package = TranslationPackage::open(&path).unwrap();
        assert_eq!(package.len(), 1);
        assert!(package.get_task("task-456").unwrap().is_none());
    }

    #[test]
    fn test_open_rejects_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("garbage.bin");
        std::fs::write(&path, b"NOTAPACKAGEFILE_WITH_SOME_LENGTH").unwrap();
        assert_matches!(TranslationPackage::open(&path), Err(PackageError::BadMagic));
    }

    #[test]
    fn test_open_rejects_unsupported_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("translations.bin");
        create(&path, &[sample_task("task-123")]).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[4] = 2; // version byte
        let tampered = dir.path().join("tampered.bin");
        std::fs::write(&tampered, bytes).unwrap();
        assert_matches!(
            TranslationPackage::open(&tampered),
            Err(PackageError::UnsupportedVersion(2))
        );
    }

    #[test]
    fn test_open_rejects_truncated_index() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("translations.bin");
        create(&path, &[sample_task("task-123")]).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let truncated = dir.path().join("truncated.bin");
        std::fs::write(&truncated, &bytes[..bytes.len() - 10]).unwrap();
        assert_matches!(
            TranslationPackage::open(&truncated),
            Err(PackageError::TruncatedIndex)
        );
    }

    #[test]
    fn test_open_rejects_index_offset_past_eof() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad_offset.bin");
        let mut bytes = PackageHeader { index_offset: 9999 }.pack().to_vec();
        bytes.extend_from_slice(&[0u8; 8]);
        std::fs::write(&path, bytes).unwrap();
        assert_matches!(
            TranslationPackage::open(&path),
            Err(PackageError::TruncatedIndex)
        );
    }

    #[test]
    fn test_open_rejects_entry_overflow() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("overflow.bin");
        // Header directly followed by the index: a single entry claiming a
        // 100-byte payload that cannot fit before the index region.
        let mut bytes = PackageHeader {
            index_offset: HEADER_SIZE as u64,
        }
        .pack()
        .to_vec();
        let entry = IndexEntry {
            task_id: "task-123".to_string(),
            size: 100,
            offset: HEADER_SIZE as u64,
        };
        bytes.extend_from_slice(&entry.pack().unwrap());
        std::fs::write(&path, bytes).unwrap();
        assert_matches!(
            TranslationPackage::open(&path),
            Err(PackageError::EntryOverflow)
        );
    }

    #[test]
    fn test_corrupt_payload_fails_decompression() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("translations.bin");
        create(&path, &[sample_task("task-123")]).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        // Scribble over the payload region, leaving header and index intact.
        for byte in bytes.iter_mut().skip(HEADER_SIZE).take(8) {
            *byte = !*byte;
        }
        let corrupt = dir.path().join("corrupt.bin");
        std::fs::write(&corrupt, bytes).unwrap();

        let package = TranslationPackage::open(&corrupt).unwrap();
        assert_matches!(
            package.get_task("task-123"),
            Err(PackageError::DecompressFailed(_))
        );
    }

    #[test]
    fn test_task_id_too_long_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("translations.bin");
        let task = TaskData::new("x".repeat(TASK_ID_SIZE + 1));
        assert_matches!(
            create(&path, &[task]),
            Err(PackageError::TaskIdTooLong(_))
        );
    }
}
