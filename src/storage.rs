//! Chunked, resumable workspace storage
//!
//! A workspace file is newline-delimited JSON:
//!
//! ```text
//! {"type":"meta","chunk_size":10000,"snapshot_interval":1}
//! {"type":"chunk","index":0,"count":10000,"payload":"...","registry_state":{...}}
//! {"type":"chunk","index":1,"count":420,"payload":"..."}
//! {"type":"summary","total_polygons":10420,"chunks":2}
//! ```
//!
//! Every `snapshot_interval`-th chunk embeds a full registry snapshot, so
//! decoding can start at any such chunk without reading what came before.

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::codec::{EncodedPolygon, PolyformDecoder, PolyformEncoder, Token};
use crate::config::StorageConfig;
use crate::error::{EngineError, Result};
use crate::registry::{RegistrySnapshot, SymbolRegistry};

/// Supplies encoded polygons in workspace order
pub trait EncodedPolygonProducer {
    fn iter_encoded_polygons(&self) -> Box<dyn Iterator<Item = EncodedPolygon> + '_>;
}

impl EncodedPolygonProducer for [EncodedPolygon] {
    fn iter_encoded_polygons(&self) -> Box<dyn Iterator<Item = EncodedPolygon> + '_> {
        Box::new(self.iter().copied())
    }
}

impl EncodedPolygonProducer for Vec<EncodedPolygon> {
    fn iter_encoded_polygons(&self) -> Box<dyn Iterator<Item = EncodedPolygon> + '_> {
        self.as_slice().iter_encoded_polygons()
    }
}

/// Receives decoded tokens one chunk at a time
pub trait TokenConsumer {
    fn ingest_tokens(&mut self, chunk_index: u64, tokens: Vec<Token>) -> Result<()>;
}

/// File layout parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageMeta {
    pub chunk_size: usize,
    pub snapshot_interval: usize,
}

/// One chunk of encoded polygons
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageChunk {
    pub index: u64,
    pub count: usize,
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_state: Option<RegistrySnapshot>,
}

/// Totals written after the last chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSummary {
    pub total_polygons: u64,
    pub chunks: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageRecord {
    Meta(StorageMeta),
    Chunk(StorageChunk),
    Summary(StorageSummary),
}

const RECORD_TYPES: [&str; 3] = ["meta", "chunk", "summary"];

impl StorageRecord {
    /// Parse one line, rejecting unknown record types
    pub fn parse(line: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(line)?;
        let record_type = value
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("<missing>");
        if !RECORD_TYPES.contains(&record_type) {
            return Err(EngineError::UnknownRecordType(record_type.to_string()));
        }
        Ok(serde_json::from_value(value)?)
    }
}

/// Saves and loads chunked workspace files under a base directory
#[derive(Debug, Clone)]
pub struct StorageManager {
    base_path: PathBuf,
    chunk_size: usize,
    snapshot_interval: usize,
}

impl StorageManager {
    pub fn new(base_path: impl Into<PathBuf>, config: &StorageConfig) -> Result<Self> {
        if config.chunk_size == 0 {
            return Err(EngineError::InvalidArgument("chunk_size must be positive".into()));
        }
        if config.snapshot_interval == 0 {
            return Err(EngineError::InvalidArgument(
                "snapshot_interval must be positive".into(),
            ));
        }

        let base_path = base_path.into();
        fs::create_dir_all(&base_path)?;

        Ok(Self {
            base_path,
            chunk_size: config.chunk_size,
            snapshot_interval: config.snapshot_interval,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn workspace_path(&self, name: &str) -> PathBuf {
        self.base_path.join(format!("{}.jsonl", name))
    }

    /// Stream a workspace to `<base>/<name>.jsonl`.
    ///
    /// The file is written beside the target and renamed into place once
    /// complete. On failure the staging file is removed and any existing
    /// target is left as it was.
    pub fn save_workspace(
        &self,
        name: &str,
        registry: &SymbolRegistry,
        producer: &(impl EncodedPolygonProducer + ?Sized),
    ) -> Result<PathBuf> {
        let target = self.workspace_path(name);
        let staging = self.base_path.join(format!("{}.jsonl.partial", name));

        let (total_polygons, chunks) = match self.write_staging(&staging, registry, producer) {
            Ok(totals) => totals,
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&staging) {
                    warn!(path = %staging.display(), error = %cleanup, "Failed to remove staging file");
                }
                return Err(e);
            }
        };
        fs::rename(&staging, &target)?;

        info!(path = %target.display(), total_polygons, chunks, "Saved workspace");
        Ok(target)
    }

    fn write_staging(
        &self,
        staging: &Path,
        registry: &SymbolRegistry,
        producer: &(impl EncodedPolygonProducer + ?Sized),
    ) -> Result<(u64, u64)> {
        let encoder = PolyformEncoder::new(registry);
        let mut writer = BufWriter::new(File::create(staging)?);
        write_record(
            &mut writer,
            &StorageRecord::Meta(StorageMeta {
                chunk_size: self.chunk_size,
                snapshot_interval: self.snapshot_interval,
            }),
        )?;

        let mut total_polygons: u64 = 0;
        let mut chunks: u64 = 0;
        let mut batch = Vec::with_capacity(self.chunk_size.min(4096));
        let mut polygons = producer.iter_encoded_polygons();

        loop {
            let next = polygons.next();
            if let Some(polygon) = next {
                batch.push(polygon);
            }
            let full = batch.len() >= self.chunk_size;
            let drained = next.is_none();
            if (full || drained) && !batch.is_empty() {
                let index = chunks;
                let registry_state = (index % self.snapshot_interval as u64 == 0)
                    .then(|| registry.export_state());
                let chunk = StorageChunk {
                    index,
                    count: batch.len(),
                    payload: encoder.encode_polygons(&batch)?,
                    registry_state,
                };
                debug!(index, count = chunk.count, snapshot = chunk.registry_state.is_some(), "Writing chunk");
                write_record(&mut writer, &StorageRecord::Chunk(chunk))?;
                total_polygons += batch.len() as u64;
                chunks += 1;
                batch.clear();
            }
            if drained {
                break;
            }
        }

        write_record(
            &mut writer,
            &StorageRecord::Summary(StorageSummary {
                total_polygons,
                chunks,
            }),
        )?;
        writer.flush()?;
        Ok((total_polygons, chunks))
    }

    /// Stream decoded chunks in file order.
    ///
    /// Embedded registry snapshots are applied to `registry` before the
    /// chunk carrying them is decoded.
    pub fn load_stream<'r>(&self, path: &Path, registry: &'r mut SymbolRegistry) -> Result<ChunkStream<'r>> {
        ChunkStream::open(path, registry, 0, false)
    }

    /// Stream decoded chunks starting at `index`.
    ///
    /// The first chunk yielded must carry a registry snapshot.
    pub fn resume_from<'r>(
        &self,
        path: &Path,
        index: u64,
        registry: &'r mut SymbolRegistry,
    ) -> Result<ChunkStream<'r>> {
        ChunkStream::open(path, registry, index, true)
    }

    /// Push every chunk into `consumer`, returning the number of chunks
    pub fn restore_to_workspace(
        &self,
        path: &Path,
        registry: &mut SymbolRegistry,
        consumer: &mut dyn TokenConsumer,
    ) -> Result<u64> {
        let mut chunks = 0;
        for chunk in self.load_stream(path, registry)? {
            let (index, tokens) = chunk?;
            consumer.ingest_tokens(index, tokens)?;
            chunks += 1;
        }
        info!(path = %path.display(), chunks, "Restored workspace");
        Ok(chunks)
    }

    /// The leading `meta` record, if the file has one
    pub fn read_meta(path: &Path) -> Result<Option<StorageMeta>> {
        let reader = BufReader::new(File::open(path)?);
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            return match StorageRecord::parse(&line)? {
                StorageRecord::Meta(meta) => Ok(Some(meta)),
                _ => Ok(None),
            };
        }
        Ok(None)
    }
}

fn write_record(writer: &mut impl Write, record: &StorageRecord) -> Result<()> {
    serde_json::to_writer(&mut *writer, record)?;
    writer.write_all(b"\n")?;
    Ok(())
}

/// Iterator over `(chunk_index, tokens)` read from a workspace file.
///
/// The first error ends the stream.
pub struct ChunkStream<'r> {
    lines: Lines<BufReader<File>>,
    registry: &'r mut SymbolRegistry,
    start_index: u64,
    require_snapshot: bool,
    finished: bool,
}

impl<'r> ChunkStream<'r> {
    fn open(
        path: &Path,
        registry: &'r mut SymbolRegistry,
        start_index: u64,
        require_snapshot: bool,
    ) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
            registry,
            start_index,
            require_snapshot,
            finished: false,
        })
    }

    fn decode_chunk(&mut self, chunk: StorageChunk) -> Result<(u64, Vec<Token>)> {
        if self.require_snapshot {
            if chunk.registry_state.is_none() {
                return Err(EngineError::MalformedStream(format!(
                    "chunk {} has no registry snapshot to resume from",
                    chunk.index
                )));
            }
            self.require_snapshot = false;
        }

        if let Some(state) = &chunk.registry_state {
            self.registry.load_state(state);
        }

        let tokens = PolyformDecoder::new(&*self.registry).decode(&chunk.payload)?;
        if tokens.len() != chunk.count {
            warn!(index = chunk.index, declared = chunk.count, decoded = tokens.len(), "Chunk count mismatch");
        }
        Ok((chunk.index, tokens))
    }

    fn next_chunk(&mut self) -> Option<Result<(u64, Vec<Token>)>> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };
            if line.trim().is_empty() {
                continue;
            }

            let record = match StorageRecord::parse(&line) {
                Ok(record) => record,
                Err(e) => return Some(Err(e)),
            };
            match record {
                StorageRecord::Meta(_) | StorageRecord::Summary(_) => continue,
                StorageRecord::Chunk(chunk) if chunk.index < self.start_index => continue,
                StorageRecord::Chunk(chunk) => return Some(self.decode_chunk(chunk)),
            }
        }
    }
}

impl Iterator for ChunkStream<'_> {
    type Item = Result<(u64, Vec<Token>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let item = self.next_chunk();
        if !matches!(item, Some(Ok(_))) {
            self.finished = true;
        }
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn polygons(n: u32) -> Vec<EncodedPolygon> {
        (0..n)
            .map(|i| EncodedPolygon::new(3 + i % 18, i % 25, i * 7, (i as i32 - 5, -(i as i32), 2)))
            .collect()
    }

    fn manager(dir: &TempDir, chunk_size: usize, snapshot_interval: usize) -> StorageManager {
        StorageManager::new(
            dir.path(),
            &StorageConfig {
                chunk_size,
                snapshot_interval,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_zero_parameters() {
        let temp_dir = TempDir::new().unwrap();
        for (chunk_size, snapshot_interval) in [(0, 1), (1, 0)] {
            let result = StorageManager::new(
                temp_dir.path(),
                &StorageConfig {
                    chunk_size,
                    snapshot_interval,
                },
            );
            assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
        }
    }

    #[test]
    fn test_chunk_boundaries_and_summary() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, 4, 2);
        let registry = SymbolRegistry::new();

        let path = manager
            .save_workspace("ws", &registry, &polygons(10))
            .unwrap();
        let content = fs::read_to_string(&path).unwrap();
        let records: Vec<StorageRecord> = content
            .lines()
            .map(|l| StorageRecord::parse(l).unwrap())
            .collect();

        assert_eq!(records.len(), 5);
        assert_eq!(
            records[0],
            StorageRecord::Meta(StorageMeta {
                chunk_size: 4,
                snapshot_interval: 2
            })
        );
        let counts: Vec<(u64, usize, bool)> = records[1..4]
            .iter()
            .map(|r| match r {
                StorageRecord::Chunk(c) => (c.index, c.count, c.registry_state.is_some()),
                other => panic!("expected chunk, got {:?}", other),
            })
            .collect();
        assert_eq!(counts, vec![(0, 4, true), (1, 4, false), (2, 2, true)]);
        assert_eq!(
            records[4],
            StorageRecord::Summary(StorageSummary {
                total_polygons: 10,
                chunks: 3
            })
        );
        assert!(!temp_dir.path().join("ws.jsonl.partial").exists());
    }

    #[test]
    fn test_failed_save_removes_staging_file() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, 2, 1);
        let registry = SymbolRegistry::new();

        let mut input = polygons(3);
        input.push(EncodedPolygon::at_origin(2));
        let result = manager.save_workspace("ws", &registry, &input);
        assert!(matches!(result, Err(EngineError::UnsupportedPolygon(2))));
        assert!(!temp_dir.path().join("ws.jsonl.partial").exists());
        assert!(!temp_dir.path().join("ws.jsonl").exists());

        // An earlier good save survives a later failed one
        let path = manager.save_workspace("ws", &registry, &polygons(3)).unwrap();
        let before = fs::read_to_string(&path).unwrap();
        assert!(manager.save_workspace("ws", &registry, &input).is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), before);
        assert!(!temp_dir.path().join("ws.jsonl.partial").exists());
    }

    #[test]
    fn test_empty_workspace_has_no_chunks() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, 4, 1);
        let mut registry = SymbolRegistry::new();

        let path = manager
            .save_workspace("empty", &registry, &Vec::<EncodedPolygon>::new())
            .unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 2);
        assert_eq!(manager.load_stream(&path, &mut registry).unwrap().count(), 0);
    }

    #[test]
    fn test_unknown_record_type_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bad.jsonl");
        fs::write(&path, "{\"type\":\"meta\",\"chunk_size\":1,\"snapshot_interval\":1}\n{\"type\":\"bogus\"}\n").unwrap();

        let manager = manager(&temp_dir, 1, 1);
        let mut registry = SymbolRegistry::new();
        let mut stream = manager.load_stream(&path, &mut registry).unwrap();

        match stream.next() {
            Some(Err(EngineError::UnknownRecordType(t))) => assert_eq!(t, "bogus"),
            other => panic!("unexpected: {:?}", other.map(|r| r.map(|(i, _)| i))),
        }
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_missing_meta_is_tolerated() {
        let temp_dir = TempDir::new().unwrap();
        let registry = SymbolRegistry::new();
        let payload = PolyformEncoder::new(&registry)
            .encode_polygons(&polygons(2))
            .unwrap();
        let chunk = StorageRecord::Chunk(StorageChunk {
            index: 0,
            count: 2,
            payload,
            registry_state: None,
        });
        let path = temp_dir.path().join("bare.jsonl");
        fs::write(&path, format!("\n{}\n", serde_json::to_string(&chunk).unwrap())).unwrap();

        assert_eq!(StorageManager::read_meta(&path).unwrap(), None);

        let manager = manager(&temp_dir, 1, 1);
        let mut registry = SymbolRegistry::new();
        let chunks: Vec<_> = manager
            .load_stream(&path, &mut registry)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].1.len(), 2);
    }

    #[test]
    fn test_resume_requires_snapshot() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, 2, 2);
        let registry = SymbolRegistry::new();
        let path = manager
            .save_workspace("ws", &registry, &polygons(6))
            .unwrap();

        let mut fresh = SymbolRegistry::new();
        let mut stream = manager.resume_from(&path, 1, &mut fresh).unwrap();
        assert!(matches!(
            stream.next(),
            Some(Err(EngineError::MalformedStream(_)))
        ));

        let mut fresh = SymbolRegistry::new();
        let indices: Vec<u64> = manager
            .resume_from(&path, 2, &mut fresh)
            .unwrap()
            .map(|c| c.unwrap().0)
            .collect();
        assert_eq!(indices, vec![2]);
    }
}
