use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::warn;

use crate::api::AuditSink;
use crate::errors::AuditError;
use crate::metrics;
use crate::model::{AuditEvent, AuditFilter};

/// Configuration for the durable journal sink.
#[derive(Clone, Debug)]
pub struct JournalConfig {
    pub root: PathBuf,
    /// Rotate the active segment once it grows past this many bytes.
    pub rotate_bytes: u64,
    /// Compress closed segments with zstd.
    pub compress_rotated: bool,
}

impl JournalConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            rotate_bytes: 64 * 1024 * 1024,
            compress_rotated: false,
        }
    }
}

/// Durable audit sink: append-only JSONL segments under one directory,
/// flushed and synced per append so a confirmed event survives a crash.
/// Closed segments may be zstd-compressed; queries scan all segments.
pub struct JournalAuditCenter {
    cfg: JournalConfig,
    state: Mutex<WriterState>,
}

struct WriterState {
    sink: Option<Segment>,
    bytes_written: u64,
    sequence: u64,
}

struct Segment {
    writer: BufWriter<File>,
    file: File,
    path: PathBuf,
}

impl JournalAuditCenter {
    pub fn open(cfg: JournalConfig) -> Result<Arc<Self>, AuditError> {
        fs::create_dir_all(&cfg.root)?;
        let sequence = segment_paths(&cfg.root)?.len() as u64;
        Ok(Arc::new(Self {
            cfg,
            state: Mutex::new(WriterState {
                sink: None,
                bytes_written: 0,
                sequence,
            }),
        }))
    }

    fn append_line(&self, line: &[u8], ts: DateTime<Utc>) -> Result<(), AuditError> {
        let mut state = self.state.lock();
        let rotate = match &state.sink {
            None => true,
            Some(_) => self.cfg.rotate_bytes > 0 && state.bytes_written >= self.cfg.rotate_bytes,
        };
        if rotate {
            self.rotate(&mut state, ts)?;
        }
        let segment = state.sink.as_mut().expect("segment must be open");
        segment.writer.write_all(line)?;
        segment.writer.write_all(b"\n")?;
        segment.writer.flush()?;
        segment.file.sync_data()?;
        state.bytes_written += line.len() as u64 + 1;
        Ok(())
    }

    fn rotate(&self, state: &mut WriterState, ts: DateTime<Utc>) -> Result<(), AuditError> {
        let closed = state.sink.take();
        if let Some(mut segment) = closed {
            segment.writer.flush()?;
            segment.file.sync_data()?;
            if self.cfg.compress_rotated {
                if let Err(err) = compress_segment(&segment.path) {
                    warn!(target: "audit", %err, "segment compression failed; keeping plain file");
                }
            }
        }

        state.sequence = state.sequence.wrapping_add(1);
        let path = self.cfg.root.join(format!(
            "audit-{}-{:04}.jsonl",
            ts.format("%Y%m%dT%H%M%S"),
            state.sequence
        ));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let sync_file = file.try_clone()?;
        state.sink = Some(Segment {
            writer: BufWriter::new(file),
            file: sync_file,
            path,
        });
        state.bytes_written = 0;
        Ok(())
    }
}

#[async_trait]
impl AuditSink for JournalAuditCenter {
    async fn append(&self, event: AuditEvent) -> Result<(), AuditError> {
        let line = serde_json::to_vec(&event)?;
        match self.append_line(&line, event.recorded_at) {
            Ok(()) => {
                metrics::record_appended();
                Ok(())
            }
            Err(err) => {
                metrics::record_write_error();
                Err(err)
            }
        }
    }

    async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>, AuditError> {
        metrics::record_query();
        let mut out = Vec::new();
        for path in segment_paths(&self.cfg.root)? {
            read_segment(&path, filter, &mut out)?;
            if let Some(limit) = filter.limit {
                if out.len() >= limit {
                    out.truncate(limit);
                    break;
                }
            }
        }
        Ok(out)
    }
}

fn segment_paths(root: &Path) -> Result<Vec<PathBuf>, AuditError> {
    let mut paths: Vec<PathBuf> = Vec::new();
    if !root.exists() {
        return Ok(paths);
    }
    for entry in fs::read_dir(root)? {
        let path = entry?.path();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if name.starts_with("audit-") && (name.ends_with(".jsonl") || name.ends_with(".jsonl.zst"))
        {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

fn read_segment(
    path: &Path,
    filter: &AuditFilter,
    out: &mut Vec<AuditEvent>,
) -> Result<(), AuditError> {
    let file = File::open(path)?;
    let reader: Box<dyn std::io::Read> = if path.extension().and_then(|e| e.to_str()) == Some("zst")
    {
        Box::new(zstd::stream::read::Decoder::new(file)?)
    } else {
        Box::new(file)
    };
    for line in BufReader::new(reader).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AuditEvent>(&line) {
            Ok(event) => {
                if filter.matches(&event) {
                    out.push(event);
                }
            }
            Err(err) => {
                warn!(target: "audit", %err, path = %path.display(), "skipping unreadable audit line");
            }
        }
    }
    Ok(())
}

fn compress_segment(path: &Path) -> std::io::Result<()> {
    let compressed = path.with_extension("jsonl.zst");
    let input = File::open(path)?;
    let output = File::create(&compressed)?;
    zstd::stream::copy_encode(input, output, 3)?;
    fs::remove_file(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AuditKind;
    use gatehouse_core_types::ActorId;

    #[tokio::test]
    async fn appended_events_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let actor = ActorId::new();
        {
            let center = JournalAuditCenter::open(JournalConfig::new(dir.path())).unwrap();
            center
                .append(AuditEvent::new(AuditKind::DecisionDenied, Utc::now()).actor(actor.clone()))
                .await
                .unwrap();
        }
        let center = JournalAuditCenter::open(JournalConfig::new(dir.path())).unwrap();
        let events = center.query(&AuditFilter::default()).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].actor, Some(actor));
    }

    #[tokio::test]
    async fn rotation_splits_segments_and_query_spans_them() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = JournalConfig::new(dir.path());
        cfg.rotate_bytes = 1;
        let center = JournalAuditCenter::open(cfg).unwrap();
        for _ in 0..3 {
            center
                .append(AuditEvent::new(AuditKind::TaskQueued, Utc::now()))
                .await
                .unwrap();
        }
        assert!(segment_paths(dir.path()).unwrap().len() >= 2);
        let events = center.query(&AuditFilter::default()).await.unwrap();
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn compressed_segments_are_still_readable() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = JournalConfig::new(dir.path());
        cfg.rotate_bytes = 1;
        cfg.compress_rotated = true;
        let center = JournalAuditCenter::open(cfg).unwrap();
        for _ in 0..3 {
            center
                .append(AuditEvent::new(AuditKind::TaskSucceeded, Utc::now()))
                .await
                .unwrap();
        }
        let events = center.query(&AuditFilter::default()).await.unwrap();
        assert_eq!(events.len(), 3);
    }
}
