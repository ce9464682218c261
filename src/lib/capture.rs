//! Traffic capture for proxied connections.
//!
//! A capture file starts with one line of JSON metadata, followed by records
//! of `direction: u8`, `unix_millis: u64 BE`, `len: u32 BE` and the payload.
//! Writing happens on its own task, the relay only pushes into a bounded
//! channel and drops chunks when the writer falls behind.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

const QUEUE: usize = 1024;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("io error")]
    Io(#[from] std::io::Error),
    #[error("bad header")]
    Json(#[from] serde_json::Error),
    #[error("truncated record")]
    Truncated,
    #[error("unknown direction {0}")]
    Direction(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureMeta {
    pub challenge: i64,
    pub team: Option<i64>,
    pub participation: Option<i64>,
    pub instance: Uuid,
    pub container: Option<String>,
    pub flag: Option<String>,
    pub client: String,
    pub target: String,
    pub started_at: DateTime<Utc>,
}

impl CaptureMeta {
    /// `{dir}/{challenge}/{participation}/{timestamp}-{instance}.cap`
    pub fn path(&self, dir: &Path) -> PathBuf {
        let participation = self
            .participation
            .map_or_else(|| "noinst".to_string(), |p| p.to_string());
        dir.join(self.challenge.to_string())
            .join(participation)
            .join(format!(
                "{}-{}.cap",
                self.started_at.format("%Y%m%dT%H%M%S%.3f"),
                self.instance.simple()
            ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// client to target
    Upstream = 0,
    /// target to client
    Downstream = 1,
}

impl TryFrom<u8> for Direction {
    type Error = CaptureError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Upstream),
            1 => Ok(Self::Downstream),
            other => Err(CaptureError::Direction(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub direction: Direction,
    pub at: DateTime<Utc>,
    pub data: Vec<u8>,
}

/// Relay side of a capture
#[derive(Clone)]
pub struct Capture {
    tx: flume::Sender<Record>,
}

/// Writer side, await [`CaptureTask::finish`] once the relay is done
pub struct CaptureTask {
    path: PathBuf,
    handle: JoinHandle<Result<u64, CaptureError>>,
}

impl Capture {
    /// Creates the file and writes the header. Fails without side effects
    /// on the relay, the caller just proxies without capture.
    pub async fn open(dir: &Path, meta: &CaptureMeta) -> Result<(Self, CaptureTask), CaptureError> {
        let path = meta.path(dir);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = BufWriter::new(File::create(&path).await?);
        let mut header = serde_json::to_vec(meta)?;
        header.push(b'\n');
        file.write_all(&header).await?;

        let (tx, rx) = flume::bounded::<Record>(QUEUE);
        let handle = tokio::spawn(async move {
            let mut written = 0u64;
            while let Ok(record) = rx.recv_async().await {
                file.write_u8(record.direction as u8).await?;
                file.write_u64(record.at.timestamp_millis().max(0) as u64)
                    .await?;
                file.write_u32(record.data.len() as u32).await?;
                file.write_all(&record.data).await?;
                written += 1;
            }
            file.flush().await?;
            Ok::<_, CaptureError>(written)
        });

        debug!(path = %path.display(), "capture started");
        Ok((Self { tx }, CaptureTask { path, handle }))
    }

    /// Queues a chunk, returns false once the writer is gone
    pub fn record(&self, direction: Direction, data: &[u8]) -> bool {
        let record = Record {
            direction,
            at: Utc::now(),
            data: data.to_vec(),
        };

        match self.tx.try_send(record) {
            Ok(()) => true,
            Err(flume::TrySendError::Full(_)) => {
                debug!("capture queue full, dropping chunk");
                true
            }
            Err(flume::TrySendError::Disconnected(_)) => false,
        }
    }
}

impl CaptureTask {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Waits for the writer to flush. All [`Capture`] handles must be dropped
    /// first.
    pub async fn finish(self) -> Option<u64> {
        match self.handle.await {
            Ok(Ok(records)) => Some(records),
            Ok(Err(e)) => {
                warn!(path = %self.path.display(), "capture failed: {:?}", e);
                None
            }
            Err(e) => {
                warn!(path = %self.path.display(), "capture writer panicked: {:?}", e);
                None
            }
        }
    }
}

/// Reads back a capture file
pub fn parse(bytes: &[u8]) -> Result<(CaptureMeta, Vec<Record>), CaptureError> {
    let newline = bytes
        .iter()
        .position(|b| *b == b'\n')
        .ok_or(CaptureError::Truncated)?;
    let meta = serde_json::from_slice(&bytes[..newline])?;

    let mut records = Vec::new();
    let mut rest = &bytes[newline + 1..];
    while !rest.is_empty() {
        if rest.len() < 13 {
            return Err(CaptureError::Truncated);
        }
        let direction = Direction::try_from(rest[0])?;
        let mut millis = [0u8; 8];
        millis.copy_from_slice(&rest[1..9]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&rest[9..13]);
        let len = u32::from_be_bytes(len) as usize;

        let data = rest.get(13..13 + len).ok_or(CaptureError::Truncated)?;
        let at = Utc
            .timestamp_millis_opt(u64::from_be_bytes(millis) as i64)
            .single()
            .ok_or(CaptureError::Truncated)?;

        records.push(Record {
            direction,
            at,
            data: data.to_vec(),
        });
        rest = &rest[13 + len..];
    }

    Ok((meta, records))
}
