//! Append-only record journal
//!
//! Each frame is a u32 length prefix followed by a little-endian payload:
//! `id u64, fingerprint u64, time_ms u64, published_ms u64, score f32,`
//! then the labels as `(name_len u16, name, value_len u16, value)` pairs
//! until the payload ends. The journal is the durability boundary: a
//! record exists iff its frame is fully on disk. Vectors live in the
//! matrix at row `id`.

use crate::error::{Error, Result};
use crate::model::Labels;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, TimeZone, Utc};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

pub const JOURNAL_FILE: &str = "journal.log";

/// Upper bound on one frame; anything larger is corruption, not a record.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// One journal entry. The in-memory form of a stored record minus its vector.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalRecord {
    pub id: u64,
    pub fingerprint: u64,
    pub time: DateTime<Utc>,
    pub published_at: DateTime<Utc>,
    pub score: f32,
    pub labels: Labels,
}

/// Append handle with batched fsync.
pub struct JournalWriter {
    file: File,
    path: PathBuf,
    appends_since_sync: u64,
    fsync_every: u64,
}

impl JournalWriter {
    pub fn open(dir: &Path, fsync_every: u64) -> Result<Self> {
        let path = dir.join(JOURNAL_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        file.seek(SeekFrom::End(0))?;
        Ok(Self {
            file,
            path,
            appends_since_sync: 0,
            fsync_every: fsync_every.max(1),
        })
    }

    pub fn append(&mut self, record: &JournalRecord) -> Result<()> {
        let payload = encode(record)?;
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.write_u32::<LittleEndian>(payload.len() as u32)?;
        frame.extend_from_slice(&payload);
        self.file.write_all(&frame)?;

        self.appends_since_sync += 1;
        if self.appends_since_sync >= self.fsync_every {
            self.sync()?;
        }
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        self.appends_since_sync = 0;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn encode(record: &JournalRecord) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(64);
    buf.write_u64::<LittleEndian>(record.id)?;
    buf.write_u64::<LittleEndian>(record.fingerprint)?;
    buf.write_u64::<LittleEndian>(record.time.timestamp_millis() as u64)?;
    buf.write_u64::<LittleEndian>(record.published_at.timestamp_millis() as u64)?;
    buf.write_f32::<LittleEndian>(record.score)?;
    for (name, value) in &record.labels {
        if name.len() > u16::MAX as usize || value.len() > u16::MAX as usize {
            return Err(Error::Internal(format!(
                "label too long to journal: {} bytes",
                name.len().max(value.len())
            )));
        }
        buf.write_u16::<LittleEndian>(name.len() as u16)?;
        buf.extend_from_slice(name.as_bytes());
        buf.write_u16::<LittleEndian>(value.len() as u16)?;
        buf.extend_from_slice(value.as_bytes());
    }
    Ok(buf)
}

fn decode(payload: &[u8]) -> Result<JournalRecord> {
    let mut cursor = std::io::Cursor::new(payload);
    let id = cursor.read_u64::<LittleEndian>().map_err(bad_frame)?;
    let fingerprint = cursor.read_u64::<LittleEndian>().map_err(bad_frame)?;
    let time_ms = cursor.read_u64::<LittleEndian>().map_err(bad_frame)?;
    let published_ms = cursor.read_u64::<LittleEndian>().map_err(bad_frame)?;
    let score = cursor.read_f32::<LittleEndian>().map_err(bad_frame)?;

    let mut labels = Labels::new();
    while (cursor.position() as usize) < payload.len() {
        let name = read_string(&mut cursor, payload)?;
        let value = read_string(&mut cursor, payload)?;
        labels.insert(name, value);
    }

    Ok(JournalRecord {
        id,
        fingerprint,
        time: millis_to_datetime(time_ms)?,
        published_at: millis_to_datetime(published_ms)?,
        score,
        labels,
    })
}

fn read_string(cursor: &mut std::io::Cursor<&[u8]>, payload: &[u8]) -> Result<String> {
    let len = cursor.read_u16::<LittleEndian>().map_err(bad_frame)? as usize;
    let start = cursor.position() as usize;
    let end = start + len;
    if end > payload.len() {
        return Err(Error::Corruption("label overruns journal frame".into()));
    }
    let s = std::str::from_utf8(&payload[start..end])
        .map_err(|_| Error::Corruption("label is not valid UTF-8".into()))?
        .to_string();
    cursor.set_position(end as u64);
    Ok(s)
}

fn bad_frame(_: std::io::Error) -> Error {
    Error::Corruption("truncated journal frame payload".into())
}

fn millis_to_datetime(ms: u64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms as i64)
        .single()
        .ok_or_else(|| Error::Corruption(format!("timestamp out of range: {}", ms)))
}

/// Replay outcome: the decoded records plus whether a trailing partial
/// frame was truncated away.
pub struct Replay {
    pub records: Vec<JournalRecord>,
    pub truncated: bool,
}

/// Replay a journal from the start. A short frame at the tail is cut off
/// (interrupted append); an undecodable frame earlier is `Corruption`.
pub fn replay(dir: &Path) -> Result<Replay> {
    let path = dir.join(JOURNAL_FILE);
    let file = match File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Ok(Replay {
                records: Vec::new(),
                truncated: false,
            })
        }
        Err(e) => return Err(e.into()),
    };
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let mut records = Vec::new();
    let mut valid_end: u64 = 0;
    let mut truncated = false;

    loop {
        let len = match reader.read_u32::<LittleEndian>() {
            Ok(len) => len,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                // Clean EOF at a frame boundary, or a partial length prefix.
                truncated = file_len > valid_end;
                break;
            }
            Err(e) => return Err(e.into()),
        };
        if len > MAX_FRAME_LEN {
            return Err(Error::Corruption(format!(
                "journal frame length {} exceeds limit",
                len
            )));
        }
        let mut payload = vec![0u8; len as usize];
        match reader.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                truncated = true;
                break;
            }
            Err(e) => return Err(e.into()),
        }
        let record = decode(&payload)?;
        if record.id != records.len() as u64 {
            return Err(Error::Corruption(format!(
                "journal id {} out of sequence (expected {})",
                record.id,
                records.len()
            )));
        }
        records.push(record);
        valid_end += 4 + len as u64;
    }

    if truncated {
        warn!(
            path = %path.display(),
            valid_end,
            file_len,
            "truncating partial journal frame"
        );
        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(valid_end)?;
        file.sync_data()?;
    }

    Ok(Replay { records, truncated })
}
