//! The JSON-lines stream shared by the listener (writer) and the display
//! (reader). One writer appends, readers tail from their own offset.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{HrError, Result};

pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HrSample {
    pub ts: f64,
    pub bpm: u16,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// RR intervals in milliseconds.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rr: Vec<f64>,
}

impl HrSample {
    pub fn new(bpm: u16, source: impl Into<String>) -> Self {
        HrSample {
            ts: now_secs(),
            bpm,
            source: source.into(),
            id: None,
            rr: vec![],
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_rr(mut self, rr: Vec<f64>) -> Self {
        self.rr = rr;
        self
    }
}

pub struct StreamWriter {
    path: PathBuf,
    file: File,
}

impl StreamWriter {
    pub fn open(path: &Path, truncate: bool) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| HrError::io(parent, e))?;
        }
        if truncate {
            File::create(path).map_err(|e| HrError::io(path, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| HrError::io(path, e))?;

        Ok(StreamWriter {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, sample: &HrSample) -> Result<()> {
        let mut line = serde_json::to_string(sample).map_err(|e| HrError::json(&self.path, e))?;
        line.push('\n');
        // One write per line so a reader never sees two half records interleaved.
        self.file
            .write_all(line.as_bytes())
            .and_then(|_| self.file.flush())
            .map_err(|e| HrError::io(&self.path, e))
    }
}

/// A line as the display sees it. Older producers omit most fields.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    pub ts: Option<f64>,
    pub bpm: u16,
    pub source: String,
}

pub fn parse_line(line: &str) -> Option<StreamRecord> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let value: Value = serde_json::from_str(line).ok()?;
    let object = value.as_object()?;

    let bpm = match object.get("bpm")? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !(0.0..=f64::from(u16::MAX)).contains(&bpm) {
        return None;
    }
    let bpm = bpm as u16;

    let source = ["source", "device", "id"]
        .iter()
        .filter_map(|key| object.get(*key))
        .find_map(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_else(|| "unknown".to_string());

    Some(StreamRecord {
        ts: object.get("ts").and_then(Value::as_f64),
        bpm,
        source,
    })
}

/// Follows a file that is appended to by another process.
pub struct FileTail {
    path: PathBuf,
    pos: u64,
    inode: Option<u64>,
}

impl FileTail {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileTail {
            path: path.into(),
            pos: 0,
            inode: None,
        }
    }

    /// Starts at the current end of the file so only new lines are seen.
    pub fn from_end(path: impl Into<PathBuf>) -> Self {
        let mut tail = FileTail::new(path);
        if let Ok(meta) = fs::metadata(&tail.path) {
            tail.pos = meta.len();
            tail.inode = file_identity(&meta);
        }
        tail
    }

    /// Complete lines appended since the last call. A trailing partial line
    /// is left for the next call.
    pub fn read_new_lines(&mut self) -> Result<Vec<String>> {
        let meta = match fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(HrError::io(&self.path, e)),
        };

        let inode = file_identity(&meta);
        if self.inode != inode || meta.len() < self.pos {
            self.inode = inode;
            self.pos = 0;
        }
        if meta.len() == self.pos {
            return Ok(vec![]);
        }

        let mut file = File::open(&self.path).map_err(|e| HrError::io(&self.path, e))?;
        file.seek(SeekFrom::Start(self.pos))
            .map_err(|e| HrError::io(&self.path, e))?;
        let mut buf = vec![];
        file.read_to_end(&mut buf)
            .map_err(|e| HrError::io(&self.path, e))?;

        let Some(end) = buf.iter().rposition(|b| *b == b'\n') else {
            return Ok(vec![]);
        };
        self.pos += end as u64 + 1;

        let lines = String::from_utf8_lossy(&buf[..end])
            .lines()
            .map(str::to_string)
            .collect();
        Ok(lines)
    }
}

#[cfg(unix)]
fn file_identity(meta: &fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(meta.ino())
}

#[cfg(not(unix))]
fn file_identity(_meta: &fs::Metadata) -> Option<u64> {
    None
}
