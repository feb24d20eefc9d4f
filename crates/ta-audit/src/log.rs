// log.rs — Append-only, hash-chained JSONL audit log.
//
// One JSON object per line. Each event's `previous_hash` is the SHA-256 of
// the raw preceding line, so removing, inserting, or editing any line breaks
// the chain and `verify_chain` reports the first broken link.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::{Path, PathBuf};

use crate::error::AuditError;
use crate::event::AuditEvent;
use crate::hasher;

/// Non-blank lines of a log file with their 1-based line numbers.
struct LogLines {
    lines: Lines<BufReader<File>>,
    line_no: usize,
}

impl LogLines {
    fn open(path: &Path) -> Result<Self, AuditError> {
        let file = File::open(path).map_err(|source| AuditError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
            line_no: 0,
        })
    }
}

impl Iterator for LogLines {
    type Item = Result<(usize, String), AuditError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };
            self.line_no += 1;
            if !line.trim().is_empty() {
                return Some(Ok((self.line_no, line)));
            }
        }
    }
}

/// An append-only audit log backed by a JSONL file.
pub struct AuditLog {
    path: PathBuf,
    writer: BufWriter<File>,
    /// Digest of the newest line; the next event links to it.
    head: Option<String>,
}

impl AuditLog {
    /// Open a log, creating the file and its directory when missing. The
    /// chain continues from the last line already on disk.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        let head = if path.exists() {
            LogLines::open(&path)?
                .last()
                .transpose()?
                .map(|(_, line)| hasher::hash_str(&line))
        } else {
            None
        };

        match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => {
                fs::create_dir_all(dir).map_err(|source| AuditError::OpenFailed {
                    path: dir.to_path_buf(),
                    source,
                })?
            }
            _ => {}
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| AuditError::OpenFailed {
                path: path.clone(),
                source,
            })?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
            head,
        })
    }

    /// Link `event` to the chain head, write it and flush. The head moves
    /// only after the flush succeeds.
    pub fn append(&mut self, event: &mut AuditEvent) -> Result<(), AuditError> {
        event.previous_hash = self.head.clone();
        let line = serde_json::to_string(event)?;
        writeln!(self.writer, "{}", line)?;
        self.writer.flush()?;
        self.head = Some(hasher::hash_str(&line));
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every event in the file, oldest first.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<AuditEvent>, AuditError> {
        LogLines::open(path.as_ref())?
            .map(|entry| {
                let (_, line) = entry?;
                Ok(serde_json::from_str(&line)?)
            })
            .collect()
    }

    /// Events about one capability, oldest first. `action_id` narrows to a
    /// single action when given.
    pub fn read_subject(
        path: impl AsRef<Path>,
        capability_id: &str,
        action_id: Option<&str>,
    ) -> Result<Vec<AuditEvent>, AuditError> {
        Ok(Self::read_all(path)?
            .into_iter()
            .filter(|e| e.capability_id.as_deref() == Some(capability_id))
            .filter(|e| action_id.is_none() || e.action_id.as_deref() == action_id)
            .collect())
    }

    /// `Ok(true)` when every link holds; otherwise an `IntegrityViolation`
    /// naming the first line whose `previous_hash` is wrong.
    pub fn verify_chain(path: impl AsRef<Path>) -> Result<bool, AuditError> {
        let mut expected: Option<String> = None;
        for entry in LogLines::open(path.as_ref())? {
            let (line_no, line) = entry?;
            let event: AuditEvent = serde_json::from_str(&line)?;
            if event.previous_hash != expected {
                let none = || "None".to_string();
                return Err(AuditError::IntegrityViolation {
                    line: line_no,
                    expected: expected.unwrap_or_else(none),
                    actual: event.previous_hash.unwrap_or_else(none),
                });
            }
            // The raw line, not a re-serialization.
            expected = Some(hasher::hash_str(&line));
        }
        Ok(true)
    }
}
