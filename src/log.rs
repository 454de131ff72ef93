//! Per-bucket append-only log: length-prefixed `INSERT`/`DELETE` records,
//! a write buffer, and compaction (§4.7, §6).

use std::fs;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::entry::{Entry, EntryOptions};
use crate::error::{Error, Result};

const COMPACT_CHUNK: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Insert,
    Delete,
}

impl RecordKind {
    fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Insert => "INSERT",
            RecordKind::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub kind: RecordKind,
    pub key: String,
    pub value: String,
    pub does_expire: bool,
    pub does_invalidate: bool,
    pub expires: i64,
    pub invalidates: i64,
    pub tolerance: f64,
}

impl LogRecord {
    pub fn from_entry(kind: RecordKind, entry: &Entry) -> LogRecord {
        let opts = entry.options();
        LogRecord {
            kind,
            key: entry.key().to_string(),
            value: entry.value().to_string(),
            does_expire: opts.does_expire(),
            does_invalidate: opts.does_invalidate(),
            expires: opts.expires.unwrap_or(0),
            invalidates: opts.invalidates.unwrap_or(0),
            tolerance: opts.tolerance,
        }
    }

    pub fn to_entry(&self) -> Entry {
        let mut opts = EntryOptions::new().tolerance(self.tolerance);
        if self.does_expire {
            opts = opts.expires_at(crate::entry::from_epoch_millis(self.expires));
        }
        if self.does_invalidate {
            opts = opts.invalidates_at(crate::entry::from_epoch_millis(self.invalidates));
        }
        Entry::new(self.key.clone(), self.value.clone(), opts)
    }

    /// Body line, WITHOUT the trailing newline (the caller appends it and
    /// accounts for it in the length prefix, per §6).
    fn encode_body(&self) -> String {
        format!(
            "{}~{}~{}~{}~{}~{}~{}~{}",
            self.kind.as_str(),
            self.key,
            self.value,
            bool01(self.does_expire),
            bool01(self.does_invalidate),
            self.expires,
            self.invalidates,
            self.tolerance,
        )
    }

    fn parse_body(body: &str) -> Result<LogRecord> {
        let mut head = body.splitn(3, '~');
        let kind = head.next().unwrap_or("");
        let key = head.next().ok_or_else(|| Error::Parse(format!("truncated log record: {:?}", body)))?;
        let rest = head.next().ok_or_else(|| Error::Parse(format!("truncated log record: {:?}", body)))?;

        let kind = match kind {
            "INSERT" => RecordKind::Insert,
            "DELETE" => RecordKind::Delete,
            other => return Err(Error::Parse(format!("unrecognized log record type {:?}", other))),
        };

        // rest = "<value>~<doesExp>~<doesInv>~<exp>~<inv>~<tol>"; split from
        // the right so a literal '~' inside the JSON value is preserved.
        let mut tail: Vec<&str> = rest.rsplitn(6, '~').collect();
        if tail.len() != 6 {
            return Err(Error::Parse(format!("truncated log record tail: {:?}", body)));
        }
        tail.reverse();
        let value = tail[0].to_string();
        let does_expire = parse01(tail[1], "doesExp")?;
        let does_invalidate = parse01(tail[2], "doesInv")?;
        let expires: i64 = tail[3].trim().parse().map_err(|_| Error::Parse(format!("bad expUnix in {:?}", body)))?;
        let invalidates: i64 = tail[4].trim().parse().map_err(|_| Error::Parse(format!("bad invUnix in {:?}", body)))?;
        let tolerance: f64 = tail[5].trim().parse().map_err(|_| Error::Parse(format!("bad tol in {:?}", body)))?;

        Ok(LogRecord {
            kind,
            key: key.to_string(),
            value,
            does_expire,
            does_invalidate,
            expires,
            invalidates,
            tolerance,
        })
    }
}

fn bool01(b: bool) -> &'static str {
    if b {
        "1"
    } else {
        "0"
    }
}

fn parse01(s: &str, context: &str) -> Result<bool> {
    match s.trim() {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(Error::Parse(format!("{}: expected 0/1, got {:?}", context, other))),
    }
}

fn write_record<W: Write>(w: &mut W, record: &LogRecord) -> Result<()> {
    let mut body = record.encode_body();
    body.push('\n');
    writeln!(w, "{}", body.len()).map_err(|e| Error::io("write log length prefix", e))?;
    w.write_all(body.as_bytes()).map_err(|e| Error::io("write log body", e))?;
    Ok(())
}

/// Read every record from `path`, stopping cleanly at EOF. A length prefix
/// with nothing at all following it (the file ends right after the prefix
/// line, e.g. a crash between writing the prefix and its body) is treated
/// as the log's effective end, not a parse error. A length prefix followed
/// by a *short* body — some bytes present but fewer than declared — is a
/// genuine declared-length mismatch and aborts recovery with a parse error
/// (§8).
pub fn read_all(path: &Path) -> Result<Vec<LogRecord>> {
    let f = fs::File::open(path).map_err(|e| Error::io(format!("open log {:?}", path), e))?;
    let mut reader = BufReader::new(f);
    let mut out = Vec::new();
    loop {
        let mut len_line = String::new();
        let n = read_line(&mut reader, &mut len_line).map_err(|e| Error::io("read log length prefix", e))?;
        if n == 0 {
            break;
        }
        let len: usize = match len_line.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(target: "log", "malformed length prefix {:?} in {:?}, stopping replay", len_line, path);
                break;
            }
        };
        let mut body = vec![0u8; len];
        let mut filled = 0usize;
        while filled < len {
            let n = reader.read(&mut body[filled..]).map_err(|e| Error::io("read log body", e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            warn!(target: "log", "log {:?} ends after a length prefix with no body, stopping replay", path);
            break;
        }
        if filled < len {
            return Err(Error::Parse(format!(
                "log record in {:?} declared length {} but only {} bytes follow",
                path, len, filled
            )));
        }
        let body = String::from_utf8(body).map_err(|e| Error::Parse(format!("non-utf8 log record: {}", e)))?;
        out.push(LogRecord::parse_body(body.trim_end_matches('\n'))?);
    }
    Ok(out)
}

fn read_line<R: Read>(r: &mut R, buf: &mut String) -> std::io::Result<usize> {
    let mut total = 0;
    let mut byte = [0u8; 1];
    loop {
        match r.read(&mut byte)? {
            0 => break,
            n => {
                total += n;
                if byte[0] == b'\n' {
                    break;
                }
                buf.push(byte[0] as char);
            }
        }
    }
    Ok(total)
}

/// Handle to a bucket's append log: an open file plus an in-memory write
/// buffer, flushed and synced per the policies in §5.
pub struct BucketLog {
    path: PathBuf,
    file: fs::File,
    buffer: Vec<u8>,
    record_count: u64,
}

impl BucketLog {
    pub fn open(path: impl AsRef<Path>) -> Result<BucketLog> {
        let path = path.as_ref().to_path_buf();
        let existing = if path.exists() { read_all(&path)?.len() as u64 } else { 0 };
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::io(format!("open log {:?}", path), e))?;
        Ok(BucketLog {
            path,
            file,
            buffer: Vec::new(),
            record_count: existing,
        })
    }

    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Queue a record into the write buffer; does not touch disk.
    pub fn append(&mut self, record: &LogRecord) -> Result<()> {
        write_record(&mut self.buffer, record)?;
        self.record_count += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.file
            .write_all(&self.buffer)
            .map_err(|e| Error::io(format!("flush log {:?}", self.path), e))?;
        self.buffer.clear();
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.flush()?;
        self.file.sync_all().map_err(|e| Error::io(format!("fsync log {:?}", self.path), e))
    }

    /// Compaction per §4.7: stream one `INSERT` per live entry (in primary
    /// order) into a sibling temp file, fsync it, then atomically rename it
    /// over the live log. The rename is the only atomic boundary — a crash
    /// before it leaves the pre-compaction log untouched.
    pub fn compact<'a>(&mut self, entries: impl Iterator<Item = &'a Arc<Entry>>) -> Result<()> {
        self.flush()?;
        let tmp_path = tmp_path_for(&self.path);
        info!(target: "log", "compacting {:?} via {:?}", self.path, tmp_path);
        let mut tmp = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|e| Error::io(format!("create compaction temp {:?}", tmp_path), e))?;

        let mut chunk = Vec::with_capacity(COMPACT_CHUNK);
        let mut count = 0u64;
        for entry in entries {
            let record = LogRecord::from_entry(RecordKind::Insert, entry);
            write_record(&mut chunk, &record)?;
            count += 1;
            if chunk.len() >= COMPACT_CHUNK {
                tmp.write_all(&chunk).map_err(|e| Error::io("write compaction chunk", e))?;
                chunk.clear();
            }
        }
        if !chunk.is_empty() {
            tmp.write_all(&chunk).map_err(|e| Error::io("write compaction chunk", e))?;
        }
        tmp.sync_all().map_err(|e| Error::io("fsync compaction temp", e))?;
        drop(tmp);

        // Drop the live handle before replacing the file on disk.
        let new_file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&tmp_path)
            .map_err(|e| Error::io("reopen compaction temp", e))?;
        drop(new_file);

        fs::rename(&tmp_path, &self.path).map_err(|e| Error::io("rename compacted log into place", e))?;
        self.file = fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| Error::io(format!("reopen log {:?}", self.path), e))?;
        self.record_count = count;
        debug!(target: "log", "compacted {:?} to {} records", self.path, count);
        Ok(())
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".tmp");
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryOptions;
    use tempfile::tempdir;

    fn record(kind: RecordKind, key: &str, value: &str) -> LogRecord {
        LogRecord::from_entry(kind, &Entry::new(key, value, EntryOptions::new()))
    }

    #[test]
    fn record_round_trips_through_body_encoding() {
        let r = record(RecordKind::Insert, "k1", r#"{"v":1}"#);
        let body = r.encode_body();
        assert_eq!(LogRecord::parse_body(&body).unwrap(), r);
    }

    #[test]
    fn value_containing_tilde_round_trips() {
        let r = record(RecordKind::Insert, "k1", r#"{"v":"a~b"}"#);
        let body = r.encode_body();
        assert_eq!(LogRecord::parse_body(&body).unwrap(), r);
    }

    #[test]
    fn append_flush_and_read_all() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("b.stitch");
        {
            let mut log = BucketLog::open(&path).unwrap();
            log.append(&record(RecordKind::Insert, "a", "1")).unwrap();
            log.append(&record(RecordKind::Delete, "a", "1")).unwrap();
            log.flush().unwrap();
        }
        let records = read_all(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, RecordKind::Insert);
        assert_eq!(records[1].kind, RecordKind::Delete);
    }

    #[test]
    fn compaction_collapses_to_one_insert_per_live_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("b.stitch");
        let mut log = BucketLog::open(&path).unwrap();
        log.append(&record(RecordKind::Insert, "a", "1")).unwrap();
        log.append(&record(RecordKind::Insert, "a", "2")).unwrap();
        log.append(&record(RecordKind::Insert, "b", "3")).unwrap();
        log.flush().unwrap();

        let live = vec![
            Arc::new(Entry::new("a", "2", EntryOptions::new())),
            Arc::new(Entry::new("b", "3", EntryOptions::new())),
        ];
        log.compact(live.iter()).unwrap();
        assert!(!tmp_path_for(&path).exists());
        let records = read_all(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.kind == RecordKind::Insert));
    }

    #[test]
    fn length_prefix_with_no_body_is_clean_eof() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("b.stitch");
        {
            let mut log = BucketLog::open(&path).unwrap();
            log.append(&record(RecordKind::Insert, "a", "1")).unwrap();
            log.flush().unwrap();
        }
        // Crash right after a length-prefix line, before any body bytes.
        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"999\n").unwrap();
        drop(f);

        let records = read_all(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, "a");
    }

    #[test]
    fn length_prefix_with_short_body_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("b.stitch");
        {
            let mut log = BucketLog::open(&path).unwrap();
            log.append(&record(RecordKind::Insert, "a", "1")).unwrap();
            log.flush().unwrap();
        }
        // Length prefix claims more body bytes than actually follow.
        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"999\nshort\n").unwrap();
        drop(f);

        assert!(matches!(read_all(&path), Err(Error::Parse(_))));
    }
}
