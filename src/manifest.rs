//! Manifest: the top-level, newline-delimited record of bucket and index
//! definitions (§6, `sbkt.conf`; §10.4 for the index records).

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use log::debug;

use crate::entry::IndexValueType;
use crate::error::{Error, Result};
use crate::options::BucketOptions;

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

#[derive(Debug, Clone, PartialEq)]
pub enum ManifestRecord {
    Create { name: String, opts: BucketOptions },
    Drop { name: String },
    CreateIndex { bucket: String, path: String, vtype: IndexValueType },
    DropIndex { bucket: String, path: String },
}

impl ManifestRecord {
    pub fn encode(&self) -> String {
        match self {
            ManifestRecord::Create { name, opts } => format!(
                "CREATE:{}:{}:{}:{}:{}:{}:{}",
                name,
                opts.btdeg,
                bool01(opts.system),
                bool01(opts.geo),
                bool01(opts.georincl),
                bool01(opts.time),
                opts.dims,
            ),
            ManifestRecord::Drop { name } => format!("DROP:{}", name),
            ManifestRecord::CreateIndex { bucket, path, vtype } => {
                format!("CREATE_INDEX:{}:{}:{}", bucket, path, vtype.as_str())
            }
            ManifestRecord::DropIndex { bucket, path } => format!("DROP_INDEX:{}:{}", bucket, path),
        }
    }

    pub fn parse(line: &str) -> Result<ManifestRecord> {
        let mut fields = line.splitn(2, ':');
        let tag = fields.next().unwrap_or("");
        let rest = fields.next().unwrap_or("");
        match tag {
            "CREATE" => {
                let parts: Vec<&str> = rest.splitn(7, ':').collect();
                if parts.len() != 7 {
                    return Err(Error::Parse(format!("CREATE record needs 8 fields, got line {:?}", line)));
                }
                let opts = BucketOptions::new()
                    .set_btdeg(parts[1].trim().parse().map_err(|_| Error::Parse(format!("bad btdeg in {:?}", line)))?)
                    .set_system(parse01(parts[2], "system")?)
                    .set_geo(parse01(parts[3], "geo")?)
                    .set_georincl(parse01(parts[4], "georincl")?)
                    .set_time(parse01(parts[5], "time")?)
                    .set_dims(parts[6].trim().parse().map_err(|_| Error::Parse(format!("bad dims in {:?}", line)))?);
                Ok(ManifestRecord::Create {
                    name: parts[0].to_string(),
                    opts,
                })
            }
            "DROP" => Ok(ManifestRecord::Drop { name: rest.to_string() }),
            "CREATE_INDEX" => {
                let parts: Vec<&str> = rest.splitn(3, ':').collect();
                if parts.len() != 3 {
                    return Err(Error::Parse(format!("CREATE_INDEX record malformed: {:?}", line)));
                }
                Ok(ManifestRecord::CreateIndex {
                    bucket: parts[0].to_string(),
                    path: parts[1].to_string(),
                    vtype: IndexValueType::parse(parts[2])?,
                })
            }
            "DROP_INDEX" => {
                let parts: Vec<&str> = rest.splitn(2, ':').collect();
                if parts.len() != 2 {
                    return Err(Error::Parse(format!("DROP_INDEX record malformed: {:?}", line)));
                }
                Ok(ManifestRecord::DropIndex {
                    bucket: parts[0].to_string(),
                    path: parts[1].to_string(),
                })
            }
            other => Err(Error::Parse(format!("unrecognized manifest record type {:?}", other))),
        }
    }
}

/// Handle to the on-disk manifest file, tracking its live record count so
/// the database manager can decide when to compact it (§4.6).
pub struct Manifest {
    path: PathBuf,
    count: u64,
}

impl Manifest {
    pub fn open(path: impl AsRef<Path>) -> Result<Manifest> {
        let path = path.as_ref().to_path_buf();
        let count = if path.exists() {
            Self::read_all_at(&path)?.len() as u64
        } else {
            fs::File::create(&path).map_err(|e| Error::io(format!("create manifest {:?}", path), e))?;
            0
        };
        Ok(Manifest { path, count })
    }

    pub fn record_count(&self) -> u64 {
        self.count
    }

    pub fn append(&mut self, record: &ManifestRecord) -> Result<()> {
        let mut f = fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| Error::io(format!("open manifest {:?}", self.path), e))?;
        writeln!(f, "{}", record.encode()).map_err(|e| Error::io("write manifest record", e))?;
        f.sync_all().map_err(|e| Error::io("fsync manifest", e))?;
        self.count += 1;
        Ok(())
    }

    pub fn read_all(&self) -> Result<Vec<ManifestRecord>> {
        Self::read_all_at(&self.path)
    }

    fn read_all_at(path: &Path) -> Result<Vec<ManifestRecord>> {
        let f = fs::File::open(path).map_err(|e| Error::io(format!("open manifest {:?}", path), e))?;
        let reader = BufReader::new(f);
        let mut out = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(|e| Error::io("read manifest line", e))?;
            if line.trim().is_empty() {
                continue;
            }
            out.push(ManifestRecord::parse(&line)?);
        }
        Ok(out)
    }

    /// Truncate and rewrite with exactly `records`, per §4.6.
    pub fn rewrite(&mut self, records: &[ManifestRecord]) -> Result<()> {
        debug!(target: "manifest", "rewriting {:?} with {} records", self.path, records.len());
        let mut f = fs::File::create(&self.path).map_err(|e| Error::io(format!("truncate manifest {:?}", self.path), e))?;
        for r in records {
            writeln!(f, "{}", r.encode()).map_err(|e| Error::io("write manifest record", e))?;
        }
        f.sync_all().map_err(|e| Error::io("fsync manifest", e))?;
        self.count = records.len() as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_round_trips() {
        let opts = BucketOptions::new().set_btdeg(16).set_geo(true).set_dims(3);
        let rec = ManifestRecord::Create {
            name: "b".to_string(),
            opts,
        };
        let line = rec.encode();
        assert_eq!(ManifestRecord::parse(&line).unwrap(), rec);
    }

    #[test]
    fn create_index_round_trips() {
        let rec = ManifestRecord::CreateIndex {
            bucket: "b".to_string(),
            path: "age".to_string(),
            vtype: IndexValueType::Int,
        };
        assert_eq!(ManifestRecord::parse(&rec.encode()).unwrap(), rec);
    }

    #[test]
    fn unrecognized_tag_is_parse_error() {
        assert!(ManifestRecord::parse("BOGUS:x").is_err());
    }
}
