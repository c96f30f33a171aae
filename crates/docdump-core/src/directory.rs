use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{DumpError, Result};

/// The on-disk output tree of one dump run (or of one database within an
/// `--all-databases` run). Produces writable files with transparent gzip
/// compression when storage compression is enabled.
pub struct ManagedDirectory {
    path: PathBuf,
    gzip: bool,
}

impl ManagedDirectory {
    /// Open or create the directory. An existing, non-empty directory is
    /// refused unless `overwrite` is set.
    pub fn create(path: impl Into<PathBuf>, overwrite: bool, gzip: bool) -> Result<Self> {
        let path = path.into();
        if path.exists() {
            if !path.is_dir() {
                return Err(DumpError::FileWrite {
                    path: path.display().to_string(),
                    message: "exists and is not a directory".to_string(),
                });
            }
            let occupied = fs::read_dir(&path)?.next().is_some();
            if occupied && !overwrite {
                return Err(DumpError::FileWrite {
                    path: path.display().to_string(),
                    message: "output directory already exists. use \"--overwrite true\" to \
                              overwrite data in it"
                        .to_string(),
                });
            }
        } else {
            fs::create_dir_all(&path)?;
        }
        Ok(ManagedDirectory { path, gzip })
    }

    /// Create a child directory with the same settings (one per database in
    /// `--all-databases` mode).
    pub fn subdirectory(&self, name: &str, overwrite: bool) -> Result<ManagedDirectory> {
        ManagedDirectory::create(self.path.join(name), overwrite, self.gzip)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open `name` for writing, truncating any previous content. When storage
    /// compression is on and the file is eligible (`gzip_ok`), the data is
    /// gzip-wrapped and the filename gains a `.gz` suffix.
    pub fn writable_file(&self, name: &str, gzip_ok: bool) -> Result<DumpFile> {
        let gzipped = self.gzip && gzip_ok;
        let filename = if gzipped {
            format!("{name}.gz")
        } else {
            name.to_string()
        };
        let path = self.path.join(filename);
        let file = File::create(&path).map_err(|e| DumpError::FileWrite {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let writer = BufWriter::new(file);
        let sink = if gzipped {
            Sink::Gzip(GzEncoder::new(writer, Compression::default()))
        } else {
            Sink::Plain(writer)
        };
        Ok(DumpFile {
            path,
            sink: Mutex::new(sink),
        })
    }
}

enum Sink {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
    Finished,
}

/// One output file. `write` is internally synchronized: in combined cluster
/// mode multiple shard jobs share a single handle, and the mutex is what
/// serializes their writes. Anything handing these out relies on that.
pub struct DumpFile {
    path: PathBuf,
    sink: Mutex<Sink>,
}

impl DumpFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, data: &[u8]) -> Result<()> {
        let mut sink = self.sink.lock().unwrap();
        let result = match &mut *sink {
            Sink::Plain(w) => w.write_all(data),
            Sink::Gzip(w) => w.write_all(data),
            Sink::Finished => Err(std::io::Error::other("file already finished")),
        };
        result.map_err(|e| DumpError::FileWrite {
            path: self.path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Flush buffered data and write the gzip trailer. Idempotent.
    pub fn finish(&self) -> Result<()> {
        let mut sink = self.sink.lock().unwrap();
        let result = match std::mem::replace(&mut *sink, Sink::Finished) {
            Sink::Plain(mut w) => w.flush(),
            Sink::Gzip(w) => w.finish().and_then(|mut inner| inner.flush()),
            Sink::Finished => Ok(()),
        };
        result.map_err(|e| DumpError::FileWrite {
            path: self.path.display().to_string(),
            message: e.to_string(),
        })
    }
}

impl Drop for DumpFile {
    fn drop(&mut self) {
        // last-holder cleanup; write errors were already surfaced
        let _ = self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn refuses_existing_directory_without_overwrite() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("out");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("stale"), b"x").unwrap();

        assert!(ManagedDirectory::create(&target, false, false).is_err());
        assert!(ManagedDirectory::create(&target, true, false).is_ok());
    }

    #[test]
    fn empty_existing_directory_is_usable() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("out");
        fs::create_dir(&target).unwrap();
        assert!(ManagedDirectory::create(&target, false, false).is_ok());
    }

    #[test]
    fn plain_file_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ManagedDirectory::create(tmp.path().join("out"), false, false).unwrap();
        let file = dir.writable_file("test.json", true).unwrap();
        file.write(b"hello").unwrap();
        file.finish().unwrap();

        let content = fs::read(dir.path().join("test.json")).unwrap();
        assert_eq!(content, b"hello");
    }

    #[test]
    fn gzip_file_gets_suffix_and_is_decodable() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ManagedDirectory::create(tmp.path().join("out"), false, true).unwrap();
        let file = dir.writable_file("c.data.json", true).unwrap();
        file.write(b"{\"a\":1}\n").unwrap();
        file.finish().unwrap();

        let raw = fs::read(dir.path().join("c.data.json.gz")).unwrap();
        assert_eq!(crate::compress::gunzip(&raw).unwrap(), b"{\"a\":1}\n");
    }

    #[test]
    fn meta_files_bypass_gzip() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ManagedDirectory::create(tmp.path().join("out"), false, true).unwrap();
        let file = dir.writable_file("dump.json", false).unwrap();
        file.write(b"{}").unwrap();
        file.finish().unwrap();
        assert!(dir.path().join("dump.json").exists());
    }

    #[test]
    fn concurrent_writes_are_serialized() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ManagedDirectory::create(tmp.path().join("out"), false, false).unwrap();
        let file = Arc::new(dir.writable_file("shared.json", true).unwrap());

        std::thread::scope(|s| {
            for t in 0..4 {
                let file = Arc::clone(&file);
                s.spawn(move || {
                    for _ in 0..64 {
                        let line = format!("{{\"thread\":{t}}}\n");
                        file.write(line.as_bytes()).unwrap();
                    }
                });
            }
        });
        file.finish().unwrap();

        let content = fs::read_to_string(dir.path().join("shared.json")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 4 * 64);
        for line in lines {
            // every line is intact, no interleaved writes
            serde_json::from_str::<serde_json::Value>(line).unwrap();
        }
    }
}
