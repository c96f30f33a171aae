use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::directory::{DumpFile, ManagedDirectory};
use crate::error::{DumpError, Result};
use crate::inventory::{collection_parameters, escaped_collection_name, md5_hex};

struct CollectionFiles {
    /// Sequence number for split-files mode, one per collection.
    count: u64,
    /// The shared handle in combined mode.
    file: Option<Arc<DumpFile>>,
    escaped: String,
    hex: String,
}

/// Maps collections to output files for the parallel pipeline.
///
/// Combined mode opens one file per collection up front, shards share the
/// handle. The files exist even for collections that end up empty, because
/// the restore tool expects one data file per collection. Split mode opens a
/// fresh file per request, with a monotonically increasing per-collection
/// sequence number in the name.
pub struct DumpFileProvider {
    directory: Arc<ManagedDirectory>,
    split_files: bool,
    suffix: &'static str,
    state: Mutex<HashMap<String, CollectionFiles>>,
}

impl DumpFileProvider {
    pub fn new(
        directory: Arc<ManagedDirectory>,
        collections: &BTreeMap<String, Value>,
        split_files: bool,
        suffix: &'static str,
    ) -> Result<Self> {
        let mut state = HashMap::with_capacity(collections.len());
        for (name, info) in collections {
            let parameters = collection_parameters(info)?;
            let escaped = escaped_collection_name(name, parameters);
            let hex = md5_hex(name);

            let file = if split_files {
                None
            } else {
                let filename = format!("{escaped}_{hex}.data.{suffix}");
                Some(Arc::new(directory.writable_file(&filename, true)?))
            };
            state.insert(
                name.clone(),
                CollectionFiles {
                    count: 0,
                    file,
                    escaped,
                    hex,
                },
            );
        }
        Ok(DumpFileProvider {
            directory,
            split_files,
            suffix,
            state: Mutex::new(state),
        })
    }

    /// The output file for the next write of `collection_name`.
    pub fn get_file(&self, collection_name: &str) -> Result<Arc<DumpFile>> {
        let mut state = self.state.lock().unwrap();
        let entry = state.get_mut(collection_name).ok_or_else(|| {
            DumpError::Other(format!(
                "no output file registered for collection '{collection_name}'"
            ))
        })?;

        if self.split_files {
            let count = entry.count;
            entry.count += 1;
            let filename = format!(
                "{}_{}.{count}.data.{}",
                entry.escaped, entry.hex, self.suffix
            );
            Ok(Arc::new(self.directory.writable_file(&filename, true)?))
        } else {
            // pre-opened in the constructor
            Ok(Arc::clone(entry.file.as_ref().ok_or_else(|| {
                DumpError::Other(format!(
                    "combined-mode file missing for collection '{collection_name}'"
                ))
            })?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn collections() -> BTreeMap<String, Value> {
        let mut map = BTreeMap::new();
        map.insert(
            "users".to_string(),
            json!({"parameters": {"name": "users", "id": "100"}}),
        );
        map.insert(
            "a/b".to_string(),
            json!({"parameters": {"name": "a/b", "id": "200"}}),
        );
        map
    }

    #[test]
    fn combined_mode_precreates_one_file_per_collection() {
        let tmp = tempfile::tempdir().unwrap();
        let dir =
            Arc::new(ManagedDirectory::create(tmp.path().join("out"), false, false).unwrap());
        let provider = DumpFileProvider::new(Arc::clone(&dir), &collections(), false, "json")
            .unwrap();

        let hex = md5_hex("users");
        assert!(dir.path().join(format!("users_{hex}.data.json")).exists());
        // unsafe name falls back to the numeric id
        let hex = md5_hex("a/b");
        assert!(dir.path().join(format!("200_{hex}.data.json")).exists());

        // repeated lookups return the same shared handle
        let a = provider.get_file("users").unwrap();
        let b = provider.get_file("users").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn split_mode_produces_numbered_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dir =
            Arc::new(ManagedDirectory::create(tmp.path().join("out"), false, false).unwrap());
        let provider =
            DumpFileProvider::new(Arc::clone(&dir), &collections(), true, "json").unwrap();

        let first = provider.get_file("users").unwrap();
        let second = provider.get_file("users").unwrap();
        let other = provider.get_file("a/b").unwrap();
        drop((first, second, other));

        let hex = md5_hex("users");
        assert!(dir.path().join(format!("users_{hex}.0.data.json")).exists());
        assert!(dir.path().join(format!("users_{hex}.1.data.json")).exists());
        // per-collection counters are independent
        let hex = md5_hex("a/b");
        assert!(dir.path().join(format!("200_{hex}.0.data.json")).exists());
    }

    #[test]
    fn split_mode_does_not_precreate() {
        let tmp = tempfile::tempdir().unwrap();
        let dir =
            Arc::new(ManagedDirectory::create(tmp.path().join("out"), false, false).unwrap());
        DumpFileProvider::new(Arc::clone(&dir), &collections(), true, "json").unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn unknown_collection_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let dir =
            Arc::new(ManagedDirectory::create(tmp.path().join("out"), false, false).unwrap());
        let provider =
            DumpFileProvider::new(Arc::clone(&dir), &collections(), false, "json").unwrap();
        assert!(provider.get_file("nope").is_err());
    }
}
