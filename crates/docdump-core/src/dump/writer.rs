use serde_json::Value;

use crate::directory::DumpFile;
use crate::error::{DumpError, Result};
use crate::maskings::Maskings;
use crate::stats::Stats;

/// Write one retrieved body to its output file.
///
/// Without maskings the body is passed through verbatim, whatever its format.
/// With maskings the body is a newline-delimited object stream (the binary
/// body format cannot be combined with maskings; option validation rejects
/// that), and every document goes through the collection's masking rules.
pub fn dump_body(
    stats: &Stats,
    maskings: Option<&Maskings>,
    file: &DumpFile,
    body: &[u8],
    collection_name: &str,
) -> Result<()> {
    let length = match maskings {
        None => {
            file.write(body)?;
            body.len()
        }
        Some(maskings) => {
            let mut out = String::with_capacity(body.len());
            for line in body.split(|b| *b == b'\n') {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let mut doc: Value = serde_json::from_slice(line).map_err(|e| {
                    DumpError::InvalidResponse(format!(
                        "cannot parse document of collection '{collection_name}': {e}"
                    ))
                })?;
                maskings.mask(collection_name, &mut doc);
                out.push_str(&serde_json::to_string(&doc)?);
                out.push('\n');
            }
            file.write(out.as_bytes())?;
            out.len()
        }
    };

    stats.add_written(length as u64);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::ManagedDirectory;
    use std::sync::atomic::Ordering;

    fn scratch_file(dir: &ManagedDirectory) -> DumpFile {
        dir.writable_file("out.data.json", true).unwrap()
    }

    #[test]
    fn verbatim_without_maskings() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ManagedDirectory::create(tmp.path().join("d"), false, false).unwrap();
        let file = scratch_file(&dir);
        let stats = Stats::default();

        let body = b"{\"_key\":\"1\"}\n{\"_key\":\"2\"}\n";
        dump_body(&stats, None, &file, body, "users").unwrap();
        file.finish().unwrap();

        let written = std::fs::read(dir.path().join("out.data.json")).unwrap();
        assert_eq!(written, body);
        assert_eq!(stats.total_written.load(Ordering::Relaxed), body.len() as u64);
    }

    #[test]
    fn masked_stream_rewrites_documents() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ManagedDirectory::create(tmp.path().join("d"), false, false).unwrap();
        let file = scratch_file(&dir);
        let stats = Stats::default();
        let path = tmp.path().join("maskings.json");
        std::fs::write(&path, r#"{"users": {"mask": ["email"]}}"#).unwrap();
        let maskings = Maskings::from_file(&path).unwrap();

        let body = b"{\"_key\":\"1\",\"email\":\"a@b.c\"}\n\n{\"_key\":\"2\",\"email\":\"d@e.f\"}\n";
        dump_body(&stats, Some(&maskings), &file, body, "users").unwrap();
        file.finish().unwrap();

        let written = std::fs::read_to_string(dir.path().join("out.data.json")).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let doc: Value = serde_json::from_str(line).unwrap();
            assert_eq!(doc["email"], "xxx");
        }
    }

    #[test]
    fn malformed_document_is_an_invalid_response() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ManagedDirectory::create(tmp.path().join("d"), false, false).unwrap();
        let file = scratch_file(&dir);
        let stats = Stats::default();
        let path = tmp.path().join("maskings.json");
        std::fs::write(&path, r#"{"users": {}}"#).unwrap();
        let maskings = Maskings::from_file(&path).unwrap();

        let result = dump_body(&stats, Some(&maskings), &file, b"not json\n", "users");
        assert!(matches!(result, Err(DumpError::InvalidResponse(_))));
    }
}
