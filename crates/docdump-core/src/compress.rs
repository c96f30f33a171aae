use std::io::Read;

use flate2::read::GzDecoder;

use crate::error::{DumpError, Result};

/// Upper bound for a single inflated response body. Keeps a corrupt or
/// malicious length field from consuming unbounded memory.
const MAX_INFLATE_SIZE: u64 = 1024 * 1024 * 1024;

/// Inflate a gzip-encoded response body.
pub fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .by_ref()
        .take(MAX_INFLATE_SIZE + 1)
        .read_to_end(&mut out)
        .map_err(|e| DumpError::InvalidResponse(format!("cannot inflate response body: {e}")))?;
    if out.len() as u64 > MAX_INFLATE_SIZE {
        return Err(DumpError::InvalidResponse(format!(
            "inflated response body exceeds limit of {MAX_INFLATE_SIZE} bytes"
        )));
    }
    Ok(out)
}

#[cfg(test)]
pub fn gzip(data: &[u8]) -> Vec<u8> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gunzip_roundtrip() {
        let payload = b"{\"_key\":\"1\"}\n{\"_key\":\"2\"}\n";
        let compressed = gzip(payload);
        assert_eq!(gunzip(&compressed).unwrap(), payload);
    }

    #[test]
    fn gunzip_rejects_garbage() {
        assert!(gunzip(b"definitely not gzip").is_err());
    }
}
