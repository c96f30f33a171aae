use crate::compress::gunzip;
use crate::directory::DumpFile;
use crate::dump::{writer::dump_body, DumpContext};
use crate::error::{DumpError, Result};
use crate::http::{
    check_response, headers, mime, retry::with_retry, url_encode, HttpClient, Method,
    ENCODING_GZIP,
};

/// Adaptive chunk growth: half again per round, capped.
pub fn next_chunk_size(current: u64, max: u64) -> u64 {
    if current >= max {
        return max;
    }
    current.saturating_add(current / 2).min(max)
}

/// Pull one collection (or one shard of it) through the replication dump API
/// and write everything to `file`. Chunks arrive in server order and are
/// written in that order; the chunk size grows adaptively between requests.
pub fn dump_collection(
    client: &HttpClient,
    ctx: &DumpContext,
    file: &DumpFile,
    name: &str,
    server: Option<&str>,
    batch_id: u64,
    collection_name: &str,
) -> Result<()> {
    let options = &ctx.options;
    let mut chunk_size = options.initial_chunk_size;

    let mut base_url = format!(
        "{}?collection={}&batchId={}&useEnvelope=false&array={}",
        ctx.db_path("/_api/replication/dump"),
        url_encode(name),
        batch_id,
        options.use_vpack,
    );
    if let Some(server) = server {
        // cluster mode, must address the dbserver holding the shard
        base_url.push_str(&format!("&DBserver={}", url_encode(server)));
    }

    let accept = if options.use_vpack {
        mime::VPACK
    } else {
        mime::DUMP
    };

    loop {
        let url = format!("{base_url}&chunkSize={chunk_size}");

        // count how many chunks we are fetching
        ctx.stats.add_batch();

        let response = with_retry(&format!("dump collection '{collection_name}'"), || {
            let mut request_headers = vec![(headers::ACCEPT, accept)];
            if options.use_gzip_for_transport {
                request_headers.push((headers::ACCEPT_ENCODING, ENCODING_GZIP));
            }
            check_response(client.request(Method::Get, &url, None, &request_headers))
        })
        .inspect_err(|e| {
            tracing::error!(
                "An error occurred while dumping collection '{collection_name}' via URL \
                 {url}: {e}"
            );
        })?;

        let check_more = response
            .header(headers::CHECK_MORE)
            .map(|v| v == "true")
            .ok_or_else(|| {
                DumpError::InvalidResponse(format!(
                    "required header is missing while dumping collection '{collection_name}'"
                ))
            })?;

        let content_type = response.header(headers::CONTENT_TYPE).unwrap_or("");
        let content_type_ok = if options.use_vpack {
            content_type == mime::VPACK
        } else {
            content_type.starts_with(mime::DUMP_NO_ENCODING)
        };
        if !content_type_ok {
            return Err(DumpError::InvalidResponse(
                "content-type is invalid".to_string(),
            ));
        }

        ctx.stats.add_received(response.body.len() as u64);
        tracing::trace!(
            "received response body of size {}, type: {}",
            response.body.len(),
            if options.use_vpack { "vpack" } else { "json" }
        );

        let gzipped = response.header(headers::CONTENT_ENCODING) == Some(ENCODING_GZIP);
        let body = if gzipped {
            gunzip(&response.body)?
        } else {
            response.body
        };

        dump_body(&ctx.stats, ctx.maskings(), file, &body, collection_name)?;

        if !check_more {
            return Ok(());
        }

        chunk_size = next_chunk_size(chunk_size, options.max_chunk_size);
    }
}
