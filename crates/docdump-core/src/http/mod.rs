use std::sync::Arc;

use serde_json::Value;

use crate::error::{DumpError, Result, TransportKind};

pub mod retry;
mod ureq_transport;

pub use ureq_transport::UreqTransport;

/// Response header names used by the replication and dump APIs.
pub mod headers {
    pub const CHECK_MORE: &str = "x-arango-replication-checkmore";
    pub const DUMP_ID: &str = "x-arango-dump-id";
    pub const DUMP_SHARD_ID: &str = "x-arango-dump-shard-id";
    pub const DUMP_BLOCK_COUNTS: &str = "x-arango-dump-block-counts";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const CONTENT_ENCODING: &str = "content-encoding";
    pub const ACCEPT: &str = "accept";
    pub const ACCEPT_ENCODING: &str = "accept-encoding";
}

pub mod mime {
    pub const VPACK: &str = "application/x-velocypack";
    pub const DUMP: &str = "application/x-arango-dump; charset=utf-8";
    pub const DUMP_NO_ENCODING: &str = "application/x-arango-dump";
}

pub const ENCODING_GZIP: &str = "gzip";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

/// A fully buffered HTTP response. Status is carried verbatim; callers decide
/// what counts as an error via [`check_response`].
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
        HttpResponse {
            status,
            headers,
            body,
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json(&self) -> Result<Value> {
        serde_json::from_slice(&self.body)
            .map_err(|e| DumpError::malformed(&format!("cannot parse body: {e}")))
    }
}

/// The transport contract: perform one HTTP exchange against the server.
///
/// Implementations return `Ok` for every completed exchange, whatever the
/// status code; the `Err` side is reserved for transport-level failures, which
/// carry the [`TransportKind`] the retry policy classifies on.
pub trait HttpTransport: Send + Sync {
    fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&[u8]>,
        headers: &[(&str, &str)],
    ) -> std::result::Result<HttpResponse, (TransportKind, String)>;
}

/// One logical HTTP client. Workers own one each; connections are pooled and
/// re-established by the underlying transport, so a client stays usable after
/// transient failures.
#[derive(Clone)]
pub struct HttpClient {
    transport: Arc<dyn HttpTransport>,
}

impl HttpClient {
    pub fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&[u8]>,
        headers: &[(&str, &str)],
    ) -> Result<HttpResponse> {
        self.transport
            .request(method, path, body, headers)
            .map_err(|(kind, message)| DumpError::Transport { kind, message })
    }

    pub fn get(&self, path: &str) -> Result<HttpResponse> {
        self.request(Method::Get, path, None, &[])
    }

    pub fn post(&self, path: &str, body: &[u8]) -> Result<HttpResponse> {
        self.request(Method::Post, path, Some(body), &[])
    }

    pub fn put(&self, path: &str, body: &[u8]) -> Result<HttpResponse> {
        self.request(Method::Put, path, Some(body), &[])
    }

    pub fn delete(&self, path: &str) -> Result<HttpResponse> {
        self.request(Method::Delete, path, None, &[])
    }
}

/// Hands out clients backed by one shared transport.
pub struct ClientManager {
    transport: Arc<dyn HttpTransport>,
}

impl ClientManager {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        ClientManager { transport }
    }

    pub fn client(&self) -> HttpClient {
        HttpClient {
            transport: Arc::clone(&self.transport),
        }
    }
}

/// Turn a completed exchange into a usable response, converting bad statuses
/// into [`DumpError::Api`]. The server's error envelope
/// `{error, errorNum, errorMessage}` is preferred when present; otherwise the
/// HTTP status doubles as the error number.
pub fn check_response(result: Result<HttpResponse>) -> Result<HttpResponse> {
    let response = result?;
    if response.status >= 400 {
        if let Ok(envelope) = response.json() {
            if envelope.get("error").and_then(Value::as_bool) == Some(true) {
                let num = envelope
                    .get("errorNum")
                    .and_then(Value::as_i64)
                    .unwrap_or(i64::from(response.status));
                let message = envelope
                    .get("errorMessage")
                    .and_then(Value::as_str)
                    .unwrap_or("(no error message)")
                    .to_string();
                return Err(DumpError::Api { num, message });
            }
        }
        return Err(DumpError::Api {
            num: i64::from(response.status),
            message: format!("unexpected HTTP status {}", response.status),
        });
    }
    Ok(response)
}

/// Percent-encode a query-string value.
pub fn url_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => {
                out.push('%');
                out.push_str(&format!("{b:02X}"));
            }
        }
    }
    out
}

/// Path prefix addressing one database.
pub fn db_prefix(database: &str) -> String {
    format!("/_db/{}", url_encode(database))
}
