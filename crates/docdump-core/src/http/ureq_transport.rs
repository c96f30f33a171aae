use std::io::Read;
use std::time::Duration;

use base64::Engine;

use crate::error::TransportKind;
use crate::http::{HttpResponse, HttpTransport, Method};

/// Blocking transport backed by a pooled `ureq` agent.
///
/// The agent re-establishes connections transparently, which is what keeps a
/// worker's long-lived client usable across transient network failures.
pub struct UreqTransport {
    agent: ureq::Agent,
    endpoint: String,
    authorization: Option<String>,
}

impl UreqTransport {
    pub fn new(endpoint: &str, username: &str, password: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .timeout_write(Duration::from_secs(300))
            .build();

        let authorization = if username.is_empty() {
            None
        } else {
            let credentials = base64::engine::general_purpose::STANDARD
                .encode(format!("{username}:{password}"));
            Some(format!("Basic {credentials}"))
        };

        UreqTransport {
            agent,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            authorization,
        }
    }

    fn classify(err: &ureq::Transport) -> TransportKind {
        match err.kind() {
            ureq::ErrorKind::ConnectionFailed
            | ureq::ErrorKind::Dns
            | ureq::ErrorKind::ProxyConnect => TransportKind::CouldNotConnect,
            ureq::ErrorKind::Io => TransportKind::ReadError,
            _ => TransportKind::Other,
        }
    }

    fn convert(
        response: ureq::Response,
    ) -> std::result::Result<HttpResponse, (TransportKind, String)> {
        let status = response.status();
        let headers: Vec<(String, String)> = response
            .headers_names()
            .into_iter()
            .filter_map(|name| {
                response
                    .header(&name)
                    .map(|value| (name.clone(), value.to_string()))
            })
            .collect();

        let mut body = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut body)
            .map_err(|e| (TransportKind::ReadError, e.to_string()))?;

        Ok(HttpResponse::new(status, headers, body))
    }
}

impl HttpTransport for UreqTransport {
    fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&[u8]>,
        headers: &[(&str, &str)],
    ) -> std::result::Result<HttpResponse, (TransportKind, String)> {
        let url = format!("{}{}", self.endpoint, path);
        let mut request = self.agent.request(method.as_str(), &url);
        if let Some(ref auth) = self.authorization {
            request = request.set("Authorization", auth);
        }
        for (name, value) in headers {
            request = request.set(name, value);
        }

        let result = match body {
            Some(data) => request.set("Content-Type", "application/json").send_bytes(data),
            None => request.call(),
        };

        match result {
            Ok(response) => Self::convert(response),
            // Bad statuses are regular responses; the checker decides.
            Err(ureq::Error::Status(_, response)) => Self::convert(response),
            Err(ureq::Error::Transport(t)) => Err((Self::classify(&t), t.to_string())),
        }
    }
}
