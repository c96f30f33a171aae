use std::collections::VecDeque;
use std::sync::Mutex;

use serde_json::{json, Value};

use crate::error::TransportKind;
use crate::http::{HttpResponse, HttpTransport, Method};

/// One scripted answer of the [`MockTransport`].
#[derive(Clone)]
pub struct MockResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    error: Option<(TransportKind, String)>,
}

impl MockResponse {
    pub fn status(status: u16) -> Self {
        MockResponse {
            status,
            headers: Vec::new(),
            body: Vec::new(),
            error: None,
        }
    }

    pub fn json(value: Value) -> Self {
        MockResponse::status(200).body(serde_json::to_vec(&value).unwrap())
    }

    pub fn transport_error(kind: TransportKind, message: &str) -> Self {
        MockResponse {
            status: 0,
            headers: Vec::new(),
            body: Vec::new(),
            error: Some((kind, message.to_string())),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

struct Route {
    method: Method,
    path_part: String,
    responses: VecDeque<MockResponse>,
    /// Served once the queue is drained (or immediately when the queue is
    /// empty), forever.
    fallback: Option<MockResponse>,
}

/// Scripted in-memory transport. Routes are matched in registration order by
/// method and path substring; each match pops the next queued response.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<Vec<Route>>,
    log: Mutex<Vec<(Method, String)>>,
}

impl MockTransport {
    pub fn new() -> Self {
        MockTransport::default()
    }

    /// Queue one response for requests matching `path_part`.
    pub fn expect(&self, method: Method, path_part: &str, response: MockResponse) {
        let mut routes = self.routes.lock().unwrap();
        if let Some(route) = routes
            .iter_mut()
            .find(|r| r.method == method && r.path_part == path_part)
        {
            route.responses.push_back(response);
        } else {
            routes.push(Route {
                method,
                path_part: path_part.to_string(),
                responses: VecDeque::from([response]),
                fallback: None,
            });
        }
    }

    /// Serve `response` for every matching request once queued responses run
    /// out.
    pub fn expect_repeat(&self, method: Method, path_part: &str, response: MockResponse) {
        let mut routes = self.routes.lock().unwrap();
        if let Some(route) = routes
            .iter_mut()
            .find(|r| r.method == method && r.path_part == path_part)
        {
            route.fallback = Some(response);
        } else {
            routes.push(Route {
                method,
                path_part: path_part.to_string(),
                responses: VecDeque::new(),
                fallback: Some(response),
            });
        }
    }

    /// Number of requests seen matching method + path substring.
    pub fn requests_matching(&self, method: Method, path_part: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, p)| *m == method && p.contains(path_part))
            .count()
    }

    /// Full paths of requests matching method + path substring.
    pub fn paths_matching(&self, method: Method, path_part: &str) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, p)| *m == method && p.contains(path_part))
            .map(|(_, p)| p.clone())
            .collect()
    }
}

impl HttpTransport for MockTransport {
    fn request(
        &self,
        method: Method,
        path: &str,
        _body: Option<&[u8]>,
        _headers: &[(&str, &str)],
    ) -> std::result::Result<HttpResponse, (TransportKind, String)> {
        self.log.lock().unwrap().push((method, path.to_string()));

        let mut routes = self.routes.lock().unwrap();
        for route in routes.iter_mut() {
            if route.method != method || !path.contains(&route.path_part) {
                continue;
            }
            let response = match route.responses.pop_front() {
                Some(r) => r,
                None => match &route.fallback {
                    Some(r) => r.clone(),
                    None => continue,
                },
            };
            return match response.error {
                Some((kind, message)) => Err((kind, message)),
                None => Ok(HttpResponse::new(
                    response.status,
                    response.headers,
                    response.body,
                )),
            };
        }

        Ok(HttpResponse::new(
            404,
            Vec::new(),
            format!("{{\"error\":true,\"errorNum\":404,\"errorMessage\":\"no route for {path}\"}}")
                .into_bytes(),
        ))
    }
}

// ---------------------------------------------------------------------------
// Fixture builders
// ---------------------------------------------------------------------------

/// Inventory entry for one collection. `shards` maps shard id to its primary
/// dbserver; pass an empty slice for single-server inventories.
pub fn collection_entry(name: &str, id: &str, shards: &[(&str, &str)]) -> Value {
    let mut parameters = json!({
        "name": name,
        "id": id,
        "deleted": false,
        "type": 2,
    });
    if !shards.is_empty() {
        let mut map = serde_json::Map::new();
        for (shard, server) in shards {
            map.insert(shard.to_string(), json!([server]));
        }
        parameters["shards"] = Value::Object(map);
    }
    json!({ "parameters": parameters, "indexes": [] })
}

pub fn inventory_body(collections: Vec<Value>, views: Vec<Value>, tick: &str) -> Value {
    json!({
        "collections": collections,
        "views": views,
        "tick": tick,
        "properties": { "id": "1", "name": "_system" },
        "state": { "running": true },
    })
}

/// Wire a mock up with the calls every dump run performs: role detection,
/// batch lifecycle, and the inventory answer.
pub fn expect_common(mock: &MockTransport, role: &str, inventory: Value) {
    mock.expect_repeat(
        Method::Get,
        "/_admin/server/role",
        MockResponse::json(json!({ "role": role })),
    );
    mock.expect_repeat(
        Method::Post,
        "/_api/replication/batch?",
        MockResponse::json(json!({ "id": "4711" })),
    );
    mock.expect_repeat(
        Method::Put,
        "/_api/replication/batch/",
        MockResponse::json(json!({ "id": "4711" })),
    );
    mock.expect_repeat(
        Method::Delete,
        "/_api/replication/batch/",
        MockResponse::status(200),
    );
    let path = if role == "COORDINATOR" {
        "/_api/replication/clusterInventory"
    } else {
        "/_api/replication/inventory"
    };
    mock.expect_repeat(Method::Get, path, MockResponse::json(inventory));
}

/// A replication dump chunk answer carrying newline-delimited documents.
pub fn dump_chunk(body: &str, check_more: bool) -> MockResponse {
    MockResponse::status(200)
        .header(
            crate::http::headers::CHECK_MORE,
            if check_more { "true" } else { "false" },
        )
        .header(
            crate::http::headers::CONTENT_TYPE,
            crate::http::mime::DUMP,
        )
        .body(body.as_bytes().to_vec())
}

/// A parallel-dump batch answer for one shard.
pub fn next_batch(shard: &str, body: &str) -> MockResponse {
    MockResponse::status(200)
        .header(crate::http::headers::DUMP_SHARD_ID, shard)
        .body(body.as_bytes().to_vec())
}

/// Options preset for tests: quiet, no compression, writing below `output`.
pub fn test_options(output: &std::path::Path) -> crate::options::Options {
    crate::options::Options {
        output_path: output.to_string_lossy().to_string(),
        progress: false,
        use_gzip_for_storage: false,
        thread_count: 2,
        ..crate::options::Options::default()
    }
}
