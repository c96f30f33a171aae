use serde_json::Value;

use crate::error::{DumpError, Result};
use crate::http::{check_response, retry::with_retry, url_encode, HttpClient};
use crate::options::Options;

/// TTL in seconds for server-side batch snapshots.
pub const BATCH_TTL: u64 = 600;

fn ttl_body() -> Vec<u8> {
    format!("{{\"ttl\":{BATCH_TTL}}}").into_bytes()
}

fn dbserver_param(dbserver: Option<&str>) -> String {
    match dbserver {
        Some(server) => format!("&DBserver={}", url_encode(server)),
        None => String::new(),
    }
}

/// Create a batch via the replication API. The returned id pins a consistent
/// snapshot on the server until [`end_batch`] or TTL expiry.
pub fn start_batch(
    client: &HttpClient,
    options: &Options,
    database: &str,
    dbserver: Option<&str>,
) -> Result<u64> {
    let url = format!(
        "{}/_api/replication/batch?serverId={}&syncerId={}{}",
        crate::http::db_prefix(database),
        options.client_id,
        options.syncer_id,
        dbserver_param(dbserver),
    );

    let response = with_retry("create batch", || {
        check_response(client.post(&url, &ttl_body()))
    })
    .inspect_err(|e| {
        tracing::error!("An error occurred while creating dump context: {e}");
    })?;

    let body = response.json()?;
    let id = body
        .get("id")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| DumpError::malformed("batch response carries no usable id"))?;
    Ok(id)
}

/// Prolong a batch so a long pull does not outlive its snapshot. Best-effort,
/// any return value is ignored.
pub fn extend_batch(client: &HttpClient, options: &Options, database: &str, batch_id: u64) {
    debug_assert!(batch_id > 0);
    let url = format!(
        "{}/_api/replication/batch/{}?serverId={}&syncerId={}",
        crate::http::db_prefix(database),
        batch_id,
        options.client_id,
        options.syncer_id,
    );
    let _ = client.put(&url, &ttl_body());
}

/// Mark a batch finished so its resources are freed on the server.
/// Best-effort, any return value is ignored.
pub fn end_batch(
    client: &HttpClient,
    options: &Options,
    database: &str,
    dbserver: Option<&str>,
    batch_id: u64,
) {
    debug_assert!(batch_id > 0);
    let url = format!(
        "{}/_api/replication/batch/{}?serverId={}{}",
        crate::http::db_prefix(database),
        batch_id,
        options.client_id,
        dbserver_param(dbserver),
    );
    let _ = client.delete(&url);
}

/// Ends the batch on drop, so every exit path of a pull (including panics)
/// releases the server-side snapshot exactly once.
pub struct BatchGuard {
    client: HttpClient,
    options: Options,
    database: String,
    dbserver: Option<String>,
    id: u64,
}

impl BatchGuard {
    pub fn new(
        client: HttpClient,
        options: &Options,
        database: &str,
        dbserver: Option<&str>,
        id: u64,
    ) -> Self {
        BatchGuard {
            client,
            options: options.clone(),
            database: database.to_string(),
            dbserver: dbserver.map(str::to_string),
            id,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        if self.id != 0 {
            end_batch(
                &self.client,
                &self.options,
                &self.database,
                self.dbserver.as_deref(),
                self.id,
            );
        }
    }
}
