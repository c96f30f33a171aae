use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;

use crate::channel::{BoundedChannel, ProducerGuard};
use crate::compress::gunzip;
use crate::directory::DumpFile;
use crate::dump::files::DumpFileProvider;
use crate::dump::writer::dump_body;
use crate::dump::{server_label, DumpContext};
use crate::error::{DumpError, Result};
use crate::http::{
    check_response, headers, retry::maybe_abort, retry::with_retry, url_encode, HttpClient,
    HttpResponse, Method, ENCODING_GZIP,
};

#[derive(Debug, Clone)]
pub struct ShardInfo {
    pub collection_name: String,
}

/// Which queue a block event happened at.
#[derive(Debug, Clone, Copy)]
pub enum BlockAt {
    /// The bounded channel between network and writer threads.
    LocalQueue = 0,
    /// The server-side prefetch queue, reported back via response header.
    RemoteQueue = 1,
}

/// Two-axis saturated counters naming the pipeline's bottleneck.
///
/// Consumers blocked on an empty queue push the axis up, producers blocked on
/// a full queue push it down. Whenever an axis reaches ±100 a diagnostic is
/// logged and the counter re-armed by the opposite amount, so a persistent
/// imbalance keeps reporting.
pub struct BlockCounters {
    counters: [AtomicI64; 2],
    label: String,
}

impl BlockCounters {
    pub fn new(label: String) -> Self {
        BlockCounters {
            counters: [AtomicI64::new(0), AtomicI64::new(0)],
            label,
        }
    }

    pub fn count(&self, at: BlockAt, delta: i64) {
        const DIAGNOSES: [&str; 4] = [
            "writer threads - consider increasing the number of network threads",
            "network threads - consider increasing the number of local writer threads",
            "dbserver get batch - consider increasing the parallelism on dbservers",
            "dbserver put batch - consider increasing the number of network threads",
        ];
        let index = at as usize;
        let previous = self.counters[index].fetch_add(delta, Ordering::Relaxed);
        let message = if previous == 100 {
            self.counters[index].fetch_sub(100, Ordering::Relaxed);
            Some(DIAGNOSES[2 * index])
        } else if previous == -100 {
            self.counters[index].fetch_add(100, Ordering::Relaxed);
            Some(DIAGNOSES[2 * index + 1])
        } else {
            None
        };
        if let Some(message) = message {
            tracing::debug!(
                "when dumping data{} system blocking at {message}",
                self.label
            );
        }
    }

    pub fn log_summary(&self) {
        tracing::debug!(
            "block counter writer threads (+) / network threads (-) = {}, dbserver worker put \
             batch (+) / rest handler get batch (-) = {}",
            self.counters[0].load(Ordering::Relaxed),
            self.counters[1].load(Ordering::Relaxed),
        );
    }
}

/// Streams every shard resident on one dbserver through a server-side dump
/// context: network threads fetch batches into a bounded channel, writer
/// threads drain it into the output files. Batches arrive in arbitrary order
/// across writers; there is no per-shard ordering guarantee.
pub struct ParallelServerJob {
    pub ctx: Arc<DumpContext>,
    pub file_provider: Arc<DumpFileProvider>,
    /// shard id -> shard info; in single-server mode one pseudo-shard per
    /// collection, keyed by collection name.
    pub shards: HashMap<String, ShardInfo>,
    /// `None` on a single server.
    pub server: Option<String>,
}

impl ParallelServerJob {
    fn dbserver_query(&self, first_separator: char) -> String {
        match &self.server {
            Some(server) => format!("{first_separator}dbserver={}", url_encode(server)),
            None => String::new(),
        }
    }

    fn create_dump_context(&self, client: &HttpClient) -> Result<String> {
        let options = &self.ctx.options;
        let body = json!({
            "batchSize": options.max_chunk_size,
            "prefetchCount": options.dbserver_prefetch_batches,
            "parallelism": options.dbserver_worker_threads,
            "shards": self.shards.keys().collect::<Vec<_>>(),
        });
        let body = serde_json::to_vec(&body)?;

        let url = format!(
            "{}?useVPack={}{}",
            self.ctx.db_path("/_api/dump/start"),
            options.use_vpack,
            self.dbserver_query('&'),
        );

        let label = server_label(self.server.as_deref());
        let response = with_retry("create dump context", || {
            check_response(client.post(&url, &body))
        })
        .inspect_err(|e| {
            tracing::error!("An error occurred while creating a dump context{label}: {e}");
        })?;

        response
            .header(headers::DUMP_ID)
            .map(str::to_string)
            .ok_or_else(|| {
                DumpError::InvalidResponse(format!(
                    "dump create response did not contain any dump id{label}"
                ))
            })
    }

    fn finish_dump_context(&self, client: &HttpClient, dump_id: &str) {
        let url = format!(
            "{}/{}{}",
            self.ctx.db_path("/_api/dump"),
            dump_id,
            self.dbserver_query('?'),
        );
        if let Err(e) = check_response(client.delete(&url)) {
            tracing::warn!(
                "failed to finish dump context{}: {e}",
                server_label(self.server.as_deref())
            );
        }
    }

    /// One `/_api/dump/next` round. `Ok(None)` means the server is exhausted.
    fn receive_next_batch(
        &self,
        client: &HttpClient,
        dump_id: &str,
        batch_id: u64,
        last_batch: Option<u64>,
    ) -> Result<Option<HttpResponse>> {
        let options = &self.ctx.options;
        let mut url = format!(
            "{}/{}?batchId={}{}",
            self.ctx.db_path("/_api/dump/next"),
            dump_id,
            batch_id,
            self.dbserver_query('&'),
        );
        if let Some(last) = last_batch {
            url.push_str(&format!("&lastBatch={last}"));
        }

        let label = server_label(self.server.as_deref());
        let response = with_retry("fetch next batch", || {
            let mut request_headers: Vec<(&str, &str)> = Vec::new();
            if options.use_gzip_for_transport {
                request_headers.push((headers::ACCEPT_ENCODING, ENCODING_GZIP));
            }
            check_response(client.request(Method::Post, &url, None, &request_headers))
        })
        .inspect_err(|e| {
            tracing::error!("An error occurred while dumping{label}: {e}");
        })?;

        match response.status {
            204 => Ok(None),
            200 => Ok(Some(response)),
            other => Err(DumpError::InvalidResponse(format!(
                "got invalid return code: {other}"
            ))),
        }
    }

    fn network_thread(
        &self,
        thread_id: usize,
        client: &HttpClient,
        dump_id: &str,
        channel: &BoundedChannel<HttpResponse>,
        batch_counter: &AtomicU64,
        block: &BlockCounters,
        failure: &Failure,
    ) {
        let mut last_batch: Option<u64> = None;
        loop {
            let batch_id = batch_counter.fetch_add(1, Ordering::Relaxed);
            match self.receive_next_batch(client, dump_id, batch_id, last_batch) {
                Ok(None) => break,
                Ok(Some(response)) => {
                    self.ctx.stats.add_batch();
                    self.ctx.stats.add_received(response.body.len() as u64);
                    let (stopped, blocked) = channel.push(response);
                    if stopped {
                        tracing::debug!(
                            "network thread {thread_id} stopped by stopped channel"
                        );
                        break;
                    }
                    if blocked {
                        block.count(BlockAt::LocalQueue, -1);
                    }
                    last_batch = Some(batch_id);
                }
                Err(e) => {
                    maybe_abort(&self.ctx.options, &e);
                    failure.record(e, channel);
                    break;
                }
            }
        }
        tracing::debug!("{} exhausted", server_label(self.server.as_deref()));
    }

    fn writer_thread(
        &self,
        channel: &BoundedChannel<HttpResponse>,
        block: &BlockCounters,
        failure: &Failure,
    ) {
        if let Err(e) = self.writer_loop(channel, block) {
            failure.record(e, channel);
        }
        tracing::debug!("writer completed");
    }

    fn writer_loop(
        &self,
        channel: &BoundedChannel<HttpResponse>,
        block: &BlockCounters,
    ) -> Result<()> {
        // first resolution per shard is cached for the thread's lifetime
        let mut files_by_shard: HashMap<String, (Arc<DumpFile>, String)> = HashMap::new();

        loop {
            let (response, blocked) = channel.pop();
            let Some(response) = response else {
                return Ok(());
            };
            if blocked {
                block.count(BlockAt::LocalQueue, 1);
            }

            let shard_id = response
                .header(headers::DUMP_SHARD_ID)
                .ok_or_else(|| {
                    DumpError::InvalidResponse(format!(
                        "missing header field '{}'",
                        headers::DUMP_SHARD_ID
                    ))
                })?
                .to_string();

            // block counts reported by the remote server
            let remote_delta = response
                .header(headers::DUMP_BLOCK_COUNTS)
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0);
            block.count(BlockAt::RemoteQueue, remote_delta);

            let gzipped = response.header(headers::CONTENT_ENCODING) == Some(ENCODING_GZIP);
            let body = if gzipped {
                gunzip(&response.body)?
            } else {
                response.body
            };

            let (file, collection_name) = match files_by_shard.get(&shard_id) {
                Some(entry) => entry.clone(),
                None => {
                    let info = self.shards.get(&shard_id).ok_or_else(|| {
                        DumpError::InvalidResponse(format!(
                            "server returned an unexpected shard {shard_id}"
                        ))
                    })?;
                    let file = self.file_provider.get_file(&info.collection_name)?;
                    let entry = (file, info.collection_name.clone());
                    files_by_shard.insert(shard_id.clone(), entry.clone());
                    entry
                }
            };

            tracing::trace!(
                "writing data for shard '{shard_id}' of collection '{collection_name}' into \
                 file '{}'",
                file.path().display()
            );
            dump_body(
                &self.ctx.stats,
                self.ctx.maskings(),
                &file,
                &body,
                &collection_name,
            )?;
        }
    }

    pub fn run(&self, client: &HttpClient) -> Result<()> {
        let options = &self.ctx.options;
        let label = server_label(self.server.as_deref());
        tracing::info!(
            "preparing data stream{label}, using {} DBServer worker thread(s), {} network \
             thread(s), {} local writer thread(s), number of prefetch batches: {}",
            options.dbserver_worker_threads,
            options.local_network_threads,
            options.local_writer_threads,
            options.dbserver_prefetch_batches,
        );

        let dump_id = self.create_dump_context(client)?;

        let channel = Arc::new(BoundedChannel::new(options.local_writer_threads as usize));
        let batch_counter = AtomicU64::new(0);
        let block = BlockCounters::new(label.clone());
        let failure = Failure::default();

        std::thread::scope(|s| {
            for i in 0..options.local_network_threads as usize {
                let guard = ProducerGuard::new(Arc::clone(&channel));
                let channel = &channel;
                let batch_counter = &batch_counter;
                let block = &block;
                let failure = &failure;
                let dump_id = dump_id.as_str();
                s.spawn(move || {
                    // the guard closes the channel when the last network
                    // thread finishes
                    let _guard = guard;
                    let client = self.ctx.manager.client();
                    self.network_thread(
                        i,
                        &client,
                        dump_id,
                        channel,
                        batch_counter,
                        block,
                        failure,
                    );
                });
            }

            for _ in 0..options.local_writer_threads as usize {
                let channel = &channel;
                let block = &block;
                let failure = &failure;
                s.spawn(move || self.writer_thread(channel, block, failure));
            }
        });

        // remove the dump context from the server with a fresh client; the
        // thread clients may already be disconnected
        self.finish_dump_context(&self.ctx.manager.client(), &dump_id);

        block.log_summary();

        match failure.take() {
            Some(e) => Err(e),
            None => {
                tracing::info!("all data received{label}");
                Ok(())
            }
        }
    }
}

/// First error of any pipeline thread; recording it also closes the channel
/// so the remaining threads wind down at their next loop boundary.
#[derive(Default)]
struct Failure {
    first: Mutex<Option<DumpError>>,
}

impl Failure {
    fn record(&self, err: DumpError, channel: &BoundedChannel<HttpResponse>) {
        let mut slot = self.first.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        }
        channel.close();
    }

    fn take(&self) -> Option<DumpError> {
        self.first.lock().unwrap().take()
    }
}
