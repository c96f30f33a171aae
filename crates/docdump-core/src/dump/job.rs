use std::sync::Arc;

use serde_json::Value;

use crate::batch::{extend_batch, start_batch, BatchGuard};
use crate::dump::collection::dump_collection;
use crate::dump::parallel::ParallelServerJob;
use crate::dump::DumpContext;
use crate::error::{DumpError, Result};
use crate::http::HttpClient;
use crate::inventory::{collection_parameters, escaped_collection_name, md5_hex};
use crate::queue::TaskQueue;

/// The unit of work consumed by the worker pool. Each variant encodes one
/// pull strategy.
pub enum DumpJob {
    /// Write a collection's structure file; on a single server also pull its
    /// data, in a cluster fan out one shard job per shard.
    Collection(CollectionJob),
    /// Pull one shard from its dbserver under a private batch.
    Shard(ShardJob),
    /// The per-dbserver streamed pipeline.
    ParallelServer(ParallelServerJob),
}

impl DumpJob {
    pub fn run(&self, client: &HttpClient, queue: &TaskQueue<DumpJob>) -> Result<()> {
        match self {
            DumpJob::Collection(job) => job.run(client, queue),
            DumpJob::Shard(job) => job.run(client),
            DumpJob::ParallelServer(job) => job.run(client),
        }
    }
}

pub struct CollectionJob {
    pub ctx: Arc<DumpContext>,
    /// Full collection descriptor from the inventory, echoed into the
    /// structure file.
    pub collection_info: Value,
    pub collection_name: String,
    /// The database-wide batch on a single server; 0 in a cluster.
    pub batch_id: u64,
}

impl CollectionJob {
    fn run(&self, client: &HttpClient, queue: &TaskQueue<DumpJob>) -> Result<()> {
        let ctx = &self.ctx;
        let options = &ctx.options;
        let name = &self.collection_name;

        if options.progress {
            tracing::info!("# Dumping collection '{name}'...");
        }

        let mut dump_structure = true;
        let mut dump_data = options.dump_data;
        if let Some(maskings) = ctx.maskings() {
            dump_structure = maskings.should_dump_structure(name);
            if dump_data {
                dump_data = maskings.should_dump_data(name);
            }
        }
        if !dump_structure && !dump_data {
            return Ok(());
        }

        let hex = md5_hex(name);
        ctx.stats.add_collection();

        // collection name may contain arbitrary characters
        let parameters = collection_parameters(&self.collection_info)?;
        let escaped = escaped_collection_name(name, parameters);

        if dump_structure {
            let filename = format!("{escaped}.structure.json");
            let file = ctx.directory.writable_file(&filename, false)?;

            let mut info = self.collection_info.clone();
            if let Some(parameters) = info.get_mut("parameters").and_then(Value::as_object_mut) {
                parameters.remove("shadowCollections");
            }
            file.write(serde_json::to_string(&info)?.as_bytes())?;
            file.finish()?;
        }

        if !options.use_parallel_dump {
            // always create the file so that the restore tool does not complain
            let filename = format!("{escaped}_{hex}.data.{}", options.datafile_suffix());
            let file = ctx.directory.writable_file(&filename, true)?;

            if dump_data {
                if options.cluster_mode {
                    // multiple shards may write to the same outfile
                    let file = Arc::new(file);
                    let shards = parameters
                        .get("shards")
                        .and_then(Value::as_object)
                        .ok_or_else(|| {
                            DumpError::InvalidResponse(
                                "unexpected value for 'shards' attribute".to_string(),
                            )
                        })?;

                    for (shard_name, servers) in shards {
                        if !options.shards.is_empty()
                            && !options.shards.iter().any(|s| s == shard_name)
                        {
                            // dump is restricted to specific shards
                            continue;
                        }
                        let server = servers
                            .get(0)
                            .and_then(Value::as_str)
                            .filter(|s| !s.is_empty())
                            .ok_or_else(|| {
                                DumpError::InvalidResponse(
                                    "unexpected value for 'shards' attribute".to_string(),
                                )
                            })?;

                        queue.queue_job(DumpJob::Shard(ShardJob {
                            ctx: Arc::clone(ctx),
                            collection_name: name.clone(),
                            shard_name: shard_name.clone(),
                            server: server.to_string(),
                            file: Arc::clone(&file),
                        }));
                    }
                } else {
                    // keep the batch alive for the duration of the pull
                    extend_batch(client, options, &ctx.database, self.batch_id);
                    dump_collection(client, ctx, &file, name, None, self.batch_id, name)?;
                }
            }
        }

        Ok(())
    }
}

pub struct ShardJob {
    pub ctx: Arc<DumpContext>,
    pub collection_name: String,
    pub shard_name: String,
    /// The dbserver holding the shard.
    pub server: String,
    /// Shared with the other shards of the collection; writes are serialized
    /// by the file itself.
    pub file: Arc<crate::directory::DumpFile>,
}

impl ShardJob {
    fn run(&self, client: &HttpClient) -> Result<()> {
        let ctx = &self.ctx;
        if ctx.options.progress {
            tracing::info!(
                "# Dumping shard '{}' of collection '{}' from DBserver '{}'...",
                self.shard_name,
                self.collection_name,
                self.server,
            );
        }

        // make sure we have a batch on this dbserver
        let batch_id = start_batch(client, &ctx.options, &ctx.database, Some(&self.server))?;
        let batch = BatchGuard::new(
            client.clone(),
            &ctx.options,
            &ctx.database,
            Some(&self.server),
            batch_id,
        );

        dump_collection(
            client,
            ctx,
            &self.file,
            &self.shard_name,
            Some(&self.server),
            batch.id(),
            &self.collection_name,
        )
    }
}
