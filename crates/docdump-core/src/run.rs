use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde_json::{json, Value};

use crate::batch::{start_batch, BatchGuard};
use crate::directory::ManagedDirectory;
use crate::dump::files::DumpFileProvider;
use crate::dump::job::{CollectionJob, DumpJob};
use crate::dump::parallel::{ParallelServerJob, ShardInfo};
use crate::dump::DumpContext;
use crate::error::{DumpError, Result};
use crate::http::{
    check_response, db_prefix, retry::maybe_abort, retry::with_retry, ClientManager, HttpClient,
    HttpTransport, UreqTransport,
};
use crate::inventory::{
    collection_id, collection_parameters, database_dir_name, escaped_view_name, Inventory,
};
use crate::maskings::Maskings;
use crate::options::Options;
use crate::queue::TaskQueue;
use crate::stats::Stats;

/// Errors reported by worker threads. Recording an error also clears the
/// remaining queue so outstanding jobs return promptly.
#[derive(Default)]
struct WorkerErrors {
    errors: Mutex<Vec<DumpError>>,
}

impl WorkerErrors {
    fn report(&self, error: DumpError, queue: &TaskQueue<DumpJob>) {
        self.errors.lock().unwrap().push(error);
        queue.clear_queue();
    }

    fn clear(&self) {
        self.errors.lock().unwrap().clear();
    }

    fn take_first(&self) -> Option<DumpError> {
        let mut errors = self.errors.lock().unwrap();
        if errors.is_empty() {
            None
        } else {
            Some(errors.remove(0))
        }
    }
}

/// Run a dump with the default blocking transport.
pub fn run(options: Options) -> Result<()> {
    let transport = Arc::new(UreqTransport::new(
        &options.endpoint,
        &options.username,
        &options.password,
    ));
    run_with_transport(options, transport)
}

/// Run a dump against an externally supplied transport. Options must already
/// be validated.
pub fn run_with_transport(mut options: Options, transport: Arc<dyn HttpTransport>) -> Result<()> {
    let start = Instant::now();

    let maskings = match &options.maskings_file {
        Some(path) => Some(Arc::new(Maskings::from_file(path)?)),
        None => None,
    };

    // pseudo-ids the server uses to track connected clients
    options.client_id = (rand::random::<u64>() & 0x0000_FFFF_FFFF_FFFF).to_string();
    options.syncer_id = rand::random::<u64>().to_string();

    let base_directory = Arc::new(ManagedDirectory::create(
        options.output_path.clone(),
        options.overwrite,
        options.use_gzip_for_storage,
    )?);

    let manager = Arc::new(ClientManager::new(transport));
    let client = manager.client();

    let role = server_role(&client)?;
    options.cluster_mode = role == "COORDINATOR";
    if role == "PRIMARY" {
        tracing::warn!(
            "You connected to a DBServer node, but operations in a cluster should be carried \
             out via a Coordinator. This is an unsupported operation!"
        );
    }

    let stats = Arc::new(Stats::default());
    let errors = Arc::new(WorkerErrors::default());

    let queue: TaskQueue<DumpJob> = {
        let errors = Arc::clone(&errors);
        let options = options.clone();
        TaskQueue::new(Box::new(move |client, job, queue| {
            if let Err(e) = job.run(client, queue) {
                maybe_abort(&options, &e);
                errors.report(e, queue);
            }
        }))
    };
    queue.spawn_workers(&manager, options.thread_count);

    if options.progress {
        tracing::info!(
            "Connected to '{}', database: '{}', username: '{}'",
            options.endpoint,
            options.database,
            options.username,
        );
        tracing::info!(
            "Writing dump to output directory '{}' with {} thread(s)",
            base_directory.path().display(),
            options.thread_count,
        );
    }

    let databases = if options.all_databases {
        match get_databases(&client) {
            Ok(databases) => databases,
            Err(e) => {
                queue.shutdown();
                return Err(e);
            }
        }
    } else {
        vec![options.database.clone()]
    };

    let mut first_failure: Option<DumpError> = None;
    for database in &databases {
        errors.clear();
        let result = dump_database(
            &client, &manager, &queue, &errors, &options, &maskings, &stats, &base_directory,
            database,
        );
        if let Err(e) = result {
            tracing::error!("An error occurred: {e}");
            if first_failure.is_none() {
                first_failure = Some(e);
            }
            if !options.force {
                break;
            }
        }
    }

    queue.shutdown();

    if options.progress {
        log_summary(&options, &stats, databases.len(), start.elapsed().as_secs_f64());
    }

    match first_failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// `GET /_admin/server/role`, the cluster/single-server discriminator.
fn server_role(client: &HttpClient) -> Result<String> {
    let response = with_retry("determine server role", || {
        check_response(client.get("/_admin/server/role"))
    })
    .inspect_err(|e| {
        tracing::error!("Error: could not detect instance type: {e}");
    })?;
    let body = response.json()?;
    body.get("role")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| DumpError::malformed("role response carries no role"))
}

/// List of databases the current user can see, `_system` first.
fn get_databases(client: &HttpClient) -> Result<Vec<String>> {
    let response = with_retry("list databases", || {
        check_response(client.get("/_api/database/user"))
    })
    .inspect_err(|e| {
        tracing::error!("An error occurred while trying to determine list of databases: {e}");
    })?;

    let body = response.json()?;
    let result = body
        .get("result")
        .and_then(Value::as_array)
        .ok_or_else(|| DumpError::Other("expecting list of databases to be an array".to_string()))?;

    let mut databases: Vec<String> = result
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect();
    databases.sort_by(|lhs, rhs| {
        let lhs_system = lhs == "_system";
        let rhs_system = rhs == "_system";
        rhs_system.cmp(&lhs_system).then_with(|| lhs.cmp(rhs))
    });
    Ok(databases)
}

#[allow(clippy::too_many_arguments)]
fn dump_database(
    client: &HttpClient,
    manager: &Arc<ClientManager>,
    queue: &TaskQueue<DumpJob>,
    errors: &WorkerErrors,
    options: &Options,
    maskings: &Option<Arc<Maskings>>,
    stats: &Arc<Stats>,
    base_directory: &Arc<ManagedDirectory>,
    database: &str,
) -> Result<()> {
    if options.cluster_mode {
        let url = format!(
            "{}/_api/replication/clusterInventory?includeSystem={}",
            db_prefix(database),
            options.include_system_collections,
        );
        run_dump(
            client, manager, queue, errors, options, maskings, stats, base_directory, database,
            &url, 0,
        )
    } else {
        // the batch pins a consistent snapshot for the whole database dump
        let batch_id = start_batch(client, options, database, None)?;
        let batch = BatchGuard::new(client.clone(), options, database, None, batch_id);
        let url = format!(
            "{}/_api/replication/inventory?includeSystem={}&includeFoxxQueues={}&batchId={}",
            db_prefix(database),
            options.include_system_collections,
            options.include_system_collections,
            batch.id(),
        );
        run_dump(
            client, manager, queue, errors, options, maskings, stats, base_directory, database,
            &url, batch.id(),
        )
    }
}

fn is_ignored_hidden_enterprise_collection(options: &Options, name: &str) -> bool {
    if !options.force
        && (name.starts_with("_local_")
            || name.starts_with("_from_")
            || name.starts_with("_to_"))
    {
        tracing::info!(
            "Dump is ignoring collection '{name}'. Will be created via SmartGraphs of a full \
             dump. If you want to dump this collection anyway use '--force'. However this is \
             not recommended and you should instead dump the edge collection of the SmartGraph \
             instead."
        );
        return true;
    }
    false
}

#[allow(clippy::too_many_arguments)]
fn run_dump(
    client: &HttpClient,
    manager: &Arc<ClientManager>,
    queue: &TaskQueue<DumpJob>,
    errors: &WorkerErrors,
    options: &Options,
    maskings: &Option<Arc<Maskings>>,
    stats: &Arc<Stats>,
    base_directory: &Arc<ManagedDirectory>,
    database: &str,
    inventory_url: &str,
    batch_id: u64,
) -> Result<()> {
    let response = with_retry("fetch inventory", || {
        check_response(client.get(inventory_url))
    })
    .inspect_err(|e| {
        tracing::error!("An error occurred while fetching inventory: {e}");
    })?;

    let body = response.json()?;
    let inventory = Inventory::parse(&body)?;

    let directory: Arc<ManagedDirectory> = if options.all_databases {
        let id = inventory
            .properties
            .as_ref()
            .and_then(|p| p.get("id"))
            .and_then(Value::as_str)
            .ok_or_else(|| DumpError::malformed("database properties carry no id"))?;
        tracing::info!("Dumping database '{database}' ({id})");
        Arc::new(base_directory.subdirectory(
            database_dir_name(database, id),
            options.overwrite,
        )?)
    } else {
        Arc::clone(base_directory)
    };

    tracing::info!("Last tick provided by server is: {}", inventory.tick);

    store_dump_json(&directory, &inventory, database, options)?;
    if options.dump_views {
        store_views(&directory, &inventory.views)?;
    }

    // lookup table of everything the user asked for (may be empty = all)
    let mut restrict_list: BTreeMap<String, Option<Value>> = options
        .collections
        .iter()
        .map(|name| (name.clone(), None))
        .collect();
    let restricted = !options.collections.is_empty();

    for collection in &inventory.collections {
        let parameters = collection_parameters(collection)?;
        let cid = collection_id(parameters);
        let name = parameters
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let deleted = parameters
            .get("deleted")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if cid == 0 || name.is_empty() {
            return Err(DumpError::malformed("collection with missing id or name"));
        }
        if deleted {
            continue;
        }
        if name.starts_with('_') && !options.include_system_collections {
            continue;
        }
        if restricted && !restrict_list.contains_key(&name) {
            continue;
        }
        if is_ignored_hidden_enterprise_collection(options, &name) {
            continue;
        }

        if !options.ignore_distribute_shards_like_errors {
            let prototype = parameters
                .get("distributeShardsLike")
                .and_then(Value::as_str)
                .unwrap_or("");
            if !prototype.is_empty()
                && restricted
                && !options.collections.iter().any(|c| c == prototype)
            {
                return Err(DumpError::Other(format!(
                    "Collection {name}'s shard distribution is based on that of collection \
                     {prototype}, which is not dumped along. You may dump the collection \
                     regardless of the missing prototype collection by using the \
                     --ignore-distribute-shards-like-errors parameter."
                )));
            }
        }

        restrict_list.insert(name, Some(collection.clone()));
    }

    // at least one of the requested collections must exist
    if restricted && restrict_list.values().all(Option::is_none) {
        return Err(DumpError::Other(
            "None of the requested collections were found in the database".to_string(),
        ));
    }

    let ctx = Arc::new(DumpContext {
        options: options.clone(),
        database: database.to_string(),
        directory: Arc::clone(&directory),
        maskings: maskings.clone(),
        stats: Arc::clone(stats),
        manager: Arc::clone(manager),
    });

    let queue_result = queue_jobs(&ctx, queue, options, &directory, &restrict_list, batch_id);

    // wait even if queueing failed part-way: some jobs may already be running
    queue.wait_for_idle();
    queue_result?;

    match errors.take_first() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn queue_jobs(
    ctx: &Arc<DumpContext>,
    queue: &TaskQueue<DumpJob>,
    options: &Options,
    directory: &Arc<ManagedDirectory>,
    restrict_list: &BTreeMap<String, Option<Value>>,
    batch_id: u64,
) -> Result<()> {
    let mut shards_by_server: HashMap<Option<String>, HashMap<String, ShardInfo>> = HashMap::new();

    for (name, info) in restrict_list {
        let Some(info) = info else {
            tracing::warn!("Requested collection '{name}' not found in database");
            continue;
        };

        if options.use_parallel_dump {
            if options.cluster_mode {
                let shards = collection_parameters(info)?
                    .get("shards")
                    .and_then(Value::as_object)
                    .ok_or_else(|| {
                        DumpError::InvalidResponse(
                            "unexpected value for 'shards' attribute".to_string(),
                        )
                    })?;
                for (shard, servers) in shards {
                    if !options.shards.is_empty() && !options.shards.iter().any(|s| s == shard) {
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
                    shards_by_server
                        .entry(Some(server.to_string()))
                        .or_default()
                        .insert(
                            shard.clone(),
                            ShardInfo {
                                collection_name: name.clone(),
                            },
                        );
                }
            } else {
                // single server: all pseudo-shards live in one place
                shards_by_server.entry(None).or_default().insert(
                    name.clone(),
                    ShardInfo {
                        collection_name: name.clone(),
                    },
                );
            }
        }

        queue.queue_job(DumpJob::Collection(CollectionJob {
            ctx: Arc::clone(ctx),
            collection_info: info.clone(),
            collection_name: name.clone(),
            batch_id,
        }));
    }

    if options.use_parallel_dump {
        let selected: BTreeMap<String, Value> = restrict_list
            .iter()
            .filter_map(|(name, info)| info.as_ref().map(|i| (name.clone(), i.clone())))
            .collect();
        let file_provider = Arc::new(DumpFileProvider::new(
            Arc::clone(directory),
            &selected,
            options.split_files,
            options.datafile_suffix(),
        )?);

        for (server, shards) in shards_by_server {
            queue.queue_job(DumpJob::ParallelServer(ParallelServerJob {
                ctx: Arc::clone(ctx),
                file_provider: Arc::clone(&file_provider),
                shards,
                server,
            }));
        }
    }

    Ok(())
}

fn store_dump_json(
    directory: &ManagedDirectory,
    inventory: &Inventory,
    database: &str,
    options: &Options,
) -> Result<()> {
    let mut meta = json!({
        "database": database,
        "createdAt": chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        "lastTickAtDumpStart": inventory.tick,
        "useEnvelope": false,
        "useVPack": options.use_vpack,
    });
    if let Some(properties) = &inventory.properties {
        meta["properties"] = properties.clone();
    }

    let file = directory.writable_file("dump.json", false)?;
    file.write(serde_json::to_string(&meta)?.as_bytes())?;
    file.finish()
}

fn store_views(directory: &ManagedDirectory, views: &[Value]) -> Result<()> {
    for view in views {
        let Some(name) = view.get("name").and_then(Value::as_str).filter(|n| !n.is_empty())
        else {
            continue;
        };

        let filename = format!("{}.view.json", escaped_view_name(name, view));
        let file = directory.writable_file(&filename, false)?;
        file.write(serde_json::to_string(view)?.as_bytes())?;
        file.finish()?;
    }
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

fn log_summary(options: &Options, stats: &Stats, databases: usize, elapsed: f64) {
    use std::sync::atomic::Ordering;

    let collections = stats.total_collections.load(Ordering::Relaxed);
    if options.dump_data {
        tracing::info!(
            "Processed {collections} collection(s) from {databases} database(s) in \
             {elapsed:.2} s total time. Retrieved {} from server, sent {} batch(es) in total. \
             Total written to disk (before compression): {}",
            format_size(stats.total_received.load(Ordering::Relaxed)),
            stats.total_batches.load(Ordering::Relaxed),
            format_size(stats.total_written.load(Ordering::Relaxed)),
        );
    } else {
        tracing::info!(
            "Processed {collections} collection(s) from {databases} database(s) in \
             {elapsed:.2} s total time"
        );
    }
}
