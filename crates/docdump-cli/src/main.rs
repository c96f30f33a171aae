use clap::{ArgAction, Parser};

use docdump_core::options::Options;
use docdump_core::run;

#[derive(Parser)]
#[command(
    name = "docdump",
    version,
    about = "Parallel logical backups for document database clusters",
    after_help = "\
Examples:
  docdump --server.endpoint http://127.0.0.1:8529 dump
  docdump --all-databases true --output-directory backup
  docdump --parallel-dump true --split-files true --threads 8 dump"
)]
struct Cli {
    /// The output directory.
    #[arg(long = "output-directory", default_value = "dump")]
    output_directory: String,

    /// Positional alternative to --output-directory.
    directory: Option<String>,

    /// Server endpoint to connect to.
    #[arg(long = "server.endpoint", default_value = "http://127.0.0.1:8529")]
    server_endpoint: String,

    /// Username to authenticate with.
    #[arg(long = "server.username", default_value = "root")]
    server_username: String,

    /// Password to authenticate with.
    #[arg(long = "server.password", default_value = "")]
    server_password: String,

    /// Database to dump.
    #[arg(long = "server.database")]
    server_database: Option<String>,

    /// Restrict the dump to this collection name (can be specified multiple
    /// times).
    #[arg(long = "collection")]
    collection: Vec<String>,

    /// Restrict the dump to this shard (can be specified multiple times).
    #[arg(long = "shard")]
    shard: Vec<String>,

    /// The initial size for individual data batches (in bytes).
    #[arg(long = "initial-batch-size", default_value_t = 1024 * 1024 * 8)]
    initial_batch_size: u64,

    /// The maximum size for individual data batches (in bytes).
    #[arg(long = "batch-size", default_value_t = 1024 * 1024 * 64)]
    batch_size: u64,

    /// The maximum number of collections/shards to process in parallel.
    #[arg(long = "threads", default_value_t = 2)]
    threads: u32,

    /// Whether to dump collection data.
    #[arg(long = "dump-data", default_value_t = true, action = ArgAction::Set,
          num_args = 0..=1, default_missing_value = "true")]
    dump_data: bool,

    /// Whether to dump view definitions.
    #[arg(long = "dump-views", default_value_t = true, action = ArgAction::Set,
          num_args = 0..=1, default_missing_value = "true")]
    dump_views: bool,

    /// Whether to dump all databases.
    #[arg(long = "all-databases", default_value_t = false, action = ArgAction::Set,
          num_args = 0..=1, default_missing_value = "true")]
    all_databases: bool,

    /// Include system collections.
    #[arg(long = "include-system-collections", default_value_t = false,
          action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    include_system_collections: bool,

    /// Continue dumping even in the face of some server-side errors.
    #[arg(long = "force", default_value_t = false, action = ArgAction::Set,
          num_args = 0..=1, default_missing_value = "true")]
    force: bool,

    /// Continue dumping even if a sharding prototype collection is not backed
    /// up, too.
    #[arg(long = "ignore-distribute-shards-like-errors", default_value_t = false,
          action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    ignore_distribute_shards_like_errors: bool,

    /// Overwrite data in the output directory.
    #[arg(long = "overwrite", default_value_t = false, action = ArgAction::Set,
          num_args = 0..=1, default_missing_value = "true")]
    overwrite: bool,

    /// Show the progress.
    #[arg(long = "progress", default_value_t = true, action = ArgAction::Set,
          num_args = 0..=1, default_missing_value = "true")]
    progress: bool,

    /// A path to a file with masking definitions.
    #[arg(long = "maskings")]
    maskings: Option<String>,

    /// Compress files containing collection contents using the gzip format.
    #[arg(long = "compress-output", default_value_t = true, action = ArgAction::Set,
          num_args = 0..=1, default_missing_value = "true")]
    compress_output: bool,

    /// Compress data for transport using the gzip format.
    #[arg(long = "compress-transfer", default_value_t = false, action = ArgAction::Set,
          num_args = 0..=1, default_missing_value = "true")]
    compress_transfer: bool,

    /// Dump collection data in the binary body format (more compact than
    /// JSON, requires a restore tool that understands it).
    #[arg(long = "dump-vpack", default_value_t = false, action = ArgAction::Set,
          num_args = 0..=1, default_missing_value = "true")]
    dump_vpack: bool,

    /// Stream shards per dbserver instead of pulling collections one by one.
    #[arg(long = "parallel-dump", default_value_t = false, action = ArgAction::Set,
          num_args = 0..=1, default_missing_value = "true")]
    parallel_dump: bool,

    /// Split a collection in multiple files to increase throughput. Only has
    /// an effect together with --parallel-dump.
    #[arg(long = "split-files", default_value_t = false, action = ArgAction::Set,
          num_args = 0..=1, default_missing_value = "true")]
    split_files: bool,

    /// Number of worker threads on each dbserver.
    #[arg(long = "dbserver-worker-threads", default_value_t = 5)]
    dbserver_worker_threads: u64,

    /// Number of batches to prefetch on each dbserver.
    #[arg(long = "dbserver-prefetch-batches", default_value_t = 5)]
    dbserver_prefetch_batches: u64,

    /// Number of local writer threads.
    #[arg(long = "local-writer-threads", default_value_t = 4)]
    local_writer_threads: u64,

    /// Number of local network threads, i.e. how many requests are sent in
    /// parallel.
    #[arg(long = "local-network-threads", default_value_t = 8)]
    local_network_threads: u64,

    /// Terminate the process when a request exhausts its retry budget
    /// instead of reporting a job failure.
    #[arg(long = "abort-on-retry-exhaustion", default_value_t = false,
          action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    abort_on_retry_exhaustion: bool,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn into_options(self) -> Options {
        Options {
            endpoint: self.server_endpoint,
            username: self.server_username,
            password: self.server_password,
            database: self
                .server_database
                .clone()
                .unwrap_or_else(|| "_system".to_string()),
            database_explicit: self.server_database.is_some(),
            collections: self.collection,
            shards: self.shard,
            initial_chunk_size: self.initial_batch_size,
            max_chunk_size: self.batch_size,
            thread_count: self.threads,
            dump_data: self.dump_data,
            dump_views: self.dump_views,
            all_databases: self.all_databases,
            include_system_collections: self.include_system_collections,
            force: self.force,
            ignore_distribute_shards_like_errors: self.ignore_distribute_shards_like_errors,
            overwrite: self.overwrite,
            progress: self.progress,
            output_path: self.directory.unwrap_or(self.output_directory),
            maskings_file: self.maskings,
            use_gzip_for_storage: self.compress_output,
            use_gzip_for_transport: self.compress_transfer,
            use_vpack: self.dump_vpack,
            use_parallel_dump: self.parallel_dump,
            split_files: self.split_files,
            dbserver_worker_threads: self.dbserver_worker_threads,
            dbserver_prefetch_batches: self.dbserver_prefetch_batches,
            local_writer_threads: self.local_writer_threads,
            local_network_threads: self.local_network_threads,
            abort_on_retry_exhaustion: self.abort_on_retry_exhaustion,
            ..Options::default()
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut options = cli.into_options();
    // conflicting flags abort before any I/O happens
    if let Err(e) = options.validate() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }

    if let Err(e) = run::run(options) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
