use crate::error::{DumpError, Result};

/// Minimum amount of data to fetch from the server in a single chunk.
pub const MIN_CHUNK_SIZE: u64 = 128 * 1024;

/// Maximum amount of data to fetch from the server in a single chunk.
// NB: larger values may cause tcp issues (check exact limits)
pub const MAX_CHUNK_SIZE: u64 = 1024 * 1024 * 96;

/// Everything the dump run needs to know, resolved once at startup and shared
/// read-only by all jobs and threads.
#[derive(Debug, Clone)]
pub struct Options {
    /// Server endpoint, e.g. "http://127.0.0.1:8529".
    pub endpoint: String,
    pub username: String,
    pub password: String,
    /// Database to dump when `all_databases` is off.
    pub database: String,
    /// Whether `database` was set explicitly (conflicts with `all_databases`).
    pub database_explicit: bool,

    /// Restrict the dump to these collection names (empty = all).
    pub collections: Vec<String>,
    /// Restrict the dump to these shard ids (empty = all).
    pub shards: Vec<String>,
    pub initial_chunk_size: u64,
    pub max_chunk_size: u64,
    /// Worker pool size for collection/shard jobs.
    pub thread_count: u32,
    pub dump_data: bool,
    pub dump_views: bool,
    pub all_databases: bool,
    pub include_system_collections: bool,
    /// Continue dumping past per-database errors.
    pub force: bool,
    pub ignore_distribute_shards_like_errors: bool,
    pub overwrite: bool,
    pub progress: bool,
    pub output_path: String,
    pub maskings_file: Option<String>,
    pub use_gzip_for_storage: bool,
    pub use_gzip_for_transport: bool,
    /// Fetch and store collection data in the binary body format.
    pub use_vpack: bool,
    /// Select the per-dbserver streamed pipeline instead of the classical
    /// per-collection pull.
    pub use_parallel_dump: bool,
    /// One output file per batch instead of one per collection. Requires
    /// `use_parallel_dump`.
    pub split_files: bool,
    pub dbserver_worker_threads: u64,
    pub dbserver_prefetch_batches: u64,
    pub local_writer_threads: u64,
    pub local_network_threads: u64,
    /// Abort the whole process when a call-site exhausts its retry budget,
    /// matching the historical behavior. Off by default: the failure is
    /// reported as a job error instead.
    pub abort_on_retry_exhaustion: bool,

    /// Detected at runtime from the server role.
    pub cluster_mode: bool,
    /// Process-wide pseudo-ids sent to the server, chosen once at startup.
    pub client_id: String,
    pub syncer_id: String,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            endpoint: "http://127.0.0.1:8529".to_string(),
            username: "root".to_string(),
            password: String::new(),
            database: "_system".to_string(),
            database_explicit: false,
            collections: Vec::new(),
            shards: Vec::new(),
            initial_chunk_size: 1024 * 1024 * 8,
            max_chunk_size: 1024 * 1024 * 64,
            thread_count: 2,
            dump_data: true,
            dump_views: true,
            all_databases: false,
            include_system_collections: false,
            force: false,
            ignore_distribute_shards_like_errors: false,
            overwrite: false,
            progress: true,
            output_path: "dump".to_string(),
            maskings_file: None,
            use_gzip_for_storage: true,
            use_gzip_for_transport: false,
            use_vpack: false,
            use_parallel_dump: false,
            split_files: false,
            dbserver_worker_threads: 5,
            dbserver_prefetch_batches: 5,
            local_writer_threads: 4,
            local_network_threads: 8,
            abort_on_retry_exhaustion: false,
            cluster_mode: false,
            client_id: String::new(),
            syncer_id: String::new(),
        }
    }
}

fn available_cores() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

impl Options {
    /// Clamp numeric settings to their allowed ranges and reject conflicting
    /// flag combinations. Must run before any I/O.
    pub fn validate(&mut self) -> Result<()> {
        self.initial_chunk_size = self.initial_chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
        self.max_chunk_size = self
            .max_chunk_size
            .clamp(self.initial_chunk_size, MAX_CHUNK_SIZE);

        let max_threads = 4 * available_cores();
        let clamped = self.thread_count.clamp(1, max_threads);
        if self.thread_count != clamped {
            tracing::warn!("capping --threads value to {clamped}");
            self.thread_count = clamped;
        }

        self.dbserver_worker_threads = self.dbserver_worker_threads.max(1);
        self.dbserver_prefetch_batches = self.dbserver_prefetch_batches.max(1);
        self.local_writer_threads = self.local_writer_threads.max(1);
        self.local_network_threads = self.local_network_threads.max(1);

        if self.all_databases && self.database_explicit {
            return Err(DumpError::Config(
                "cannot use --server.database and --all-databases at the same time".to_string(),
            ));
        }

        if self.split_files && !self.use_parallel_dump {
            return Err(DumpError::Config(
                "--split-files is only available when using --parallel-dump".to_string(),
            ));
        }

        if self.maskings_file.is_some() && self.use_vpack {
            return Err(DumpError::Config(
                "--maskings requires the JSON transfer format and cannot be combined \
                 with --dump-vpack"
                    .to_string(),
            ));
        }

        // if any of the specified collections is a system collection,
        // auto-enable system collections for the user
        if self.collections.iter().any(|name| name.starts_with('_')) {
            self.include_system_collections = true;
        }

        while self.output_path.len() > 1 && self.output_path.ends_with('/') {
            self.output_path.pop();
        }

        Ok(())
    }

    /// Suffix for data files, depending on the body format.
    pub fn datafile_suffix(&self) -> &'static str {
        if self.use_vpack {
            "vpack"
        } else {
            "json"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_sizes_are_clamped() {
        let mut opts = Options {
            initial_chunk_size: 1,
            max_chunk_size: u64::MAX,
            ..Options::default()
        };
        opts.validate().unwrap();
        assert_eq!(opts.initial_chunk_size, MIN_CHUNK_SIZE);
        assert_eq!(opts.max_chunk_size, MAX_CHUNK_SIZE);
    }

    #[test]
    fn max_chunk_size_at_least_initial() {
        let mut opts = Options {
            initial_chunk_size: 1024 * 1024,
            max_chunk_size: 1,
            ..Options::default()
        };
        opts.validate().unwrap();
        assert_eq!(opts.max_chunk_size, opts.initial_chunk_size);
    }

    #[test]
    fn thread_count_is_clamped() {
        let mut opts = Options {
            thread_count: 0,
            ..Options::default()
        };
        opts.validate().unwrap();
        assert_eq!(opts.thread_count, 1);

        let mut opts = Options {
            thread_count: u32::MAX,
            ..Options::default()
        };
        opts.validate().unwrap();
        assert!(opts.thread_count <= 4 * available_cores());
    }

    #[test]
    fn split_files_requires_parallel_dump() {
        let mut opts = Options {
            split_files: true,
            use_parallel_dump: false,
            ..Options::default()
        };
        assert!(matches!(opts.validate(), Err(DumpError::Config(_))));

        opts.use_parallel_dump = true;
        opts.validate().unwrap();
    }

    #[test]
    fn all_databases_conflicts_with_explicit_database() {
        let mut opts = Options {
            all_databases: true,
            database_explicit: true,
            ..Options::default()
        };
        assert!(matches!(opts.validate(), Err(DumpError::Config(_))));
    }

    #[test]
    fn maskings_conflict_with_vpack() {
        let mut opts = Options {
            maskings_file: Some("maskings.json".to_string()),
            use_vpack: true,
            ..Options::default()
        };
        assert!(matches!(opts.validate(), Err(DumpError::Config(_))));
    }

    #[test]
    fn system_collection_request_enables_system_collections() {
        let mut opts = Options {
            collections: vec!["_apps".to_string()],
            ..Options::default()
        };
        opts.validate().unwrap();
        assert!(opts.include_system_collections);
    }
}
