use std::sync::Arc;

use crate::directory::ManagedDirectory;
use crate::http::ClientManager;
use crate::maskings::Maskings;
use crate::options::Options;
use crate::stats::Stats;

pub mod collection;
pub mod files;
pub mod job;
pub mod parallel;
pub mod writer;

/// Shared, read-only state for every job of one database dump.
pub struct DumpContext {
    pub options: Options,
    pub database: String,
    pub directory: Arc<ManagedDirectory>,
    pub maskings: Option<Arc<Maskings>>,
    pub stats: Arc<Stats>,
    pub manager: Arc<ClientManager>,
}

impl DumpContext {
    /// Prefix an API path with the database selector.
    pub fn db_path(&self, suffix: &str) -> String {
        format!("{}{}", crate::http::db_prefix(&self.database), suffix)
    }

    pub fn maskings(&self) -> Option<&Maskings> {
        self.maskings.as_deref()
    }
}

/// " on server 'x'" / " on server", for log message suffixes.
pub fn server_label(server: Option<&str>) -> String {
    match server {
        Some(s) => format!(" on server '{s}'"),
        None => " on server".to_string(),
    }
}
