use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::Value;

use crate::directory::ManagedDirectory;
use crate::dump::files::DumpFileProvider;
use crate::dump::parallel::{ParallelServerJob, ShardInfo};
use crate::dump::DumpContext;
use crate::error::DumpError;
use crate::http::{headers, ClientManager, Method};
use crate::inventory::md5_hex;
use crate::options::Options;
use crate::run::run_with_transport;
use crate::stats::Stats;
use crate::testutil::{
    collection_entry, expect_common, inventory_body, next_batch, test_options, MockResponse,
    MockTransport,
};

fn parallel_options(out: &std::path::Path) -> Options {
    let mut options = test_options(out);
    options.use_parallel_dump = true;
    options.local_network_threads = 2;
    options.local_writer_threads = 2;
    options.validate().unwrap();
    options
}

/// A single-server parallel job over one collection, everything constructed
/// by hand so the stats are observable.
fn make_job(
    mock: &Arc<MockTransport>,
    options: Options,
    directory: Arc<ManagedDirectory>,
) -> ParallelServerJob {
    let manager = Arc::new(ClientManager::new(Arc::clone(mock) as _));
    let stats = Arc::new(Stats::default());

    let mut collections: BTreeMap<String, Value> = BTreeMap::new();
    collections.insert("c".to_string(), collection_entry("c", "100", &[]));
    let split = options.split_files;
    let suffix = options.datafile_suffix();
    let file_provider =
        Arc::new(DumpFileProvider::new(Arc::clone(&directory), &collections, split, suffix).unwrap());

    let ctx = Arc::new(DumpContext {
        options,
        database: "_system".to_string(),
        directory,
        maskings: None,
        stats,
        manager,
    });

    let mut shards = HashMap::new();
    shards.insert(
        "c".to_string(),
        ShardInfo {
            collection_name: "c".to_string(),
        },
    );

    ParallelServerJob {
        ctx,
        file_provider,
        shards,
        server: None,
    }
}

fn dump_start_response(id: &str) -> MockResponse {
    MockResponse::status(200).header(headers::DUMP_ID, id)
}

#[test]
fn streams_batches_into_the_collection_file() {
    let tmp = tempfile::tempdir().unwrap();
    let directory =
        Arc::new(ManagedDirectory::create(tmp.path().join("out"), false, false).unwrap());
    let mock = Arc::new(MockTransport::new());
    mock.expect(Method::Post, "/_api/dump/start", dump_start_response("dumpA"));
    mock.expect(Method::Post, "/_api/dump/next/dumpA", next_batch("c", "{\"k\":1}\n"));
    mock.expect(Method::Post, "/_api/dump/next/dumpA", next_batch("c", "{\"k\":2}\n"));
    mock.expect_repeat(Method::Post, "/_api/dump/next/dumpA", MockResponse::status(204));
    mock.expect_repeat(Method::Delete, "/_api/dump/dumpA", MockResponse::status(200));

    let job = make_job(&mock, parallel_options(tmp.path()), Arc::clone(&directory));
    job.run(&job.ctx.manager.client()).unwrap();

    let hex = md5_hex("c");
    let data =
        std::fs::read_to_string(directory.path().join(format!("c_{hex}.data.json"))).unwrap();
    let lines: BTreeSet<&str> = data.lines().collect();
    assert_eq!(lines, BTreeSet::from(["{\"k\":1}", "{\"k\":2}"]));

    assert_eq!(job.ctx.stats.total_batches.load(Ordering::Relaxed), 2);
    assert!(job.ctx.stats.total_received.load(Ordering::Relaxed) > 0);

    // the dump context is released exactly once
    assert_eq!(mock.requests_matching(Method::Delete, "/_api/dump/dumpA"), 1);

    // lastBatch is echoed from the second request of a network thread on
    let with_last: Vec<String> = mock
        .paths_matching(Method::Post, "/_api/dump/next/dumpA")
        .into_iter()
        .filter(|p| p.contains("lastBatch="))
        .collect();
    assert!(!with_last.is_empty());
}

#[test]
fn transient_unavailability_is_retried_once_with_backoff() {
    let tmp = tempfile::tempdir().unwrap();
    let directory =
        Arc::new(ManagedDirectory::create(tmp.path().join("out"), false, false).unwrap());
    let mock = Arc::new(MockTransport::new());
    mock.expect(Method::Post, "/_api/dump/start", dump_start_response("dumpA"));
    // one 503, then data, then exhausted
    mock.expect(Method::Post, "/_api/dump/next/dumpA", MockResponse::status(503));
    mock.expect(Method::Post, "/_api/dump/next/dumpA", next_batch("c", "{\"k\":1}\n"));
    mock.expect_repeat(Method::Post, "/_api/dump/next/dumpA", MockResponse::status(204));
    mock.expect_repeat(Method::Delete, "/_api/dump/dumpA", MockResponse::status(200));

    let mut options = parallel_options(tmp.path());
    options.local_network_threads = 1;
    let job = make_job(&mock, options, Arc::clone(&directory));

    let started = std::time::Instant::now();
    job.run(&job.ctx.manager.client()).unwrap();

    assert_eq!(job.ctx.stats.total_batches.load(Ordering::Relaxed), 1);
    // the 503 bought one 500 ms backoff
    assert!(started.elapsed() >= std::time::Duration::from_millis(500));
}

#[test]
fn missing_dump_id_header_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let directory =
        Arc::new(ManagedDirectory::create(tmp.path().join("out"), false, false).unwrap());
    let mock = Arc::new(MockTransport::new());
    mock.expect(Method::Post, "/_api/dump/start", MockResponse::status(200));

    let job = make_job(&mock, parallel_options(tmp.path()), directory);
    let result = job.run(&job.ctx.manager.client());
    assert!(matches!(result, Err(DumpError::InvalidResponse(_))));
}

#[test]
fn missing_shard_header_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let directory =
        Arc::new(ManagedDirectory::create(tmp.path().join("out"), false, false).unwrap());
    let mock = Arc::new(MockTransport::new());
    mock.expect(Method::Post, "/_api/dump/start", dump_start_response("dumpA"));
    mock.expect(
        Method::Post,
        "/_api/dump/next/dumpA",
        MockResponse::status(200).body("{\"k\":1}\n".as_bytes().to_vec()),
    );
    mock.expect_repeat(Method::Post, "/_api/dump/next/dumpA", MockResponse::status(204));
    mock.expect_repeat(Method::Delete, "/_api/dump/dumpA", MockResponse::status(200));

    let job = make_job(&mock, parallel_options(tmp.path()), directory);
    let result = job.run(&job.ctx.manager.client());
    match result {
        Err(DumpError::InvalidResponse(message)) => {
            assert!(message.contains(headers::DUMP_SHARD_ID));
        }
        other => panic!("expected missing-header error, got {other:?}"),
    }
}

#[test]
fn unexpected_shard_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let directory =
        Arc::new(ManagedDirectory::create(tmp.path().join("out"), false, false).unwrap());
    let mock = Arc::new(MockTransport::new());
    mock.expect(Method::Post, "/_api/dump/start", dump_start_response("dumpA"));
    mock.expect(Method::Post, "/_api/dump/next/dumpA", next_batch("bogus", "{}\n"));
    mock.expect_repeat(Method::Post, "/_api/dump/next/dumpA", MockResponse::status(204));
    mock.expect_repeat(Method::Delete, "/_api/dump/dumpA", MockResponse::status(200));

    let job = make_job(&mock, parallel_options(tmp.path()), directory);
    let result = job.run(&job.ctx.manager.client());
    match result {
        Err(DumpError::InvalidResponse(message)) => {
            assert!(message.contains("unexpected shard"));
        }
        other => panic!("expected unexpected-shard error, got {other:?}"),
    }
}

#[test]
fn gzip_encoded_batches_are_inflated() {
    let tmp = tempfile::tempdir().unwrap();
    let directory =
        Arc::new(ManagedDirectory::create(tmp.path().join("out"), false, false).unwrap());
    let mock = Arc::new(MockTransport::new());
    mock.expect(Method::Post, "/_api/dump/start", dump_start_response("dumpA"));
    mock.expect(
        Method::Post,
        "/_api/dump/next/dumpA",
        MockResponse::status(200)
            .header(headers::DUMP_SHARD_ID, "c")
            .header(headers::CONTENT_ENCODING, "gzip")
            .body(crate::compress::gzip(b"{\"k\":\"zipped\"}\n")),
    );
    mock.expect_repeat(Method::Post, "/_api/dump/next/dumpA", MockResponse::status(204));
    mock.expect_repeat(Method::Delete, "/_api/dump/dumpA", MockResponse::status(200));

    let job = make_job(&mock, parallel_options(tmp.path()), Arc::clone(&directory));
    job.run(&job.ctx.manager.client()).unwrap();

    let hex = md5_hex("c");
    let data =
        std::fs::read_to_string(directory.path().join(format!("c_{hex}.data.json"))).unwrap();
    assert_eq!(data, "{\"k\":\"zipped\"}\n");
}

/// Cluster run in split-files mode: every document lands in exactly one
/// numbered file, shards are routed by the response header.
#[test]
fn cluster_split_files_cover_every_document_once() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("out");
    let mut options = test_options(&out);
    options.use_parallel_dump = true;
    options.split_files = true;
    options.local_network_threads = 2;
    options.local_writer_threads = 2;
    options.validate().unwrap();

    let mock = Arc::new(MockTransport::new());
    expect_common(
        &mock,
        "COORDINATOR",
        inventory_body(
            vec![collection_entry(
                "c",
                "100",
                &[("s1", "dbs1"), ("s2", "dbs2")],
            )],
            vec![],
            "7",
        ),
    );
    mock.expect(
        Method::Post,
        "/_api/dump/start?useVPack=false&dbserver=dbs1",
        dump_start_response("dump1"),
    );
    mock.expect(
        Method::Post,
        "/_api/dump/start?useVPack=false&dbserver=dbs2",
        dump_start_response("dump2"),
    );
    mock.expect(Method::Post, "/_api/dump/next/dump1", next_batch("s1", "{\"k\":\"a\"}\n"));
    mock.expect(Method::Post, "/_api/dump/next/dump1", next_batch("s1", "{\"k\":\"b\"}\n"));
    mock.expect_repeat(Method::Post, "/_api/dump/next/dump1", MockResponse::status(204));
    mock.expect(Method::Post, "/_api/dump/next/dump2", next_batch("s2", "{\"k\":\"c\"}\n"));
    mock.expect_repeat(Method::Post, "/_api/dump/next/dump2", MockResponse::status(204));
    mock.expect_repeat(Method::Delete, "/_api/dump/dump1", MockResponse::status(200));
    mock.expect_repeat(Method::Delete, "/_api/dump/dump2", MockResponse::status(200));

    run_with_transport(options, mock.clone() as _).unwrap();

    let hex = md5_hex("c");
    let prefix = format!("c_{hex}.");
    let mut documents: Vec<String> = Vec::new();
    let mut data_files = 0;
    for entry in std::fs::read_dir(&out).unwrap() {
        let entry = entry.unwrap();
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(&prefix) && name.ends_with(".data.json") {
            data_files += 1;
            let content = std::fs::read_to_string(entry.path()).unwrap();
            documents.extend(content.lines().map(str::to_string));
        }
    }

    assert!(data_files >= 2, "expected numbered split files, got {data_files}");
    documents.sort();
    assert_eq!(
        documents,
        vec!["{\"k\":\"a\"}", "{\"k\":\"b\"}", "{\"k\":\"c\"}"]
    );

    // structure file exists alongside, no combined data file
    assert!(out.join("c.structure.json").exists());
    assert!(!out.join(format!("c_{hex}.data.json")).exists());

    // each dump context was ended exactly once
    assert_eq!(mock.requests_matching(Method::Delete, "/_api/dump/dump1"), 1);
    assert_eq!(mock.requests_matching(Method::Delete, "/_api/dump/dump2"), 1);
}
