use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use datadeck_db::arrow::array::{ArrayRef, Int64Array};
use datadeck_db::{ClusterRegistry, DataFrame, DatadeckDb, TableMeta};

const ROLE_ENV: &str = "DATADECK_WORKER_ROLE";
const DB_ENV: &str = "DATADECK_WORKER_DB";
const OUT_ENV: &str = "DATADECK_WORKER_OUT";
const ROUNDS: usize = 20;
const WORKERS: usize = 3;

fn maybe_run_child() {
    let role = match env::var(ROLE_ENV) {
        Ok(role) => role,
        Err(_) => return,
    };
    if role != "worker" {
        eprintln!("unknown role: {role}");
        std::process::exit(4);
    }

    let db_path = PathBuf::from(env::var(DB_ENV).expect("child missing DB path"));
    let out_path = PathBuf::from(env::var(OUT_ENV).expect("child missing output path"));
    let db = DatadeckDb::open(&db_path, ClusterRegistry::empty()).expect("child failed to open store");

    let mut applied = 0usize;
    for _ in 0..ROUNDS {
        match db.execute_and_log("SELECT COUNT(*) FROM iris", None, false) {
            Ok(_) => applied += 1,
            Err(err) => {
                eprintln!("worker query failed: {err}");
                std::process::exit(3);
            }
        }
    }
    fs::write(out_path, applied.to_string()).expect("child failed to write result");
    std::process::exit(0);
}

#[test]
fn worker_processes_share_one_store() {
    maybe_run_child();

    let temp_dir = tempfile::TempDir::new().expect("tempdir");
    let db_path = temp_dir.path().join("dash.duckdb");
    {
        let db = DatadeckDb::open(&db_path, ClusterRegistry::empty()).expect("open store");
        let frame = DataFrame::from_columns(vec![(
            "id",
            Arc::new(Int64Array::from(vec![1, 2, 3])) as ArrayRef,
        )])
        .expect("frame");
        db.ingest(&frame, "iris", TableMeta::default(), None)
            .expect("ingest");
    }

    let exe = env::current_exe().expect("test executable");
    let children: Vec<_> = (0..WORKERS)
        .map(|i| {
            let out = temp_dir.path().join(format!("worker-{i}.out"));
            let child = Command::new(&exe)
                .args(["--exact", "worker_processes_share_one_store", "--nocapture"])
                .env(ROLE_ENV, "worker")
                .env(DB_ENV, &db_path)
                .env(OUT_ENV, &out)
                .spawn()
                .expect("failed to spawn worker");
            (child, out)
        })
        .collect();

    let mut queries = 0usize;
    for (mut child, out) in children {
        let status = child.wait().expect("failed to wait for worker");
        assert!(status.success(), "worker exited with {status}");
        let count: usize = fs::read_to_string(&out)
            .expect("worker output")
            .trim()
            .parse()
            .expect("worker count");
        queries += count;
    }
    assert_eq!(queries, WORKERS * ROUNDS);

    // Workers take the store lock in turn, so no increment is lost
    let db = DatadeckDb::open(&db_path, ClusterRegistry::empty()).expect("reopen store");
    let entry = db.catalog_get("iris", None).unwrap().unwrap();
    assert_eq!(entry.hits, (WORKERS * ROUNDS) as i64);
}
