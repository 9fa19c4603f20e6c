use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use datadeck_db::arrow::array::{ArrayRef, Int64Array, StringArray};
use datadeck_db::{ClusterRegistry, DataFrame, DatadeckDb, TableMeta};
use serde_json::json;

fn frame() -> DataFrame {
    DataFrame::from_columns(vec![
        ("id", Arc::new(Int64Array::from(vec![1, 2])) as ArrayRef),
        ("label", Arc::new(StringArray::from(vec!["a", "b"])) as ArrayRef),
    ])
    .expect("frame")
}

fn db_with(tables: &[&str]) -> DatadeckDb {
    let registry = ClusterRegistry::from_toml_str(
        "[clusters.c1]\nhost = \"localhost\"\nuser = \"reader\"\ndatabases = [\"d1\"]\n",
    )
    .expect("registry");
    let db = DatadeckDb::open_in_memory(registry).expect("open store");
    for table in tables {
        db.ingest(&frame(), table, TableMeta::default(), None)
            .expect("ingest");
    }
    db
}

fn hits(db: &DatadeckDb, table: &str) -> i64 {
    db.catalog_get(table, None)
        .expect("catalog lookup")
        .expect("catalog row")
        .hits
}

#[test]
fn test_join_counts_each_table_once() {
    let db = db_with(&["iris", "economics", "flights"]);
    db.execute_and_log(
        "SELECT * FROM iris i JOIN economics e ON i.id = e.id JOIN iris j ON j.id = e.id",
        None,
        false,
    )
    .expect("query");

    assert_eq!(hits(&db, "iris"), 1);
    assert_eq!(hits(&db, "economics"), 1);
    assert_eq!(hits(&db, "flights"), 0);
    assert!(db.catalog_get("iris", None).unwrap().unwrap().last_hit.is_some());
}

#[test]
fn test_quoted_and_uppercase_names_count() {
    let db = db_with(&["iris"]);
    db.execute_and_log(r#"SELECT * FROM "iris" WHERE label = 'a'"#, None, false)
        .expect("quoted query");
    db.execute_and_log("SELECT COUNT(*) FROM IRIS", None, false)
        .expect("uppercase query");
    // Mentioned in a string literal only; the query itself still runs
    db.execute_and_log("SELECT 'iris' AS name", None, false)
        .expect("literal query");

    assert_eq!(hits(&db, "iris"), 3);
}

#[test]
fn test_regex_fallback_counts_before_query_fails() {
    let db = db_with(&["iris"]);
    let result = db.execute_and_log("SELECT * FROM iris /* never closed", None, false);
    assert!(result.is_err());
    assert_eq!(hits(&db, "iris"), 1);
}

#[test]
fn test_queries_without_datasets_change_nothing() {
    let db = db_with(&["iris"]);
    let frame = db
        .execute_and_log("SELECT 42 AS answer", None, false)
        .expect("query");
    assert_eq!(frame.num_rows(), 1);
    assert_eq!(hits(&db, "iris"), 0);
}

#[test]
fn test_usage_logged_against_pseudo_table_name() {
    let db = db_with(&[]);
    db.pseudo_ingest(
        "sales",
        TableMeta::default(),
        "postgres",
        json!({"cluster": "c1", "database": "d1", "query": "SELECT 1"}),
        None,
    )
    .expect("register");

    assert!(db.log_table_usage(&["sales"], None).unwrap());
    assert!(db.log_table_usage(&["sales", "ghost"], None).unwrap());
    assert_eq!(hits(&db, "sales"), 2);
    assert!(!db.catalog_exists("ghost", None).unwrap());
}

#[test]
fn test_touch_bumps_updates_only() {
    let db = db_with(&["iris"]);
    assert!(db.touch(&["iris"], None).unwrap());
    let entry = db.catalog_get("iris", None).unwrap().unwrap();
    assert_eq!(entry.updates, 1);
    assert_eq!(entry.hits, 0);
}

#[test]
fn test_conflicting_increment_is_dropped() {
    let db = db_with(&["iris"]);

    let holder = db.connect().expect("holder connection");
    holder.execute_batch("BEGIN").unwrap();
    holder
        .execute(
            "UPDATE administrative.table_catalog SET hits = hits + 1 WHERE table_name = 'iris'",
            &[],
        )
        .unwrap();

    let applied = db
        .log_table_usage(&["iris"], None)
        .expect("conflict must not surface as an error");
    assert!(!applied);

    let frame = db
        .execute_and_log("SELECT * FROM iris", None, false)
        .expect("query still runs while its hit is dropped");
    assert_eq!(frame.num_rows(), 2);

    holder.execute_batch("COMMIT").unwrap();
    assert_eq!(hits(&db, "iris"), 1);
}

#[test]
fn test_concurrent_increments_never_fail() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 25;

    let db = db_with(&["iris"]);
    let applied = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let db = db.clone();
            let applied = Arc::clone(&applied);
            thread::spawn(move || {
                for _ in 0..ROUNDS {
                    if db.log_table_usage(&["iris"], None).expect("increment") {
                        applied.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker thread panicked");
    }

    let total = hits(&db, "iris");
    let applied = applied.load(Ordering::SeqCst) as i64;
    assert!(total >= applied, "hits {total} < applied {applied}");
    assert!(total <= (THREADS * ROUNDS) as i64);
}
