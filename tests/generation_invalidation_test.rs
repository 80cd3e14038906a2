//! Generation Invalidation Tests
//!
//! When a client shows up with a new generation, everything the previous
//! generation left open is rolled back and closed before the new command
//! runs:
//! - Uncommitted writes of the old generation disappear
//! - The old generation's write lock no longer blocks the new one
//! - Init reports the replaced generation, or "" if nothing was replaced
//! - Other clients are never touched

mod common;

use common::{next_decoded, Results};
use serde_json::json;
use txbroker::{Broker, BrokerConfig};

const APP: &str = "com.example.editor";

fn create_table(broker: &Broker, client: &str, results: &Results) {
    broker
        .run_stmt(client, "g0", 1, 0, "CREATE TABLE t (id INTEGER, gen TEXT)", None, results.sink())
        .unwrap();
    broker.run_commit(client, "g0", 1, results.sink()).unwrap();
    assert!(next_decoded(results).is_success());
    assert!(next_decoded(results).is_success());
}

/// Init under a new generation rolls back the old generation's open
/// transaction and frees its write lock.
#[test]
fn init_reclaims_open_transactions() {
    let (_dir, broker) = common::started_broker(BrokerConfig::default());
    let results = Results::new();
    create_table(&broker, APP, &results);

    broker.initialize(APP, "g1", results.sink()).unwrap();
    broker
        .run_stmt(APP, "g1", 1, 0, "INSERT INTO t VALUES (1, 'g1')", None, results.sink())
        .unwrap();

    // Adopting g1 replaced g0, which had nothing open.
    let init = next_decoded(&results);
    assert_eq!(init.function, "__txbInitResult");
    assert_eq!(init.address, vec![json!("g0")]);
    assert_eq!(next_decoded(&results).payload, json!({"rowsAffected": 1}));

    broker.initialize(APP, "g2", results.sink()).unwrap();
    broker
        .run_stmt(APP, "g2", 1, 0, "INSERT INTO t VALUES (2, 'g2')", None, results.sink())
        .unwrap();
    broker.run_commit(APP, "g2", 1, results.sink()).unwrap();
    broker
        .run_stmt(APP, "g2", 2, 0, "SELECT id, gen FROM t", None, results.sink())
        .unwrap();

    let init = next_decoded(&results);
    assert_eq!(init.address, vec![json!("g1")]);
    assert!(init.is_success());

    // Would time out on the write lock if the g1 transaction were still open.
    assert_eq!(next_decoded(&results).payload, json!({"rowsAffected": 1}));
    assert!(next_decoded(&results).is_success());

    let select = next_decoded(&results);
    assert_eq!(select.rows(), &vec![json!({"id": 2, "gen": "g2"})]);

    let stats = broker.stats();
    assert_eq!(stats.invalidations, 2);
    assert_eq!(stats.reclaimed, 1);

    broker.shutdown();
}

/// Init reports the empty sentinel for a first sighting and for a
/// repeated generation.
#[test]
fn init_reports_empty_previous_generation() {
    let (_dir, broker) = common::started_broker(BrokerConfig::default());
    let results = Results::new();

    broker.initialize(APP, "g1", results.sink()).unwrap();
    broker.initialize(APP, "g1", results.sink()).unwrap();
    broker.initialize(APP, "g2", results.sink()).unwrap();

    assert_eq!(next_decoded(&results).address, vec![json!("")]);
    assert_eq!(next_decoded(&results).address, vec![json!("")]);
    assert_eq!(next_decoded(&results).address, vec![json!("g1")]);

    broker.shutdown();
}

/// Re-initializing with the current generation keeps its transactions.
#[test]
fn same_generation_keeps_transactions() {
    let (_dir, broker) = common::started_broker(BrokerConfig::default());
    let results = Results::new();
    create_table(&broker, APP, &results);

    broker
        .run_stmt(APP, "g1", 3, 0, "INSERT INTO t VALUES (3, 'g1')", None, results.sink())
        .unwrap();
    broker.initialize(APP, "g1", results.sink()).unwrap();
    broker.run_commit(APP, "g1", 3, results.sink()).unwrap();
    broker
        .run_stmt(APP, "g1", 4, 0, "SELECT COUNT(*) AS n FROM t", None, results.sink())
        .unwrap();

    assert!(next_decoded(&results).is_success());
    assert_eq!(next_decoded(&results).address, vec![json!("")]);
    assert!(next_decoded(&results).is_success());
    assert_eq!(next_decoded(&results).rows(), &vec![json!({"n": 1})]);

    broker.shutdown();
}

/// Any command carrying a new generation triggers invalidation, not just Init.
#[test]
fn statement_triggers_invalidation() {
    let (_dir, broker) = common::started_broker(BrokerConfig::default());
    let results = Results::new();
    create_table(&broker, APP, &results);

    broker
        .run_stmt(APP, "g1", 5, 0, "INSERT INTO t VALUES (5, 'g1')", None, results.sink())
        .unwrap();
    broker
        .run_stmt(APP, "g2", 5, 0, "INSERT INTO t VALUES (6, 'g2')", None, results.sink())
        .unwrap();
    broker.run_commit(APP, "g2", 5, results.sink()).unwrap();
    broker
        .run_stmt(APP, "g2", 6, 0, "SELECT id FROM t", None, results.sink())
        .unwrap();

    assert!(next_decoded(&results).is_success());

    // Same transaction id, new generation: a fresh transaction, not a duplicate.
    let second = next_decoded(&results);
    assert_eq!(second.address, vec![json!("g2"), json!(5), json!(0)]);
    assert_eq!(second.payload, json!({"rowsAffected": 1}));

    assert!(next_decoded(&results).is_success());
    assert_eq!(next_decoded(&results).rows(), &vec![json!({"id": 6})]);

    broker.shutdown();
}

/// Commit under a new generation finds the old transaction already gone.
#[test]
fn stale_commit_after_invalidation_is_a_no_op() {
    let (_dir, broker) = common::started_broker(BrokerConfig::default());
    let results = Results::new();
    create_table(&broker, APP, &results);

    broker
        .run_stmt(APP, "g1", 8, 0, "INSERT INTO t VALUES (8, 'g1')", None, results.sink())
        .unwrap();
    broker.run_commit(APP, "g2", 8, results.sink()).unwrap();
    broker
        .run_stmt(APP, "g2", 9, 0, "SELECT COUNT(*) AS n FROM t", None, results.sink())
        .unwrap();

    assert!(next_decoded(&results).is_success());
    let commit = next_decoded(&results);
    assert!(commit.is_success());
    assert_eq!(commit.address, vec![json!("g2"), json!(8)]);
    assert_eq!(next_decoded(&results).rows(), &vec![json!({"n": 0})]);

    broker.shutdown();
}

/// A generation change for one client leaves other clients alone.
#[test]
fn other_clients_unaffected() {
    let (_dir, broker) = common::started_broker(BrokerConfig::default());
    let results = Results::new();
    create_table(&broker, "app.a", &results);
    create_table(&broker, "app.b", &results);

    broker
        .run_stmt("app.a", "g1", 1, 0, "INSERT INTO t VALUES (1, 'a')", None, results.sink())
        .unwrap();
    broker
        .run_stmt("app.b", "g1", 1, 0, "INSERT INTO t VALUES (1, 'b')", None, results.sink())
        .unwrap();
    broker.initialize("app.a", "g2", results.sink()).unwrap();
    broker.run_commit("app.b", "g1", 1, results.sink()).unwrap();
    broker
        .run_stmt("app.b", "g1", 2, 0, "SELECT gen FROM t", None, results.sink())
        .unwrap();

    assert!(next_decoded(&results).is_success());
    assert!(next_decoded(&results).is_success());
    assert_eq!(next_decoded(&results).address, vec![json!("g1")]);
    assert!(next_decoded(&results).is_success());
    assert_eq!(next_decoded(&results).rows(), &vec![json!({"gen": "b"})]);

    assert_eq!(broker.stats().reclaimed, 1);

    broker.shutdown();
}
