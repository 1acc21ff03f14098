use std::sync::Arc;

use agency::agent::TransactItem;
use agency::agent::TransactResult;
use agency::store::Op;
use agency::store::Precondition;
use agency::LogStore;
use agency::Transaction;
use anyhow::Result;
use serde_json::json;

use fixtures::AgencyRouter;

mod fixtures;

/// Mixed transactional batches.
///
/// What does this test do?
///
/// - runs a `transact` batch mixing writes, a guarded write and reads.
/// - asserts that reads observe the effects of earlier writes in the same
///   batch, that failed preconditions reject only their own transaction,
///   and that index assignment matches application order.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn transact_batches() -> Result<()> {
    fixtures::init_tracing();

    let router = Arc::new(AgencyRouter::new(fixtures::test_config()));
    let leader = router.new_cluster(1, 1).await?;
    let agent = router.agent(leader).await;

    let items = vec![
        TransactItem::Write(Transaction::set("/a", json!(1))),
        TransactItem::Read(vec!["/a".to_string()]),
        TransactItem::Write(Transaction::default().with_op("/counter", Op::Increment)),
        TransactItem::Write(
            Transaction::set("/a", json!(2)).with_precondition("/a", Precondition::OldEquals(json!(42))),
        ),
        TransactItem::Read(vec!["/counter".to_string()]),
    ];
    let res = agent.transact(items).await?;

    let mut written = Vec::new();
    match &res.results[0] {
        TransactResult::Written(index) => written.push(*index),
        other => panic!("expected a write, got {:?}", other),
    }
    // The read observes the write right before it, well ahead of commit.
    assert_eq!(res.results[1], TransactResult::Read(json!({"a": 1})));
    match &res.results[2] {
        TransactResult::Written(index) => written.push(*index),
        other => panic!("expected a write, got {:?}", other),
    }
    assert_eq!(res.results[3], TransactResult::Rejected(vec!["/a".to_string()]));
    assert_eq!(res.results[4], TransactResult::Read(json!({"counter": 1})));

    // Indices are assigned in application order.
    assert!(written[0] < written[1]);
    assert_eq!(res.max_index, written[1]);

    // The guarded write never happened.
    assert_eq!(router.read_value(leader, "/a").await?, Some(json!(1)));
    Ok(())
}

/// The transient store.
///
/// What does this test do?
///
/// - writes to the transient store and asserts that the value is visible
///   there, but neither in the replicated store nor in the log.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn transient_is_not_replicated() -> Result<()> {
    fixtures::init_tracing();

    let router = Arc::new(AgencyRouter::new(fixtures::test_config()));
    let leader = router.new_cluster(1, 1).await?;
    let agent = router.agent(leader).await;
    let log = router.log_store(leader).await;
    let log_len_before = log.last_index().await?;

    let res = agent
        .transient(vec![
            TransactItem::Write(Transaction::set("/scratch", json!("volatile"))),
            TransactItem::Read(vec!["/scratch".to_string()]),
        ])
        .await?;
    assert_eq!(res[0], TransactResult::Written(0));
    assert_eq!(res[1], TransactResult::Read(json!({"scratch": "volatile"})));

    // Nothing reached the log or the committed store.
    assert_eq!(log.last_index().await?, log_len_before);
    assert_eq!(router.read_value(leader, "/scratch").await?, None);
    Ok(())
}
