use std::sync::Arc;
use std::time::Duration;

use agency::agent::InquiryResult;
use agency::agent::WaitForStatus;
use agency::LogStore;
use anyhow::Result;
use serde_json::json;

use fixtures::AgencyRouter;

mod fixtures;

/// Idempotent resubmission.
///
/// What does this test do?
///
/// - commits a write carrying an idempotency key.
/// - resubmits the same write, as a client would after a lost
///   acknowledgement.
/// - asserts that no second log entry is produced, that the original index
///   is reported back, and that `inquire` resolves the key to it.
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn idempotent_resubmit() -> Result<()> {
    fixtures::init_tracing();

    let router = Arc::new(AgencyRouter::new(fixtures::test_config()));
    let leader = router.new_cluster(1, 1).await?;
    let agent = router.agent(leader).await;
    let log = router.log_store(leader).await;

    let first = router.set_value(leader, "/k", json!(1), Some("X")).await?;
    let index = first.max_index();
    assert_eq!(agent.wait_for(index, Duration::from_secs(1)).await, WaitForStatus::Committed);
    let log_len_before = log.last_index().await?;

    // The acknowledgement was lost; the client sends the same transaction
    // again under the same key.
    let second = router.set_value(leader, "/k", json!(1), Some("X")).await?;
    assert_eq!(second.applied, vec![true]);
    assert_eq!(second.indices, vec![index], "a duplicate must resolve to the original index");
    assert_eq!(log.last_index().await?, log_len_before, "a duplicate must not grow the log");

    // Even a differing payload under a known key is deduplicated, not
    // applied twice.
    let third = router.set_value(leader, "/k", json!(999), Some("X")).await?;
    assert_eq!(third.indices, vec![index]);
    assert_eq!(router.read_value(leader, "/k").await?, Some(json!(1)));

    let inquiry = agent.inquire(vec!["X".to_string(), "unseen".to_string()]).await?;
    match &inquiry[0] {
        InquiryResult::Logged(ids) => assert_eq!(ids[0].index, index),
        other => panic!("expected the key to be logged, got {:?}", other),
    }
    // Never silently empty: an unknown key is reported as such.
    assert_eq!(inquiry[1], InquiryResult::Unknown);

    Ok(())
}
