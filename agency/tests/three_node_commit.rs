use std::sync::Arc;
use std::time::Duration;

use agency::agent::WaitForStatus;
use anyhow::Result;
use serde_json::json;

use fixtures::AgencyRouter;

mod fixtures;

/// Three-node happy path.
///
/// What does this test do?
///
/// - brings up a three-node agency.
/// - writes one value on the leader.
/// - asserts that the commit index advances once the followers ack, that
///   the value is readable on the leader, and that all three committed
///   stores converge to the same image.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_commit() -> Result<()> {
    fixtures::init_tracing();

    let router = Arc::new(AgencyRouter::new(fixtures::test_config()));
    let leader = router.new_cluster(3, 3).await?;

    let res = router.set_value(leader, "/y", json!(2), None).await?;
    assert_eq!(res.applied, vec![true]);
    let index = res.max_index();
    assert!(index > 0);

    let agent = router.agent(leader).await;
    let status = agent.wait_for(index, Duration::from_secs(10)).await;
    assert_eq!(status, WaitForStatus::Committed);

    assert_eq!(router.read_value(leader, "/y").await?, Some(json!(2)));

    // Every member catches up through heartbeats.
    router.wait_for_commit(&[0, 1, 2], index, Some(Duration::from_secs(10)), "replicated write").await?;

    let (commit, image) = agent.read_db().await?;
    assert!(commit >= index);
    for id in 0..3 {
        let node = router.agent(id).await;
        let wait = router.wait(&id, Some(Duration::from_secs(10))).await?;
        wait.commit(commit, "follower read db").await?;
        let (_, follower_image) = node.read_db().await?;
        assert_eq!(follower_image, image, "node {} diverged from the leader", id);
    }

    router.assert_stable_cluster().await;
    Ok(())
}
