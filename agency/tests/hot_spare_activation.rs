use std::sync::Arc;
use std::time::Duration;

use agency::Config;
use anyhow::Result;
use serde_json::json;

use fixtures::AgencyRouter;

mod fixtures;

/// Hot-spare activation.
///
/// What does this test do?
///
/// - brings up an agency of three active members drawn from a pool of
///   four; the fourth node idles as a passive spare.
/// - isolates an active follower until the leader declares it failed.
/// - asserts that the spare is caught up and promoted into the active set,
///   that the new configuration is itself replicated, and that the agency
///   keeps committing with the new membership.
#[tokio::test(flavor = "multi_thread", worker_threads = 5)]
async fn hot_spare_activation() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(
        Config::build("test".into())
            .ping_times(0.2, 0.8)
            .wait_for_sync(false)
            .agent_failure_grace(1.0)
            .validate()?,
    );
    let router = Arc::new(AgencyRouter::new(config));
    let cluster = fixtures::cluster_config(3, 4);
    for id in 0..4 {
        router.new_agency_node(id, cluster.clone()).await;
    }
    let leader = router.wait_for_serving_leader(Duration::from_secs(30)).await?;

    let res = router.set_value(leader, "/before", json!(1), None).await?;
    router.wait_for_commit(&[0, 1, 2], res.max_index(), Some(Duration::from_secs(10)), "seed write").await?;

    // The spare idles outside the active set.
    let spare: u64 = 3;
    let metrics = router.agent(leader).await.metrics().borrow().clone();
    assert!(!metrics.active.contains(&spare));
    let failed = metrics
        .active
        .iter()
        .copied()
        .find(|id| *id != leader)
        .expect("an active follower must exist");

    tracing::info!("--- isolating active follower {}", failed);
    router.isolate_node(failed).await;

    // The leader notices the silence on its next detection pass and
    // promotes the spare in place of the failed member.
    router
        .wait(&leader, Some(Duration::from_secs(40)))
        .await?
        .metrics(
            |m| m.active.contains(&spare) && !m.active.contains(&failed),
            "spare promoted into the active set",
        )
        .await?;

    // The membership change is itself replicated: it shows up under the
    // reserved configuration path of the committed store.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(active) = router.read_value(leader, "/.agency/active").await? {
            let ids: Vec<u64> = serde_json::from_value(active)?;
            if ids.contains(&spare) && !ids.contains(&failed) {
                break;
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!("replicated configuration never reflected the promotion");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // The promoted spare learns the new membership and participates in
    // commits.
    router
        .wait(&spare, Some(Duration::from_secs(10)))
        .await?
        .metrics(|m| m.active.contains(&spare), "spare adopts the new configuration")
        .await?;

    let res = router.set_value(leader, "/after", json!(2), None).await?;
    let index = res.max_index();
    let members: Vec<u64> = (0..4).filter(|id| *id != failed).collect();
    router.wait_for_commit(&members, index, Some(Duration::from_secs(10)), "write with new membership").await?;
    assert_eq!(router.read_value(leader, "/after").await?, Some(json!(2)));

    Ok(())
}
