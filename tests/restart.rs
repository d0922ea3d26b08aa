//! Restart behavior: durable queue state, no re-submission of confirmed
//! events, and catch-up from the persisted watermark instead of genesis.

mod common;

use std::time::Duration;

use common::{SubmitScript, TestClient};
use opsledger::event::{self, BuildEvent, BuildStatus};
use opsledger::read_log;
use opsledger::submit::SubmissionState;

fn foreign_event(build_id: &str, status: BuildStatus) -> Vec<u8> {
    event::encode(&BuildEvent::new(build_id, status, "other-team"))
}

#[tokio::test]
async fn test_confirmed_submission_is_not_resubmitted_after_restart() {
    let client = TestClient::start(5);
    let key = client
        .queue
        .enqueue("build-1", BuildStatus::Success, "alice")
        .unwrap();
    assert_eq!(
        client.wait_terminal(&key).await,
        SubmissionState::Confirmed { sequence: 0 }
    );
    assert_eq!(client.ledger.submit_calls(), 1);

    // New process life over the same database and ledger.
    let (ledger, db_dir) = client.shutdown().await;
    let client = TestClient::start_with(ledger, db_dir, 5);

    // Confirmed records were retired at confirmation; nothing to resubmit.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(client.ledger.submit_calls(), 1);
    assert_eq!(client.ledger.chain_len(), 1);
    assert!(client.queue.state_of(&key).is_none());

    client.cancel.cancel();
}

#[tokio::test]
async fn test_unfinished_submission_resumes_after_restart() {
    // Attempts high enough that the first life cannot exhaust them.
    let client = TestClient::start(1000);
    // Every submit fails while the first process life is up.
    client
        .ledger
        .script_submits(std::iter::repeat(SubmitScript::Transient).take(1000));

    let key = client
        .queue
        .enqueue("build-2", BuildStatus::Started, "bob")
        .unwrap();
    // Let it burn a few attempts, then die mid-flight.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let (ledger, db_dir) = client.shutdown().await;

    // The ledger works again.
    ledger.clear_script();
    let client = TestClient::start_with(ledger, db_dir, 1000);

    // The restored record was demoted to Pending and driven to confirmation
    // by the new writer.
    assert!(matches!(
        client.wait_terminal(&key).await,
        SubmissionState::Confirmed { .. }
    ));
    assert_eq!(client.ledger.chain_len(), 1);

    client.cancel.cancel();
}

#[tokio::test]
async fn test_catchup_starts_at_watermark_not_genesis() {
    let client = TestClient::start(5);
    client.ledger.append_raw(foreign_event("b1", BuildStatus::Started));
    client.ledger.append_raw(foreign_event("b1", BuildStatus::Success));
    client.ledger.append_raw(foreign_event("b2", BuildStatus::Started));
    client.wait_observed(3).await;
    client.ledger.finalize(2);
    client.wait_finalized(2).await;

    let (ledger, db_dir) = client.shutdown().await;
    let queries_before = ledger.appended_queries().len();

    let client = TestClient::start_with(ledger, db_dir, 5);

    // The finalized region is served immediately, before any ledger round
    // trip completes.
    {
        let log = read_log(&client.log);
        assert_eq!(log.finalized_len(), 3);
        assert_eq!(log.finalized_height(), Some(2));
    }

    // Wait for the new life to poll at least once, then verify every range
    // query starts past the watermark.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while client.ledger.appended_queries().len() == queries_before {
        assert!(tokio::time::Instant::now() < deadline, "reconciler never polled");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let new_queries = &client.ledger.appended_queries()[queries_before..];
    assert!(new_queries.iter().all(|from| *from >= 3), "rescanned from genesis");

    client.cancel.cancel();
}

#[tokio::test]
async fn test_finalized_events_survive_restart_in_order() {
    let client = TestClient::start(5);
    for i in 0..4 {
        client
            .ledger
            .append_raw(foreign_event(&format!("b{}", i), BuildStatus::Success));
    }
    client.wait_observed(4).await;
    client.ledger.finalize(3);
    client.wait_finalized(3).await;

    let (ledger, db_dir) = client.shutdown().await;
    let client = TestClient::start_with(ledger, db_dir, 5);

    let log = read_log(&client.log);
    let page = log.list(&Default::default(), None, 10);
    let sequences: Vec<u64> = page.events.iter().filter_map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![0, 1, 2, 3]);
    // Ledger-assigned timestamps were persisted with the events.
    assert!(page.events.iter().all(|e| e.ledger_timestamp.is_some()));
    drop(log);

    client.cancel.cancel();
}
