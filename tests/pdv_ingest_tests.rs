mod common;

use std::sync::Arc;
use std::time::Duration;

use cerberus::jobs::pdv_ingest::{start_pdv_ingest_job, INGEST_WORKERS};
use cerberus::services::chain::{Broadcast, RewardLine};
use cerberus::services::index::Index;
use cerberus::Error;
use common::{pdv_message, Harness};
use rust_decimal_macros::dec;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_rewarded_bulk_is_paid_in_one_broadcast() {
    let h = Harness::new();
    h.enqueue(&pdv_message("bob", 2, dec!(0.5)));
    h.enqueue(&pdv_message("alice", 1, dec!(1.25)));
    h.enqueue(&pdv_message("alice", 7, dec!(0.000000000000000001)));

    let report = h.ingest(10).process_bulk(&h.receive_all().await).await.unwrap();

    assert_eq!(report.received, 3);
    assert_eq!(report.written, 3);
    assert_eq!(report.rewarded, 3);
    assert_eq!(report.deleted, 3);
    assert!(h.queue.is_empty());

    let broadcasts = h.chain.broadcasts();
    assert_eq!(broadcasts.len(), 1);
    let Broadcast::DistributeRewards { hash, lines } = &broadcasts[0] else {
        panic!("expected a rewards broadcast, got {:?}", broadcasts[0]);
    };
    assert_eq!(report.tx.as_deref(), Some(hash.as_str()));
    // Lines follow (address, id) order
    assert_eq!(
        lines,
        &vec![
            RewardLine { receiver: "alice".into(), reward: dec!(1.25) },
            RewardLine { receiver: "alice".into(), reward: dec!(0.000000000000000001) },
            RewardLine { receiver: "bob".into(), reward: dec!(0.5) },
        ]
    );

    for (address, id) in [("alice", 1), ("alice", 7), ("bob", 2)] {
        let meta = h.index.get_pdv_meta(address, id).await.unwrap();
        assert_eq!(&meta.tx, hash);
        assert_eq!(meta.device, "device-1");
        assert_eq!(meta.object_types.get("cookie"), Some(&1));
        assert_eq!(h.blobs.read(address, id).await.unwrap(), common::pdv_data(address, id));
    }
}

#[tokio::test]
async fn test_redelivered_message_is_deduplicated() {
    let h = Harness::new();
    let ingest = h.ingest(10);
    let message = pdv_message("alice", 1, dec!(2));

    h.enqueue(&message);
    ingest.process_bulk(&h.receive_all().await).await.unwrap();
    let first = h.index.get_pdv_meta("alice", 1).await.unwrap();

    h.enqueue(&message);
    let report = ingest.process_bulk(&h.receive_all().await).await.unwrap();

    assert_eq!(report.duplicates, 1);
    assert_eq!(report.written, 0);
    assert_eq!(report.tx, None);
    assert_eq!(report.deleted, 1);
    assert!(h.queue.is_empty());
    assert_eq!(h.chain.broadcasts().len(), 1, "a duplicate must not be paid twice");
    assert_eq!(h.objects.put_count(), 1);
    assert_eq!(h.index.get_pdv_meta("alice", 1).await.unwrap(), first);
}

#[tokio::test]
async fn test_rewardless_submission_is_stored_without_broadcast() {
    let h = Harness::new();
    h.enqueue(&pdv_message("alice", 1, dec!(0)));

    let report = h.ingest(10).process_bulk(&h.receive_all().await).await.unwrap();

    assert_eq!(report.written, 1);
    assert_eq!(report.rewarded, 0);
    assert_eq!(report.tx, None);
    assert!(h.chain.broadcasts().is_empty());
    assert!(h.queue.is_empty());

    let meta = h.index.get_pdv_meta("alice", 1).await.unwrap();
    assert_eq!(meta.tx, "");
    assert_eq!(meta.reward, dec!(0));
    assert_eq!(h.index.get_pdv_total_delta().await.unwrap(), dec!(0));
    assert!(h.blobs.read("alice", 1).await.is_ok());
}

#[tokio::test]
async fn test_mixed_bulk_pays_only_rewarded_messages() {
    let h = Harness::new();
    h.enqueue(&pdv_message("alice", 1, dec!(0)));
    h.enqueue(&pdv_message("bob", 1, dec!(3)));

    let report = h.ingest(10).process_bulk(&h.receive_all().await).await.unwrap();

    assert_eq!(report.written, 2);
    assert_eq!(report.rewarded, 1);
    let hash = report.tx.unwrap();
    assert_eq!(h.index.get_pdv_meta("alice", 1).await.unwrap().tx, "");
    assert_eq!(h.index.get_pdv_meta("bob", 1).await.unwrap().tx, hash);
    match &h.chain.broadcasts()[0] {
        Broadcast::DistributeRewards { lines, .. } => assert_eq!(lines.len(), 1),
        other => panic!("unexpected broadcast {:?}", other),
    }
}

#[tokio::test]
async fn test_empty_bulk_is_a_no_op() {
    let h = Harness::new();

    let report = h.ingest(10).process_bulk(&[]).await.unwrap();

    assert_eq!(report.received, 0);
    assert_eq!(report.written, 0);
    assert!(h.chain.broadcasts().is_empty());
    assert_eq!(h.index.pdv_count(), 0);
}

#[tokio::test]
async fn test_broadcast_failure_rolls_back_and_keeps_messages() {
    let h = Harness::new();
    let ingest = h.ingest(10);
    h.enqueue(&pdv_message("alice", 1, dec!(1)));
    h.enqueue(&pdv_message("bob", 1, dec!(0)));
    let bulk = h.receive_all().await;

    h.chain.fail_broadcast_attempt(1);
    let err = ingest.process_bulk(&bulk).await.unwrap_err();

    assert!(matches!(err, Error::Transient(_)), "got {:?}", err);
    assert_eq!(h.index.pdv_count(), 0, "rewardless meta must roll back too");
    assert_eq!(h.queue.len(), 2);
    assert!(h.chain.broadcasts().is_empty());

    // Redelivery succeeds; the orphaned blobs are simply overwritten
    let report = ingest.process_bulk(&bulk).await.unwrap();
    assert_eq!(report.written, 2);
    assert_eq!(report.rewarded, 1);
    assert_eq!(h.index.pdv_count(), 2);
    assert!(h.queue.is_empty());
    assert_eq!(h.chain.broadcasts().len(), 1);
}

#[tokio::test]
async fn test_commit_failure_leaves_queue_untouched() {
    let h = Harness::new();
    let ingest = h.ingest(10);
    h.enqueue(&pdv_message("alice", 1, dec!(1)));
    let bulk = h.receive_all().await;

    h.index.fail_next_commits(1);
    assert!(ingest.process_bulk(&bulk).await.is_err());

    assert_eq!(h.index.pdv_count(), 0);
    assert_eq!(h.queue.len(), 1);
    // The reward already went out; redelivery pays again
    assert_eq!(h.chain.broadcasts().len(), 1);

    let report = ingest.process_bulk(&bulk).await.unwrap();
    assert_eq!(report.rewarded, 1);
    assert_eq!(h.chain.broadcasts().len(), 2);
    assert!(h.queue.is_empty());
}

#[tokio::test]
async fn test_blob_failure_skips_only_that_message() {
    let h = Harness::new();
    h.enqueue(&pdv_message("alice", 1, dec!(1)));
    h.enqueue(&pdv_message("bob", 1, dec!(1)));

    h.objects.fail_next_puts(1);
    let report = h.ingest(10).process_bulk(&h.receive_all().await).await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.written, 1);
    assert_eq!(report.rewarded, 1);
    assert_eq!(report.deleted, 1);
    assert_eq!(h.index.pdv_count(), 1);
    assert_eq!(h.queue.len(), 1, "the failed message stays for redelivery");
    match &h.chain.broadcasts()[0] {
        Broadcast::DistributeRewards { lines, .. } => assert_eq!(lines.len(), 1),
        other => panic!("unexpected broadcast {:?}", other),
    }
}

#[tokio::test]
async fn test_meta_lookup_failure_skips_message() {
    let h = Harness::new();
    h.enqueue(&pdv_message("alice", 1, dec!(1)));

    h.index.fail_next("get_pdv_meta", 1);
    let report = h.ingest(10).process_bulk(&h.receive_all().await).await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.written, 0);
    assert!(h.chain.broadcasts().is_empty());
    assert_eq!(h.objects.put_count(), 0);
    assert_eq!(h.queue.len(), 1);
}

#[tokio::test]
async fn test_duplicate_within_bulk_is_written_once() {
    let h = Harness::new();
    let message = pdv_message("alice", 1, dec!(1));
    h.enqueue(&message);
    h.enqueue(&message);

    let report = h.ingest(10).process_bulk(&h.receive_all().await).await.unwrap();

    assert_eq!(report.received, 2);
    assert_eq!(report.written, 1);
    assert_eq!(report.deleted, 2);
    assert_eq!(h.objects.put_count(), 1);
    assert!(h.queue.is_empty());
    match &h.chain.broadcasts()[0] {
        Broadcast::DistributeRewards { lines, .. } => assert_eq!(lines.len(), 1),
        other => panic!("unexpected broadcast {:?}", other),
    }
}

#[tokio::test]
async fn test_malformed_message_is_left_on_queue() {
    let h = Harness::new();
    h.queue.push("not json");
    h.queue.push(r#"{"ID":1,"Address":"","Meta":{"reward":"1"},"Data":""}"#);
    h.enqueue(&pdv_message("0x5aAeb6053F3E94C9b9A09f33669435E7Ef1Be", 1, dec!(1)));
    h.enqueue(&pdv_message("alice", 1, dec!(1)));

    let report = h.ingest(10).process_bulk(&h.receive_all().await).await.unwrap();

    assert_eq!(report.malformed, 3);
    assert_eq!(report.written, 1);
    assert_eq!(report.deleted, 1);
    assert_eq!(h.queue.len(), 3);
}

#[tokio::test]
async fn test_ingest_job_drains_queue_and_stops() {
    let h = Harness::new();
    for id in 1..=25 {
        h.enqueue(&pdv_message("alice", id, dec!(0.1)));
    }

    let shutdown = CancellationToken::new();
    let handle = start_pdv_ingest_job(Arc::new(h.ingest(10)), shutdown.clone());

    for _ in 0..200 {
        if h.queue.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.cancel();
    handle.await.unwrap();

    assert!(h.queue.is_empty());
    assert_eq!(h.index.pdv_count(), 25);
    // 25 messages in bulks of at most 10
    assert_eq!(h.chain.broadcasts().len(), 3);
    assert_eq!(h.index.list_pdv("alice", 0, 3).await.unwrap(), vec![25, 24, 23]);
}

#[tokio::test]
async fn test_ingest_job_runs_bulk_wider_than_worker_pool() {
    let h = Harness::new();
    let count = INGEST_WORKERS * 2 + 4;
    for n in 0..count {
        h.enqueue(&pdv_message(&format!("user-{:02}", n), 1, dec!(0.25)));
    }

    let shutdown = CancellationToken::new();
    let handle = start_pdv_ingest_job(Arc::new(h.ingest(count)), shutdown.clone());

    for _ in 0..200 {
        if h.queue.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.cancel();
    handle.await.unwrap();

    assert!(h.queue.is_empty());
    assert_eq!(h.index.pdv_count(), count);
    let broadcasts = h.chain.broadcasts();
    assert_eq!(broadcasts.len(), 1);
    let Broadcast::DistributeRewards { lines, .. } = &broadcasts[0] else {
        panic!("expected a rewards broadcast, got {:?}", broadcasts[0]);
    };
    assert_eq!(lines.len(), count);
    for n in 0..count {
        let address = format!("user-{:02}", n);
        assert_eq!(h.blobs.read(&address, 1).await.unwrap(), common::pdv_data(&address, 1));
    }
}

#[tokio::test]
async fn test_checksummed_address_is_stored_in_canonical_form() {
    let h = Harness::new();
    let checksummed = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";
    let canonical = "0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed";
    h.enqueue(&pdv_message(checksummed, 1, dec!(1)));
    // Same submission spelled the other way is the same key
    h.enqueue(&pdv_message(canonical, 1, dec!(1)));

    let report = h.ingest(10).process_bulk(&h.receive_all().await).await.unwrap();

    assert_eq!(report.written, 1);
    assert_eq!(report.deleted, 2);
    assert!(h.index.get_pdv_meta(canonical, 1).await.is_ok());
    assert!(matches!(h.index.get_pdv_meta(checksummed, 1).await, Err(Error::NotFound)));
    assert_eq!(h.blobs.list(canonical, 0, 10).await.unwrap(), vec![1]);
    let Broadcast::DistributeRewards { lines, .. } = &h.chain.broadcasts()[0] else {
        panic!("expected a rewards broadcast");
    };
    assert_eq!(lines[0].receiver, canonical);
}

#[tokio::test]
async fn test_rewards_window_lock_failure_leaves_bulk_queued() {
    let h = Harness::new();
    h.enqueue(&pdv_message("alice", 1, dec!(1)));
    h.index.fail_next("lock_rewards_window", 1);

    assert!(h.ingest(10).process_bulk(&h.receive_all().await).await.is_err());

    assert_eq!(h.index.pdv_count(), 0);
    assert!(h.chain.broadcasts().is_empty());
    assert_eq!(h.receive_all().await.len(), 1);
}
