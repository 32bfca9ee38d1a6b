mod common;

use common::{Harness, WAIT, ended, fast_config, new_id, participated, started};
use rand::seq::SliceRandom;
use saga_tcc::application::coordinator::{TxHealth, TxPhase};
use saga_tcc::domain::command::Outcome;
use saga_tcc::domain::event::TransactionStatus;
use saga_tcc::domain::ports::EventStore;
use std::sync::Arc;

const SERVICES: [&str; 3] = ["inventory", "payment", "shipping"];

/// Acknowledges every command a service receives.
async fn spawn_responder(harness: &Arc<Harness>, service: &'static str) {
    let mut commands = harness.connect(service, &format!("{service}-1")).await;
    let harness = harness.clone();
    tokio::spawn(async move {
        while let Some(command) = commands.recv().await {
            harness
                .acknowledge(&command, &format!("{service}-1"), TransactionStatus::Succeed)
                .await
                .unwrap();
        }
    });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_global_transactions() {
    let harness = Arc::new(Harness::in_memory(fast_config()));
    for service in SERVICES {
        spawn_responder(&harness, service).await;
    }

    let mut transactions: Vec<(String, TransactionStatus)> = (0..40)
        .map(|i| {
            let status = if i % 4 == 0 {
                TransactionStatus::Failed
            } else {
                TransactionStatus::Succeed
            };
            (new_id(), status)
        })
        .collect();
    transactions.shuffle(&mut rand::thread_rng());

    let mut handles = Vec::new();
    for (g, status) in transactions.clone() {
        let harness = harness.clone();
        handles.push(tokio::spawn(async move {
            harness.ingestion.on_global_tx_started(started(&g)).await?;
            for (i, service) in SERVICES.iter().enumerate() {
                harness
                    .ingestion
                    .on_participated(participated(service, &g, &format!("P{i}"), TransactionStatus::Succeed))
                    .await?;
            }
            harness.ingestion.on_global_tx_ended(ended(&g, status)).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    for (g, status) in &transactions {
        let report = harness
            .coordinator
            .wait_for(g, |r| r.phase == TxPhase::Done, WAIT)
            .await
            .unwrap();
        assert_eq!(report.health(), TxHealth::Done);
        assert_eq!(report.legs.len(), SERVICES.len());
        let expected = if status.is_success() {
            Outcome::Confirm
        } else {
            Outcome::Cancel
        };
        assert_eq!(report.outcome, Some(expected));
    }
    assert!(harness.coordinator.wait_settled(WAIT).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_duplicate_submissions_keep_one_row() {
    let harness = Arc::new(Harness::in_memory(fast_config()));
    let g = new_id();

    let mut submissions: Vec<bool> = (0..32).map(|i| i % 2 == 0).collect();
    submissions.shuffle(&mut rand::thread_rng());

    let mut handles = Vec::new();
    for is_start in submissions {
        let harness = harness.clone();
        let g = g.clone();
        handles.push(tokio::spawn(async move {
            if is_start {
                harness.ingestion.on_global_tx_started(started(&g)).await
            } else {
                harness
                    .ingestion
                    .on_participated(participated("inventory", &g, "P1", TransactionStatus::Succeed))
                    .await
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let globals = harness.store.find_global_events(&g).await.unwrap().unwrap();
    assert_eq!(globals.len(), 1);
    let participations = harness.store.find_participations(&g).await.unwrap().unwrap();
    assert_eq!(participations.len(), 1);
    assert_eq!(harness.store.find_tcc_events(&g).await.unwrap().unwrap().len(), 2);
}
