mod common;

use common::{FaultyEventStore, new_id, participated, started};
use saga_tcc::domain::batch::{EventBatch, WriteMode};
use saga_tcc::domain::event::{EventRecord, TransactionStatus};
use saga_tcc::domain::ports::{CallbackRef, EventStore, EventStoreRef, OmegaCallback};
use saga_tcc::infrastructure::channel::ChannelCallback;
use saga_tcc::infrastructure::in_memory::InMemoryEventStore;
use std::sync::Arc;

#[tokio::test]
async fn test_stores_as_trait_objects() {
    let stores: Vec<EventStoreRef> = vec![
        Arc::new(InMemoryEventStore::new()),
        Arc::new(FaultyEventStore::new()),
    ];

    for store in stores {
        let g = new_id();
        let mut batch = EventBatch::new(&g);
        batch.push(EventRecord::Global(started(&g)), WriteMode::InsertIfAbsent);
        batch.push(
            EventRecord::Participated(participated("inventory", &g, "P1", TransactionStatus::Succeed)),
            WriteMode::Upsert,
        );

        // Verify Send + Sync by spawning tasks
        let writer = store.clone();
        tokio::spawn(async move { writer.commit(batch).await })
            .await
            .unwrap()
            .unwrap();

        let reader = store.clone();
        let handle = tokio::spawn(async move { reader.find_participation(&g, "P1").await });
        let participation = handle.await.unwrap().unwrap().unwrap();
        assert_eq!(participation.confirm_method, "confirm_P1");
    }
}

#[tokio::test]
async fn test_callback_as_trait_object() {
    let (callback, mut commands) = ChannelCallback::pair(1);
    let callback: CallbackRef = Arc::new(callback);
    let g = new_id();
    let command = saga_tcc::domain::command::Outcome::Confirm
        .command_for(&participated("inventory", &g, "P1", TransactionStatus::Succeed));

    let sender = callback.clone();
    let sent = command.clone();
    tokio::spawn(async move { sender.send(sent).await })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(commands.recv().await.unwrap(), command);

    drop(commands);
    assert!(callback.send(command).await.is_err());
}
