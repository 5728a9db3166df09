//! Query cache integration tests
//!
//! Run with:
//!   cargo test --test queries

use std::sync::{Arc, Mutex};
use std::time::Duration;

use polycentric_core::model::{ContentType, Identity, Process};
use polycentric_core::queries::{Callback, IndexDelta, IndexView, QueryError};
use polycentric_core::storage::MemoryKv;
use polycentric_core::{CoreConfig, ProcessHandle};

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn handle() -> ProcessHandle {
    let _ = env_logger::builder().is_test(true).try_init();
    ProcessHandle::new(
        Identity::generate(),
        Process::generate(),
        Arc::new(MemoryKv::new()),
        CoreConfig::default(),
    )
}

/// Callback that forwards every value into a channel.
fn channel<V: Clone + Send + 'static>() -> (Callback<V>, UnboundedReceiver<V>) {
    let (tx, rx) = unbounded_channel();
    let callback = Callback::new(move |value: &V| {
        let _ = tx.send(value.clone());
    });
    (callback, rx)
}

async fn next<V>(rx: &mut UnboundedReceiver<V>) -> V {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a query value")
        .expect("query channel closed")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_same_key_shares_one_subscription() {
    let handle = handle();
    handle.set_crdt(ContentType::Username, b"alice".to_vec()).await.unwrap();
    let crdt = handle.queries().crdt();

    let (first, mut first_rx) = channel::<Option<Vec<u8>>>();
    let (second, mut second_rx) = channel::<Option<Vec<u8>>>();
    let a = crdt.query(handle.system(), ContentType::Username, first).unwrap();
    assert_eq!(next(&mut first_rx).await, Some(b"alice".to_vec()));
    let b = crdt.query(handle.system(), ContentType::Username, second).unwrap();
    assert_eq!(next(&mut second_rx).await, Some(b"alice".to_vec()));

    handle.set_crdt(ContentType::Username, b"alicia".to_vec()).await.unwrap();
    assert_eq!(next(&mut first_rx).await, Some(b"alicia".to_vec()));
    assert_eq!(next(&mut second_rx).await, Some(b"alicia".to_vec()));

    a.unregister();
    assert!(!crdt.is_clean());
    b.unregister();
    assert!(crdt.is_clean());
    assert!(handle.queries().is_clean());
}

#[tokio::test]
async fn test_duplicate_registration_is_rejected() {
    let handle = handle();
    let crdt = handle.queries().crdt();
    let (callback, _rx) = channel::<Option<Vec<u8>>>();

    let registration = crdt
        .query(handle.system(), ContentType::Description, callback.clone())
        .unwrap();
    let err = crdt
        .query(handle.system(), ContentType::Description, callback)
        .unwrap_err();
    assert_eq!(err, QueryError::DuplicatedCallbackError);

    registration.unregister();
    assert!(crdt.is_clean());
}

#[tokio::test]
async fn test_cancelled_callback_stays_silent() {
    let handle = handle();
    let crdt = handle.queries().crdt();

    let token = CancellationToken::new();
    let silenced = Arc::new(Mutex::new(Vec::new()));
    let sink = silenced.clone();
    let cancelled = Callback::new(move |v: &Option<Vec<u8>>| sink.lock().unwrap().push(v.clone()))
        .with_cancellation(token.clone());
    let (witness, mut witness_rx) = channel::<Option<Vec<u8>>>();

    let r1 = crdt.query(handle.system(), ContentType::Username, cancelled).unwrap();
    let r2 = crdt.query(handle.system(), ContentType::Username, witness).unwrap();
    assert_eq!(next(&mut witness_rx).await, None);

    token.cancel();
    let before = silenced.lock().unwrap().len();
    handle.set_crdt(ContentType::Username, b"bob".to_vec()).await.unwrap();
    assert_eq!(next(&mut witness_rx).await, Some(b"bob".to_vec()));
    assert_eq!(silenced.lock().unwrap().len(), before);

    r1.unregister();
    r2.unregister();
    assert!(crdt.is_clean());
}

#[tokio::test]
async fn test_index_advances_in_pages() {
    let handle = handle();
    for i in 1..=5 {
        handle
            .post(ContentType::Post, format!("post {}", i).into_bytes())
            .await
            .unwrap();
    }
    let index = handle.queries().index();
    let (callback, mut rx) = channel::<IndexDelta>();
    let registration = index
        .query(handle.system(), ContentType::Post, callback.clone())
        .unwrap();

    let first = index
        .advance(&handle.system(), ContentType::Post, &callback, 2)
        .await
        .unwrap();
    let second = index
        .advance(&handle.system(), ContentType::Post, &callback, 2)
        .await
        .unwrap();
    let clocks = |cells: &[polycentric_core::queries::Cell]| {
        cells.iter().map(|c| c.key.logical_clock).collect::<Vec<_>>()
    };
    assert_eq!(clocks(&first), vec![5, 4]);
    assert_eq!(clocks(&second), vec![3, 2]);
    assert!(first.iter().chain(&second).all(|c| !c.is_placeholder()));

    let mut view = IndexView::new();
    view.apply(&next(&mut rx).await);
    view.apply(&next(&mut rx).await);
    let folded: Vec<u64> = view.cells().map(|c| c.key.logical_clock).collect();
    assert_eq!(folded, vec![5, 4, 3, 2]);

    let last = index
        .advance(&handle.system(), ContentType::Post, &callback, 2)
        .await
        .unwrap();
    assert_eq!(clocks(&last), vec![1]);
    assert!(index
        .advance(&handle.system(), ContentType::Post, &callback, 2)
        .await
        .unwrap()
        .is_empty());

    registration.unregister();
    assert!(index.is_clean());
}

#[tokio::test]
async fn test_index_follows_posts_and_deletes() {
    let handle = handle();
    for i in 1..=3 {
        handle
            .post(ContentType::Post, format!("post {}", i).into_bytes())
            .await
            .unwrap();
    }
    let index = handle.queries().index();
    let (callback, mut rx) = channel::<IndexDelta>();
    let registration = index
        .query(handle.system(), ContentType::Post, callback.clone())
        .unwrap();
    index
        .advance(&handle.system(), ContentType::Post, &callback, 10)
        .await
        .unwrap();
    let mut view = IndexView::new();
    view.apply(&next(&mut rx).await);
    assert_eq!(view.len(), 3);

    let fresh = handle.post(ContentType::Post, b"fresh".to_vec()).await.unwrap();
    let delta = next(&mut rx).await;
    assert_eq!(delta.add.len(), 1);
    assert_eq!(delta.add[0].pointer.as_ref(), Some(&fresh));
    view.apply(&delta);

    handle
        .delete(handle.process(), 2, ContentType::Post)
        .await
        .unwrap();
    let delta = next(&mut rx).await;
    assert_eq!(delta.remove.len(), 1);
    assert_eq!(delta.remove[0].logical_clock, 2);
    assert!(delta.add[0].is_placeholder());
    view.apply(&delta);

    let shape: Vec<(u64, bool)> = view
        .cells()
        .map(|c| (c.key.logical_clock, c.is_placeholder()))
        .collect();
    assert_eq!(shape, vec![(4, false), (3, false), (2, true), (1, false)]);
    assert_eq!(view.events().count(), 3);

    registration.unregister();
}

#[tokio::test]
async fn test_index_drops_placeholder_when_target_has_another_type() {
    let author = handle();
    author.set_crdt(ContentType::Username, b"n".to_vec()).await.unwrap();
    // Names Post although the target is a Username.
    author
        .delete(author.process(), 1, ContentType::Post)
        .await
        .unwrap();
    let event_at = |clock| {
        let store = author.store().clone();
        let system = author.system();
        let process = author.process();
        async move {
            store
                .get_event(&system, &process, clock)
                .await
                .unwrap()
                .unwrap()
        }
    };

    let reader = handle();
    let index = reader.queries().index();
    let (callback, mut rx) = channel::<IndexDelta>();
    let registration = index
        .query(author.system(), ContentType::Post, callback.clone())
        .unwrap();
    assert!(index
        .advance(&author.system(), ContentType::Post, &callback, 10)
        .await
        .unwrap()
        .is_empty());

    // The delete arrives first and announces a Post placeholder.
    reader.ingester().ingest(&event_at(2).await).await.unwrap();
    let delta = next(&mut rx).await;
    assert_eq!(delta.add.len(), 1);
    assert!(delta.add[0].is_placeholder());
    let mut view = IndexView::new();
    view.apply(&delta);

    // The target turns out to be a Username, so the placeholder goes away.
    reader.ingester().ingest(&event_at(1).await).await.unwrap();
    let delta = next(&mut rx).await;
    assert!(delta.add.is_empty());
    assert_eq!(delta.remove.len(), 1);
    assert_eq!(delta.remove[0].logical_clock, 1);
    view.apply(&delta);
    assert!(view.is_empty());

    registration.unregister();
    assert!(index.is_clean());
}

#[tokio::test]
async fn test_resubscribe_churn_runs_one_computation() {
    let handle = handle();
    let crdt = handle.queries().crdt();
    let (callback, mut rx) = channel::<Option<Vec<u8>>>();

    // Each round tears the key down before its first load has finished.
    for _ in 0..20 {
        crdt.query(handle.system(), ContentType::Username, callback.clone())
            .unwrap()
            .unregister();
        assert!(crdt.is_clean());
    }

    let registration = crdt
        .query(handle.system(), ContentType::Username, callback)
        .unwrap();
    assert_eq!(next(&mut rx).await, None);
    handle.set_crdt(ContentType::Username, b"bob".to_vec()).await.unwrap();
    assert_eq!(next(&mut rx).await, Some(b"bob".to_vec()));

    // Torn-down computations never reach the live subscriber.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());

    registration.unregister();
    assert!(crdt.is_clean());
}

#[tokio::test]
async fn test_advance_requires_registration() {
    let handle = handle();
    let index = handle.queries().index();
    let (registered, _rx) = channel::<IndexDelta>();
    let (stranger, _srx) = channel::<IndexDelta>();

    assert_eq!(
        index
            .advance(&handle.system(), ContentType::Post, &stranger, 1)
            .await
            .unwrap_err(),
        QueryError::NotRegistered
    );
    let registration = index
        .query(handle.system(), ContentType::Post, registered)
        .unwrap();
    assert_eq!(
        index
            .advance(&handle.system(), ContentType::Post, &stranger, 1)
            .await
            .unwrap_err(),
        QueryError::NotRegistered
    );
    registration.unregister();
}

#[tokio::test]
async fn test_blob_reassembles_and_vanishes_on_delete() {
    let handle = handle();
    let blob: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8).collect();
    let ranges = handle.publish_blob(&blob, 100).await.unwrap();
    assert_eq!(ranges.len(), 3);

    let (callback, mut rx) = channel::<Option<Vec<u8>>>();
    let registration = handle
        .queries()
        .blob()
        .query(handle.system(), handle.process(), ranges.clone(), callback)
        .unwrap();
    assert_eq!(next(&mut rx).await, Some(blob.clone()));

    let second = ranges.clocks().nth(1).unwrap();
    handle
        .delete(handle.process(), second, ContentType::BlobSection)
        .await
        .unwrap();
    assert_eq!(next(&mut rx).await, None);

    registration.unregister();
    assert!(handle.queries().is_clean());
}

#[tokio::test]
async fn test_blob_waits_for_missing_sections() {
    let author = handle();
    let blob = vec![9u8; 30];
    let ranges = author.publish_blob(&blob, 10).await.unwrap();

    // A replica that only has the first two sections.
    let reader = handle();
    for clock in ranges.clocks().take(2) {
        let signed = author
            .store()
            .get_event(&author.system(), &author.process(), clock)
            .await
            .unwrap()
            .unwrap();
        reader.ingester().ingest(&signed).await.unwrap();
    }

    let (callback, mut rx) = channel::<Option<Vec<u8>>>();
    let registration = reader
        .queries()
        .blob()
        .query(author.system(), author.process(), ranges.clone(), callback)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());

    let last = ranges.max().unwrap();
    let signed = author
        .store()
        .get_event(&author.system(), &author.process(), last)
        .await
        .unwrap()
        .unwrap();
    reader.ingester().ingest(&signed).await.unwrap();
    assert_eq!(next(&mut rx).await, Some(blob));

    registration.unregister();
    assert!(reader.queries().is_clean());
}

#[tokio::test]
async fn test_servers_merge_hints_and_server_list() {
    let handle = handle();
    handle.add_server("https://listed.example").await.unwrap();
    let servers = handle.queries().servers();

    let (callback, mut rx) = channel();
    let registration = servers.query(handle.system(), callback).unwrap();
    let initial: std::collections::BTreeSet<String> = next(&mut rx).await;
    assert_eq!(initial.len(), 1);

    servers
        .add_address_hint(&handle.system(), "https://hint.example")
        .await
        .unwrap();
    let updated = next(&mut rx).await;
    assert!(updated.contains("https://hint.example"));
    assert!(updated.contains("https://listed.example"));

    registration.unregister();
    assert!(servers.is_clean());
}
