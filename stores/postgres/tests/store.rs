use everlog::event::{SequenceSelect, VersionSelect};
use everlog::store::{
    AppendError, Appender, DeleteError, DeleteMode, Deleter, LinkError, Linker, ReadError,
    Streamer,
};
use everlog::stream::Direction;
use everlog::version::Check;
use everlog_postgres::Config;
use futures::TryStreamExt;

mod setup;

#[tokio::test]
async fn appended_events_are_read_back_in_order() {
    let store = setup::store().await;
    let stream_id = setup::unique_id("stream");

    let new_version = store
        .append(
            &stream_id,
            Check::MustBe(0),
            vec![setup::event("created"), setup::event("paid")],
        )
        .await
        .expect("the store should append the events");

    assert_eq!(new_version, 2);

    let events = store
        .read_stream(&stream_id, VersionSelect::All, Direction::Forward, 10)
        .await
        .expect("the store should read the events back");

    assert_eq!(events.len(), 2);
    assert_eq!(events[0].version, 1);
    assert_eq!(events[1].version, 2);
    assert_eq!(events[0].event_type, "created");
    assert_eq!(events[1].event_type, "paid");
    assert_eq!(events[0].stream_id, stream_id);
    assert!(events[0].sequence_number < events[1].sequence_number);
}

#[tokio::test]
async fn a_stale_expected_version_is_rejected() {
    let store = setup::store().await;
    let stream_id = setup::unique_id("stream");

    store
        .append(
            &stream_id,
            Check::MustBe(0),
            vec![setup::event("created"), setup::event("paid")],
        )
        .await
        .expect("the store should append the events");

    let error = store
        .append(&stream_id, Check::MustBe(1), vec![setup::event("shipped")])
        .await
        .expect_err("the stale expected version should be rejected");

    match error {
        AppendError::Conflict(conflict) => {
            assert_eq!(conflict.expected, Check::MustBe(1));
            assert_eq!(conflict.actual, 2);
        },
        other => panic!("expected a conflict error, received: {other}"),
    }
}

#[tokio::test]
async fn expectation_boundaries_hold() {
    let store = setup::store().await;
    let stream_id = setup::unique_id("stream");

    // StreamExists against a missing stream fails.
    assert!(matches!(
        store
            .append(&stream_id, Check::StreamExists, vec![setup::event("e")])
            .await,
        Err(AppendError::Conflict(_))
    ));

    // An empty batch runs the check but records nothing.
    let version = store
        .append(&stream_id, Check::MustBe(0), vec![])
        .await
        .expect("an empty batch with a passing check should not fail");
    assert_eq!(version, 0);
    assert!(matches!(
        store
            .read_stream(&stream_id, VersionSelect::All, Direction::Forward, 10)
            .await,
        Err(ReadError::StreamNotFound)
    ));

    // MustBe(0) creates the stream.
    store
        .append(&stream_id, Check::MustBe(0), vec![setup::event("created")])
        .await
        .expect("the store should create the stream");

    // NoStream now fails.
    assert!(matches!(
        store
            .append(&stream_id, Check::NoStream, vec![setup::event("e")])
            .await,
        Err(AppendError::Conflict(_))
    ));
}

#[tokio::test]
async fn concurrent_appends_to_the_same_stream_conflict() {
    let store = setup::store().await;
    let stream_id = setup::unique_id("stream");

    let result = futures::join!(
        store.append(&stream_id, Check::MustBe(0), vec![setup::event("first")]),
        store.append(&stream_id, Check::MustBe(0), vec![setup::event("second")]),
    );

    match result {
        (Ok(_), Err(AppendError::Conflict(_))) | (Err(AppendError::Conflict(_)), Ok(_)) => {},
        (first, second) => panic!(
            "invalid state detected, first: {:?}, second: {:?}",
            first.is_ok(),
            second.is_ok()
        ),
    }
}

#[tokio::test]
async fn the_global_log_orders_events_across_streams() {
    let store = setup::store().await;
    let s = setup::unique_id("stream");
    let s2 = setup::unique_id("stream");

    store
        .append(
            &s,
            Check::MustBe(0),
            vec![setup::event("e1"), setup::event("e2")],
        )
        .await
        .expect("the store should append the events");
    store
        .append(&s2, Check::MustBe(0), vec![setup::event("e4")])
        .await
        .expect("the store should append the events");

    let first = store
        .read_stream(&s, VersionSelect::All, Direction::Forward, 10)
        .await
        .expect("the store should read the stream back");

    // Other tests append concurrently; restrict the assertion to the
    // events of these two streams.
    let ours: Vec<_> = store
        .stream_all(SequenceSelect::From(first[0].sequence_number))
        .try_collect::<Vec<_>>()
        .await
        .expect("the store should stream the global log")
        .into_iter()
        .filter(|event| event.stream_id == s || event.stream_id == s2)
        .collect();

    let types: Vec<_> = ours.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types, vec!["e1", "e2", "e4"]);

    let sequences: Vec<_> = ours.iter().map(|e| e.sequence_number).collect();
    let mut sorted = sequences.clone();
    sorted.sort_unstable();
    assert_eq!(sequences, sorted, "global order should match commit order");

    // Batch events occupy adjacent global sequence numbers.
    assert_eq!(ours[1].sequence_number, ours[0].sequence_number + 1);
}

#[tokio::test]
async fn linked_events_keep_their_original_identity() {
    let store = setup::store().await;
    let s = setup::unique_id("stream");
    let s2 = setup::unique_id("stream");

    store
        .append(&s, Check::MustBe(0), vec![setup::event("e1")])
        .await
        .expect("the store should append the events");
    store
        .append(&s2, Check::MustBe(0), vec![setup::event("e4")])
        .await
        .expect("the store should append the events");

    let e1 = store
        .read_stream(&s, VersionSelect::All, Direction::Forward, 1)
        .await
        .expect("the store should read the stream back")
        .remove(0);

    let new_version = store
        .link(&s2, Check::MustBe(1), vec![e1.event_id])
        .await
        .expect("the store should link the event");
    assert_eq!(new_version, 2);

    let events = store
        .read_stream(&s2, VersionSelect::All, Direction::Forward, 10)
        .await
        .expect("the store should read the stream back");

    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_type, "e4");
    assert_eq!(events[1].event_id, e1.event_id);
    assert_eq!(events[1].stream_id, s, "the original stream id is kept");
    assert_eq!(events[1].version, 1, "the original position is kept");
    assert_eq!(events[1].sequence_number, e1.sequence_number);

    // At most one link per (stream, event) pair.
    assert!(matches!(
        store.link(&s2, Check::MustBe(2), vec![e1.event_id]).await,
        Err(LinkError::DuplicateLink { .. })
    ));

    // Unknown events cannot be linked.
    assert!(matches!(
        store
            .link(&s2, Check::MustBe(2), vec![uuid::Uuid::new_v4()])
            .await,
        Err(LinkError::EventNotFound(_))
    ));
}

#[tokio::test]
async fn soft_deletion_hides_the_stream_but_not_the_global_log() {
    let store = setup::store().await;
    let stream_id = setup::unique_id("stream");

    store
        .append(&stream_id, Check::MustBe(0), vec![setup::event("e1")])
        .await
        .expect("the store should append the events");

    let recorded = store
        .read_stream(&stream_id, VersionSelect::All, Direction::Forward, 1)
        .await
        .expect("the store should read the stream back")
        .remove(0);

    store
        .delete(&stream_id, Check::MustBe(1), DeleteMode::Soft)
        .await
        .expect("the store should soft-delete the stream");

    assert!(matches!(
        store
            .read_stream(&stream_id, VersionSelect::All, Direction::Forward, 10)
            .await,
        Err(ReadError::StreamDeleted)
    ));
    assert!(matches!(
        store.append(&stream_id, Check::Any, vec![setup::event("e2")]).await,
        Err(AppendError::StreamDeleted)
    ));

    // The event is still visible through the global log.
    let ours: Vec<_> = store
        .read_all(
            SequenceSelect::From(recorded.sequence_number),
            Direction::Forward,
            10,
        )
        .await
        .expect("the store should read the global log")
        .into_iter()
        .filter(|event| event.stream_id == stream_id)
        .collect();

    assert_eq!(ours.len(), 1);
    assert_eq!(ours[0].event_id, recorded.event_id);
}

#[tokio::test]
async fn hard_deletes_require_the_configuration_opt_in() {
    let store = setup::store().await;
    let stream_id = setup::unique_id("stream");

    store
        .append(&stream_id, Check::MustBe(0), vec![setup::event("e1")])
        .await
        .expect("the store should append the events");

    assert!(matches!(
        store.delete(&stream_id, Check::Any, DeleteMode::Hard).await,
        Err(DeleteError::HardDeletesDisabled)
    ));
}

#[tokio::test]
async fn hard_deletion_removes_events_links_and_the_stream() {
    let store = setup::store_with(Config::default().with_hard_deletes()).await;
    let s = setup::unique_id("stream");
    let s2 = setup::unique_id("stream");

    store
        .append(
            &s,
            Check::MustBe(0),
            vec![setup::event("e1"), setup::event("e2")],
        )
        .await
        .expect("the store should append the events");
    store
        .append(&s2, Check::MustBe(0), vec![setup::event("e4")])
        .await
        .expect("the store should append the events");

    let e1 = store
        .read_stream(&s, VersionSelect::All, Direction::Forward, 1)
        .await
        .expect("the store should read the stream back")
        .remove(0);
    store
        .link(&s2, Check::MustBe(1), vec![e1.event_id])
        .await
        .expect("the store should link the event");

    store
        .delete(&s, Check::Any, DeleteMode::Hard)
        .await
        .expect("the store should hard-delete the stream");

    // The tombstone is observable on direct reads.
    assert!(matches!(
        store
            .read_stream(&s, VersionSelect::All, Direction::Forward, 10)
            .await,
        Err(ReadError::StreamDeleted)
    ));

    // No trace is left in the global log.
    let ours: Vec<_> = store
        .read_all(
            SequenceSelect::From(e1.sequence_number),
            Direction::Forward,
            100,
        )
        .await
        .expect("the store should read the global log")
        .into_iter()
        .filter(|event| event.stream_id == s || event.stream_id == s2)
        .collect();
    let types: Vec<_> = ours.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types, vec!["e4"]);

    // The linked copy is removed from s2 as well.
    let events = store
        .read_stream(&s2, VersionSelect::All, Direction::Forward, 10)
        .await
        .expect("the store should read the stream back");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "e4");

    // The stream id can be reused from version 0, with a recreating
    // expectation only.
    assert!(matches!(
        store.append(&s, Check::StreamExists, vec![setup::event("e5")]).await,
        Err(AppendError::StreamDeleted)
    ));
    let version = store
        .append(&s, Check::NoStream, vec![setup::event("e5")])
        .await
        .expect("the store should recreate the stream");
    assert_eq!(version, 1);
}

#[tokio::test]
async fn linking_recreates_a_hard_deleted_stream() {
    let store = setup::store_with(Config::default().with_hard_deletes()).await;
    let s = setup::unique_id("stream");
    let s2 = setup::unique_id("stream");

    store
        .append(&s, Check::MustBe(0), vec![setup::event("e1")])
        .await
        .expect("the store should append the events");
    store
        .append(&s2, Check::MustBe(0), vec![setup::event("e4")])
        .await
        .expect("the store should append the events");

    store
        .delete(&s, Check::Any, DeleteMode::Hard)
        .await
        .expect("the store should hard-delete the stream");

    let e4 = store
        .read_stream(&s2, VersionSelect::All, Direction::Forward, 1)
        .await
        .expect("the store should read the stream back")
        .remove(0);

    // A non-recreating expectation still observes the tombstone.
    assert!(matches!(
        store.link(&s, Check::StreamExists, vec![e4.event_id]).await,
        Err(LinkError::StreamDeleted)
    ));

    let version = store
        .link(&s, Check::NoStream, vec![e4.event_id])
        .await
        .expect("linking should recreate the stream");
    assert_eq!(version, 1);

    let events = store
        .read_stream(&s, VersionSelect::All, Direction::Forward, 10)
        .await
        .expect("the store should read the stream back");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_id, e4.event_id);
    assert_eq!(events[0].stream_id, s2, "the original stream id is kept");
}

#[tokio::test]
async fn backward_reads_return_the_newest_events_first() {
    let store = setup::store().await;
    let stream_id = setup::unique_id("stream");

    store
        .append(
            &stream_id,
            Check::MustBe(0),
            vec![setup::event("e1"), setup::event("e2"), setup::event("e3")],
        )
        .await
        .expect("the store should append the events");

    let events = store
        .read_stream(&stream_id, VersionSelect::All, Direction::Backward, 2)
        .await
        .expect("the store should read the stream back");

    let types: Vec<_> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types, vec!["e3", "e2"]);
}

#[tokio::test]
async fn paged_streaming_returns_every_event() {
    let store = setup::store_with(Config::default().with_read_batch_size(2)).await;
    let stream_id = setup::unique_id("stream");

    let events: Vec<_> = (0..5).map(|i| setup::event(&format!("e{i}"))).collect();
    store
        .append(&stream_id, Check::MustBe(0), events)
        .await
        .expect("the store should append the events");

    let collected: Vec<_> = store
        .stream(&stream_id, VersionSelect::All)
        .try_collect()
        .await
        .expect("the store should stream the events back");

    assert_eq!(collected.len(), 5);
    let versions: Vec<_> = collected.iter().map(|e| e.version).collect();
    assert_eq!(versions, vec![1, 2, 3, 4, 5]);
}
