//! Handle reference counting and native teardown.

mod common;

use common::{enqueue_host_work, Fixture};
use unirt::api;
use unirt::host::{HostDriver, HostOp, HostStatus};
use unirt::prelude::*;

/// Test native primitives are destroyed exactly once, on the last release
#[test]
fn test_event_destroyed_on_last_release() {
    let fixture = Fixture::new(QueueConfig::default());
    let event = enqueue_host_work(&fixture.queue, &[], || {});
    event.wait().expect("Failed to wait");
    assert_eq!(fixture.live_events(), 1);

    for _ in 0..3 {
        assert_eq!(api::event_retain(Some(&event)), ResultCode::Success);
    }
    assert_eq!(event.ref_count(), 4);

    for expected in (1..4).rev() {
        assert_eq!(api::event_release(Some(&event)), ResultCode::Success);
        assert_eq!(event.ref_count(), expected);
        assert_eq!(fixture.live_events(), 1);
    }

    let destroyed_before = fixture.stats().events_destroyed;
    assert_eq!(api::event_release(Some(&event)), ResultCode::Success);
    assert_eq!(fixture.stats().events_destroyed - destroyed_before, 1);
    assert_eq!(fixture.live_events(), 0);

    assert_eq!(api::event_release(Some(&event)), ResultCode::InvalidEvent);
    assert_eq!(api::event_retain(Some(&event)), ResultCode::InvalidEvent);
    assert_eq!(api::event_release::<HostDriver>(None), ResultCode::InvalidNullHandle);
    assert_eq!(fixture.stats().events_destroyed - destroyed_before, 1);
    fixture.teardown();
}

/// Test events keep their queue alive until they are released
#[test]
fn test_event_holds_queue_reference() {
    let fixture = Fixture::new(QueueConfig::out_of_order());
    let first = enqueue_host_work(&fixture.queue, &[], || {});
    let second = enqueue_host_work(&fixture.queue, &[], || {});
    assert_eq!(fixture.queue.ref_count(), 3);

    first.release().expect("Failed to release event");
    assert_eq!(fixture.queue.ref_count(), 2);

    // The application's reference goes first; the queue outlives it.
    fixture.queue.release().expect("Failed to release queue");
    assert_eq!(fixture.queue.ref_count(), 1);
    assert!(fixture.stats().live_streams() > 0);
    assert_eq!(second.queue().id(), fixture.queue.id());
    second.wait().expect("Failed to wait");

    second.release().expect("Failed to release event");
    assert_eq!(fixture.stats().live_streams(), 0);
    assert_eq!(fixture.stats().live_events(), 0);
    assert_eq!(
        fixture.queue.ensure_live().unwrap_err().code(),
        ResultCode::InvalidQueue
    );

    fixture
        .context
        .release()
        .expect("Failed to release context");
}

/// Test cloning a handle does not add a reference
#[test]
fn test_clone_is_not_retain() {
    let fixture = Fixture::new(QueueConfig::default());
    let event = enqueue_host_work(&fixture.queue, &[], || {});
    let copy = event.clone();
    assert_eq!(copy, event);
    assert_eq!(event.ref_count(), 1);

    copy.release().expect("Failed to release event");
    assert_eq!(
        event.wait().unwrap_err().code(),
        ResultCode::InvalidEvent
    );
    fixture.teardown();
}

/// Test buffers hold their context until released
#[test]
fn test_buffer_lifecycle() {
    let fixture = Fixture::new(QueueConfig::default());
    let buffer = Buffer::new(&fixture.context, 64).expect("Failed to create buffer");
    assert_eq!(fixture.context.ref_count(), 3);
    assert_eq!(fixture.stats().allocations, 1);

    assert_eq!(
        Buffer::new(&fixture.context, 0).unwrap_err().code(),
        ResultCode::InvalidValue
    );

    let err = fixture
        .queue
        .enqueue_buffer_write(&buffer, true, 60, &[0u8; 8], WaitList::empty(), false)
        .unwrap_err();
    assert_eq!(err.code(), ResultCode::InvalidSize);

    buffer.release().expect("Failed to release buffer");
    assert_eq!(fixture.stats().frees, 1);
    assert_eq!(fixture.context.ref_count(), 2);
    assert_eq!(
        buffer.device_ptr().unwrap_err().code(),
        ResultCode::InvalidMemObject
    );
    fixture.teardown();
}

/// Test a failed queue creation gives back its context reference and streams
#[test]
fn test_queue_creation_failure_cleans_up() {
    let fixture = Fixture::new(QueueConfig::default());
    let streams_before = fixture.stats().live_streams();

    fixture
        .driver
        .faults()
        .fail_nth(HostOp::StreamCreate, 1, HostStatus::OutOfResources);
    let err = Queue::new(&fixture.context, &fixture.device, QueueConfig::out_of_order())
        .unwrap_err();

    assert_eq!(err.code(), ResultCode::OutOfResources);
    assert_eq!(fixture.context.ref_count(), 2);
    assert_eq!(fixture.stats().live_streams(), streams_before);
    fixture.teardown();
}

/// Test a failed profiling event creation destroys the primitives it made
#[test]
fn test_partial_event_creation_cleans_up() {
    let fixture = Fixture::new(QueueConfig::profiling());
    fixture
        .driver
        .faults()
        .fail_nth(HostOp::EventCreate, 1, HostStatus::OutOfMemory);

    let err = fixture
        .queue
        .enqueue_events_wait(WaitList::empty(), true)
        .unwrap_err();

    assert_eq!(err.code(), ResultCode::OutOfDeviceMemory);
    assert_eq!(fixture.live_events(), 0);
    assert_eq!(fixture.queue.ref_count(), 1);
    fixture.teardown();
}
