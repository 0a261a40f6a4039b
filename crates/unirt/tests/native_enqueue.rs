//! Native-escape enqueue: ordering, interop stream and failure paths.

mod common;

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{enqueue_host_work, Fixture};
use parking_lot::Mutex;
use unirt::api;
use unirt::host::{HostConfig, HostContext, HostDriver, HostOp, HostStatus, HostStream};
use unirt::prelude::*;
use unirt::{adapter_get_last_error, ScopedContext};

type Log = Arc<Mutex<Vec<&'static str>>>;

fn push(log: &Log, entry: &'static str) -> impl FnOnce() + Send + 'static {
    let log = Arc::clone(log);
    move || log.lock().push(entry)
}

fn out_of_order(skip_completed_waits: bool) -> QueueConfig {
    QueueConfigBuilder::out_of_order()
        .with_skip_completed_waits(skip_completed_waits)
        .build()
}

/// Runs a command that depends on a gated command on another stream and
/// checks it only runs after the gate opens.
fn check_cross_stream_ordering(fixture: &Fixture) {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let (open_gate, gate) = mpsc::channel::<()>();

    let gated_log = Arc::clone(&log);
    let gated = enqueue_host_work(&fixture.queue, &[], move || {
        let _ = gate.recv();
        gated_log.lock().push("gated");
    });
    let quick = enqueue_host_work(&fixture.queue, &[], push(&log, "quick"));
    assert_ne!(gated.stream(), quick.stream());

    // Reuses the quick command's stream and waits on the gated one.
    let dependent = enqueue_host_work(
        &fixture.queue,
        &[quick.clone(), gated.clone()],
        push(&log, "dependent"),
    );
    assert_eq!(dependent.stream(), quick.stream());

    thread::sleep(Duration::from_millis(5));
    let ran_early = log.lock().contains(&"dependent");
    let complete_early = dependent.is_complete().expect("Failed to query event");
    open_gate.send(()).expect("Failed to open gate");

    dependent.wait().expect("Failed to wait");
    assert!(!ran_early, "dependent command ran before its dependency");
    assert!(!complete_early);

    let log = log.lock();
    let gated_at = log.iter().position(|e| *e == "gated");
    let dependent_at = log.iter().position(|e| *e == "dependent");
    assert!(gated_at < dependent_at);

    for event in [gated, quick, dependent] {
        event.release().expect("Failed to release event");
    }
}

/// Test cross-stream dependencies are enforced on the device
#[test]
fn test_cross_stream_ordering() {
    for skip in [true, false] {
        let fixture = Fixture::new(out_of_order(skip));
        for _ in 0..10 {
            check_cross_stream_ordering(&fixture);
        }
        assert_eq!(fixture.live_events(), 0);
        fixture.teardown();
    }
}

/// Test completed wait-list entries skip the device-side wait when enabled
#[test]
fn test_completed_waits_skipped() {
    for (skip, expected_waits) in [(true, 0), (false, 1)] {
        let fixture = Fixture::new(out_of_order(skip));
        let first = enqueue_host_work(&fixture.queue, &[], || {});
        first.wait().expect("Failed to wait");

        // Occupy the first event's stream so the next command moves on.
        let filler = enqueue_host_work(&fixture.queue, &[], || {});
        let before = fixture.stats().waits_inserted;
        let second = enqueue_host_work(&fixture.queue, &[filler.clone(), first.clone()], || {});
        second.wait().expect("Failed to wait");

        assert_ne!(second.stream(), first.stream());
        assert_eq!(fixture.stats().waits_inserted - before, expected_waits);

        for event in [first, filler, second] {
            event.release().expect("Failed to release event");
        }
        fixture.teardown();
    }
}

/// Test in-order queues never insert waits between their own commands
#[test]
fn test_in_order_queue_needs_no_waits() {
    let fixture = Fixture::new(
        QueueConfigBuilder::new()
            .with_skip_completed_waits(false)
            .build(),
    );
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let first = enqueue_host_work(&fixture.queue, &[], push(&log, "first"));
    let second = enqueue_host_work(&fixture.queue, &[first.clone()], push(&log, "second"));
    second.wait().expect("Failed to wait");

    assert_eq!(fixture.stats().waits_inserted, 0);
    assert_eq!(*log.lock(), vec!["first", "second"]);

    first.release().expect("Failed to release event");
    second.release().expect("Failed to release event");
    fixture.teardown();
}

/// Test the callback sees the stream its dependencies were ordered on
#[test]
fn test_interop_stream_matches_selection() {
    let fixture = Fixture::new(QueueConfig::out_of_order());
    let first = enqueue_host_work(&fixture.queue, &[], || {});
    let filler = enqueue_host_work(&fixture.queue, &[], || {});

    let mut seen: (Option<HostStream>, Option<HostStream>) = (None, None);
    let mut out_event = None;
    let code = api::enqueue_native_command_exp(
        Some(&fixture.queue),
        Some(
            |queue: &Queue<HostDriver>, seen: &mut (Option<HostStream>, Option<HostStream>)| {
                seen.0 = queue.native_handle().ok();
                let mut native = None;
                if api::queue_get_native_handle(Some(queue), Some(&mut native))
                    != ResultCode::Success
                {
                    return Err(HostStatus::InvalidHandle);
                }
                seen.1 = native;
                Ok(())
            },
        ),
        &mut seen,
        None,
        1,
        Some(std::slice::from_ref(&first)),
        Some(&mut out_event),
    );
    assert_eq!(code, ResultCode::Success);

    let event = out_event.expect("event published");
    assert_eq!(seen.0, Some(event.stream()));
    assert_eq!(seen.1, Some(event.stream()));
    assert_eq!(event.stream(), first.stream());
    assert_eq!(event.kind(), CommandKind::EnqueueNative);
    event.wait().expect("Failed to wait");

    for event in [first, filler, event] {
        event.release().expect("Failed to release event");
    }
    fixture.teardown();
}

/// Test concurrent submitters each see their own interop stream
#[test]
fn test_interop_stream_is_per_thread() {
    let fixture = Fixture::new(QueueConfig::out_of_order());
    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..25 {
                    let mut seen = None;
                    let event = fixture
                        .queue
                        .enqueue_native_command(
                            |queue, seen: &mut Option<HostStream>| {
                                *seen = queue.native_handle().ok();
                                thread::yield_now();
                                Ok(())
                            },
                            &mut seen,
                            None,
                            WaitList::empty(),
                            true,
                        )
                        .expect("Failed to enqueue native command")
                        .expect("event requested");
                    assert_eq!(seen, Some(event.stream()));
                    event.release().expect("Failed to release event");
                }
            });
        }
    });
    assert_eq!(fixture.live_events(), 0);
    fixture.teardown();
}

/// Test no event is created when none was requested
#[test]
fn test_no_event_requested() {
    let fixture = Fixture::new(QueueConfig::default());
    let mut ran = false;
    let event = fixture
        .queue
        .enqueue_native_command(
            |_, ran: &mut bool| {
                *ran = true;
                Ok(())
            },
            &mut ran,
            None,
            WaitList::empty(),
            false,
        )
        .expect("Failed to enqueue native command");

    assert!(event.is_none());
    assert!(ran);
    assert_eq!(fixture.stats().events_created, 0);
    fixture.teardown();
}

/// Test a native status returned by the callback is translated
#[test]
fn test_callback_status_translated() {
    let fixture = Fixture::new(QueueConfig::default());
    let mut out_event = None;
    let code = api::enqueue_native_command_exp(
        Some(&fixture.queue),
        Some(|_: &Queue<HostDriver>, _: &mut ()| Err(HostStatus::OutOfMemory)),
        &mut (),
        None,
        0,
        None,
        Some(&mut out_event),
    );

    assert_eq!(code, ResultCode::OutOfDeviceMemory);
    assert!(out_event.is_none());
    let last = adapter_get_last_error().expect("last error recorded");
    assert_eq!(last.backend, "host");
    assert_eq!(last.raw, HostStatus::OutOfMemory as i64);

    assert_eq!(fixture.live_events(), 0);
    assert_eq!(fixture.queue.ref_count(), 1);
    fixture.teardown();
}

/// Test a panicking callback is contained and reported as unknown
#[test]
fn test_callback_panic_contained() {
    let fixture = Fixture::new(QueueConfig::default());
    let mut out_event = None;
    let code = api::enqueue_native_command_exp(
        Some(&fixture.queue),
        Some(|_: &Queue<HostDriver>, _: &mut ()| -> std::result::Result<(), HostStatus> {
            panic!("native work exploded")
        }),
        &mut (),
        None,
        0,
        None,
        Some(&mut out_event),
    );

    assert_eq!(code, ResultCode::Unknown);
    assert!(out_event.is_none());
    assert_eq!(fixture.live_events(), 0);

    let err = fixture
        .queue
        .enqueue_native_command(
            |_, _: &mut ()| -> std::result::Result<(), HostStatus> { panic!("again") },
            &mut (),
            None,
            WaitList::empty(),
            true,
        )
        .unwrap_err();
    assert!(matches!(err, Error::Panicked(ref message) if message == "again"));
    fixture.teardown();
}

/// Test null arguments are rejected before any work happens
#[test]
fn test_null_arguments() {
    let fixture = Fixture::new(QueueConfig::default());
    let mut ran = false;

    let code = api::enqueue_native_command_exp::<HostDriver, bool, _>(
        None,
        Some(|_: &Queue<HostDriver>, ran: &mut bool| -> std::result::Result<(), HostStatus> {
            *ran = true;
            Ok(())
        }),
        &mut ran,
        None,
        0,
        None,
        None,
    );
    assert_eq!(code, ResultCode::InvalidNullHandle);

    let code = api::enqueue_native_command_exp(
        Some(&fixture.queue),
        None::<fn(&Queue<HostDriver>, &mut bool) -> std::result::Result<(), HostStatus>>,
        &mut ran,
        None,
        0,
        None,
        None,
    );
    assert_eq!(code, ResultCode::InvalidNullPointer);

    assert!(!ran);
    fixture.teardown();
}

/// Test malformed wait-lists fail without running the callback
#[test]
fn test_invalid_wait_list() {
    let fixture = Fixture::new(QueueConfig::out_of_order());
    let event = enqueue_host_work(&fixture.queue, &[], || {});
    let mut ran = false;
    let callback = |_: &Queue<HostDriver>, ran: &mut bool| -> std::result::Result<(), HostStatus> {
        *ran = true;
        Ok(())
    };

    let cases: [(u32, Option<&[EventHandle<HostDriver>]>); 3] = [
        (1, None),
        (0, Some(std::slice::from_ref(&event))),
        (2, Some(std::slice::from_ref(&event))),
    ];
    for (count, list) in cases {
        let mut out_event = None;
        let code = api::enqueue_native_command_exp(
            Some(&fixture.queue),
            Some(callback),
            &mut ran,
            None,
            count,
            list,
            Some(&mut out_event),
        );
        assert_eq!(code, ResultCode::InvalidEventWaitList);
        assert!(out_event.is_none());
    }
    assert!(!ran);

    event.release().expect("Failed to release event");
    fixture.teardown();
}

/// Test a released wait-list entry is rejected
#[test]
fn test_released_wait_list_entry() {
    let fixture = Fixture::new(QueueConfig::default());
    let event = enqueue_host_work(&fixture.queue, &[], || {});
    event.release().expect("Failed to release event");

    let err = fixture
        .queue
        .enqueue_events_wait(WaitList::from(std::slice::from_ref(&event)), true)
        .unwrap_err();
    assert_eq!(err.code(), ResultCode::InvalidEvent);
    assert_eq!(fixture.live_events(), 0);
    fixture.teardown();
}

/// Test a wait-list entry from another device is rejected
#[test]
fn test_foreign_device_wait_list_entry() {
    let fixture = Fixture::with_host(HostConfig::with_devices(2), QueueConfig::default());
    let other_device =
        Device::new(Arc::clone(&fixture.driver), 1).expect("Failed to open device");
    let other_context = Context::new(&other_device).expect("Failed to create context");
    let other_queue = Queue::new(&other_context, &other_device, QueueConfig::default())
        .expect("Failed to create queue");

    let foreign = enqueue_host_work(&other_queue, &[], || {});
    let err = fixture
        .queue
        .enqueue_events_wait(WaitList::from(std::slice::from_ref(&foreign)), false)
        .unwrap_err();
    assert_eq!(err.code(), ResultCode::InvalidEventWaitList);

    foreign.release().expect("Failed to release event");
    other_queue.release().expect("Failed to release queue");
    other_context.release().expect("Failed to release context");
    fixture.teardown();
}

/// Test native failures at each protocol step leave nothing behind
#[test]
fn test_injected_faults() {
    let cases = [
        (HostOp::SetCurrentContext, false),
        (HostOp::EventCreate, false),
        (HostOp::EventRecord, true),
        (HostOp::LaunchHostFn, true),
    ];
    for (op, callback_runs) in cases {
        let fixture = Fixture::new(QueueConfig::default());
        let ran = Arc::new(Mutex::new(false));

        fixture.driver.faults().fail_next(op, HostStatus::DeviceLost);
        let flag = Arc::clone(&ran);
        let result = fixture.queue.enqueue_native_command(
            |queue, _: &mut ()| {
                *flag.lock() = true;
                let stream = queue.native_handle().expect("Failed to get native handle");
                queue.device().driver().launch_host_fn(stream, Box::new(|| {}))
            },
            &mut (),
            None,
            WaitList::empty(),
            true,
        );

        let err = result.unwrap_err();
        assert_eq!(err.code(), ResultCode::DeviceLost, "{op:?}");
        assert!(err.is_native());
        assert_eq!(*ran.lock(), callback_runs, "{op:?}");
        assert_eq!(fixture.live_events(), 0, "{op:?}");
        assert_eq!(fixture.queue.ref_count(), 1, "{op:?}");
        assert_eq!(fixture.driver.faults().pending(op), 0);
        assert_eq!(
            fixture.driver.current_context().expect("Failed to read context"),
            None,
            "{op:?}"
        );
        fixture.teardown();
    }
}

/// Test the caller's context binding survives an enqueue on another device
#[test]
fn test_context_restored() {
    let fixture = Fixture::with_host(HostConfig::with_devices(2), QueueConfig::default());
    let other_device =
        Device::new(Arc::clone(&fixture.driver), 1).expect("Failed to open device");
    let driver = fixture.driver.as_ref();

    let outer = ScopedContext::new(&other_device).expect("Failed to bind context");
    assert_eq!(
        driver.current_context().expect("Failed to read context"),
        Some(other_device.native_context())
    );

    let mut inside: Option<HostContext> = None;
    let event = fixture
        .queue
        .enqueue_native_command(
            |queue, inside: &mut Option<HostContext>| {
                *inside = queue.device().driver().current_context()?;
                Ok(())
            },
            &mut inside,
            None,
            WaitList::empty(),
            true,
        )
        .expect("Failed to enqueue native command")
        .expect("event requested");
    assert_eq!(inside, Some(fixture.device.native_context()));
    assert_eq!(
        driver.current_context().expect("Failed to read context"),
        Some(other_device.native_context())
    );

    let result = fixture.queue.enqueue_native_command(
        |_, _: &mut ()| Err(HostStatus::Unknown),
        &mut (),
        None,
        WaitList::empty(),
        true,
    );
    assert!(result.is_err());
    assert_eq!(
        driver.current_context().expect("Failed to read context"),
        Some(other_device.native_context())
    );

    event.wait().expect("Failed to wait");
    assert_eq!(
        driver.current_context().expect("Failed to read context"),
        Some(other_device.native_context())
    );
    drop(outer);
    assert_eq!(driver.current_context().expect("Failed to read context"), None);

    event.release().expect("Failed to release event");
    fixture.teardown();
}

/// Test an empty events-wait joins every stream of the queue
#[test]
fn test_events_wait_joins_queue() {
    let fixture = Fixture::new(QueueConfig::out_of_order());
    let (open_gate, gate) = mpsc::channel::<()>();
    let gated = enqueue_host_work(&fixture.queue, &[], move || {
        let _ = gate.recv();
    });

    let marker = fixture
        .queue
        .enqueue_events_wait(WaitList::empty(), true)
        .expect("Failed to enqueue events wait")
        .expect("event requested");
    assert_eq!(marker.kind(), CommandKind::EventsWait);
    assert_ne!(marker.stream(), gated.stream());

    thread::sleep(Duration::from_millis(5));
    let complete_early = marker.is_complete().expect("Failed to query event");
    open_gate.send(()).expect("Failed to open gate");
    marker.wait().expect("Failed to wait");
    assert!(!complete_early);
    assert!(gated.is_complete().expect("Failed to query event"));

    gated.release().expect("Failed to release event");
    marker.release().expect("Failed to release event");
    fixture.teardown();
}

/// Test commands after a barrier wait for work submitted before it
#[test]
fn test_barrier_orders_later_commands() {
    let fixture = Fixture::new(QueueConfig::out_of_order());
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let (open_gate, gate) = mpsc::channel::<()>();

    let gated_log = Arc::clone(&log);
    let gated = enqueue_host_work(&fixture.queue, &[], move || {
        let _ = gate.recv();
        gated_log.lock().push("before");
    });

    let mut out_event = None;
    assert_eq!(
        api::enqueue_events_wait_with_barrier(Some(&fixture.queue), 0, None, Some(&mut out_event)),
        ResultCode::Success
    );
    let barrier = out_event.expect("event published");
    assert_eq!(barrier.kind(), CommandKind::EventsWaitWithBarrier);

    let later = enqueue_host_work(&fixture.queue, &[], push(&log, "after"));
    assert_ne!(later.stream(), gated.stream());

    thread::sleep(Duration::from_millis(5));
    let ran_early = log.lock().contains(&"after");
    open_gate.send(()).expect("Failed to open gate");
    assert_eq!(api::queue_finish(Some(&fixture.queue)), ResultCode::Success);

    assert!(!ran_early);
    assert_eq!(*log.lock(), vec!["before", "after"]);

    for event in [gated, barrier, later] {
        event.release().expect("Failed to release event");
    }
    fixture.teardown();
}

/// Test lifecycle transitions out of order are internal errors
#[test]
fn test_event_transitions_checked() {
    let fixture = Fixture::new(QueueConfig::default());
    let event = enqueue_host_work(&fixture.queue, &[], || {});
    assert_eq!(event.state(), unirt::EventState::Recorded);
    assert!(event.seq().is_some());

    let err = event.record().unwrap_err();
    assert!(matches!(err, Error::Internal(_)));
    assert_eq!(err.code(), ResultCode::InvalidOperation);
    assert!(matches!(event.start().unwrap_err(), Error::Internal(_)));

    event.wait().expect("Failed to wait");
    assert_eq!(
        event.execution_status().expect("Failed to query status"),
        EventStatus::Complete
    );
    event.release().expect("Failed to release event");
    fixture.teardown();
}

/// Test event sequence numbers follow submission order on a queue
#[test]
fn test_event_sequence_numbers() {
    let fixture = Fixture::new(QueueConfig::out_of_order());
    let events: Vec<_> = (0..8)
        .map(|_| enqueue_host_work(&fixture.queue, &[], || {}))
        .collect();
    let seqs: Vec<u64> = events.iter().filter_map(EventHandle::seq).collect();
    assert_eq!(seqs.len(), events.len());
    assert!(seqs.windows(2).all(|pair| pair[0] < pair[1]));

    assert_eq!(api::event_wait(events.len() as u32, Some(&events[..])), ResultCode::Success);
    assert_eq!(api::event_wait::<HostDriver>(0, None), ResultCode::InvalidValue);
    assert_eq!(api::event_wait::<HostDriver>(1, None), ResultCode::InvalidNullPointer);
    assert_eq!(api::event_wait(2, Some(&events[..1])), ResultCode::InvalidValue);

    for event in events {
        event.release().expect("Failed to release event");
    }
    fixture.teardown();
}

/// Test querying the native handle outside a command leaves selection alone
#[test]
fn test_native_handle_query_is_read_only() {
    let fixture = Fixture::new(
        QueueConfigBuilder::out_of_order()
            .with_skip_completed_waits(false)
            .build(),
    );
    let first = enqueue_host_work(&fixture.queue, &[], || {});

    let peeked = fixture.queue.native_handle().expect("Failed to get native handle");
    for _ in 0..3 {
        assert_eq!(
            fixture.queue.native_handle().expect("Failed to get native handle"),
            peeked
        );
    }

    // Still the last command on its stream, so the dependency stays implicit.
    let dependent = enqueue_host_work(&fixture.queue, &[first.clone()], || {});
    assert_eq!(dependent.stream(), first.stream());
    assert_eq!(fixture.stats().waits_inserted, 0);

    let next = enqueue_host_work(&fixture.queue, &[], || {});
    assert_eq!(next.stream(), peeked);

    for event in [first, dependent, next] {
        event.release().expect("Failed to release event");
    }
    fixture.teardown();
}
