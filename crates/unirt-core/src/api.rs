//! Runtime boundary.
//!
//! These functions mirror the runtime ABI: handles and out-pointers may be
//! absent, wait-lists arrive as a count plus an optional slice, and every
//! call reports exactly one [`ResultCode`]. They validate the raw argument
//! shape and forward to the typed methods, which Rust callers can use
//! directly.

use crate::driver::Driver;
use crate::enqueue::NativeCommandProperties;
use crate::error::{boundary, Error, Result, ResultCode};
use crate::event::EventHandle;
use crate::info::{EventInfo, InfoWriter, ProfilingInfo};
use crate::queue::Queue;
use crate::stream::WaitList;

fn require<'a, T>(handle: Option<&'a T>, what: &str) -> Result<&'a T> {
    handle.ok_or_else(|| Error::usage(ResultCode::InvalidNullHandle, format!("{what} is null")))
}

fn publish<D: Driver>(
    event: Option<EventHandle<D>>,
    out_event: Option<&mut Option<EventHandle<D>>>,
) {
    if let Some(out) = out_event {
        *out = event;
    }
}

/// Queries `event` for the info selector `prop_name`.
///
/// With `value` absent and `size_ret` present this is a size query.
pub fn event_get_info<D: Driver>(
    event: Option<&EventHandle<D>>,
    prop_name: u32,
    prop_size: usize,
    prop_value: Option<&mut [u8]>,
    prop_size_ret: Option<&mut usize>,
) -> ResultCode {
    boundary("event_get_info", || {
        let event = require(event, "event")?;
        let info = EventInfo::try_from(prop_name)?;
        let writer = InfoWriter::new(prop_size, prop_value, prop_size_ret)?;
        event.get_info(info, writer)
    })
}

/// Queries a profiling timestamp of `event`.
pub fn event_get_profiling_info<D: Driver>(
    event: Option<&EventHandle<D>>,
    prop_name: u32,
    prop_size: usize,
    prop_value: Option<&mut [u8]>,
    prop_size_ret: Option<&mut usize>,
) -> ResultCode {
    boundary("event_get_profiling_info", || {
        let event = require(event, "event")?;
        let info = ProfilingInfo::try_from(prop_name)?;
        let writer = InfoWriter::new(prop_size, prop_value, prop_size_ret)?;
        writer.write_u64(event.profiling_info(info)?)
    })
}

/// Adds a reference to `event`.
pub fn event_retain<D: Driver>(event: Option<&EventHandle<D>>) -> ResultCode {
    boundary("event_retain", || require(event, "event")?.retain())
}

/// Drops a reference to `event`.
pub fn event_release<D: Driver>(event: Option<&EventHandle<D>>) -> ResultCode {
    boundary("event_release", || require(event, "event")?.release())
}

/// Blocks until every listed event completes.
pub fn event_wait<D: Driver>(
    num_events: u32,
    event_list: Option<&[EventHandle<D>]>,
) -> ResultCode {
    boundary("event_wait", || {
        if num_events == 0 {
            return Err(Error::usage(
                ResultCode::InvalidValue,
                "wait needs at least one event",
            ));
        }
        let events = event_list.ok_or_else(|| {
            Error::usage(ResultCode::InvalidNullPointer, "event list is null")
        })?;
        if events.len() != num_events as usize {
            return Err(Error::usage(
                ResultCode::InvalidValue,
                format!("{num_events} events announced, {} given", events.len()),
            ));
        }
        EventHandle::wait_all(events)
    })
}

/// Enqueues caller-supplied native work on `queue`.
///
/// See [`Queue::enqueue_native_command`]. `out_event` is written only when
/// the whole command was enqueued.
#[allow(clippy::too_many_arguments)]
pub fn enqueue_native_command_exp<D, T, F>(
    queue: Option<&Queue<D>>,
    callback: Option<F>,
    data: &mut T,
    properties: Option<&NativeCommandProperties>,
    num_events_in_wait_list: u32,
    event_wait_list: Option<&[EventHandle<D>]>,
    out_event: Option<&mut Option<EventHandle<D>>>,
) -> ResultCode
where
    D: Driver,
    F: FnOnce(&Queue<D>, &mut T) -> std::result::Result<(), D::Status>,
{
    boundary("enqueue_native_command_exp", || {
        let queue = require(queue, "queue")?;
        let callback = callback.ok_or_else(|| {
            Error::usage(ResultCode::InvalidNullPointer, "native command callback is null")
        })?;
        let wait_list = WaitList::new(num_events_in_wait_list, event_wait_list);
        let event = queue.enqueue_native_command(
            callback,
            data,
            properties,
            wait_list,
            out_event.is_some(),
        )?;
        publish(event, out_event);
        Ok(())
    })
}

/// Enqueues a marker that completes after the listed events, or after all
/// prior work on `queue` when the list is empty.
pub fn enqueue_events_wait<D: Driver>(
    queue: Option<&Queue<D>>,
    num_events_in_wait_list: u32,
    event_wait_list: Option<&[EventHandle<D>]>,
    out_event: Option<&mut Option<EventHandle<D>>>,
) -> ResultCode {
    boundary("enqueue_events_wait", || {
        let queue = require(queue, "queue")?;
        let wait_list = WaitList::new(num_events_in_wait_list, event_wait_list);
        let event = queue.enqueue_events_wait(wait_list, out_event.is_some())?;
        publish(event, out_event);
        Ok(())
    })
}

/// Barrier variant of [`enqueue_events_wait`].
pub fn enqueue_events_wait_with_barrier<D: Driver>(
    queue: Option<&Queue<D>>,
    num_events_in_wait_list: u32,
    event_wait_list: Option<&[EventHandle<D>]>,
    out_event: Option<&mut Option<EventHandle<D>>>,
) -> ResultCode {
    boundary("enqueue_events_wait_with_barrier", || {
        let queue = require(queue, "queue")?;
        let wait_list = WaitList::new(num_events_in_wait_list, event_wait_list);
        let event = queue.enqueue_events_wait_with_barrier(wait_list, out_event.is_some())?;
        publish(event, out_event);
        Ok(())
    })
}

/// Returns the native stream external code should submit to for `queue`.
pub fn queue_get_native_handle<D: Driver>(
    queue: Option<&Queue<D>>,
    native: Option<&mut Option<D::Stream>>,
) -> ResultCode {
    boundary("queue_get_native_handle", || {
        let queue = require(queue, "queue")?;
        let native = native.ok_or_else(|| {
            Error::usage(ResultCode::InvalidNullPointer, "native handle output is null")
        })?;
        *native = Some(queue.native_handle()?);
        Ok(())
    })
}

/// Blocks until all work submitted to `queue` completed.
pub fn queue_finish<D: Driver>(queue: Option<&Queue<D>>) -> ResultCode {
    boundary("queue_finish", || require(queue, "queue")?.finish())
}
