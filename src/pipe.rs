//! Ordered buffered streams with flush-based back-pressure.
//!
//! A pipe is a bounded FIFO connecting writers to readers.
//! [`create`]/[`with_capacity`] return the two halves; both are cheaply
//! cloneable, so pipes are multi-producer and multi-consumer.
//!
//! # Back-pressure
//!
//! [`Writer::write`] accepts the value immediately and returns the pipe's
//! pushback deferred: determined while the buffer holds at most `capacity`
//! values, pending while the pipe is over capacity. A producer that waits
//! on it before writing again self-limits to the consumer's pace;
//! [`Writer::write_without_pushback`] opts out.
//!
//! # Ordering
//!
//! Values arrive in producer order. With several concurrent readers each
//! value goes to exactly one of them, in the order the readers arrived.
//!
//! # Close semantics
//!
//! Closing the write end fails subsequent writes with `Closed` and lets
//! readers drain the buffer before seeing [`ReadResult::Eof`]. Closing the
//! read end drops buffered values, signals `ReaderClosed` to flush
//! waiters, and releases pushback so writers are not left hanging.

use crate::deferred::{Deferred, Ivar};
use crate::error::{Error, Result};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

/// What a completed [`Reader::read`] produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResult<T> {
    /// The next value in producer order.
    Ok(T),
    /// The pipe is closed and fully drained.
    Eof,
}

/// Outcome of a non-blocking [`Reader::read_now`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadNow<T> {
    /// The next value in producer order.
    Ok(T),
    /// The pipe is closed and fully drained.
    Eof,
    /// Nothing buffered right now; the pipe is still open.
    NothingAvailable,
}

/// Outcome of [`Reader::read_exactly`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadExactly<T> {
    /// Exactly the requested number of values.
    Exactly(Vec<T>),
    /// The pipe closed first; fewer than requested (at least one).
    Fewer(Vec<T>),
    /// The pipe closed before yielding anything.
    Eof,
}

/// How a flush wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushResult {
    /// Everything buffered at wait time has been read.
    Flushed,
    /// The read end was closed; buffered values were dropped.
    ReaderClosed,
}

struct PipeInner<T> {
    buffer: VecDeque<T>,
    capacity: usize,
    closed: bool,
    read_closed: bool,
    pushback: Ivar<()>,
    reader_waiters: VecDeque<Ivar<ReadResult<T>>>,
    available_waiters: Vec<Ivar<ReadResult<()>>>,
    flush_waiters: Vec<(u64, Ivar<FlushResult>)>,
    total_written: u64,
    total_read: u64,
}

/// Deferred fills staged while the pipe cell is borrowed, executed after
/// the borrow ends so handler enqueueing never observes a half-updated
/// pipe.
enum Fill<T> {
    Read(Ivar<ReadResult<T>>, ReadResult<T>),
    Available(Ivar<ReadResult<()>>, ReadResult<()>),
    Flush(Ivar<FlushResult>, FlushResult),
    Pushback(Ivar<()>),
}

impl<T: Clone + 'static> Fill<T> {
    fn run(self) {
        match self {
            Fill::Read(ivar, value) => ivar.fill(value),
            Fill::Available(ivar, value) => ivar.fill(value),
            Fill::Flush(ivar, value) => ivar.fill(value),
            Fill::Pushback(ivar) => {
                ivar.fill_if_empty(());
            }
        }
    }
}

impl<T: Clone + 'static> PipeInner<T> {
    fn update_pushback(&mut self, fills: &mut Vec<Fill<T>>) {
        if self.closed || self.buffer.len() <= self.capacity {
            if !self.pushback.is_determined() {
                fills.push(Fill::Pushback(self.pushback.clone()));
            }
        } else if self.pushback.is_determined() {
            // Over capacity again: writers now wait on a fresh cell.
            self.pushback = Ivar::create();
        }
    }

    fn update_flushes(&mut self, fills: &mut Vec<Fill<T>>) {
        let total_read = self.total_read;
        self.flush_waiters.retain(|(target, ivar)| {
            if *target <= total_read {
                fills.push(Fill::Flush(ivar.clone(), FlushResult::Flushed));
                false
            } else {
                true
            }
        });
    }
}

type Shared<T> = Rc<RefCell<PipeInner<T>>>;

/// Creates a pipe with capacity 0: every buffered value holds pushback.
#[must_use]
pub fn create<T: Clone + 'static>() -> (Reader<T>, Writer<T>) {
    with_capacity(0)
}

/// Creates a pipe whose pushback engages once more than `capacity` values
/// are buffered.
#[must_use]
pub fn with_capacity<T: Clone + 'static>(capacity: usize) -> (Reader<T>, Writer<T>) {
    let pushback = Ivar::create();
    pushback.fill(());
    let inner: Shared<T> = Rc::new(RefCell::new(PipeInner {
        buffer: VecDeque::new(),
        capacity,
        closed: false,
        read_closed: false,
        pushback,
        reader_waiters: VecDeque::new(),
        available_waiters: Vec::new(),
        flush_waiters: Vec::new(),
        total_written: 0,
        total_read: 0,
    }));
    (
        Reader {
            inner: inner.clone(),
        },
        Writer { inner },
    )
}

/// The consuming half of a pipe.
pub struct Reader<T> {
    inner: Shared<T>,
}

/// The producing half of a pipe.
pub struct Writer<T> {
    inner: Shared<T>,
}

impl<T> Clone for Reader<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Clone for Writer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + 'static> Writer<T> {
    /// Accepts `value` and returns the pushback deferred: already
    /// determined while the pipe is at or under capacity, pending until
    /// reads bring it back under once it is over.
    ///
    /// Fails with `Closed` once the pipe is closed.
    pub fn write(&self, value: T) -> Result<Deferred<()>> {
        self.write_without_pushback(value)?;
        Ok(self.pushback())
    }

    /// Accepts `value` without flow control.
    pub fn write_without_pushback(&self, value: T) -> Result<()> {
        let mut fills = Vec::new();
        {
            let mut pipe = self.inner.borrow_mut();
            if pipe.closed {
                return Err(Error::closed().with_context("write to closed pipe"));
            }
            pipe.total_written += 1;
            if let Some(waiter) = pipe.reader_waiters.pop_front() {
                // A reader was already parked: the value bypasses the
                // buffer and counts as read immediately.
                pipe.total_read += 1;
                fills.push(Fill::Read(waiter, ReadResult::Ok(value)));
            } else {
                pipe.buffer.push_back(value);
                for waiter in pipe.available_waiters.drain(..) {
                    fills.push(Fill::Available(waiter, ReadResult::Ok(())));
                }
            }
            pipe.update_pushback(&mut fills);
            pipe.update_flushes(&mut fills);
        }
        for fill in fills {
            fill.run();
        }
        Ok(())
    }

    /// The current pushback deferred.
    #[must_use]
    pub fn pushback(&self) -> Deferred<()> {
        self.inner.borrow().pushback.read()
    }

    /// Closes the write end. Buffered values remain readable; drained
    /// readers see EOF. Idempotent.
    pub fn close(&self) {
        close_write(&self.inner);
    }

    /// True once the pipe is closed (either end).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    /// Number of values currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.borrow().buffer.len()
    }

    /// True if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().buffer.is_empty()
    }

    /// Determined once every value buffered now has been read (or the
    /// read end closes).
    #[must_use]
    pub fn downstream_flushed(&self) -> Deferred<FlushResult> {
        flushed(&self.inner)
    }
}

impl<T: Clone + 'static> Reader<T> {
    /// Pops the next value in producer order, waiting if none is buffered;
    /// EOF once the pipe is closed and drained. Concurrent reads are
    /// served in arrival order, one value each.
    pub fn read(&self) -> Deferred<ReadResult<T>> {
        let mut fills = Vec::new();
        let result = {
            let mut pipe = self.inner.borrow_mut();
            if let Some(value) = pipe.buffer.pop_front() {
                pipe.total_read += 1;
                pipe.update_pushback(&mut fills);
                pipe.update_flushes(&mut fills);
                Deferred::ready(ReadResult::Ok(value))
            } else if pipe.closed {
                Deferred::ready(ReadResult::Eof)
            } else {
                let waiter = Ivar::create();
                pipe.reader_waiters.push_back(waiter.clone());
                waiter.read()
            }
        };
        for fill in fills {
            fill.run();
        }
        result
    }

    /// Pops the next value without waiting.
    pub fn read_now(&self) -> ReadNow<T> {
        let mut fills = Vec::new();
        let result = {
            let mut pipe = self.inner.borrow_mut();
            if let Some(value) = pipe.buffer.pop_front() {
                pipe.total_read += 1;
                pipe.update_pushback(&mut fills);
                pipe.update_flushes(&mut fills);
                ReadNow::Ok(value)
            } else if pipe.closed {
                ReadNow::Eof
            } else {
                ReadNow::NothingAvailable
            }
        };
        for fill in fills {
            fill.run();
        }
        result
    }

    /// Reads `count` values, or fewer if the pipe closes first.
    pub fn read_exactly(&self, count: usize) -> Deferred<ReadExactly<T>> {
        if count == 0 {
            return Deferred::ready(ReadExactly::Exactly(Vec::new()));
        }
        let result: Ivar<ReadExactly<T>> = Ivar::create();
        let collected: Rc<RefCell<Vec<T>>> = Rc::new(RefCell::new(Vec::with_capacity(count)));
        read_exactly_step(self.clone(), count, collected, result.clone());
        Deferred::of_ivar(result)
    }

    /// Determined with `Ok` once a value is buffered (without consuming
    /// it), or `Eof` once the pipe is closed and drained.
    pub fn values_available(&self) -> Deferred<ReadResult<()>> {
        let mut pipe = self.inner.borrow_mut();
        if !pipe.buffer.is_empty() {
            return Deferred::ready(ReadResult::Ok(()));
        }
        if pipe.closed {
            return Deferred::ready(ReadResult::Eof);
        }
        let waiter = Ivar::create();
        pipe.available_waiters.push(waiter.clone());
        waiter.read()
    }

    /// Closes the read end: buffered values are dropped, flush waiters see
    /// `ReaderClosed`, later writes fail with `Closed`, and pushback is
    /// released. Idempotent.
    pub fn close(&self) {
        let mut fills = Vec::new();
        {
            let mut pipe = self.inner.borrow_mut();
            if pipe.read_closed {
                return;
            }
            pipe.read_closed = true;
            pipe.closed = true;
            pipe.buffer.clear();
            pipe.total_read = pipe.total_written;
            for (_, ivar) in pipe.flush_waiters.drain(..) {
                fills.push(Fill::Flush(ivar, FlushResult::ReaderClosed));
            }
            for waiter in pipe.reader_waiters.drain(..) {
                fills.push(Fill::Read(waiter, ReadResult::Eof));
            }
            for waiter in pipe.available_waiters.drain(..) {
                fills.push(Fill::Available(waiter, ReadResult::Eof));
            }
            pipe.update_pushback(&mut fills);
        }
        for fill in fills {
            fill.run();
        }
    }

    /// True once the pipe is closed (either end).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    /// Number of values currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.borrow().buffer.len()
    }

    /// True if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().buffer.is_empty()
    }

    /// Determined once every value buffered now has been read (or the
    /// read end closes). From the reader's side this is the upstream
    /// flush: a chained upstream would be consulted first in a multi-stage
    /// pipeline, and a lone pipe is its own upstream.
    #[must_use]
    pub fn upstream_flushed(&self) -> Deferred<FlushResult> {
        flushed(&self.inner)
    }
}

fn read_exactly_step<T: Clone + 'static>(
    reader: Reader<T>,
    count: usize,
    collected: Rc<RefCell<Vec<T>>>,
    result: Ivar<ReadExactly<T>>,
) {
    reader.read().upon(move |read| match read {
        ReadResult::Ok(value) => {
            collected.borrow_mut().push(value);
            if collected.borrow().len() == count {
                let values = std::mem::take(&mut *collected.borrow_mut());
                result.fill(ReadExactly::Exactly(values));
            } else {
                read_exactly_step(reader.clone(), count, collected.clone(), result.clone());
            }
        }
        ReadResult::Eof => {
            let values = std::mem::take(&mut *collected.borrow_mut());
            if values.is_empty() {
                result.fill(ReadExactly::Eof);
            } else {
                result.fill(ReadExactly::Fewer(values));
            }
        }
    });
}

fn close_write<T: Clone + 'static>(inner: &Shared<T>) {
    let mut fills = Vec::new();
    {
        let mut pipe = inner.borrow_mut();
        if pipe.closed {
            return;
        }
        pipe.closed = true;
        // Waiting readers only exist when the buffer is empty; they all
        // see EOF.
        for waiter in pipe.reader_waiters.drain(..) {
            fills.push(Fill::Read(waiter, ReadResult::Eof));
        }
        let available = if pipe.buffer.is_empty() {
            ReadResult::Eof
        } else {
            ReadResult::Ok(())
        };
        for waiter in pipe.available_waiters.drain(..) {
            fills.push(Fill::Available(waiter, available.clone()));
        }
        pipe.update_pushback(&mut fills);
    }
    for fill in fills {
        fill.run();
    }
}

fn flushed<T: Clone + 'static>(inner: &Shared<T>) -> Deferred<FlushResult> {
    let mut pipe = inner.borrow_mut();
    if pipe.read_closed {
        return Deferred::ready(FlushResult::ReaderClosed);
    }
    if pipe.buffer.is_empty() {
        return Deferred::ready(FlushResult::Flushed);
    }
    let target = pipe.total_written;
    let waiter = Ivar::create();
    pipe.flush_waiters.push((target, waiter.clone()));
    waiter.read()
}

impl<T> fmt::Debug for Reader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pipe = self.inner.borrow();
        f.debug_struct("pipe::Reader")
            .field("buffered", &pipe.buffer.len())
            .field("closed", &pipe.closed)
            .finish()
    }
}

impl<T> fmt::Debug for Writer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pipe = self.inner.borrow();
        f.debug_struct("pipe::Writer")
            .field("buffered", &pipe.buffer.len())
            .field("closed", &pipe.closed)
            .finish()
    }
}
