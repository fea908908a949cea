//! Execution context: one ring, one registry, one thread.
//!
//! A [`Context`] owns the ring transport and the operation registry and
//! drives both from the thread that created it. Everything hangs off an
//! `Rc`, so none of the types here are `Send` or `Sync`; the compiler
//! rejects attempts to move a context or its handles across threads, which
//! is exactly the single-submitter discipline the ring bookkeeping assumes.
//!
//! Queueing an operation writes a submission entry and reserves a registry
//! record but tells the kernel nothing; [`Context::submit`] flushes the
//! queued entries in one syscall, and [`Context::poll`] drains whatever has
//! completed. Callers batch as they see fit.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::mem;
use std::rc::Rc;
use std::time::Duration;

use log::{debug, trace, warn};
use smallvec::{smallvec, SmallVec};

use crate::error::Error;
use crate::operation::{prep, Completion, OpId, OpKind, Owner, Payload, Registry};
use crate::ring::Ring;
use crate::sys::{self, Cqe, Sqe};

const LOG: &str = "gyre::context";

/// Completions staged per drain pass.
const CQ_BATCH: usize = 32;

/// Bounded-wait rounds before shutdown abandons in-flight operations.
const SHUTDOWN_ROUNDS: u32 = 8;
const SHUTDOWN_WAIT: Duration = Duration::from_millis(100);

/// User-data of the cancel-all entry queued at shutdown. Outside the token
/// space the registry hands out.
const SHUTDOWN_TOKEN: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Running,
    ShutDown,
}

struct Inner {
    ring: Ring,
    registry: Registry,
}

/// State shared between a [`Context`] and its [`Handle`]s.
pub(crate) struct Shared {
    inner: RefCell<Option<Inner>>,
    status: Cell<Status>,
    /// Entries written to the submission ring but not yet flushed.
    pending: Cell<u32>,
    last_error: Cell<Option<Error>>,
    sq_capacity: u32,
    cq_capacity: u32,
}

impl Shared {
    pub(crate) fn record(&self, err: Error) -> Error {
        self.last_error.set(Some(err));
        err
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut Inner) -> Result<T, Error>) -> Result<T, Error> {
        let mut guard = self.inner.borrow_mut();
        match guard.as_mut() {
            Some(inner) => f(inner),
            None => Err(Error::ShuttingDown),
        }
    }

    /// Reserve a submission slot and a registry record, let `configure`
    /// write the entry against the slab-resident payload, and publish it.
    /// On failure the payload travels back to the caller.
    pub(crate) fn queue(
        &self,
        kind: OpKind,
        owner: Owner,
        user_data: u64,
        payload: Payload,
        configure: impl FnOnce(&mut Sqe, &mut Payload),
    ) -> Result<OpId, (Error, Payload)> {
        let mut guard = self.inner.borrow_mut();
        let Some(inner) = guard.as_mut() else {
            return Err((self.record(Error::ShuttingDown), payload));
        };
        let Inner { ring, registry } = inner;
        let (id, slot) = match registry.reserve(kind, owner, user_data, payload) {
            Ok(reserved) => reserved,
            Err((err, payload)) => return Err((self.record(err), payload)),
        };
        let Some(sqe) = ring.sq_mut().reserve() else {
            // Roll the reservation back so the id never escapes.
            let payload = registry.release(id);
            return Err((self.record(Error::SubmissionQueueFull), payload));
        };
        configure(sqe, slot);
        sqe.user_data = id.token();
        ring.sq_mut().publish();
        self.pending.set(self.pending.get() + 1);
        trace!(target: LOG, "queue kind={:?} id={:?} user_data={}", kind, id, user_data);
        Ok(id)
    }

    pub(crate) fn submit(&self) -> Result<u32, Error> {
        if self.status.get() == Status::ShutDown {
            return Err(self.record(Error::ShuttingDown));
        }
        let pending = self.pending.get();
        if pending == 0 {
            return Ok(0);
        }
        let accepted = self
            .with_inner(|inner| loop {
                match inner.ring.enter(pending, 0, 0) {
                    Ok(accepted) => return Ok(accepted),
                    Err(err) if err.raw_os_error() == Some(libc::EINTR) => {
                        trace!(target: LOG, "submit.interrupted");
                    }
                    Err(err) => {
                        warn!(target: LOG, "submit.failed pending={} err={}", pending, err);
                        return Err(Error::from(err));
                    }
                }
            })
            .map_err(|err| self.record(err))?;
        self.pending.set(pending - accepted);
        trace!(target: LOG, "submit accepted={}", accepted);
        Ok(accepted)
    }

    pub(crate) fn poll(
        &self,
        out: &mut Vec<Completion>,
        max: usize,
        timeout: Option<Duration>,
    ) -> Result<usize, Error> {
        if self.status.get() == Status::ShutDown {
            return Err(self.record(Error::ShuttingDown));
        }
        if max == 0 {
            return Ok(0);
        }
        self.with_inner(|inner| {
            let drained = drain(inner, out, max);
            if drained > 0 {
                return Ok(drained);
            }
            // Only operations the kernel has actually been told about can
            // complete. If none are out there, waiting would hang.
            let kernel_owned = inner.registry.in_flight().saturating_sub(self.pending.get());
            if kernel_owned == 0 {
                return Ok(0);
            }
            let waited = match timeout {
                Some(timeout) => inner.ring.enter_timeout(timeout),
                None => inner.ring.enter(0, 1, sys::IORING_ENTER_GETEVENTS),
            };
            match waited {
                Ok(_) => {}
                Err(err) if err.raw_os_error() == Some(libc::ETIME) => return Ok(0),
                Err(err) => {
                    warn!(target: LOG, "poll.wait err={}", err);
                    return Err(Error::from(err));
                }
            }
            Ok(drain(inner, out, max))
        })
        .map_err(|err| self.record(err))
    }

    pub(crate) fn cancel(&self, target: OpId) -> Result<OpId, Error> {
        {
            let guard = self.inner.borrow();
            let Some(inner) = guard.as_ref() else {
                return Err(self.record(Error::ShuttingDown));
            };
            if !inner.registry.is_live(target) {
                return Err(self.record(Error::InvalidArgument));
            }
        }
        let id = self
            .queue(OpKind::Cancel, Owner::None, 0, Payload::None, |sqe, _| {
                prep::cancel(sqe, target.token(), 0);
            })
            .map_err(|(err, _)| err)?;
        // From here on the target's own completion is consumed internally.
        let _ = self.with_inner(|inner| {
            inner.registry.mark_cancelled(target);
            Ok(())
        });
        debug!(target: LOG, "cancel target={:?} id={:?}", target, id);
        Ok(id)
    }

    pub(crate) fn shutdown(&self) -> Result<(), Error> {
        if self.status.replace(Status::ShutDown) == Status::ShutDown {
            return Ok(());
        }
        let Some(mut inner) = self.inner.borrow_mut().take() else {
            return Ok(());
        };
        debug!(
            target: LOG,
            "shutdown in_flight={} pending={}",
            inner.registry.in_flight(),
            self.pending.get()
        );
        self.pending.set(0);
        if inner.registry.in_flight() > 0 && !reap(&mut inner) {
            warn!(
                target: LOG,
                "shutdown.abandoned in_flight={}",
                inner.registry.in_flight()
            );
            // The kernel may still write into registry-owned memory. Leak
            // the transport rather than free it out from under the kernel.
            mem::forget(inner);
        }
        Ok(())
    }

    pub(crate) fn last_error(&self) -> Option<Error> {
        self.last_error.get()
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.status.get() == Status::ShutDown
    }
}

/// Drain up to `max` resolved completions into `out` without entering the
/// kernel. Internally-consumed completions do not count toward `max`.
fn drain(inner: &mut Inner, out: &mut Vec<Completion>, max: usize) -> usize {
    let Inner { ring, registry } = inner;
    let mut staged: SmallVec<[Cqe; CQ_BATCH]> = smallvec![Cqe::default(); CQ_BATCH];
    let mut drained = 0;
    while drained < max {
        let want = (max - drained).min(CQ_BATCH);
        let got = ring.cq_mut().fill(&mut staged[..want]);
        if got == 0 {
            break;
        }
        for cqe in &staged[..got] {
            if let Some(completion) = registry.resolve(cqe) {
                out.push(completion);
                drained += 1;
            }
        }
    }
    drained
}

/// Cancel everything in flight and drain until the kernel has released all
/// registry records. Returns false if operations survive the bounded wait.
fn reap(inner: &mut Inner) -> bool {
    let Inner { ring, registry } = inner;
    registry.cancel_all();
    if let Some(sqe) = ring.sq_mut().reserve() {
        // One cancel-any request covers every submitted operation.
        prep::cancel(sqe, 0, sys::IORING_ASYNC_CANCEL_ANY);
        sqe.user_data = SHUTDOWN_TOKEN;
        ring.sq_mut().publish();
    }
    loop {
        match ring.enter(ring.sq().in_queue(), 0, 0) {
            Ok(_) => break,
            Err(err) if err.raw_os_error() == Some(libc::EINTR) => {}
            Err(err) => {
                warn!(target: LOG, "shutdown.flush err={}", err);
                break;
            }
        }
    }
    for _ in 0..SHUTDOWN_ROUNDS {
        drain_for_shutdown(ring, registry);
        if registry.in_flight() == 0 {
            return true;
        }
        match ring.enter_timeout(SHUTDOWN_WAIT) {
            Ok(_) => {}
            Err(err) if matches!(err.raw_os_error(), Some(libc::ETIME) | Some(libc::EINTR)) => {}
            Err(err) => {
                warn!(target: LOG, "shutdown.wait err={}", err);
                break;
            }
        }
    }
    drain_for_shutdown(ring, registry);
    registry.in_flight() == 0
}

fn drain_for_shutdown(ring: &mut Ring, registry: &mut Registry) {
    let mut staged = [Cqe::default(); CQ_BATCH];
    loop {
        let got = ring.cq_mut().fill(&mut staged);
        if got == 0 {
            return;
        }
        for cqe in &staged[..got] {
            if cqe.user_data == SHUTDOWN_TOKEN {
                continue;
            }
            let _ = registry.resolve(cqe);
        }
    }
}

/// A single-threaded asynchronous I/O context over one ring.
///
/// Operations are queued through the context (or through sockets and files
/// created from its [`Handle`]), flushed with [`Context::submit`], and
/// collected with [`Context::poll`]. The context is not `Send`; it lives
/// and dies on the thread that called [`Context::init`].
pub struct Context {
    shared: Rc<Shared>,
}

impl Context {
    /// Set up a ring sized for at least `desired_concurrency` in-flight
    /// submissions. The value is rounded up to the next power of two;
    /// zero or anything beyond the ring limit is rejected with
    /// [`Error::InvalidArgument`]. The completion side is sized by the
    /// kernel (twice the submission depth) and bounds how many operations
    /// may be in flight at once.
    pub fn init(desired_concurrency: u32) -> Result<Context, Error> {
        Context::builder(desired_concurrency).build()
    }

    /// Configure a context before setting it up. `desired_concurrency`
    /// means the same as in [`Context::init`].
    pub fn builder(desired_concurrency: u32) -> Builder {
        Builder::new(desired_concurrency)
    }

    /// A cloneable handle for creating sockets and files on this context.
    pub fn handle(&self) -> Handle {
        Handle {
            shared: Rc::clone(&self.shared),
        }
    }

    /// Queue a no-op that round-trips through the kernel and completes with
    /// `user_data` attached. Useful for pipeline flushes and liveness
    /// checks.
    pub fn nop(&self, user_data: u64) -> Result<OpId, Error> {
        self.shared
            .queue(OpKind::Nop, Owner::None, user_data, Payload::None, |sqe, _| {
                prep::nop(sqe);
            })
            .map_err(|(err, _)| err)
    }

    /// Flush every queued submission to the kernel in one syscall. Returns
    /// the number of entries the kernel accepted; entries it did not accept
    /// stay queued for the next call. Queueing nothing and submitting is
    /// not an error.
    pub fn submit(&self) -> Result<u32, Error> {
        self.shared.submit()
    }

    /// Drain up to `max` completions into `out` (appending), waiting at
    /// most `timeout` if none are ready. `None` waits indefinitely.
    ///
    /// Already-arrived completions are collected without entering the
    /// kernel. When nothing is with the kernel yet, because everything
    /// queued still awaits [`Context::submit`], this returns `Ok(0)`
    /// immediately rather than waiting for completions that cannot
    /// arrive. An expired timeout is `Ok(0)`, not an error.
    pub fn poll(
        &self,
        out: &mut Vec<Completion>,
        max: usize,
        timeout: Option<Duration>,
    ) -> Result<usize, Error> {
        self.shared.poll(out, max, timeout)
    }

    /// Ask the kernel to cancel the in-flight operation `target`. Returns
    /// the id of the cancel operation itself, whose completion reports
    /// whether anything was found to cancel. The target's own completion
    /// is consumed internally; it will never appear in [`Context::poll`]
    /// output after this call succeeds.
    ///
    /// Cancelling an id that is not live fails with
    /// [`Error::InvalidArgument`].
    pub fn cancel(&self, target: OpId) -> Result<OpId, Error> {
        self.shared.cancel(target)
    }

    /// True while `id` names an operation whose completion has not been
    /// drained (or consumed internally) yet.
    pub fn is_live(&self, id: OpId) -> bool {
        self.shared
            .inner
            .borrow()
            .as_ref()
            .is_some_and(|inner| inner.registry.is_live(id))
    }

    /// Tear the context down: cancel and drain whatever is in flight, then
    /// release the ring and its mappings. Idempotent; later calls return
    /// `Ok` and every other entry point fails with
    /// [`Error::ShuttingDown`]. Dropping the context shuts it down too.
    pub fn shutdown(&self) -> Result<(), Error> {
        self.shared.shutdown()
    }

    /// The most recent error returned by any operation on this context or
    /// its handles. Stays set until a later failure replaces it.
    pub fn last_error(&self) -> Option<Error> {
        self.shared.last_error()
    }

    /// Submission slots available per batch.
    pub fn sq_capacity(&self) -> u32 {
        self.shared.sq_capacity
    }

    /// Completion capacity; also the maximum number of in-flight
    /// operations.
    pub fn cq_capacity(&self) -> u32 {
        self.shared.cq_capacity
    }

    /// Entries queued locally and not yet submitted.
    pub fn pending(&self) -> u32 {
        self.shared.pending.get()
    }

    /// Operations with undrained completions, submitted or not.
    pub fn in_flight(&self) -> u32 {
        self.shared
            .inner
            .borrow()
            .as_ref()
            .map_or(0, |inner| inner.registry.in_flight())
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("sq_capacity", &self.shared.sq_capacity)
            .field("cq_capacity", &self.shared.cq_capacity)
            .field("pending", &self.shared.pending.get())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

/// [`Builder`] is used to configure and create a [`Context`].
#[derive(Copy, Clone, Debug)]
pub struct Builder {
    concurrency: u32,
    cq_entries: Option<u32>,
}

impl Builder {
    fn new(concurrency: u32) -> Builder {
        Builder {
            concurrency,
            cq_entries: None,
        }
    }

    /// Request a completion queue of at least `entries` slots instead of
    /// the kernel default of twice the submission depth. In-flight
    /// operations are bounded by completion capacity, so raising this lets
    /// more operations wait in the kernel than one submission batch holds.
    ///
    /// The kernel rounds the value up to a power of two. `build` rejects
    /// values below the submission depth or beyond the ring maximum.
    pub fn completion_entries(mut self, entries: u32) -> Builder {
        self.cq_entries = Some(entries);
        self
    }

    /// Set up the ring and registry with the configured geometry.
    pub fn build(&self) -> Result<Context, Error> {
        if self.concurrency == 0 || self.concurrency > sys::IORING_MAX_ENTRIES {
            return Err(Error::InvalidArgument);
        }
        let entries = self.concurrency.next_power_of_two();
        if let Some(cq_entries) = self.cq_entries {
            if cq_entries < entries || cq_entries > sys::IORING_MAX_CQ_ENTRIES {
                return Err(Error::InvalidArgument);
            }
        }
        let ring = Ring::new(entries, self.cq_entries)?;
        let sq_capacity = ring.sq().capacity();
        let cq_capacity = ring.cq().capacity();
        let registry = Registry::new(cq_capacity);
        debug!(
            target: LOG,
            "init requested={} sq={} cq={}",
            self.concurrency,
            sq_capacity,
            cq_capacity
        );
        Ok(Context {
            shared: Rc::new(Shared {
                inner: RefCell::new(Some(Inner { ring, registry })),
                status: Cell::new(Status::Running),
                pending: Cell::new(0),
                last_error: Cell::new(None),
                sq_capacity,
                cq_capacity,
            }),
        })
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Err(err) = self.shared.shutdown() {
            warn!(target: LOG, "drop.shutdown err={}", err);
        }
    }
}

/// A cloneable reference to a [`Context`], used to create sockets and
/// files. Handles keep the shared state alive but cannot outlive the
/// shutdown: once the context shuts down, operations through any handle
/// fail with [`Error::ShuttingDown`].
#[derive(Clone)]
pub struct Handle {
    shared: Rc<Shared>,
}

impl Handle {
    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("sq_capacity", &self.shared.sq_capacity)
            .finish_non_exhaustive()
    }
}
