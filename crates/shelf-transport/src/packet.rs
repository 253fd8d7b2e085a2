//! The request packet.
//!
//! A [`Packet`] is a shared, interior-mutable handle to one in-flight unit of
//! work. Completion is continuation passing: every holder that wants to see
//! the result pushes a frame, and [`Packet::complete`] unwinds the frames
//! most-recent-first.
//!
//! ```text
//!   issuer            push(frame A)
//!   forwarder         push(frame B)
//!   handler           complete()
//!                        ├── B(packet, status) -> Continue
//!                        └── A(packet, status) -> Continue   => COMPLETED
//! ```
//!
//! A frame that hands the packet off again returns
//! [`Completion::MoreProcessingRequired`]; unwinding stops and resumes on the
//! next `complete`.
//!
//! Subpackets link a child to a master. The master refuses to complete while
//! children are attached, so a child's completion frame must call
//! [`Packet::remove_subpacket`] before completing the master.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex, MutexGuard};
use shelf_core::{PacketId, Status};

use crate::edge::EdgeBinding;
use crate::error::{Result, TransportError};
use crate::payload::{Operation, Payload};

/// Maximum number of completion frames a packet can hold.
pub const MAX_COMPLETION_DEPTH: usize = 16;

/// Result of a completion frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Keep unwinding the completion stack.
    Continue,
    /// Stop unwinding; the packet was handed off and will be completed again.
    MoreProcessingRequired,
}

/// Where a packet is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketState {
    /// Owned by a handler.
    InProgress,
    /// Parked on a terminator queue.
    Queued,
    /// Cancellation has been requested.
    Canceled,
    /// The completion stack has fully unwound.
    Completed,
}

bitflags! {
    /// Packet-level flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PacketFlags: u32 {
        /// Permit cancellation while the packet is in progress.
        const DESTROY_ENABLED = 1 << 0;
        /// Never cancel, even when queued.
        const DO_NOT_CANCEL = 1 << 1;
        /// Issued by a lifecycle condition.
        const MONITOR_OP = 1 << 2;
    }
}

const INHERITED_FLAGS: PacketFlags = PacketFlags::DESTROY_ENABLED.union(PacketFlags::DO_NOT_CANCEL);

/// A completion frame.
pub type CompletionFn = Box<dyn FnOnce(&Packet, Status) -> Completion + Send>;

/// A cancellation hook.
pub type CancelFn = Box<dyn FnOnce(&Packet) + Send>;

/// Names a pushed completion frame so it can be withdrawn unused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionToken(u64);

struct Frame {
    token: CompletionToken,
    callback: CompletionFn,
}

struct Fields {
    status: Status,
    qualifier: u32,
    state: PacketState,
    flags: PacketFlags,
    on_queue: bool,
    completing: bool,
    recomplete: bool,
    payload: Payload,
    frames: Vec<Frame>,
    next_token: u64,
    master: Option<Weak<Inner>>,
    children: Vec<Packet>,
    cancel_fn: Option<CancelFn>,
    route: Option<EdgeBinding>,
}

impl Fields {
    fn new() -> Self {
        Self {
            status: Status::Ok,
            qualifier: 0,
            state: PacketState::InProgress,
            flags: PacketFlags::empty(),
            on_queue: false,
            completing: false,
            recomplete: false,
            payload: Payload::default(),
            frames: Vec::new(),
            next_token: 0,
            master: None,
            children: Vec::new(),
            cancel_fn: None,
            route: None,
        }
    }
}

struct Inner {
    id: PacketId,
    fields: Mutex<Fields>,
    done: Condvar,
}

/// Shared handle to a request.
#[derive(Clone)]
pub struct Packet {
    inner: Arc<Inner>,
}

impl Packet {
    /// Create a fresh packet outside any pool.
    #[must_use]
    pub fn new(id: PacketId) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                fields: Mutex::new(Fields::new()),
                done: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Fields> {
        self.inner.fields.lock()
    }

    /// Packet identifier.
    #[must_use]
    pub fn id(&self) -> PacketId {
        self.inner.id
    }

    /// Returns true if both handles refer to the same packet.
    #[must_use]
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Reset the packet for its next use.
    ///
    /// # Errors
    ///
    /// Returns `PacketAttached` if the packet still has a master, children,
    /// or terminator-queue membership.
    pub fn reuse(&self) -> Result<()> {
        let mut fields = self.lock();
        if fields.master.is_some() || !fields.children.is_empty() || fields.on_queue {
            return Err(TransportError::PacketAttached(self.id()));
        }
        *fields = Fields::new();
        Ok(())
    }

    // ========================================================================
    // Status and flags
    // ========================================================================

    /// Current status code.
    #[must_use]
    pub fn status(&self) -> Status {
        self.lock().status
    }

    /// Current status qualifier.
    #[must_use]
    pub fn qualifier(&self) -> u32 {
        self.lock().qualifier
    }

    /// Set status code and qualifier.
    pub fn set_status(&self, status: Status, qualifier: u32) {
        let mut fields = self.lock();
        fields.status = status;
        fields.qualifier = qualifier;
    }

    /// Copy this packet's status and qualifier onto `to`.
    pub fn copy_status_to(&self, to: &Self) {
        let (status, qualifier) = {
            let fields = self.lock();
            (fields.status, fields.qualifier)
        };
        to.set_status(status, qualifier);
    }

    /// Current packet state.
    #[must_use]
    pub fn state(&self) -> PacketState {
        self.lock().state
    }

    /// Current flags.
    #[must_use]
    pub fn flags(&self) -> PacketFlags {
        self.lock().flags
    }

    /// Add flags.
    pub fn set_flags(&self, flags: PacketFlags) {
        self.lock().flags.insert(flags);
    }

    /// Binding of the last edge this packet crossed.
    #[must_use]
    pub fn route(&self) -> Option<EdgeBinding> {
        self.lock().route
    }

    /// Stamp the binding of the edge this packet is about to cross.
    pub fn set_route(&self, binding: EdgeBinding) {
        self.lock().route = Some(binding);
    }

    /// True if linked to a master, children, or a terminator queue.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        let fields = self.lock();
        fields.master.is_some() || !fields.children.is_empty() || fields.on_queue
    }

    pub(crate) fn set_on_queue(&self, queued: bool) -> bool {
        let mut fields = self.lock();
        let changed = fields.on_queue != queued;
        fields.on_queue = queued;
        match (queued, fields.state) {
            (true, PacketState::InProgress) => fields.state = PacketState::Queued,
            (false, PacketState::Queued) => fields.state = PacketState::InProgress,
            _ => {}
        }
        changed
    }

    // ========================================================================
    // Payload
    // ========================================================================

    /// Push an operation onto the payload stack.
    pub fn push_operation(&self, operation: Operation) {
        self.lock().payload.push(operation);
    }

    /// Pop the current operation.
    pub fn pop_operation(&self) -> Option<Operation> {
        self.lock().payload.pop()
    }

    /// Clone of the current operation.
    #[must_use]
    pub fn current_operation(&self) -> Option<Operation> {
        self.lock().payload.current().cloned()
    }

    /// Run `f` against the current operation under the packet lock.
    ///
    /// `f` must not call back into this packet.
    pub fn with_operation<R>(&self, f: impl FnOnce(Option<&mut Operation>) -> R) -> R {
        let mut fields = self.lock();
        f(fields.payload.current_mut())
    }

    // ========================================================================
    // Completion stack
    // ========================================================================

    /// Push a completion frame.
    ///
    /// # Errors
    ///
    /// Returns `CompletionStackOverflow` past [`MAX_COMPLETION_DEPTH`] frames.
    pub fn push_completion<F>(&self, callback: F) -> Result<CompletionToken>
    where
        F: FnOnce(&Self, Status) -> Completion + Send + 'static,
    {
        let mut fields = self.lock();
        if fields.frames.len() >= MAX_COMPLETION_DEPTH {
            tracing::error!(packet_id = %self.id(), "completion stack overflow");
            return Err(TransportError::CompletionStackOverflow(self.id()));
        }
        let token = CompletionToken(fields.next_token);
        fields.next_token += 1;
        fields.frames.push(Frame {
            token,
            callback: Box::new(callback),
        });
        Ok(token)
    }

    /// Withdraw a frame that has not run yet.
    ///
    /// # Errors
    ///
    /// Returns `UnknownCompletion` if the frame already ran or never existed.
    pub fn cancel_completion(&self, token: CompletionToken) -> Result<()> {
        let mut fields = self.lock();
        let position = fields
            .frames
            .iter()
            .rposition(|frame| frame.token == token)
            .ok_or(TransportError::UnknownCompletion(self.id()))?;
        fields.frames.remove(position);
        Ok(())
    }

    /// Number of frames still on the completion stack.
    #[must_use]
    pub fn completion_depth(&self) -> usize {
        self.lock().frames.len()
    }

    /// Unwind the completion stack.
    ///
    /// Completing a packet that already completed is a no-op, as is a
    /// completion that races one already unwinding the stack.
    ///
    /// # Errors
    ///
    /// Returns `StillQueued` if the packet is on a terminator queue and
    /// `SubpacketsOutstanding` while children are attached.
    pub fn complete(&self) -> Result<()> {
        {
            let mut fields = self.lock();
            if fields.state == PacketState::Completed {
                tracing::debug!(packet_id = %self.id(), "packet already completed");
                return Ok(());
            }
            if fields.on_queue {
                tracing::error!(
                    packet_id = %self.id(),
                    "completing a packet that is still on a terminator queue"
                );
                return Err(TransportError::StillQueued(self.id()));
            }
            if !fields.children.is_empty() {
                return Err(TransportError::SubpacketsOutstanding {
                    id: self.id(),
                    count: fields.children.len(),
                });
            }
            if fields.completing {
                fields.recomplete = true;
                return Ok(());
            }
            fields.completing = true;
        }

        loop {
            let (frame, status) = {
                let mut fields = self.lock();
                if let Some(frame) = fields.frames.pop() {
                    (frame, fields.status)
                } else {
                    fields.state = PacketState::Completed;
                    fields.completing = false;
                    fields.recomplete = false;
                    drop(fields);
                    self.inner.done.notify_all();
                    return Ok(());
                }
            };

            if (frame.callback)(self, status) == Completion::MoreProcessingRequired {
                let mut fields = self.lock();
                if fields.recomplete {
                    fields.recomplete = false;
                    continue;
                }
                fields.completing = false;
                return Ok(());
            }
        }
    }

    /// Block until the packet completes.
    pub fn wait(&self) {
        let mut fields = self.lock();
        while fields.state != PacketState::Completed {
            self.inner.done.wait(&mut fields);
        }
    }

    /// Block until the packet completes or `timeout` elapses.
    ///
    /// Returns true if the packet completed.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let mut fields = self.lock();
        while fields.state != PacketState::Completed {
            if self.inner.done.wait_for(&mut fields, timeout).timed_out() {
                return fields.state == PacketState::Completed;
            }
        }
        true
    }

    // ========================================================================
    // Subpackets
    // ========================================================================

    /// Attach `child` as a subpacket of this packet.
    ///
    /// The child inherits the cancellation flags of its master.
    ///
    /// # Errors
    ///
    /// Returns `MasterCanceled` if this packet was already cancelled.
    pub fn add_subpacket(&self, child: &Self) -> Result<()> {
        let inherited = {
            let mut fields = self.lock();
            if fields.state == PacketState::Canceled {
                return Err(TransportError::MasterCanceled(self.id()));
            }
            fields.children.push(child.clone());
            fields.flags & INHERITED_FLAGS
        };
        let mut child_fields = child.lock();
        child_fields.master = Some(Arc::downgrade(&self.inner));
        child_fields.flags.insert(inherited);
        Ok(())
    }

    /// Detach this packet from its master.
    ///
    /// Returns true if the master has no children left.
    ///
    /// # Errors
    ///
    /// Returns `NoMaster` if this packet is not a subpacket.
    pub fn remove_subpacket(&self) -> Result<bool> {
        let master = self
            .lock()
            .master
            .take()
            .and_then(|weak| weak.upgrade())
            .ok_or(TransportError::NoMaster(self.id()))?;
        let mut master_fields = master.fields.lock();
        master_fields.children.retain(|c| !Arc::ptr_eq(&c.inner, &self.inner));
        Ok(master_fields.children.is_empty())
    }

    /// The master packet, if this is a live subpacket.
    #[must_use]
    pub fn master(&self) -> Option<Self> {
        self.lock()
            .master
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| Self { inner })
    }

    /// Number of attached subpackets.
    #[must_use]
    pub fn subpacket_count(&self) -> usize {
        self.lock().children.len()
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    /// Install the cancellation hook, replacing any previous one.
    pub fn set_cancel_function<F>(&self, cancel: F)
    where
        F: FnOnce(&Self) + Send + 'static,
    {
        self.lock().cancel_fn = Some(Box::new(cancel));
    }

    /// Request cancellation.
    ///
    /// A queued packet is cancelled unless it carries `DO_NOT_CANCEL`; an
    /// in-progress packet only if it carries `DESTROY_ENABLED`. The hook runs
    /// at most once and every attached child is cancelled in turn.
    ///
    /// Returns true if this call moved the packet to CANCELED.
    pub fn cancel(&self) -> bool {
        let (hook, children) = {
            let mut fields = self.lock();
            let cancellable = match fields.state {
                PacketState::Queued => !fields.flags.contains(PacketFlags::DO_NOT_CANCEL),
                PacketState::InProgress => fields.flags.contains(PacketFlags::DESTROY_ENABLED),
                PacketState::Canceled | PacketState::Completed => false,
            };
            if !cancellable {
                return false;
            }
            fields.state = PacketState::Canceled;
            fields.status = Status::CancelPending;
            (fields.cancel_fn.take(), fields.children.clone())
        };

        tracing::debug!(packet_id = %self.id(), children = children.len(), "cancelling packet");
        if let Some(hook) = hook {
            hook(self);
        }
        for child in children {
            child.cancel();
        }
        true
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = self.lock();
        f.debug_struct("Packet")
            .field("id", &self.inner.id)
            .field("state", &fields.state)
            .field("status", &fields.status)
            .field("frames", &fields.frames.len())
            .field("children", &fields.children.len())
            .finish_non_exhaustive()
    }
}
