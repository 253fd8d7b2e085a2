//! Mock collaborators for testing.

use parking_lot::Mutex;
use shelf_core::{ObjectId, Status};

use crate::edge::ControlSender;
use crate::packet::Packet;
use crate::payload::{ControlRequest, Operation};

/// A [`ControlSender`] that records every request and answers with a fixed
/// status.
#[derive(Debug)]
pub struct RecordingSender {
    reply: Status,
    sent: Mutex<Vec<(ObjectId, ControlRequest)>>,
}

impl Default for RecordingSender {
    fn default() -> Self {
        Self::replying(Status::Ok)
    }
}

impl RecordingSender {
    /// Create a sender that completes every request with `reply`.
    #[must_use]
    pub fn replying(reply: Status) -> Self {
        Self {
            reply,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Requests seen so far.
    #[must_use]
    pub fn sent(&self) -> Vec<(ObjectId, ControlRequest)> {
        self.sent.lock().clone()
    }

    /// Number of requests seen so far.
    #[must_use]
    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }
}

impl ControlSender for RecordingSender {
    fn send_control(&self, target: ObjectId, packet: &Packet) -> Status {
        let request = packet.with_operation(|op| match op {
            Some(Operation::Control(control)) => {
                control.status = self.reply;
                Some(control.request.clone())
            }
            _ => None,
        });
        if let Some(request) = request {
            self.sent.lock().push((target, request));
        }
        packet.set_status(self.reply, 0);
        if let Err(e) = packet.complete() {
            tracing::warn!(error = %e, "mock sender could not complete packet");
        }
        self.reply
    }
}
