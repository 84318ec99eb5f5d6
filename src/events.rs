//! Consumer-facing surface for unsolicited event frames.
//!
//! The dispatcher is fed by the control channel whenever a datagram
//! classifies as an event — during a `request` reply wait or a standalone
//! `receive`. Events are delivered strictly in wire-arrival order; the
//! priority tag on each frame is caller-side metadata and never promotes a
//! frame past an earlier one.
//!
//! The queue is deliberately unbounded: dropping events would break causal
//! assumptions callers rely on (a disconnect event must not vanish between
//! polls), so a caller that never drains accepts unbounded growth. Attach a
//! sink or drain regularly.

use std::collections::VecDeque;
use std::fmt;

use crate::frame::EventFrame;

/// Receiver for event frames routed out of the control channel.
///
/// Blanket-implemented for any `FnMut(EventFrame) + Send` closure.
pub trait EventSink: Send {
    /// Called once per event, in wire-arrival order.
    fn on_event(&mut self, event: EventFrame);
}

impl<F: FnMut(EventFrame) + Send> EventSink for F {
    fn on_event(&mut self, event: EventFrame) {
        self(event)
    }
}

/// FIFO queue / callback surface for event frames.
#[derive(Default)]
pub struct EventDispatcher {
    queue: VecDeque<EventFrame>,
    sink: Option<Box<dyn EventSink>>,
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("queued", &self.queue.len())
            .field("sink_attached", &self.sink.is_some())
            .finish()
    }
}

impl EventDispatcher {
    /// Create an empty dispatcher with no sink attached.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route one event: to the attached sink if any, else onto the queue.
    pub(crate) fn dispatch(&mut self, event: EventFrame) {
        match self.sink.as_mut() {
            Some(sink) => sink.on_event(event),
            None => self.queue.push_back(event),
        }
    }

    /// Append one event to the queue, bypassing any sink.
    pub fn push(&mut self, event: EventFrame) {
        self.queue.push_back(event);
    }

    /// Remove and return all queued events, oldest first.
    pub fn drain(&mut self) -> Vec<EventFrame> {
        self.queue.drain(..).collect()
    }

    /// Attach a sink for direct delivery.
    ///
    /// Already-queued events are flushed into the sink first, preserving
    /// arrival order across the transition. Replaces any previous sink.
    pub fn attach(&mut self, sink: Box<dyn EventSink>) {
        self.sink = Some(sink);
        // Flush backlog in order before any new event reaches the sink.
        while let Some(event) = self.queue.pop_front() {
            if let Some(sink) = self.sink.as_mut() {
                sink.on_event(event);
            }
        }
    }

    /// True if a sink is currently attached.
    pub(crate) fn sink_attached(&self) -> bool {
        self.sink.is_some()
    }

    /// Number of queued (undrained) events.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True if no events are queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
