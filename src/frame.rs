//! Wire-frame classification.
//!
//! Every datagram on the control socket is one of two disjoint kinds,
//! distinguished by a leading sentinel:
//!
//! ```text
//! reply:  OK\n                      (any non-sentinel bytes)
//! event:  <3>CTRL-EVENT-CONNECTED   ('<' priority-digits '>' body)
//! ```
//!
//! [`classify`] is the single source of truth for this rule — both the
//! reply-wait loop inside `Channel::request` and the standalone
//! `Channel::receive` path go through it, so the two call paths can never
//! diverge on what counts as an event.

use crate::error::{Error, Result};

/// Maximum size of a single control frame, in bytes.
///
/// Protocol-defined; datagrams are delivered whole or not at all, so one
/// receive buffer of this size always holds a complete frame.
pub const MAX_FRAME_SIZE: usize = 4096;

/// Leading byte marking an unsolicited event datagram.
pub const EVENT_SENTINEL: u8 = b'<';

/// A classified control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Reply to the most recently sent request. The protocol carries no
    /// request IDs; correlation is strictly one-outstanding-request.
    Reply(Vec<u8>),
    /// Unsolicited asynchronous event.
    Event(EventFrame),
}

/// An unsolicited event datagram.
///
/// Keeps the raw wire bytes so consumers observe exactly what arrived; the
/// priority tag is parsed out for caller-side filtering. The tag never
/// affects delivery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFrame {
    priority: u8,
    raw: Vec<u8>,
    body_start: usize,
}

impl EventFrame {
    /// Priority level parsed from the `<N>` header.
    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// The complete datagram as received, sentinel header included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// The event body after the `<N>` header.
    pub fn message(&self) -> &[u8] {
        &self.raw[self.body_start..]
    }

    /// Consume the frame, yielding the raw wire bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.raw
    }
}

/// Classify one received datagram as a reply or an event.
///
/// # Errors
///
/// Returns [`Error::MalformedFrame`] for an empty datagram, or for a
/// sentinel-prefixed datagram whose priority header does not parse
/// (missing `>`, no digits, or a value that does not fit in `u8`).
pub fn classify(buf: &[u8]) -> Result<Frame> {
    if buf.is_empty() {
        return Err(Error::MalformedFrame {
            reason: "empty datagram".into(),
        });
    }
    if buf[0] != EVENT_SENTINEL {
        return Ok(Frame::Reply(buf.to_vec()));
    }

    // Sentinel present: the header must be '<' digits '>'.
    let close = buf
        .iter()
        .position(|&b| b == b'>')
        .ok_or_else(|| Error::MalformedFrame {
            reason: "event header missing '>'".into(),
        })?;
    let digits = &buf[1..close];
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(Error::MalformedFrame {
            reason: "event priority is not a decimal number".into(),
        });
    }
    let text = std::str::from_utf8(digits).map_err(|_| Error::MalformedFrame {
        reason: "event priority is not ASCII".into(),
    })?;
    let priority: u8 = text.parse().map_err(|_| Error::MalformedFrame {
        reason: format!("event priority {text} out of range"),
    })?;

    Ok(Frame::Event(EventFrame {
        priority,
        raw: buf.to_vec(),
        body_start: close + 1,
    }))
}
