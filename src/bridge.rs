//! Bridge Channel - the one-directional event link from a sandbox to the host.
//!
//! The sandbox side holds an [`EventSink`]; the host holds the matching
//! [`EventStream`]. The only thing the host can send back is a
//! [`HostCommand`] on a separate channel owned by the sandbox host.
//!
//! Delivery rules:
//! - the render outcome (`Rendered` or `RuntimeError`) is the first event of
//!   every instance; console lines produced while rendering are held and
//!   delivered right after it, in order;
//! - at most `capacity` console lines are undelivered at any time. Extra lines
//!   are counted, and an `overflow` console event reporting the count is
//!   emitted before the next delivered line, after the outcome, or on close.
//!   Status events are never dropped.

use crate::error::ChannelError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Identity of one sandbox instance. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Log,
    Info,
    Warn,
    Error,
    Debug,
    /// Marker for console lines the bridge had to drop.
    Overflow,
}

impl ConsoleLevel {
    /// Level names as the sandbox console reports them. Unknown names are
    /// treated as `log`; the sandbox cannot forge an overflow marker.
    pub fn from_js(level: &str) -> Self {
        match level {
            "info" => ConsoleLevel::Info,
            "warn" => ConsoleLevel::Warn,
            "error" => ConsoleLevel::Error,
            "debug" => ConsoleLevel::Debug,
            _ => ConsoleLevel::Log,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConsoleLevel::Log => "log",
            ConsoleLevel::Info => "info",
            ConsoleLevel::Warn => "warn",
            ConsoleLevel::Error => "error",
            ConsoleLevel::Debug => "debug",
            ConsoleLevel::Overflow => "overflow",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    Rendered {
        html: String,
    },
    RuntimeError {
        message: String,
        stack: Option<String>,
        /// Fallback markup rendered by the sandbox in place of the component.
        diagnostic: Option<String>,
    },
    ConsoleOutput {
        level: ConsoleLevel,
        text: String,
    },
}

impl StatusEvent {
    pub fn is_outcome(&self) -> bool {
        !matches!(self, StatusEvent::ConsoleOutput { .. })
    }

    fn counts_against_capacity(&self) -> bool {
        matches!(
            self,
            StatusEvent::ConsoleOutput { level, .. } if *level != ConsoleLevel::Overflow
        )
    }
}

/// A status event stamped with the instance that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub instance: InstanceId,
    pub event: StatusEvent,
}

/// The host's entire command vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCommand {
    Unmount,
}

/// Create a bridge for `instance` that keeps at most `capacity` console lines
/// undelivered.
pub fn channel(instance: InstanceId, capacity: usize) -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    let in_flight = Arc::new(AtomicUsize::new(0));
    let sink = EventSink {
        instance,
        tx,
        in_flight: Arc::clone(&in_flight),
        capacity: capacity.max(1),
        held: Vec::new(),
        dropped: 0,
        settled: false,
    };
    let stream = EventStream { instance, rx, in_flight };
    (sink, stream)
}

/// Sandbox half of the bridge. Lives in the isolate's `OpState`.
pub struct EventSink {
    instance: InstanceId,
    tx: mpsc::UnboundedSender<Envelope>,
    in_flight: Arc<AtomicUsize>,
    capacity: usize,
    held: Vec<(ConsoleLevel, String)>,
    dropped: usize,
    settled: bool,
}

impl EventSink {
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Whether the render outcome has been delivered.
    pub fn is_settled(&self) -> bool {
        self.settled
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn console(&mut self, level: ConsoleLevel, text: String) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        if self.in_flight.load(Ordering::Acquire) + self.held.len() >= self.capacity {
            self.dropped += 1;
            return Ok(());
        }

        if self.settled {
            self.flush_overflow()?;
            self.send(StatusEvent::ConsoleOutput { level, text })
        } else {
            self.held.push((level, text));
            Ok(())
        }
    }

    /// Deliver a `Rendered` or `RuntimeError`. The first one settles the
    /// render and releases held console output behind it.
    pub fn status(&mut self, event: StatusEvent) -> Result<(), ChannelError> {
        debug_assert!(event.is_outcome());
        self.send(event)?;
        if !self.settled {
            self.settled = true;
            for (level, text) in std::mem::take(&mut self.held) {
                self.send(StatusEvent::ConsoleOutput { level, text })?;
            }
            self.flush_overflow()?;
        }
        Ok(())
    }

    /// Emit any pending overflow marker and hang up.
    pub fn close(mut self) {
        // Console produced by a render that never settled still reaches the host.
        for (level, text) in std::mem::take(&mut self.held) {
            if self.send(StatusEvent::ConsoleOutput { level, text }).is_err() {
                return;
            }
        }
        let _ = self.flush_overflow();
    }

    fn flush_overflow(&mut self) -> Result<(), ChannelError> {
        if self.dropped == 0 {
            return Ok(());
        }
        let dropped = std::mem::take(&mut self.dropped);
        tracing::debug!(instance = %self.instance, dropped, "console overflow");
        let noun = if dropped == 1 { "message" } else { "messages" };
        self.send(StatusEvent::ConsoleOutput {
            level: ConsoleLevel::Overflow,
            text: format!("{dropped} console {noun} dropped"),
        })
    }

    fn send(&mut self, event: StatusEvent) -> Result<(), ChannelError> {
        let counted = event.counts_against_capacity();
        if counted {
            self.in_flight.fetch_add(1, Ordering::AcqRel);
        }
        let envelope = Envelope {
            instance: self.instance,
            event,
        };
        self.tx.send(envelope).map_err(|_| {
            if counted {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
            }
            ChannelError::Closed
        })
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("instance", &self.instance)
            .field("held", &self.held.len())
            .field("dropped", &self.dropped)
            .field("settled", &self.settled)
            .finish()
    }
}

/// Host half of the bridge.
#[derive(Debug)]
pub struct EventStream {
    instance: InstanceId,
    rx: mpsc::UnboundedReceiver<Envelope>,
    in_flight: Arc<AtomicUsize>,
}

impl EventStream {
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Next event, or `None` once the sandbox has hung up and everything it
    /// sent has been received.
    pub async fn recv(&mut self) -> Option<Envelope> {
        let envelope = self.rx.recv().await?;
        self.received(&envelope);
        Some(envelope)
    }

    /// Next event if one is ready.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        let envelope = self.rx.try_recv().ok()?;
        self.received(&envelope);
        Some(envelope)
    }

    fn received(&self, envelope: &Envelope) {
        if envelope.event.counts_against_capacity() {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(text: &str) -> StatusEvent {
        StatusEvent::ConsoleOutput {
            level: ConsoleLevel::Log,
            text: text.to_string(),
        }
    }

    fn rendered() -> StatusEvent {
        StatusEvent::Rendered {
            html: "<p>ok</p>".to_string(),
        }
    }

    fn drain(stream: &mut EventStream) -> Vec<StatusEvent> {
        std::iter::from_fn(|| stream.try_recv().map(|e| e.event)).collect()
    }

    #[test]
    fn test_outcome_precedes_render_console() {
        let (mut sink, mut stream) = channel(InstanceId(1), 16);
        sink.console(ConsoleLevel::Log, "a".into()).unwrap();
        sink.console(ConsoleLevel::Log, "b".into()).unwrap();
        assert!(stream.try_recv().is_none());

        sink.status(rendered()).unwrap();
        sink.console(ConsoleLevel::Log, "c".into()).unwrap();

        assert_eq!(drain(&mut stream), vec![rendered(), log("a"), log("b"), log("c")]);
    }

    #[test]
    fn test_overflow_marker_after_outcome() {
        let (mut sink, mut stream) = channel(InstanceId(1), 2);
        for i in 0..5 {
            sink.console(ConsoleLevel::Log, i.to_string()).unwrap();
        }
        sink.status(rendered()).unwrap();

        let events = drain(&mut stream);
        assert_eq!(events.len(), 4);
        assert_eq!(events[0], rendered());
        assert_eq!(
            events[3],
            StatusEvent::ConsoleOutput {
                level: ConsoleLevel::Overflow,
                text: "3 console messages dropped".into()
            }
        );
    }

    #[test]
    fn test_capacity_frees_as_host_consumes() {
        let (mut sink, mut stream) = channel(InstanceId(1), 1);
        sink.status(rendered()).unwrap();
        sink.console(ConsoleLevel::Log, "first".into()).unwrap();
        sink.console(ConsoleLevel::Log, "dropped".into()).unwrap();

        assert_eq!(drain(&mut stream), vec![rendered(), log("first")]);

        sink.console(ConsoleLevel::Warn, "second".into()).unwrap();
        let events = drain(&mut stream);
        assert_eq!(
            events,
            vec![
                StatusEvent::ConsoleOutput {
                    level: ConsoleLevel::Overflow,
                    text: "1 console message dropped".into()
                },
                StatusEvent::ConsoleOutput {
                    level: ConsoleLevel::Warn,
                    text: "second".into()
                },
            ]
        );
    }

    #[test]
    fn test_close_flushes_unsettled_console() {
        let (mut sink, mut stream) = channel(InstanceId(3), 8);
        sink.console(ConsoleLevel::Error, "late".into()).unwrap();
        sink.close();

        let envelope = stream.try_recv().unwrap();
        assert_eq!(envelope.instance, InstanceId(3));
        assert!(stream.try_recv().is_none());
    }

    #[test]
    fn test_send_after_host_hangs_up() {
        let (mut sink, stream) = channel(InstanceId(1), 8);
        drop(stream);
        assert_eq!(sink.status(rendered()), Err(ChannelError::Closed));
        assert_eq!(
            sink.console(ConsoleLevel::Log, "x".into()),
            Err(ChannelError::Closed)
        );
    }

    #[test]
    fn test_sandbox_cannot_forge_overflow() {
        assert_eq!(ConsoleLevel::from_js("overflow"), ConsoleLevel::Log);
        assert_eq!(ConsoleLevel::from_js("warn"), ConsoleLevel::Warn);
    }

    #[test]
    fn test_event_wire_shape() {
        let json = serde_json::to_value(&StatusEvent::RuntimeError {
            message: "Error: boom".into(),
            stack: None,
            diagnostic: None,
        })
        .unwrap();
        assert_eq!(json["type"], "runtime_error");
        assert_eq!(json["message"], "Error: boom");
    }
}
