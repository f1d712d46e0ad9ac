//! Sandbox Host - mounts packaged documents into isolated V8 instances.
//!
//! ## Isolation
//!
//! - **Fresh isolate per instance**: nothing survives a refresh
//! - **No filesystem, environment or process access**: the isolate only has
//!   the preview ops; `Deno` and `eval` are removed before user code runs
//! - **No imports**: every `import()` is refused by the module loader
//! - **Network allow-list**: `fetch` reaches the pinned runtime CDN only,
//!   unless configured otherwise
//! - **Limits**: V8 heap limit and a render watchdog, both reported as
//!   `RuntimeError` events
//!
//! ## Lifecycle
//!
//! [`SandboxHost::mount`] spawns the instance and returns at once; the render
//! outcome arrives on the instance's event stream. [`SandboxHost::unmount`]
//! cancels whatever is still running and waits (bounded) for the thread to
//! exit. Dropping a [`SandboxInstance`] also tears it down, without waiting.

pub mod controller;
mod isolate;
pub mod loader;
pub mod network;
pub mod ops;

pub use isolate::create_runtime;

use crate::bridge::{self, Envelope, EventStream, HostCommand, InstanceId};
use crate::config::SandboxConfig;
use crate::error::{ChannelError, PreviewError};
use crate::packager::PackagedDocument;
use crate::sanitize::sanitize_props;
use deno_core::v8;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Spawns and tears down sandbox instances. Cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct SandboxHost {
    config: Arc<SandboxConfig>,
    next_id: AtomicU64,
    live: Arc<AtomicUsize>,
}

impl SandboxHost {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config: Arc::new(config),
            next_id: AtomicU64::new(0),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Sandbox threads that have not exited yet.
    pub fn live_instances(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Mount `document` with no props.
    pub fn mount(&self, document: Arc<PackagedDocument>) -> Result<SandboxInstance, PreviewError> {
        self.mount_with_props(document, Value::Null)
    }

    pub fn mount_with_props(
        &self,
        document: Arc<PackagedDocument>,
        props: Value,
    ) -> Result<SandboxInstance, PreviewError> {
        let props = sanitize_props(props)?.to_string();
        let id = InstanceId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);

        let (sink, events) = bridge::channel(id, self.config.console_capacity);
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (exited_tx, exited) = oneshot::channel();
        let control = Arc::new(InstanceControl::default());
        let guard = LiveGuard::enter(Arc::clone(&self.live), exited_tx);

        let job = isolate::Job {
            id,
            document: Arc::clone(&document),
            props,
            config: Arc::clone(&self.config),
            sink,
            commands: command_rx,
            control: Arc::clone(&control),
        };

        std::thread::Builder::new()
            .name(format!("preview-sandbox-{}", id.0))
            .spawn(move || {
                let _guard = guard;
                isolate::run(job);
            })
            .map_err(PreviewError::Spawn)?;

        tracing::info!(instance = %id, key = %document.key, entry = %document.entry, "mounted");

        Ok(SandboxInstance {
            id,
            document,
            events,
            commands,
            control,
            exited: Some(exited),
        })
    }

    /// Tear `instance` down. Returns whether its thread exited within the
    /// teardown timeout; events it had not delivered yet are discarded.
    pub async fn unmount(&self, mut instance: SandboxInstance) -> bool {
        self.teardown(&mut instance).await
    }

    /// Mount, wait for the render outcome, unmount, and return every event
    /// the instance produced.
    pub async fn render_once(
        &self,
        document: Arc<PackagedDocument>,
        props: Value,
    ) -> Result<Vec<Envelope>, PreviewError> {
        let mut instance = self.mount_with_props(document, props)?;
        let mut events = Vec::new();

        loop {
            match instance.next_event().await {
                Some(envelope) => {
                    let outcome = envelope.event.is_outcome();
                    events.push(envelope);
                    if outcome {
                        break;
                    }
                }
                None => return Err(ChannelError::Disconnected(instance.id).into()),
            }
        }

        self.teardown(&mut instance).await;
        events.extend(std::iter::from_fn(|| instance.try_next_event()));
        Ok(events)
    }

    async fn teardown(&self, instance: &mut SandboxInstance) -> bool {
        let id = instance.id;
        instance.signal_unmount();

        let Some(exited) = instance.exited.take() else {
            return true;
        };
        let timeout = Duration::from_millis(self.config.teardown_timeout_ms);
        match tokio::time::timeout(timeout, exited).await {
            Ok(_) => {
                tracing::info!(instance = %id, "unmounted");
                true
            }
            Err(_) => {
                tracing::warn!(instance = %id, timeout_ms = self.config.teardown_timeout_ms, "sandbox did not exit in time");
                false
            }
        }
    }
}

/// A live sandbox bound to exactly one document. Never reused.
#[derive(Debug)]
pub struct SandboxInstance {
    id: InstanceId,
    document: Arc<PackagedDocument>,
    events: EventStream,
    commands: mpsc::UnboundedSender<HostCommand>,
    control: Arc<InstanceControl>,
    exited: Option<oneshot::Receiver<()>>,
}

impl SandboxInstance {
    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn document(&self) -> &Arc<PackagedDocument> {
        &self.document
    }

    /// Next event from this instance; `None` once it has hung up.
    pub async fn next_event(&mut self) -> Option<Envelope> {
        self.events.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<Envelope> {
        self.events.try_recv()
    }

    fn signal_unmount(&self) {
        self.control.cancel();
        let _ = self.commands.send(HostCommand::Unmount);
    }
}

impl Drop for SandboxInstance {
    fn drop(&mut self) {
        if self.exited.is_some() {
            self.signal_unmount();
        }
    }
}

/// Shared between the host and the sandbox thread: lets the host stop
/// running JavaScript without waiting for the thread.
#[derive(Default)]
pub(crate) struct InstanceControl {
    cancelled: AtomicBool,
    isolate: Mutex<Option<v8::IsolateHandle>>,
}

impl InstanceControl {
    pub(crate) fn attach(&self, handle: v8::IsolateHandle) {
        let mut slot = self.isolate.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_cancelled() {
            handle.terminate_execution();
        }
        *slot = Some(handle);
    }

    pub(crate) fn detach(&self) {
        self.isolate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let slot = self.isolate.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = slot.as_ref() {
            handle.terminate_execution();
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for InstanceControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceControl")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Counts a sandbox thread as live until it exits, then tells the host.
struct LiveGuard {
    live: Arc<AtomicUsize>,
    exited: Option<oneshot::Sender<()>>,
}

impl LiveGuard {
    fn enter(live: Arc<AtomicUsize>, exited: oneshot::Sender<()>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self {
            live,
            exited: Some(exited),
        }
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        if let Some(exited) = self.exited.take() {
            let _ = exited.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_guard_counts() {
        let live = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = oneshot::channel();
        let guard = LiveGuard::enter(Arc::clone(&live), tx);
        assert_eq!(live.load(Ordering::SeqCst), 1);
        assert!(rx.try_recv().is_err());

        drop(guard);
        assert_eq!(live.load(Ordering::SeqCst), 0);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_cancel_before_attach_is_remembered() {
        let control = InstanceControl::default();
        control.cancel();
        assert!(control.is_cancelled());
        control.detach();
        assert!(control.is_cancelled());
    }
}
