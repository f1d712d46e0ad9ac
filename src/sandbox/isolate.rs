//! The sandbox thread: one fresh V8 isolate per instance.
//!
//! V8 isolates are `!Send`, so each instance runs on a dedicated thread with
//! its own single-threaded tokio runtime. The host talks to it only through
//! the bridge, the command channel and the instance control block.

use super::loader::SealedLoader;
use super::network::NetworkPolicy;
use super::ops::{preview_bridge, MountProps, Terminator};
use super::InstanceControl;
use crate::bridge::{EventSink, HostCommand, InstanceId, StatusEvent};
use crate::config::SandboxConfig;
use crate::packager::PackagedDocument;
use deno_core::error::JsError;
use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::Instrument;

const BRIDGE_JS: &str = include_str!("../js/bridge.js");

/// Extra heap granted once the limit is hit so termination can unwind.
const HEAP_GRACE_BYTES: usize = 1024 * 1024;

/// Everything a sandbox thread needs, moved onto it at spawn.
pub(super) struct Job {
    pub id: InstanceId,
    pub document: Arc<PackagedDocument>,
    pub props: String,
    pub config: Arc<SandboxConfig>,
    pub sink: EventSink,
    pub commands: mpsc::UnboundedReceiver<HostCommand>,
    pub control: Arc<InstanceControl>,
}

/// Why a render did not complete normally.
#[derive(Debug)]
enum Failure {
    /// Torn down by the host; nothing is reported.
    Cancelled,
    HeapLimit(usize),
    TimedOut(u64),
    Script {
        message: String,
        stack: Option<String>,
    },
}

impl Failure {
    fn into_event(self) -> Option<StatusEvent> {
        let (message, stack) = match self {
            Failure::Cancelled => return None,
            Failure::HeapLimit(bytes) => (
                format!(
                    "RangeError: render exceeded the sandbox heap limit of {}MB",
                    bytes / (1024 * 1024)
                ),
                None,
            ),
            Failure::TimedOut(ms) => (format!("Render timed out after {ms}ms"), None),
            Failure::Script { message, stack } => (message, stack),
        };
        Some(StatusEvent::RuntimeError {
            message,
            stack,
            diagnostic: None,
        })
    }
}

/// Thread entry point.
pub(super) fn run(job: Job) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(instance = %job.id, %err, "failed to start sandbox runtime");
            let mut sink = job.sink;
            let _ = sink.status(StatusEvent::RuntimeError {
                message: format!("failed to start sandbox: {err}"),
                stack: None,
                diagnostic: None,
            });
            sink.close();
            return;
        }
    };

    let span = tracing::info_span!("sandbox", instance = %job.id);
    runtime.block_on(drive(job).instrument(span));
}

async fn drive(job: Job) {
    let Job {
        id: _,
        document,
        props,
        config,
        sink,
        mut commands,
        control,
    } = job;

    if control.is_cancelled() {
        tracing::debug!("superseded before start");
        sink.close();
        return;
    }

    let mut runtime = create_runtime(&config);
    let handle = runtime.v8_isolate().thread_safe_handle();
    {
        let state = runtime.op_state();
        let mut state = state.borrow_mut();
        state.put(sink);
        state.put(MountProps(props));
        state.put(Terminator(handle.clone()));
    }
    control.attach(handle.clone());

    let started = std::time::Instant::now();
    let (result, unmount_requested) =
        render(&mut runtime, &document, &config, &handle, &mut commands).await;

    let failure = match result {
        Err(_) if control.is_cancelled() => Some(Failure::Cancelled),
        Err(failure) => Some(failure),
        Ok(()) => None,
    };

    match failure {
        Some(failure) => {
            tracing::info!(?failure, elapsed_ms = started.elapsed().as_millis() as u64, "render failed");
            if let Some(event) = failure.into_event() {
                report(&mut runtime, event);
            }
        }
        None => {
            tracing::debug!(elapsed_ms = started.elapsed().as_millis() as u64, "render settled");
            if !is_settled(&mut runtime) {
                report(
                    &mut runtime,
                    StatusEvent::RuntimeError {
                        message: "Render finished without reporting a result".to_string(),
                        stack: None,
                        diagnostic: None,
                    },
                );
            }
        }
    }

    // Idle until the host unmounts or drops the instance.
    if !unmount_requested {
        let _ = commands.recv().await;
    }

    control.detach();
    let sink = runtime.op_state().borrow_mut().try_take::<EventSink>();
    if let Some(sink) = sink {
        sink.close();
    }
    tracing::debug!("sandbox torn down");
}

/// Create a sandboxed JS runtime for one preview instance.
pub fn create_runtime(config: &SandboxConfig) -> JsRuntime {
    // Configure V8 heap limits if specified
    let create_params = config
        .max_heap_size
        .map(|max_bytes| v8::Isolate::create_params().heap_limits(0, max_bytes));

    let mut runtime = JsRuntime::new(RuntimeOptions {
        module_loader: Some(Rc::new(SealedLoader)),
        extensions: vec![preview_bridge::init_ops_and_esm()],
        create_params,
        ..Default::default()
    });

    runtime.op_state().borrow_mut().put(NetworkPolicy::new(
        &config.allowed_origins,
        config.max_fetch_bytes,
    ));

    runtime
}

/// Evaluate the bridge bootstrap, the runtime and the document, then drive the event loop
/// until it settles, the deadline passes or the host sends `Unmount`.
///
/// Returns the render result and whether an unmount command was consumed.
async fn render(
    runtime: &mut JsRuntime,
    document: &PackagedDocument,
    config: &SandboxConfig,
    handle: &v8::IsolateHandle,
    commands: &mut mpsc::UnboundedReceiver<HostCommand>,
) -> (Result<(), Failure>, bool) {
    let heap_hit = Arc::new(AtomicBool::new(false));
    if let Some(max) = config.max_heap_size {
        let flag = Arc::clone(&heap_hit);
        let handle = handle.clone();
        runtime.add_near_heap_limit_callback(move |current, _initial| {
            if !flag.swap(true, Ordering::SeqCst) {
                tracing::warn!(limit_mb = max / (1024 * 1024), "near heap limit, terminating");
                handle.terminate_execution();
            }
            current + HEAP_GRACE_BYTES
        });
    }

    let timeout = config.timeout_ms.map(Duration::from_millis);
    let watchdog = timeout.map(|timeout| Watchdog::arm(handle.clone(), timeout));
    let deadline = timeout.map(|timeout| Instant::now() + timeout);

    let mut unmount_requested = false;
    let mut result = evaluate(runtime, document);

    if result.is_ok() {
        let event_loop = runtime.run_event_loop(PollEventLoopOptions::default());
        result = tokio::select! {
            outcome = until(deadline, event_loop) => match outcome {
                Some(Ok(())) => Ok(()),
                Some(Err(err)) => Err(script_failure(err)),
                None => Err(Failure::TimedOut(config.timeout_ms.unwrap_or_default())),
            },
            _ = commands.recv() => {
                unmount_requested = true;
                Err(Failure::Cancelled)
            }
        };
    }

    let watchdog_fired = watchdog.is_some_and(Watchdog::disarm);

    let result = match result {
        Err(_) if heap_hit.load(Ordering::SeqCst) => {
            Err(Failure::HeapLimit(config.max_heap_size.unwrap_or_default()))
        }
        Err(_) if watchdog_fired => Err(Failure::TimedOut(config.timeout_ms.unwrap_or_default())),
        other => other,
    };
    (result, unmount_requested)
}

fn evaluate(runtime: &mut JsRuntime, document: &PackagedDocument) -> Result<(), Failure> {
    runtime
        .execute_script("[preview:bridge]", BRIDGE_JS)
        .map_err(script_failure)?;
    runtime
        .execute_script("[preview:runtime]", document.runtime)
        .map_err(script_failure)?;
    runtime
        .execute_script("<preview>", document.script.clone())
        .map_err(script_failure)?;
    Ok(())
}

async fn until<F: std::future::Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

fn script_failure(err: anyhow::Error) -> Failure {
    match err.downcast_ref::<JsError>() {
        Some(js) => Failure::Script {
            message: js.exception_message.clone(),
            stack: js.stack.clone(),
        },
        None => Failure::Script {
            message: err.to_string(),
            stack: None,
        },
    }
}

fn report(runtime: &mut JsRuntime, event: StatusEvent) {
    let state = runtime.op_state();
    let mut state = state.borrow_mut();
    if let Some(sink) = state.try_borrow_mut::<EventSink>() {
        if let Err(err) = sink.status(event) {
            tracing::debug!(%err, "outcome not delivered");
        }
    }
}

fn is_settled(runtime: &mut JsRuntime) -> bool {
    runtime
        .op_state()
        .borrow()
        .try_borrow::<EventSink>()
        .map_or(true, EventSink::is_settled)
}

/// CPU watchdog: terminates the isolate if the render is still running when
/// the timeout elapses. Handles synchronous infinite loops, which never yield
/// to the tokio timer.
struct Watchdog {
    cancel: std_mpsc::Sender<()>,
    thread: JoinHandle<()>,
    fired: Arc<AtomicBool>,
}

impl Watchdog {
    fn arm(handle: v8::IsolateHandle, timeout: Duration) -> Self {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let (cancel, cancelled) = std_mpsc::channel::<()>();
        let thread = std::thread::spawn(move || {
            if let Err(std_mpsc::RecvTimeoutError::Timeout) = cancelled.recv_timeout(timeout) {
                flag.store(true, Ordering::SeqCst);
                handle.terminate_execution();
            }
        });
        Self {
            cancel,
            thread,
            fired,
        }
    }

    /// Stop the watchdog and wait for its thread. Returns whether it fired.
    fn disarm(self) -> bool {
        let _ = self.cancel.send(());
        let _ = self.thread.join();
        self.fired.load(Ordering::SeqCst)
    }
}
