//! Ops exposed to preview isolates and the extension that registers them.
//!
//! The sandbox reaches the host only through these. Status and console ops
//! write to the instance's [`EventSink`]; when the host has hung up, the op
//! terminates the isolate instead of throwing into user code.

use super::network::op_preview_fetch;
use crate::bridge::{ConsoleLevel, EventSink, StatusEvent};
use crate::error::ChannelError;
use anyhow::{anyhow, Error};
use deno_core::{op2, v8, OpState};

/// Sanitized props JSON for the entry component.
#[derive(Debug, Clone)]
pub struct MountProps(pub String);

/// Thread-safe handle used to stop the isolate from inside an op.
pub struct Terminator(pub v8::IsolateHandle);

fn deliver(
    state: &mut OpState,
    send: impl FnOnce(&mut EventSink) -> Result<(), ChannelError>,
) {
    let Some(sink) = state.try_borrow_mut::<EventSink>() else {
        return;
    };
    let instance = sink.instance();
    if let Err(err) = send(sink) {
        tracing::debug!(%instance, %err, "host hung up, terminating sandbox");
        if let Some(terminator) = state.try_borrow::<Terminator>() {
            terminator.0.terminate_execution();
        }
    }
}

// ============================================================================
// Bridge Ops
// ============================================================================

#[op2(fast)]
pub fn op_preview_console(state: &mut OpState, #[string] level: &str, #[string] text: &str) {
    let level = ConsoleLevel::from_js(level);
    deliver(state, |sink| sink.console(level, text.to_string()));
}

/// A sandbox reports one outcome; later calls are dropped.
fn settle(state: &mut OpState, event: StatusEvent) {
    deliver(state, |sink| {
        if sink.is_settled() {
            tracing::debug!(instance = %sink.instance(), "outcome already reported, ignoring");
            return Ok(());
        }
        sink.status(event)
    });
}

#[op2(fast)]
pub fn op_preview_rendered(state: &mut OpState, #[string] html: String) {
    settle(state, StatusEvent::Rendered { html });
}

#[op2(fast)]
pub fn op_preview_error(
    state: &mut OpState,
    #[string] message: String,
    #[string] stack: String,
    #[string] diagnostic: String,
) {
    let event = StatusEvent::RuntimeError {
        message,
        stack: Some(stack).filter(|s| !s.is_empty()),
        diagnostic: Some(diagnostic).filter(|d| !d.is_empty()),
    };
    settle(state, event);
}

#[op2]
#[string]
pub fn op_preview_props(state: &mut OpState) -> String {
    state
        .try_borrow::<MountProps>()
        .map(|props| props.0.clone())
        .unwrap_or_else(|| "{}".to_string())
}

// ============================================================================
// Crypto Ops
// ============================================================================

#[op2]
#[string]
pub fn op_preview_random_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[op2(fast)]
pub fn op_preview_random_values(#[buffer] buf: &mut [u8]) {
    use rand::RngCore;
    rand::thread_rng().fill_bytes(buf);
}

// ============================================================================
// Encoding Ops
// ============================================================================

/// `btoa` takes a binary string: every code point must fit in one byte.
#[op2]
#[string]
pub fn op_preview_btoa(#[string] data: &str) -> Result<String, Error> {
    use base64::Engine;
    let bytes = latin1_bytes(data)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

#[op2]
#[string]
pub fn op_preview_atob(#[string] data: &str) -> Result<String, Error> {
    use base64::Engine;
    let compact: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(compact)
        .map_err(|e| anyhow!("Invalid base64: {}", e))?;
    Ok(bytes.into_iter().map(char::from).collect())
}

fn latin1_bytes(data: &str) -> Result<Vec<u8>, Error> {
    data.chars()
        .map(|c| {
            u8::try_from(u32::from(c))
                .map_err(|_| anyhow!("Invalid character: btoa only accepts Latin-1 strings"))
        })
        .collect()
}

deno_core::extension!(
    preview_bridge,
    ops = [
        op_preview_console,
        op_preview_rendered,
        op_preview_error,
        op_preview_props,
        op_preview_random_uuid,
        op_preview_random_values,
        op_preview_btoa,
        op_preview_atob,
        op_preview_fetch,
    ],
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latin1_bytes() {
        assert_eq!(latin1_bytes("héllo").unwrap(), vec![b'h', 0xe9, b'l', b'l', b'o']);
        assert!(latin1_bytes("€").is_err());
    }
}
