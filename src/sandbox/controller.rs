//! Host-side preview state: at most one live instance, replaced on every
//! source change or refresh.
//!
//! The controller holds only the current instance's event stream. A
//! superseded instance loses its receiver the moment it is replaced, so its
//! events can never reach the host UI, and its next send terminates it.

use super::{SandboxHost, SandboxInstance};
use crate::bridge::{Envelope, InstanceId};
use crate::config::PreviewConfig;
use crate::error::{ChannelError, PreviewError};
use crate::packager::{PackagedDocument, Packager};
use crate::sanitize::sanitize_props;
use crate::source::SourceUnit;
use serde_json::Value;
use std::sync::Arc;

pub struct PreviewController {
    host: Arc<SandboxHost>,
    packager: Packager,
    current: Option<SandboxInstance>,
    props: Value,
}

impl PreviewController {
    pub fn new(host: Arc<SandboxHost>, packager: Packager) -> Self {
        Self {
            host,
            packager,
            current: None,
            props: Value::Null,
        }
    }

    pub fn from_config(config: &PreviewConfig) -> Self {
        Self::new(
            Arc::new(SandboxHost::new(config.sandbox.clone())),
            Packager::new(&config.packager),
        )
    }

    /// Props for the entry component of every instance mounted from now on.
    pub fn set_props(&mut self, props: Value) -> Result<(), PreviewError> {
        self.props = sanitize_props(props)?;
        Ok(())
    }

    /// Package `unit` and mount it in place of the current instance.
    ///
    /// Packaging errors are returned before anything is unmounted, so a bad
    /// edit leaves the last good preview on screen.
    pub async fn update_source(&mut self, unit: &SourceUnit) -> Result<InstanceId, PreviewError> {
        let document = self.package(unit)?;
        self.refresh(document).await
    }

    /// [`update_source`](Self::update_source) with new props. The props are
    /// kept only once the source has packaged and the props are valid.
    pub async fn update(
        &mut self,
        unit: &SourceUnit,
        props: Value,
    ) -> Result<InstanceId, PreviewError> {
        let document = self.package(unit)?;
        self.props = sanitize_props(props)?;
        self.refresh(document).await
    }

    fn package(&self, unit: &SourceUnit) -> Result<Arc<PackagedDocument>, PreviewError> {
        let document = self.packager.package(unit).map_err(|err| {
            tracing::info!(%err, "source rejected, keeping current preview");
            err
        })?;
        Ok(document)
    }

    /// Destroy the current instance and mount `document` in a fresh one.
    pub async fn refresh(
        &mut self,
        document: Arc<PackagedDocument>,
    ) -> Result<InstanceId, PreviewError> {
        if let Some(previous) = self.current.take() {
            let id = previous.id();
            if !self.host.unmount(previous).await {
                tracing::warn!(instance = %id, "superseded instance still shutting down");
            }
        }

        let instance = self.host.mount_with_props(document, self.props.clone())?;
        let id = instance.id();
        self.current = Some(instance);
        Ok(id)
    }

    /// Remount the current document. In-sandbox state is not preserved.
    pub async fn reload(&mut self) -> Result<InstanceId, PreviewError> {
        let document = self
            .current
            .as_ref()
            .map(|instance| Arc::clone(instance.document()))
            .ok_or(ChannelError::NotMounted)?;
        self.refresh(document).await
    }

    /// Unmount the current instance, if any.
    pub async fn unmount(&mut self) {
        if let Some(instance) = self.current.take() {
            self.host.unmount(instance).await;
        }
    }

    /// Next event from the current instance.
    ///
    /// A sandbox that hangs up without being unmounted is dropped and reported
    /// as [`ChannelError::Disconnected`]; the host must remount.
    pub async fn next_event(&mut self) -> Result<Envelope, ChannelError> {
        let instance = self.current.as_mut().ok_or(ChannelError::NotMounted)?;
        match instance.next_event().await {
            Some(envelope) => Ok(envelope),
            None => {
                let id = instance.id();
                tracing::warn!(instance = %id, "sandbox disconnected");
                self.current = None;
                Err(ChannelError::Disconnected(id))
            }
        }
    }

    /// Events already delivered by the current instance.
    pub fn drain_ready(&mut self) -> Vec<Envelope> {
        match self.current.as_mut() {
            Some(instance) => std::iter::from_fn(|| instance.try_next_event()).collect(),
            None => Vec::new(),
        }
    }

    pub fn current(&self) -> Option<InstanceId> {
        self.current.as_ref().map(SandboxInstance::id)
    }

    pub fn current_document(&self) -> Option<&Arc<PackagedDocument>> {
        self.current.as_ref().map(SandboxInstance::document)
    }

    pub fn live_instances(&self) -> usize {
        self.host.live_instances()
    }

    pub fn packager(&self) -> &Packager {
        &self.packager
    }
}

impl std::fmt::Debug for PreviewController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreviewController")
            .field("current", &self.current())
            .field("live", &self.live_instances())
            .finish()
    }
}
