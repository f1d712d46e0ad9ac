//! # Component Preview
//!
//! A sandboxed, hot-reloading preview runtime for generated UI components,
//! built on deno_core.
//!
//! Untrusted JSX goes through three stages:
//!
//! 1. **Packager** ([`packager`]): validates and lowers the source into a
//!    self-contained script bundled with a pinned preview runtime.
//! 2. **Sandbox host** ([`sandbox`]): evaluates that script in a fresh V8
//!    isolate, one per preview instance, and tears it down on every change.
//! 3. **Bridge** ([`bridge`]): the only path from a sandbox to the host. It
//!    carries typed status events stamped with their instance id.
//!
//! ## Security Guarantees
//!
//! - **No filesystem, environment or shell access**: `Deno`, `eval` and the
//!   `Function` constructors are gone before user code runs
//! - **No imports**: the module loader refuses everything
//! - **Network allow-list**: `fetch` only reaches the pinned runtime CDN
//! - **Resource limits**: heap limit and render timeout, reported as
//!   `RuntimeError` events instead of hanging the host
//! - **Inert output**: rendered markup is shown in a script-less sandboxed
//!   iframe ([`page`])
//!
//! ## Usage
//!
//! ```rust,ignore
//! use component_preview::{PreviewConfig, PreviewController, SourceUnit};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut preview = PreviewController::from_config(&PreviewConfig::default());
//!     let unit = SourceUnit::default_export(
//!         "export default () => <button>Hi</button>;",
//!     );
//!
//!     preview.update_source(&unit).await?;
//!     let envelope = preview.next_event().await?;
//!     println!("{:?}", envelope.event);
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod collab;
pub mod config;
pub mod error;
pub mod packager;
pub mod page;
pub mod sandbox;
pub mod sanitize;
pub mod source;

pub use bridge::{ConsoleLevel, Envelope, InstanceId, StatusEvent};
pub use config::{PackagerConfig, PageConfig, PreviewConfig, SandboxConfig};
pub use error::{ChannelError, CollabError, PackagingError, PreviewError, PropsError};
pub use packager::{DocumentKey, PackagedDocument, Packager};
pub use page::Viewport;
pub use sandbox::controller::PreviewController;
pub use sandbox::{SandboxHost, SandboxInstance};
pub use source::{EntryPoint, SourceUnit};
