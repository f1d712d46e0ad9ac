//! Component Preview CLI
//!
//! Single-shot mode:
//!   component-preview render <file.jsx> [--entry App] [--props '{"title":"Hi"}'] [--page]
//!
//! Server mode (persistent process, reads from stdin):
//!   component-preview serve
//!
//! Protocol (server mode):
//!   Request (stdin):
//!     default
//!     {"title":"Hi"}
//!     Length:42
//!     export default () => <h1>Hello</h1>;
//!
//!   Response (stdout):
//!     Status:Ok
//!     Instance:#1
//!     Length:1234
//!
//!     <!DOCTYPE html>...
//!
//!   Error response:
//!     Status:Error
//!     Instance:#1
//!     Length:42
//!
//!     ReferenceError: foo is not defined
//!
//! Every request replaces the previous preview instance. A request whose
//! source fails to package leaves the previous instance mounted and answers
//! with `Instance:none`. So does a body over `packager.max_source_bytes`,
//! which is skipped without being read into memory.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use component_preview::collab::{self, InMemorySessionStore, MockGenerator, SessionStore};
use component_preview::page::{frame, render_page};
use component_preview::{
    EntryPoint, Envelope, InstanceId, Packager, PreviewConfig, PreviewController, SandboxHost,
    SourceUnit, StatusEvent, Viewport,
};
use serde_json::Value;
use std::io::{BufRead, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "component-preview")]
#[command(about = "Render generated UI components in a throwaway V8 sandbox")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML configuration file (defaults apply when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Package and render one source file, print the page to stdout
    Render {
        file: PathBuf,

        /// Binding to render instead of the default export
        #[arg(short, long, conflicts_with = "default_export")]
        entry: Option<String>,

        /// Render the default export (the default)
        #[arg(long)]
        default_export: bool,

        /// Props for the entry component, as a JSON object
        #[arg(short, long)]
        props: Option<String>,

        /// Wrap the page in a sandboxed iframe sized for this viewport
        #[arg(short, long)]
        viewport: Option<Viewport>,

        /// Print a complete HTML page instead of the bare markup
        #[arg(long)]
        page: bool,
    },

    /// Persistent mode: length-prefixed requests on stdin
    Serve,

    /// Ask the canned generator for a component and render it
    Demo {
        prompt: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("component_preview=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => PreviewConfig::load(path)?,
        None => PreviewConfig::default(),
    };

    match cli.command {
        Command::Render {
            file,
            entry,
            default_export: _,
            props,
            viewport,
            page,
        } => {
            let source = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let entry = entry.map_or(EntryPoint::Default, |name| EntryPoint::parse(&name));
            let props = parse_props(props.as_deref())?;
            run_single_shot(&config, SourceUnit::new(source, entry), props, viewport, page)
                .await
        }
        Command::Serve => run_server(&config).await,
        Command::Demo { prompt } => run_demo(&config, &prompt).await,
    }
}

fn parse_props(raw: Option<&str>) -> Result<Value> {
    match raw.map(str::trim) {
        None | Some("") => Ok(Value::Null),
        Some(json) => serde_json::from_str(json).map_err(|e| anyhow!("Invalid props JSON: {}", e)),
    }
}

/// Mount once, print the page, unmount.
async fn run_single_shot(
    config: &PreviewConfig,
    unit: SourceUnit,
    props: Value,
    viewport: Option<Viewport>,
    as_page: bool,
) -> Result<()> {
    let packager = Packager::new(&config.packager);
    let host = SandboxHost::new(config.sandbox.clone());

    let document = packager.package(&unit)?;
    let events = host.render_once(document, props).await?;

    let mut html = None;
    for envelope in &events {
        log_console(envelope);
        match &envelope.event {
            StatusEvent::Rendered { html: markup } => html = Some(markup.clone()),
            StatusEvent::RuntimeError { message, stack, .. } => {
                if let Some(stack) = stack {
                    eprintln!("{stack}");
                }
                bail!("{message}");
            }
            StatusEvent::ConsoleOutput { .. } => {}
        }
    }

    let html = html.ok_or_else(|| anyhow!("sandbox finished without rendering"))?;
    let output = match viewport {
        Some(viewport) => frame(&render_page(&html, &config.page), viewport),
        None if as_page => render_page(&html, &config.page),
        None => html,
    };
    println!("{output}");
    Ok(())
}

/// Run in server mode: one controller, one live instance at a time.
async fn run_server(config: &PreviewConfig) -> Result<()> {
    let mut controller = PreviewController::from_config(config);

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    let mut reader = stdin.lock();

    eprintln!("[component-preview] Server ready, reading from stdin...");

    loop {
        let request = match read_request(&mut reader, config.packager.max_source_bytes)? {
            Some(request) => request,
            // EOF - stdin closed, exit gracefully
            None => break,
        };
        let (entry, props, source) = match request {
            Request::Preview {
                entry,
                props,
                source,
            } => (entry, props, source),
            Request::Rejected(reason) => {
                write_response(&mut stdout, false, None, &reason)?;
                continue;
            }
        };
        let props = match parse_props(Some(&props)) {
            Ok(props) => props,
            Err(err) => {
                write_response(&mut stdout, false, None, &err.to_string())?;
                continue;
            }
        };

        let unit = SourceUnit::new(source, EntryPoint::parse(&entry));
        let id = match controller.update(&unit, props).await {
            Ok(id) => id,
            Err(err) => {
                write_response(&mut stdout, false, None, &err.to_string())?;
                continue;
            }
        };

        let (ok, body) = match await_outcome(&mut controller).await {
            Ok(StatusEvent::Rendered { html }) => (true, render_page(&html, &config.page)),
            Ok(StatusEvent::RuntimeError { message, .. }) => (false, message),
            Ok(StatusEvent::ConsoleOutput { .. }) => (false, "sandbox finished without rendering".to_string()),
            Err(err) => (false, err.to_string()),
        };
        for envelope in controller.drain_ready() {
            log_console(&envelope);
        }
        write_response(&mut stdout, ok, Some(id), &body)?;
    }

    controller.unmount().await;
    eprintln!("[component-preview] Server shutting down");
    Ok(())
}

/// One request read off the server's input.
#[derive(Debug, PartialEq, Eq)]
enum Request {
    Preview {
        entry: String,
        props: String,
        source: String,
    },
    /// Answered with an error without touching the preview. The body, when
    /// its length is known, has already been consumed.
    Rejected(String),
}

/// Read one request. Bodies over `max_source_bytes` are skipped without
/// being buffered. Returns `None` at end of input.
fn read_request(reader: &mut impl BufRead, max_source_bytes: usize) -> Result<Option<Request>> {
    let mut entry = String::new();
    if reader.read_line(&mut entry)? == 0 {
        return Ok(None);
    }
    let mut props = String::new();
    reader.read_line(&mut props)?;
    let mut length_line = String::new();
    reader.read_line(&mut length_line)?;

    let Some(length) = length_line
        .trim()
        .strip_prefix("Length:")
        .and_then(|n| n.trim().parse::<u64>().ok())
    else {
        return Ok(Some(Request::Rejected(format!(
            "expected `Length:<bytes>`, got {:?}",
            length_line.trim()
        ))));
    };

    if length > max_source_bytes as u64 {
        std::io::copy(&mut reader.by_ref().take(length), &mut std::io::sink())?;
        return Ok(Some(Request::Rejected(format!(
            "source is {length} bytes, the limit is {max_source_bytes}"
        ))));
    }

    let mut body = Vec::with_capacity(length as usize);
    reader.by_ref().take(length).read_to_end(&mut body)?;
    if (body.len() as u64) < length {
        eprintln!("[component-preview] Input ended inside a {length}-byte body");
        return Ok(None);
    }

    match String::from_utf8(body) {
        Ok(source) => Ok(Some(Request::Preview {
            entry,
            props,
            source,
        })),
        Err(_) => Ok(Some(Request::Rejected("source is not valid UTF-8".to_string()))),
    }
}

async fn await_outcome(controller: &mut PreviewController) -> Result<StatusEvent> {
    loop {
        let envelope = controller.next_event().await?;
        if envelope.event.is_outcome() {
            return Ok(envelope.event);
        }
        log_console(&envelope);
    }
}

/// Generate a component for `prompt` through the session seams and render it.
async fn run_demo(config: &PreviewConfig, prompt: &str) -> Result<()> {
    let store = InMemorySessionStore::with_samples();
    let session = store.create("Demo").await?;
    let reply = collab::send_message(&store, &MockGenerator, session.id, prompt).await?;
    eprintln!("[assistant] {}", reply.assistant_reply);

    let unit = reply
        .generated_source
        .ok_or_else(|| anyhow!("generator returned no source"))?;
    let host = Arc::new(SandboxHost::new(config.sandbox.clone()));
    let mut controller = PreviewController::new(host, Packager::new(&config.packager));
    controller.update_source(&unit).await?;

    let outcome = await_outcome(&mut controller).await;
    for envelope in controller.drain_ready() {
        log_console(&envelope);
    }
    controller.unmount().await;

    match outcome? {
        StatusEvent::Rendered { html } => {
            println!("{}", frame(&render_page(&html, &config.page), Viewport::Desktop));
            Ok(())
        }
        StatusEvent::RuntimeError { message, .. } => bail!("{message}"),
        StatusEvent::ConsoleOutput { .. } => bail!("sandbox finished without rendering"),
    }
}

fn log_console(envelope: &Envelope) {
    if let StatusEvent::ConsoleOutput { level, text } = &envelope.event {
        eprintln!("[{}] [{}] {}", envelope.instance, level.as_str().to_uppercase(), text);
    }
}

/// Write response in length-prefixed protocol
fn write_response(
    stdout: &mut std::io::Stdout,
    ok: bool,
    instance: Option<InstanceId>,
    body: &str,
) -> Result<()> {
    let status = if ok { "Ok" } else { "Error" };
    let instance = instance.map_or_else(|| "none".to_string(), |id| id.to_string());

    writeln!(stdout, "Status:{}", status)?;
    writeln!(stdout, "Instance:{}", instance)?;
    writeln!(stdout, "Length:{}", body.len())?;
    writeln!(stdout)?; // Empty line separator
    write!(stdout, "{}", body)?;
    stdout.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn requests(input: &str, max: usize) -> Vec<Request> {
        let mut reader = Cursor::new(input.as_bytes().to_vec());
        std::iter::from_fn(|| read_request(&mut reader, max).unwrap()).collect()
    }

    #[test]
    fn test_reads_framed_requests() {
        let input = "default\n{}\nLength:5\nhelloApp\n\nLength:2\nhi";
        assert_eq!(
            requests(input, 1024),
            vec![
                Request::Preview {
                    entry: "default\n".into(),
                    props: "{}\n".into(),
                    source: "hello".into(),
                },
                Request::Preview {
                    entry: "App\n".into(),
                    props: "\n".into(),
                    source: "hi".into(),
                },
            ]
        );
    }

    #[test]
    fn test_oversized_body_is_skipped_not_buffered() {
        let big = "x".repeat(64);
        let input = format!("default\n{{}}\nLength:64\n{big}default\n{{}}\nLength:2\nok");
        let got = requests(&input, 16);
        assert_eq!(got.len(), 2);
        assert_eq!(
            got[0],
            Request::Rejected("source is 64 bytes, the limit is 16".into())
        );
        assert!(matches!(&got[1], Request::Preview { source, .. } if source == "ok"));
    }

    #[test]
    fn test_huge_declared_length_is_rejected() {
        let input = "default\n{}\nLength:18446744073709551615\n";
        assert_eq!(
            requests(input, 1024),
            vec![Request::Rejected(
                "source is 18446744073709551615 bytes, the limit is 1024".into()
            )]
        );
    }

    #[test]
    fn test_malformed_length_answers_instead_of_exiting() {
        let input = "default\n{}\nLength:lots\ndefault\n{}\nLength:2\nok";
        let got = requests(input, 1024);
        assert!(matches!(&got[0], Request::Rejected(reason) if reason.contains("Length:lots")));
        assert!(matches!(&got[1], Request::Preview { source, .. } if source == "ok"));
    }

    #[test]
    fn test_invalid_utf8_keeps_framing() {
        let mut input = b"default\n{}\nLength:2\n".to_vec();
        input.extend([0xff, 0xfe]);
        input.extend(b"default\n{}\nLength:2\nok");
        let mut reader = Cursor::new(input);
        assert_eq!(
            read_request(&mut reader, 1024).unwrap(),
            Some(Request::Rejected("source is not valid UTF-8".into()))
        );
        assert!(matches!(
            read_request(&mut reader, 1024).unwrap(),
            Some(Request::Preview { source, .. }) if source == "ok"
        ));
        assert_eq!(read_request(&mut reader, 1024).unwrap(), None);
    }
}
