use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use extension_runtime::{ModuleHandle, OutboundMessage, Runtime, RuntimeConfig};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::bridge;

fn load_config(path: &Path) -> anyhow::Result<RuntimeConfig> {
    RuntimeConfig::from_file(path)
        .with_context(|| format!("failed to load configuration {}", path.display()))
}

/// Validate the configuration and resolve every referenced chart.
///
/// Prints one line per extension and returns whether everything loaded.
pub fn check(path: &Path) -> anyhow::Result<bool> {
    let config = load_config(path)?;
    let runtime = Runtime::new(config);
    let mut all_ok = runtime.rejected().is_empty();

    for rejected in runtime.rejected() {
        println!("rejected: {rejected}");
    }

    for module in runtime.modules() {
        for extension in module.extensions() {
            match runtime.charts().resolve(&extension.chart) {
                Ok(handle) => {
                    let states = runtime
                        .charts()
                        .get(handle)
                        .map(|chart| chart.states.len())
                        .unwrap_or_default();
                    println!(
                        "ok: {}/{} ({}, {} states)",
                        module.id(),
                        extension.id,
                        extension.chart,
                        states
                    );
                    runtime.charts().release(handle);
                }
                Err(err) => {
                    all_ok = false;
                    println!(
                        "error: {}/{} ({}): {err}",
                        module.id(),
                        extension.id,
                        extension.chart
                    );
                }
            }
        }
    }

    Ok(all_ok)
}

/// Run the runtime until stdin closes or Ctrl-C.
///
/// Each stdin line is one event (see [`bridge::parse_line`]); ACD sends are
/// written to stdout as JSON lines.
pub async fn run(path: &Path) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let mut runtime = Runtime::new(config);
    for rejected in runtime.rejected() {
        warn!(error = %rejected, "configuration entry rejected");
    }

    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
    let outboxes = runtime.attach_acd_outbox(outbox_tx);
    let writer = tokio::spawn(write_outbound(outbox_rx));

    let report = runtime.start().await?;
    for failure in &report.failures {
        warn!(
            module = %failure.module,
            extension = %failure.extension,
            error = %failure.error,
            "extension not registered"
        );
    }
    info!(
        registered = report.registered.len(),
        modules = runtime.modules().len(),
        outboxes,
        "runtime started"
    );

    let handles: HashMap<String, ModuleHandle> = runtime
        .modules()
        .iter()
        .filter_map(|module| runtime.handle(module.id()))
        .map(|handle| (handle.module().to_string(), handle))
        .collect();
    let default_module = match runtime.modules() {
        [only] => Some(only.id().to_string()),
        _ => None,
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupt received");
                break;
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        info!("stdin closed");
                        break;
                    }
                    Err(err) => {
                        warn!(error = %err, "failed to read stdin");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                feed_line(&line, default_module.as_deref(), &handles).await;
            }
        }
    }

    let stopped = runtime.stop().await;
    info!(
        routed = stopped.router.routed,
        unknown = stopped.router.unknown,
        released = stopped.released,
        producers_aborted = stopped.producers_aborted,
        "runtime stopped"
    );

    // The writer ends once every outbox sender is gone.
    drop(handles);
    drop(runtime);
    writer.await.context("outbound writer failed")?;
    Ok(())
}

async fn feed_line(line: &str, default_module: Option<&str>, handles: &HashMap<String, ModuleHandle>) {
    let (module, event) = match bridge::parse_line(line, default_module) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "ignoring input line");
            return;
        }
    };
    let Some(handle) = handles.get(&module) else {
        warn!(module = %module, "unknown module");
        return;
    };
    if let Err(err) = handle.push_event(event).await {
        warn!(module = %module, error = %err, "event rejected");
    }
}

async fn write_outbound(mut outbox: mpsc::UnboundedReceiver<OutboundMessage>) {
    let mut stdout = tokio::io::stdout();
    while let Some(message) = outbox.recv().await {
        let mut line = match serde_json::to_string(&message) {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "failed to encode outbound message");
                continue;
            }
        };
        line.push('\n');
        if let Err(err) = stdout.write_all(line.as_bytes()).await {
            warn!(error = %err, "failed to write outbound message");
            break;
        }
        let _ = stdout.flush().await;
    }
}
