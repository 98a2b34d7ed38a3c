//! Control-channel handlers: bind, exec and debug.

use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;

use ctrlwire_core::{BindingKey, Client, DebugEvent};

use crate::cli::{BindArgs, DebugArgs, ExecArgs, GlobalOpts, OutputFormat};
use crate::config::Resolved;
use crate::error::CliError;
use crate::output;

use super::{binding_key, connected_client};

/// How long a one-shot `bind` waits for the first notification.
const FIRST_VALUE_WAIT: Duration = Duration::from_secs(3);

// ── Bind ────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct BindingUpdate {
    key: String,
    value: Value,
    at: DateTime<Utc>,
}

impl BindingUpdate {
    fn new(key: &BindingKey, value: Value) -> Self {
        Self {
            key: key.to_string(),
            value,
            at: Utc::now(),
        }
    }

    fn render(&self, format: OutputFormat, watching: bool) -> String {
        // One record per line while streaming.
        let format = match format {
            OutputFormat::Json if watching => OutputFormat::JsonCompact,
            other => other,
        };
        output::render_single(
            format,
            self,
            |u| {
                let line = format!("{} = {}", u.key, output::value_text(&u.value));
                if watching {
                    format!("{}  {line}", u.at.with_timezone(&Local).format("%H:%M:%S%.3f"))
                } else {
                    line
                }
            },
            |u| output::value_text(&u.value),
        )
    }
}

pub async fn bind(args: BindArgs, resolved: &Resolved, global: &GlobalOpts) -> Result<(), CliError> {
    let key = binding_key(&args.target, &args.name)?;
    let client = connected_client(resolved, global).await?;
    let result = run_bind(&client, &key, &args, global).await;
    client.shutdown();
    result
}

async fn run_bind(client: &Client, key: &BindingKey, args: &BindArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let mut stream = client.bind(key).await?;
    tracing::debug!(%key, "bound");

    if !args.watch && args.count.is_none() {
        let mut value = stream.current().clone();
        if value.is_null() {
            if let Ok(Some(first)) = tokio::time::timeout(FIRST_VALUE_WAIT, stream.changed()).await {
                value = first;
            }
        }
        output::print_output(&BindingUpdate::new(key, value).render(global.output, false), global.quiet);
        return Ok(());
    }

    if !stream.current().is_null() {
        let current = BindingUpdate::new(key, stream.current().clone());
        output::print_output(&current.render(global.output, true), global.quiet);
    }

    let mut updates = stream.into_stream().take(args.count.unwrap_or(usize::MAX));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            update = updates.next() => match update {
                Some(value) => {
                    let update = BindingUpdate::new(key, value);
                    output::print_output(&update.render(global.output, true), global.quiet);
                }
                None => break,
            },
        }
    }

    client.unbind(key).await?;
    Ok(())
}

// ── Exec ────────────────────────────────────────────────────────────

/// Parse a command-line argument as JSON, falling back to a plain string.
pub fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()))
}

pub async fn exec(args: ExecArgs, resolved: &Resolved, global: &GlobalOpts) -> Result<(), CliError> {
    let method = binding_key(&args.target, &args.method)?;
    let call_args: Vec<Value> = args.args.iter().map(String::as_str).map(parse_arg).collect();
    tracing::debug!(%method, args = call_args.len(), "executing");

    let client = connected_client(resolved, global).await?;
    let result = client.exec(&method, call_args).await;
    client.shutdown();
    let value = result?;

    let out = output::render_single(global.output, &value, output::value_text, output::value_text);
    output::print_output(&out, global.quiet);
    Ok(())
}

// ── Debug ───────────────────────────────────────────────────────────

fn render_event(format: OutputFormat, event: &DebugEvent) -> String {
    let format = match format {
        OutputFormat::Json => OutputFormat::JsonCompact,
        other => other,
    };
    output::render_single(
        format,
        event,
        |e| {
            format!(
                "{}  {:>5}  {}  {}",
                e.time.with_timezone(&Local).format("%H:%M:%S%.3f"),
                e.level,
                e.module,
                e.message
            )
        },
        |e| e.message.clone(),
    )
}

pub async fn debug(args: DebugArgs, resolved: &Resolved, global: &GlobalOpts) -> Result<(), CliError> {
    // Only the module instance part of the key is used.
    let target = binding_key(&args.target, "debug")?;
    let client = connected_client(resolved, global).await?;
    let result = run_debug(&client, &target, args.count, global).await;
    client.shutdown();
    result
}

async fn run_debug(
    client: &Client,
    target: &BindingKey,
    count: Option<usize>,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    let mut events = client.debug_events();
    client.debug(&target.system, &target.module, target.index).await?;

    let mut seen = 0usize;
    while count.is_none_or(|limit| seen < limit) {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => {
                    seen += 1;
                    output::print_output(&render_event(global.output, &event), global.quiet);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "debug output lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    client.ignore(&target.system, &target.module, target.index).await?;
    Ok(())
}
