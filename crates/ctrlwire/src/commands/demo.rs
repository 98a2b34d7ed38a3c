//! Guided walk through bind and exec against the simulated backend.

use std::time::Duration;

use owo_colors::OwoColorize;
use serde_json::Value;

use ctrlwire_core::{BindingKey, BindingStream, Client};

use crate::cli::GlobalOpts;
use crate::config::mock_resolved;
use crate::error::CliError;
use crate::output;

use super::{DEMO_SYSTEM, connected_client};

/// Quiet period after which a binding is considered settled.
const SETTLE: Duration = Duration::from_millis(200);

pub async fn run(level: u32, global: &GlobalOpts) -> Result<(), CliError> {
    let resolved = mock_resolved()?;
    let client = connected_client(&resolved, global).await?;
    let result = walk(&client, level, global).await;
    client.shutdown();
    result
}

async fn walk(client: &Client, level: u32, global: &GlobalOpts) -> Result<(), CliError> {
    let power = BindingKey::new(DEMO_SYSTEM, "Light", 1, "power");
    let brightness = BindingKey::new(DEMO_SYSTEM, "Light", 1, "level");

    let mut power_stream = client.bind(&power).await?;
    let mut level_stream = client.bind(&brightness).await?;
    show(global, &power, &settle(&mut power_stream).await);
    show(global, &brightness, &settle(&mut level_stream).await);

    let toggle = BindingKey::new(DEMO_SYSTEM, "Light", 1, "toggle");
    let result = client.exec(&toggle, Vec::new()).await?;
    step(global, "toggle()", &result);
    show(global, &power, &settle(&mut power_stream).await);

    // The `level` method shares its name with the variable it sets.
    let result = client.exec(&brightness, vec![Value::from(level)]).await?;
    step(global, &format!("level({level})"), &result);
    show(global, &brightness, &settle(&mut level_stream).await);

    client.unbind(&power).await?;
    client.unbind(&brightness).await?;
    Ok(())
}

/// Drain notifications until the binding goes quiet and return its value.
async fn settle(stream: &mut BindingStream) -> Value {
    while let Ok(Some(_)) = tokio::time::timeout(SETTLE, stream.changed()).await {}
    stream.current().clone()
}

fn show(global: &GlobalOpts, key: &BindingKey, value: &Value) {
    output::print_output(&format!("{key} = {}", output::value_text(value)), global.quiet);
}

fn step(global: &GlobalOpts, call: &str, result: &Value) {
    let line = format!("{} {call} -> {}", "▶".cyan(), output::value_text(result));
    output::print_output(&line, global.quiet);
}
