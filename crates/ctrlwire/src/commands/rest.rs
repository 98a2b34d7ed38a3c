//! REST resource handlers.

use serde_json::Value;
use tabled::Tabled;

use ctrlwire_api::{ResourceClient, UpdateMethod};
use ctrlwire_core::{AuthError, Client};

use crate::cli::{GlobalOpts, RestArgs, RestCommand};
use crate::config::Resolved;
use crate::error::CliError;
use crate::output;

use super::build_client;

#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Type")]
    kind: String,
}

fn text_field(record: &Value, names: &[&str]) -> String {
    names
        .iter()
        .find_map(|name| record.get(*name).filter(|v| !v.is_null()))
        .map(output::value_text)
        .unwrap_or_default()
}

fn resource_row(record: &Value) -> ResourceRow {
    ResourceRow {
        id: text_field(record, &["id", "_id"]),
        name: text_field(record, &["name", "title"]),
        kind: text_field(record, &["type", "kind", "class_name"]),
    }
}

/// Parse `key=value` query parameters.
fn parse_params(raw: &[String]) -> Result<Vec<(&str, String)>, CliError> {
    raw.iter()
        .map(|p| {
            p.split_once('=')
                .map(|(k, v)| (k, v.to_owned()))
                .ok_or_else(|| CliError::Validation {
                    field: "param".into(),
                    reason: format!("expected KEY=VALUE, got '{p}'"),
                })
        })
        .collect()
}

fn print_record(global: &GlobalOpts, record: &Value) {
    let out = output::render_single(
        global.output,
        record,
        |r| serde_json::to_string_pretty(r).unwrap_or_else(|_| r.to_string()),
        |r| text_field(r, &["id", "_id"]),
    );
    output::print_output(&out, global.quiet);
}

/// Set up credentials and obtain a token for REST calls.
async fn authorised(resolved: &Resolved, global: &GlobalOpts) -> Result<(Client, ResourceClient), CliError> {
    if resolved.is_mock() {
        return Err(CliError::Validation {
            field: "mock".into(),
            reason: "REST commands need a live platform".into(),
        });
    }
    let client = build_client(resolved, global);
    client.auth().setup(resolved.auth.clone()).await?;
    if let Err(e) = client.auth().authorise(None).await {
        client.shutdown();
        return Err(match e {
            AuthError::LoginRequired { .. } => CliError::NotLoggedIn {
                profile: resolved.profile_name.clone(),
            },
            other => other.into(),
        });
    }
    let rest = client.rest()?;
    Ok((client, rest))
}

pub async fn handle(args: RestArgs, resolved: &Resolved, global: &GlobalOpts) -> Result<(), CliError> {
    let (client, rest) = authorised(resolved, global).await?;
    let result = run(args.command, &rest, global).await;
    client.shutdown();
    result
}

async fn run(command: RestCommand, rest: &ResourceClient, global: &GlobalOpts) -> Result<(), CliError> {
    match command {
        RestCommand::Query { path, params, all } => {
            let params = parse_params(&params)?;
            let records: Vec<Value> = if all {
                rest.query_all(&path, &params).await?
            } else {
                let page = rest.query(&path, &params).await?;
                if let Some(total) = page.total {
                    tracing::debug!(total, returned = page.data.len(), "page fetched");
                }
                page.data
            };
            let out = output::render_list(global.output, &records, resource_row, |r| text_field(r, &["id", "_id"]));
            output::print_output(&out, global.quiet);
        }
        RestCommand::Show { path, id } => {
            let record: Value = rest.show(&path, &id, &[]).await?;
            print_record(global, &record);
        }
        RestCommand::Create { path, data } => {
            let body: Value = serde_json::from_str(&data)?;
            let record: Value = rest.create(&path, &body).await?;
            print_record(global, &record);
        }
        RestCommand::Update { path, id, data, put } => {
            let body: Value = serde_json::from_str(&data)?;
            let method = if put { UpdateMethod::Put } else { UpdateMethod::Patch };
            let record: Value = rest.update(&path, &id, &body, method).await?;
            print_record(global, &record);
        }
        RestCommand::Task { path, id, task, args } => {
            let args: Option<Value> = args.as_deref().map(serde_json::from_str).transpose()?;
            let result: Value = rest.task(&path, &id, &task, args.as_ref()).await?;
            print_record(global, &result);
        }
        RestCommand::Remove { path, id } => {
            rest.remove(&path, &id).await?;
            if !global.quiet {
                eprintln!("✓ Removed {path}/{id}");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use serde_json::json;

    use super::*;

    #[test]
    fn params_split_on_first_equals() {
        let raw = vec!["q=name=lobby".to_owned(), "limit=5".to_owned()];
        let params = parse_params(&raw).unwrap();
        assert_eq!(params, vec![("q", "name=lobby".to_owned()), ("limit", "5".to_owned())]);
        assert!(parse_params(&["oops".to_owned()]).is_err());
    }

    #[test]
    fn rows_fall_back_across_field_names() {
        let row = resource_row(&json!({ "_id": "z-1", "title": "Lobby", "kind": "zone" }));
        assert_eq!(row.id, "z-1");
        assert_eq!(row.name, "Lobby");
        assert_eq!(row.kind, "zone");

        let sparse = resource_row(&json!({ "id": 7 }));
        assert_eq!(sparse.id, "7");
        assert_eq!(sparse.name, "");
    }
}
