//! Command dispatch: bridges CLI args -> core client -> output formatting.

pub mod auth;
pub mod channel;
pub mod config_cmd;
pub mod demo;
pub mod rest;

use std::sync::Arc;

use ctrlwire_core::mock::demo_light;
use ctrlwire_core::{BindingKey, Client, SimulatedSystem};

use crate::cli::{Command, GlobalOpts, ModuleTarget};
use crate::config::Resolved;
use crate::error::CliError;
use crate::navigator::TerminalNavigator;

/// System id of the simulated installation used by `--mock`.
pub const DEMO_SYSTEM: &str = "Demo";

/// Dispatch a platform-bound command to the appropriate handler.
pub async fn dispatch(cmd: Command, resolved: &Resolved, global: &GlobalOpts) -> Result<(), CliError> {
    match cmd {
        Command::Authority => auth::authority(resolved, global).await,
        Command::Login(args) => auth::login(args, resolved, global).await,
        Command::Logout => auth::logout(resolved, global).await,
        Command::Token => auth::token(resolved, global).await,
        Command::Bind(args) => channel::bind(args, resolved, global).await,
        Command::Exec(args) => channel::exec(args, resolved, global).await,
        Command::Debug(args) => channel::debug(args, resolved, global).await,
        Command::Rest(args) => rest::handle(args, resolved, global).await,
        // Demo, Config and Completions are handled before dispatch
        Command::Demo(_) | Command::Config(_) | Command::Completions(_) => unreachable!(),
    }
}

// ── Shared helpers ──────────────────────────────────────────────────

/// Build a client wired to the terminal. Mock clients get the demo system.
pub fn build_client(resolved: &Resolved, global: &GlobalOpts) -> Client {
    let client = Client::builder(resolved.client.clone())
        .navigator(Arc::new(TerminalNavigator { quiet: global.quiet }))
        .build();
    if resolved.is_mock() {
        client
            .backend()
            .register(DEMO_SYSTEM, SimulatedSystem::new().with_module("Light", demo_light()));
    }
    client
}

/// Build and set up a client for control-channel work.
///
/// Live profiles must already hold a token; the channel would otherwise
/// retry the credential gate for minutes before giving up.
pub async fn connected_client(resolved: &Resolved, global: &GlobalOpts) -> Result<Client, CliError> {
    let client = build_client(resolved, global);
    client.setup(resolved.auth.clone()).await?;
    if !resolved.is_mock() && !client.auth().has_token() {
        client.shutdown();
        return Err(CliError::NotLoggedIn {
            profile: resolved.profile_name.clone(),
        });
    }
    Ok(client)
}

/// Build the binding key for `name` on a module target.
///
/// `Display_2` addresses the second Display instance; `--index` wins
/// over the suffix.
pub fn binding_key(target: &ModuleTarget, name: &str) -> Result<BindingKey, CliError> {
    let (module, suffix) = match target.module.rsplit_once('_') {
        Some((module, index)) if !module.is_empty() && !index.is_empty() && index.chars().all(|c| c.is_ascii_digit()) => {
            let index = index.parse::<u32>().map_err(|e| CliError::Validation {
                field: "module".into(),
                reason: e.to_string(),
            })?;
            (module, Some(index))
        }
        _ => (target.module.as_str(), None),
    };
    let index = target.index.or(suffix).unwrap_or(1);
    if index == 0 {
        return Err(CliError::Validation {
            field: "index".into(),
            reason: "module indexes start at 1".into(),
        });
    }
    Ok(BindingKey::new(target.system.as_str(), module, index, name))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn target(module: &str, index: Option<u32>) -> ModuleTarget {
        ModuleTarget {
            system: "sys-1".into(),
            module: module.into(),
            index,
        }
    }

    #[test]
    fn module_suffix_selects_the_index() {
        let key = binding_key(&target("Display_2", None), "power").unwrap();
        assert_eq!(key.to_string(), "sys-1|Display_2|power");

        let key = binding_key(&target("Display", None), "power").unwrap();
        assert_eq!(key.index, 1);
    }

    #[test]
    fn explicit_index_wins() {
        let key = binding_key(&target("Display_2", Some(3)), "power").unwrap();
        assert_eq!(key.module, "Display");
        assert_eq!(key.index, 3);
    }

    #[test]
    fn non_numeric_suffix_is_part_of_the_name() {
        let key = binding_key(&target("Video_Switcher", None), "input").unwrap();
        assert_eq!(key.module, "Video_Switcher");
        assert_eq!(key.index, 1);
    }

    #[test]
    fn zero_index_is_rejected() {
        assert!(matches!(
            binding_key(&target("Display", Some(0)), "power"),
            Err(CliError::Validation { .. })
        ));
    }
}
