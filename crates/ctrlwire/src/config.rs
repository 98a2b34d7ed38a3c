//! CLI configuration: thin wrapper around `ctrlwire_config` shared types.
//!
//! Adds resolution that respects `GlobalOpts` flag overrides
//! (--host, --mock, --insecure, ...) and prompts for missing passwords
//! when attached to a terminal.

use std::io::IsTerminal;

use dialoguer::Input;

use ctrlwire_core::{AuthOptions, ClientConfig};

use crate::cli::GlobalOpts;
use crate::error::{CliError, prompt_err};

// ── Re-exports from shared crate ────────────────────────────────────

pub use ctrlwire_config::{
    Config, ConfigError, Profile, config_path, load_config_or_default, save_config, store_password,
};

/// Host used by `--mock` when no profile names one.
const MOCK_HOST: &str = "http://localhost:8080";

/// Everything a command needs to build a client.
#[derive(Debug)]
pub struct Resolved {
    pub profile_name: String,
    pub client: ClientConfig,
    pub auth: AuthOptions,
}

impl Resolved {
    pub fn is_mock(&self) -> bool {
        self.auth.mock
    }
}

// ── CLI-specific helpers ────────────────────────────────────────────

/// Resolve the active profile name from CLI flags and config.
pub fn active_profile_name(global: &GlobalOpts, config: &Config) -> String {
    global
        .profile
        .clone()
        .or_else(|| config.default_profile.clone())
        .unwrap_or_else(|| "default".into())
}

/// Select the active profile and apply flag overrides.
pub fn effective_profile(global: &GlobalOpts, config: &Config) -> Result<(String, Profile), CliError> {
    let name = active_profile_name(global, config);

    let mut profile = match (config.profiles.get(&name), &global.host) {
        (Some(profile), _) => profile.clone(),
        (None, Some(host)) => Profile::new(host.clone()),
        (None, None) if global.mock => Profile::new(MOCK_HOST),
        (None, None) if global.profile.is_some() => {
            let mut available: Vec<_> = config.profiles.keys().cloned().collect();
            available.sort();
            return Err(CliError::ProfileNotFound {
                name,
                available: available.join(", "),
            });
        }
        (None, None) => {
            return Err(CliError::NoConfig {
                path: config_path().display().to_string(),
            });
        }
    };

    if let Some(ref host) = global.host {
        profile.host.clone_from(host);
    }
    if let Some(ref username) = global.username {
        profile.username = Some(username.clone());
    }
    if global.mock {
        profile.mock = true;
    }
    // Simulated sessions never touch the credential file.
    if profile.mock {
        profile.storage = "session".into();
    }
    if global.insecure {
        profile.insecure = Some(true);
    }
    if let Some(timeout) = global.timeout {
        profile.timeout = Some(timeout);
    }
    Ok((name, profile))
}

/// Translate config + flags into client and auth options.
///
/// A password grant without resolvable credentials prompts for them when
/// stdin is a terminal.
pub fn resolve(global: &GlobalOpts) -> Result<Resolved, CliError> {
    let cfg = load_config_or_default();
    let (profile_name, profile) = effective_profile(global, &cfg)?;
    let client = ctrlwire_config::profile_to_client_config(&profile, &cfg.defaults);

    let auth = match ctrlwire_config::profile_to_auth_options(&profile, &profile_name) {
        Ok(auth) => auth,
        Err(ConfigError::NoCredentials { .. }) if std::io::stdin().is_terminal() => {
            let prompted = prompt_credentials(profile)?;
            ctrlwire_config::profile_to_auth_options(&prompted, &profile_name)?
        }
        Err(e) => return Err(e.into()),
    };

    Ok(Resolved {
        profile_name,
        client,
        auth,
    })
}

/// Options for the built-in simulated backend, ignoring any config file.
pub fn mock_resolved() -> Result<Resolved, CliError> {
    let mut profile = Profile::new(MOCK_HOST);
    profile.mock = true;
    profile.storage = "session".into();
    let client = ctrlwire_config::profile_to_client_config(&profile, &Config::default().defaults);
    let auth = ctrlwire_config::profile_to_auth_options(&profile, "mock")?;
    Ok(Resolved {
        profile_name: "mock".into(),
        client,
        auth,
    })
}

fn prompt_credentials(mut profile: Profile) -> Result<Profile, CliError> {
    if profile.username.is_none() {
        let username: String = Input::new()
            .with_prompt("Username")
            .interact_text()
            .map_err(prompt_err)?;
        profile.username = Some(username);
    }
    let password = rpassword::prompt_password("Password: ").map_err(prompt_err)?;
    if password.is_empty() {
        return Err(CliError::Validation {
            field: "password".into(),
            reason: "password cannot be empty".into(),
        });
    }
    profile.password = Some(password);
    Ok(profile)
}
