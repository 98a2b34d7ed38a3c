//! Config subcommand handlers.

use dialoguer::{Input, Select};

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts};
use crate::config::{self, Config, Profile};
use crate::error::{CliError, prompt_err};
use crate::output;

const GRANTS: &[&str] = &["auth_code", "password", "implicit"];
const VALID_KEYS: &str =
    "host, redirect_uri, scope, grant, storage, username, password_env, api_route, insecure, timeout, ca_cert, mock";

// ── Helpers ─────────────────────────────────────────────────────────

fn available_profiles(cfg: &Config) -> String {
    let mut names: Vec<_> = cfg.profiles.keys().cloned().collect();
    if names.is_empty() {
        return "(none)".into();
    }
    names.sort();
    names.join(", ")
}

fn parse_bool(field: &str, value: &str) -> Result<bool, CliError> {
    value.parse().map_err(|_| CliError::Validation {
        field: field.into(),
        reason: "must be 'true' or 'false'".into(),
    })
}

/// Apply a `config set` assignment to a profile.
fn apply_setting(profile: &mut Profile, key: &str, value: String) -> Result<(), CliError> {
    match key {
        "host" => profile.host = value,
        "redirect_uri" | "redirect-uri" => profile.redirect_uri = value,
        "scope" => profile.scope = value,
        "grant" => {
            profile.grant = value;
            profile.grant_type()?;
        }
        "storage" => {
            profile.storage = value;
            profile.storage_mode()?;
        }
        "username" => profile.username = Some(value),
        "password_env" | "password-env" => profile.password_env = Some(value),
        "api_route" | "api-route" => profile.api_route = Some(value),
        "insecure" => profile.insecure = Some(parse_bool("insecure", &value)?),
        "mock" => profile.mock = parse_bool("mock", &value)?,
        "timeout" => {
            profile.timeout = Some(value.parse().map_err(|_| CliError::Validation {
                field: "timeout".into(),
                reason: "must be a number (seconds)".into(),
            })?);
        }
        "ca_cert" | "ca-cert" => profile.ca_cert = Some(value.into()),
        other => {
            return Err(CliError::Validation {
                field: other.into(),
                reason: format!("unknown config key '{other}'. Valid keys: {VALID_KEYS}"),
            });
        }
    }
    Ok(())
}

/// A copy of the config that is safe to print.
fn redacted(cfg: &Config) -> Config {
    let mut cfg = cfg.clone();
    for profile in cfg.profiles.values_mut() {
        if profile.password.is_some() {
            profile.password = Some("********".into());
        }
        if profile.client_secret.is_some() {
            profile.client_secret = Some("********".into());
        }
    }
    cfg
}

// ── Handler ─────────────────────────────────────────────────────────

pub fn handle(args: ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Init => init(),

        ConfigCommand::Show => {
            let cfg = redacted(&config::load_config_or_default());
            let out = output::render_single(global.output, &cfg, |c| format!("{c:#?}"), |_| "config".into());
            output::print_output(&out, global.quiet);
            Ok(())
        }

        ConfigCommand::Set { key, value } => {
            let mut cfg = config::load_config_or_default();
            let profile_name = config::active_profile_name(global, &cfg);
            let profile = cfg
                .profiles
                .entry(profile_name.clone())
                .or_insert_with(|| Profile::new(String::new()));
            apply_setting(profile, &key, value)?;

            config::save_config(&cfg)?;
            if !global.quiet {
                eprintln!("✓ Set {key} on profile '{profile_name}'");
            }
            Ok(())
        }

        ConfigCommand::Profiles => {
            let cfg = config::load_config_or_default();
            let default = cfg.default_profile.as_deref().unwrap_or("default");
            if cfg.profiles.is_empty() {
                eprintln!("No profiles configured. Run: ctrlwire config init");
                return Ok(());
            }
            let mut names: Vec<_> = cfg.profiles.keys().collect();
            names.sort();
            for name in names {
                let marker = if name == default { " *" } else { "" };
                println!("{name}{marker}");
            }
            Ok(())
        }

        ConfigCommand::Use { name } => {
            let mut cfg = config::load_config_or_default();
            if !cfg.profiles.contains_key(&name) {
                return Err(CliError::ProfileNotFound {
                    available: available_profiles(&cfg),
                    name,
                });
            }
            cfg.default_profile = Some(name.clone());
            config::save_config(&cfg)?;
            eprintln!("✓ Default profile set to '{name}'");
            Ok(())
        }

        ConfigCommand::SetPassword => {
            let cfg = config::load_config_or_default();
            let profile_name = config::active_profile_name(global, &cfg);
            if !cfg.profiles.contains_key(&profile_name) {
                return Err(CliError::ProfileNotFound {
                    available: available_profiles(&cfg),
                    name: profile_name,
                });
            }

            let secret = rpassword::prompt_password("Password: ").map_err(prompt_err)?;
            if secret.is_empty() {
                return Err(CliError::Validation {
                    field: "password".into(),
                    reason: "value cannot be empty".into(),
                });
            }
            config::store_password(&profile_name, &secret)?;
            eprintln!("✓ Password stored in system keyring for profile '{profile_name}'");
            Ok(())
        }
    }
}

// ── Init: interactive wizard ────────────────────────────────────────

fn init() -> Result<(), CliError> {
    let config_path = config::config_path();
    eprintln!("ctrlwire configuration wizard");
    eprintln!("   Config path: {}\n", config_path.display());

    let profile_name: String = Input::new()
        .with_prompt("Profile name")
        .default("default".into())
        .interact_text()
        .map_err(prompt_err)?;

    let host: String = Input::new()
        .with_prompt("Platform URL")
        .default("https://bms.example.com".into())
        .interact_text()
        .map_err(prompt_err)?;

    let mut profile = Profile::new(host);
    profile.host_url()?;

    let grant = Select::new()
        .with_prompt("Sign-in method")
        .items(&["Browser login (auth code)", "Username/Password", "Browser login (implicit)"])
        .default(0)
        .interact()
        .map_err(prompt_err)?;
    profile.grant = GRANTS.get(grant).copied().unwrap_or("auth_code").into();

    if profile.grant == "password" {
        let user: String = Input::new()
            .with_prompt("Username")
            .interact_text()
            .map_err(prompt_err)?;
        let pass = rpassword::prompt_password("Password: ").map_err(prompt_err)?;
        if user.is_empty() || pass.is_empty() {
            return Err(CliError::Validation {
                field: "credentials".into(),
                reason: "username and password cannot be empty".into(),
            });
        }
        profile.username = Some(user);

        let store = Select::new()
            .with_prompt("Where to store the password?")
            .items(&["Store in system keyring (recommended)", "Save to config file (plaintext)"])
            .default(0)
            .interact()
            .map_err(prompt_err)?;
        if store == 0 {
            config::store_password(&profile_name, &pass)?;
            eprintln!("   ✓ Password stored in system keyring");
        } else {
            profile.password = Some(pass);
        }
    } else {
        profile.redirect_uri = Input::new()
            .with_prompt("Redirect URI")
            .default(profile.redirect_uri.clone())
            .interact_text()
            .map_err(prompt_err)?;
    }

    let mut cfg = config::load_config_or_default();
    cfg.profiles.insert(profile_name.clone(), profile);
    cfg.default_profile = Some(profile_name.clone());
    config::save_config(&cfg)?;

    eprintln!("\n✓ Configuration written to {}", config_path.display());
    eprintln!("  Active profile: {profile_name}");
    eprintln!("\n  Test it: ctrlwire authority");
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn settings_update_the_profile() {
        let mut profile = Profile::new("https://bms.test");
        apply_setting(&mut profile, "grant", "password".into()).unwrap();
        apply_setting(&mut profile, "timeout", "12".into()).unwrap();
        apply_setting(&mut profile, "api-route", "/api/engine/v3".into()).unwrap();
        apply_setting(&mut profile, "mock", "true".into()).unwrap();

        assert_eq!(profile.grant, "password");
        assert_eq!(profile.timeout, Some(12));
        assert_eq!(profile.api_route.as_deref(), Some("/api/engine/v3"));
        assert!(profile.mock);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let mut profile = Profile::new("https://bms.test");
        assert!(apply_setting(&mut profile, "grant", "magic".into()).is_err());
        assert!(apply_setting(&mut profile, "timeout", "soon".into()).is_err());
        assert!(matches!(
            apply_setting(&mut profile, "colour", "blue".into()),
            Err(CliError::Validation { field, .. }) if field == "colour"
        ));
    }

    #[test]
    fn secrets_are_masked_for_display() {
        let mut profile = Profile::new("https://bms.test");
        profile.password = Some("hunter2".into());
        let mut cfg = Config::default();
        cfg.profiles.insert("default".into(), profile);

        let shown = redacted(&cfg);
        assert_eq!(shown.profiles["default"].password.as_deref(), Some("********"));
        assert!(shown.profiles["default"].client_secret.is_none());
    }
}
