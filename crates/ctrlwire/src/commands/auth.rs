//! Authority, login, logout and token handlers.
//!
//! These drive the credential manager directly and never open the
//! control channel.

use std::io::IsTerminal;

use dialoguer::Input;
use owo_colors::OwoColorize;
use serde::Serialize;
use url::Url;

use ctrlwire_core::{AuthError, Client};

use crate::cli::{GlobalOpts, LoginArgs};
use crate::config::Resolved;
use crate::error::{CliError, prompt_err};
use crate::output;

use super::build_client;

/// A client whose credential manager is configured, without starting the
/// initial authorization attempt.
async fn auth_client(resolved: &Resolved, global: &GlobalOpts) -> Result<Client, CliError> {
    let client = build_client(resolved, global);
    client.auth().setup(resolved.auth.clone()).await?;
    Ok(client)
}

// ── Authority ───────────────────────────────────────────────────────

#[derive(Serialize)]
struct AuthorityView<'a> {
    profile: &'a str,
    host: String,
    #[serde(flatten)]
    authority: &'a ctrlwire_core::Authority,
    logged_in: bool,
}

pub async fn authority(resolved: &Resolved, global: &GlobalOpts) -> Result<(), CliError> {
    let client = auth_client(resolved, global).await?;
    let authority = client.auth().authority().ok_or(AuthError::AuthorityNotLoaded)?;
    let view = AuthorityView {
        profile: &resolved.profile_name,
        host: resolved.auth.host.to_string(),
        authority: &authority,
        logged_in: client.auth().has_token(),
    };

    let out = output::render_single(
        global.output,
        &view,
        |v| {
            output::detail(&[
                ("profile", v.profile.to_owned()),
                ("host", v.host.clone()),
                ("id", v.authority.id.clone()),
                ("name", v.authority.name.clone()),
                ("domain", v.authority.domain.clone()),
                ("version", v.authority.version.clone()),
                ("login", v.authority.login_url.clone()),
                ("logout", v.authority.logout_url.clone()),
                ("logged in", v.logged_in.to_string()),
            ])
        },
        |v| v.authority.version.clone(),
    );
    output::print_output(&out, global.quiet);
    client.shutdown();
    Ok(())
}

// ── Login / logout ──────────────────────────────────────────────────

pub async fn login(args: LoginArgs, resolved: &Resolved, global: &GlobalOpts) -> Result<(), CliError> {
    if resolved.is_mock() {
        if !global.quiet {
            eprintln!("Mock profiles need no login.");
        }
        return Ok(());
    }

    let client = auth_client(resolved, global).await?;
    let auth = client.auth();

    let result = if let Some(ref callback) = args.callback {
        let url = parse_callback(callback)?;
        auth.handle_callback(&url).await
    } else {
        match auth.authorise(args.state.clone()).await {
            Err(AuthError::LoginRequired { .. }) if std::io::stdin().is_terminal() => {
                let pasted: String = Input::new()
                    .with_prompt("Paste the URL your browser was redirected to")
                    .interact_text()
                    .map_err(prompt_err)?;
                auth.handle_callback(&parse_callback(pasted.trim())?).await
            }
            other => other,
        }
    };
    client.shutdown();
    result?;

    if !global.quiet {
        eprintln!(
            "{} Logged in to profile '{}'",
            "✓".green(),
            resolved.profile_name
        );
    }
    Ok(())
}

fn parse_callback(raw: &str) -> Result<Url, CliError> {
    Url::parse(raw).map_err(|e| CliError::Validation {
        field: "callback".into(),
        reason: format!("not a URL: {e}"),
    })
}

pub async fn logout(resolved: &Resolved, global: &GlobalOpts) -> Result<(), CliError> {
    let client = auth_client(resolved, global).await?;
    let result = client.auth().logout().await;
    client.shutdown();
    result?;

    if !global.quiet {
        eprintln!("{} Logged out of profile '{}'", "✓".green(), resolved.profile_name);
    }
    Ok(())
}

// ── Token ───────────────────────────────────────────────────────────

/// Print the access token, obtaining one first when the grant allows it
/// without interaction.
pub async fn token(resolved: &Resolved, global: &GlobalOpts) -> Result<(), CliError> {
    if resolved.is_mock() {
        if !global.quiet {
            eprintln!("Mock profiles have no access token.");
        }
        return Ok(());
    }

    let client = auth_client(resolved, global).await?;
    let result = client.auth().authorise(None).await;
    client.shutdown();
    let token = result.map_err(|e| match e {
        AuthError::LoginRequired { .. } => CliError::NotLoggedIn {
            profile: resolved.profile_name.clone(),
        },
        other => other.into(),
    })?;

    output::print_output(&token, global.quiet);
    Ok(())
}
