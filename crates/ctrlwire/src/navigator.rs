//! Navigator for terminal sessions.
//!
//! There is no browser to drive: login and logout pages are printed for the
//! user to open, and silent authorization is never possible.

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use owo_colors::OwoColorize;
use url::Url;

use ctrlwire_core::{AuthError, Navigator};

#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalNavigator {
    pub quiet: bool,
}

impl Navigator for TerminalNavigator {
    fn navigate(&self, url: &Url) {
        tracing::debug!(%url, "navigation requested");
        if !self.quiet {
            eprintln!("Open this URL in your browser:\n  {}", url.as_str().cyan());
        }
    }

    fn authorize_silently(&self, authorize_url: Url) -> BoxFuture<'static, Result<Url, AuthError>> {
        let login_url = authorize_url.to_string();
        async move { Err(AuthError::LoginRequired { login_url }) }.boxed()
    }

    fn reload(&self) {
        tracing::warn!("connection supervisor gave up; restart the command to retry");
    }
}
