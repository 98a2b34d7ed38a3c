// ── Host navigation hooks ──
//
// Browser-style side effects the credential manager and the supervisor need
// from their host: sending the user to a login/logout page, performing a
// silent authorize round-trip, and reloading the application after the
// connection supervisor gives up.

use futures_util::future::BoxFuture;
use url::Url;

use crate::error::AuthError;

pub trait Navigator: Send + Sync {
    /// Send the user to `url` (login page, logout page).
    fn navigate(&self, url: &Url);

    /// Follow `authorize_url` without user interaction and resolve with the
    /// redirect URL it lands on.
    fn authorize_silently(&self, authorize_url: Url) -> BoxFuture<'static, Result<Url, AuthError>>;

    /// Restart the host application.
    fn reload(&self);
}

/// Navigator for hosts without a browser: navigation is logged and silent
/// authorization is unsupported.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeadlessNavigator;

impl Navigator for HeadlessNavigator {
    fn navigate(&self, url: &Url) {
        tracing::info!(%url, "Navigation requested");
    }

    fn authorize_silently(&self, authorize_url: Url) -> BoxFuture<'static, Result<Url, AuthError>> {
        let login_url = authorize_url.to_string();
        Box::pin(async move { Err(AuthError::LoginRequired { login_url }) })
    }

    fn reload(&self) {
        tracing::warn!("Reload requested by connection supervisor");
    }
}
