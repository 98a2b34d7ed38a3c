// Auth endpoint client
//
// Stateless HTTP calls against the platform's authorization surface: the
// authority document, the token endpoint (password, authorization-code and
// refresh grants), token revocation and authorize-URL construction. Token
// storage and flow decisions live in ctrlwire-core.

use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::Error;
use crate::transport::TransportConfig;

/// Placeholder in an authority's `login_url` replaced by the encoded
/// redirect target.
pub const URL_PLACEHOLDER: &str = "{{url}}";

// ── Models ──────────────────────────────────────────────────────────

/// Domain authority returned by `GET /auth/authority`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Authority {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub domain: String,
    /// Platform version, e.g. `"2.3.1"`.
    #[serde(default)]
    pub version: String,
    /// `true` when the browser already holds a platform session.
    #[serde(default)]
    pub session: bool,
    #[serde(default)]
    pub login_url: String,
    #[serde(default)]
    pub logout_url: String,
    #[serde(default)]
    pub production: bool,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl Authority {
    /// Major component of [`version`](Self::version), if it parses.
    pub fn major_version(&self) -> Option<u32> {
        self.version
            .trim_start_matches(['v', 'V'])
            .split('.')
            .next()
            .and_then(|major| major.parse().ok())
    }

    /// Login URL with [`URL_PLACEHOLDER`] replaced by `target`.
    pub fn login_url_for(&self, target: &Url) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(target.as_str().as_bytes()).collect();
        self.login_url.replace(URL_PLACEHOLDER, &encoded)
    }
}

/// Token endpoint response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime in seconds from issue.
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub token_type: Option<String>,
}

/// The grant presented to the token endpoint.
#[derive(Debug, Clone, Copy)]
pub enum TokenGrant<'a> {
    Password {
        username: &'a str,
        password: &'a SecretString,
        client_secret: Option<&'a SecretString>,
        scope: &'a str,
    },
    AuthorizationCode {
        code: &'a str,
        code_verifier: Option<&'a str>,
    },
    RefreshToken {
        refresh_token: &'a str,
    },
}

impl TokenGrant<'_> {
    fn grant_type(&self) -> &'static str {
        match self {
            Self::Password { .. } => "password",
            Self::AuthorizationCode { .. } => "authorization_code",
            Self::RefreshToken { .. } => "refresh_token",
        }
    }
}

/// Query parameters of an authorize-endpoint redirect.
#[derive(Debug, Clone, Copy)]
pub struct AuthorizeRequest<'a> {
    pub client_id: &'a str,
    pub redirect_uri: &'a str,
    /// `"code"` or `"token"`.
    pub response_type: &'a str,
    pub scope: &'a str,
    pub state: &'a str,
    /// PKCE S256 challenge, only for `response_type = "code"`.
    pub code_challenge: Option<&'a str>,
}

// ── Client ──────────────────────────────────────────────────────────

/// HTTP client for the authorization endpoints of one platform host.
#[derive(Debug, Clone)]
pub struct AuthClient {
    http: reqwest::Client,
    base_url: Url,
}

impl AuthClient {
    /// Create a client against `base_url` (the platform host root).
    pub fn new(base_url: Url, transport: &TransportConfig) -> Result<Self, Error> {
        Ok(Self {
            http: transport.build_client()?,
            base_url,
        })
    }

    /// Create a client with a pre-built `reqwest::Client`.
    pub fn with_client(http: reqwest::Client, base_url: Url) -> Self {
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Fetch the domain authority.
    pub async fn authority(&self) -> Result<Authority, Error> {
        let url = self.base_url.join("/auth/authority")?;
        debug!("GET {}", url);

        let resp = self.http.get(url).send().await?;
        parse_json(resp).await
    }

    /// Exchange a grant for tokens at `token_uri`.
    pub async fn exchange(
        &self,
        token_uri: &str,
        client_id: &str,
        redirect_uri: &str,
        grant: &TokenGrant<'_>,
    ) -> Result<TokenResponse, Error> {
        let url = self.base_url.join(token_uri)?;
        debug!(grant_type = grant.grant_type(), "POST {}", url);

        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", grant.grant_type()),
            ("client_id", client_id),
            ("redirect_uri", redirect_uri),
        ];
        match *grant {
            TokenGrant::Password {
                username,
                password,
                client_secret,
                scope,
            } => {
                form.push(("username", username));
                form.push(("password", password.expose_secret()));
                form.push(("scope", scope));
                if let Some(secret) = client_secret {
                    form.push(("client_secret", secret.expose_secret()));
                }
            }
            TokenGrant::AuthorizationCode {
                code,
                code_verifier,
            } => {
                form.push(("code", code));
                if let Some(verifier) = code_verifier {
                    form.push(("code_verifier", verifier));
                }
            }
            TokenGrant::RefreshToken { refresh_token } => {
                form.push(("refresh_token", refresh_token));
            }
        }

        let resp = self.http.post(url).form(&form).send().await?;
        parse_json(resp).await
    }

    /// Revoke `token` with `POST <token_uri>?token=<token>`.
    pub async fn revoke(&self, token_uri: &str, token: &str) -> Result<(), Error> {
        let mut url = self.base_url.join(token_uri)?;
        url.query_pairs_mut().append_pair("token", token);
        debug!(path = url.path(), "POST revoke");

        let resp = self.http.post(url).send().await?;
        check_status(resp).await.map(|_| ())
    }

    /// Build the authorize-endpoint URL for a browser or silent redirect.
    pub fn authorize_url(&self, auth_uri: &str, request: &AuthorizeRequest<'_>) -> Result<Url, Error> {
        let mut url = self.base_url.join(auth_uri)?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("response_type", request.response_type)
                .append_pair("client_id", request.client_id)
                .append_pair("redirect_uri", request.redirect_uri)
                .append_pair("scope", request.scope)
                .append_pair("state", request.state);
            if let Some(challenge) = request.code_challenge {
                pairs
                    .append_pair("code_challenge", challenge)
                    .append_pair("code_challenge_method", "S256");
            }
        }
        Ok(url)
    }
}

// ── Response helpers ────────────────────────────────────────────────

pub(crate) async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, Error> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let url = resp.url().path().to_owned();
    let body = resp.text().await.unwrap_or_default();
    Err(Error::Http {
        status: status.as_u16(),
        url,
        body,
    })
}

pub(crate) async fn parse_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, Error> {
    let resp = check_status(resp).await?;
    let body = resp.text().await?;
    serde_json::from_str(&body).map_err(|e| Error::Deserialization {
        message: e.to_string(),
        body,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn major_version_parses_leading_component() {
        let mut authority = Authority {
            version: "1.9.4".into(),
            ..Authority::default()
        };
        assert_eq!(authority.major_version(), Some(1));

        authority.version = "v2".into();
        assert_eq!(authority.major_version(), Some(2));

        authority.version = String::new();
        assert_eq!(authority.major_version(), None);
    }

    #[test]
    fn login_url_placeholder_is_encoded() {
        let authority = Authority {
            login_url: "/login?continue={{url}}".into(),
            ..Authority::default()
        };
        let target = Url::parse("https://host/auth/oauth/authorize?state=a;b").unwrap();
        assert_eq!(
            authority.login_url_for(&target),
            "/login?continue=https%3A%2F%2Fhost%2Fauth%2Foauth%2Fauthorize%3Fstate%3Da%3Bb"
        );
    }

    #[test]
    fn authorize_url_includes_pkce_challenge() {
        let client = AuthClient::with_client(
            reqwest::Client::new(),
            Url::parse("https://platform.example").unwrap(),
        );
        let url = client
            .authorize_url(
                "/auth/oauth/authorize",
                &AuthorizeRequest {
                    client_id: "cid",
                    redirect_uri: "https://app.example/oauth",
                    response_type: "code",
                    scope: "public",
                    state: "nonce;",
                    code_challenge: Some("challenge"),
                },
            )
            .unwrap();

        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(url.path(), "/auth/oauth/authorize");
        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["state"], "nonce;");
        assert_eq!(pairs["code_challenge_method"], "S256");
    }
}
