// REST resource client
//
// One generic client for every engine resource (systems, zones, modules,
// drivers, ...). Callers name the collection path; this module handles the
// versioned base route, bearer auth, pagination headers and the uniform
// query/show/create/update/remove/task verbs.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::auth::check_status;
use crate::error::Error;
use crate::transport::TransportConfig;

/// Default versioned API route.
pub const DEFAULT_API_ROUTE: &str = "/api/engine/v2";

const TOTAL_COUNT_HEADER: &str = "x-total-count";

/// Supplies the current bearer token for each request.
pub trait TokenSource: Send + Sync {
    /// The current access token, or `""` when none is held.
    fn token(&self) -> String;
}

impl<F> TokenSource for F
where
    F: Fn() -> String + Send + Sync,
{
    fn token(&self) -> String {
        self()
    }
}

/// One page of a collection query.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    /// Total matching records, from `x-total-count`.
    pub total: Option<u64>,
    /// Absolute URL of the next page, from the `Link` header.
    pub next: Option<Url>,
    pub data: Vec<T>,
}

/// HTTP verb used by [`ResourceClient::update`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpdateMethod {
    #[default]
    Patch,
    Put,
}

/// Generic CRUD client for engine resources.
#[derive(Clone)]
pub struct ResourceClient {
    http: reqwest::Client,
    base_url: Url,
    route: String,
    tokens: Arc<dyn TokenSource>,
}

impl fmt::Debug for ResourceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceClient")
            .field("base_url", &self.base_url.as_str())
            .field("route", &self.route)
            .finish_non_exhaustive()
    }
}

impl ResourceClient {
    pub fn new(
        base_url: Url,
        route: impl Into<String>,
        tokens: Arc<dyn TokenSource>,
        transport: &TransportConfig,
    ) -> Result<Self, Error> {
        Ok(Self::with_client(transport.build_client()?, base_url, route, tokens))
    }

    pub fn with_client(
        http: reqwest::Client,
        base_url: Url,
        route: impl Into<String>,
        tokens: Arc<dyn TokenSource>,
    ) -> Self {
        Self {
            http,
            base_url,
            route: route.into().trim_end_matches('/').to_owned(),
            tokens,
        }
    }

    // ── URL builders ────────────────────────────────────────────────

    /// `{base}{route}/{path}[/{id}[/{task}]]`
    fn resource_url(&self, path: &str, id: Option<&str>, task: Option<&str>) -> Result<Url, Error> {
        let mut full = format!("{}/{}", self.route, path.trim_matches('/'));
        for segment in [id, task].into_iter().flatten() {
            full.push('/');
            full.push_str(segment);
        }
        Ok(self.base_url.join(&full)?)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let token = self.tokens.token();
        if token.is_empty() {
            builder
        } else {
            builder.bearer_auth(token)
        }
    }

    // ── Verbs ───────────────────────────────────────────────────────

    /// `GET {path}` with query parameters, returning one page.
    pub async fn query<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<Page<T>, Error> {
        let mut url = self.resource_url(path, None, None)?;
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }
        self.fetch_page(url).await
    }

    /// Follow `next` links until the collection is exhausted.
    pub async fn query_all<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<Vec<T>, Error> {
        let mut page = self.query::<T>(path, params).await?;
        let mut all = std::mem::take(&mut page.data);
        while let Some(next) = page.next.take() {
            page = self.fetch_page(next).await?;
            all.append(&mut page.data);
        }
        Ok(all)
    }

    async fn fetch_page<T: DeserializeOwned>(&self, url: Url) -> Result<Page<T>, Error> {
        debug!("GET {}", url);
        let resp = self.authorized(self.http.get(url)).send().await?;
        let resp = check_status(resp).await?;

        let total = resp
            .headers()
            .get(TOTAL_COUNT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());
        let next = resp
            .headers()
            .get(reqwest::header::LINK)
            .and_then(|v| v.to_str().ok())
            .and_then(next_link)
            .and_then(|link| self.base_url.join(&link).ok());

        let data = parse_body(resp).await?;
        Ok(Page { total, next, data })
    }

    /// `GET {path}/{id}`
    pub async fn show<T: DeserializeOwned>(
        &self,
        path: &str,
        id: &str,
        params: &[(&str, String)],
    ) -> Result<T, Error> {
        let mut url = self.resource_url(path, Some(id), None)?;
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }
        debug!("GET {}", url);
        let resp = self.authorized(self.http.get(url)).send().await?;
        parse_body(check_status(resp).await?).await
    }

    /// `POST {path}` with a JSON body.
    pub async fn create<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, Error> {
        let url = self.resource_url(path, None, None)?;
        debug!("POST {}", url);
        let resp = self.authorized(self.http.post(url)).json(body).send().await?;
        parse_body(check_status(resp).await?).await
    }

    /// `PATCH {path}/{id}` (or `PUT` when requested) with a JSON body.
    pub async fn update<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        id: &str,
        body: &B,
        method: UpdateMethod,
    ) -> Result<T, Error> {
        let url = self.resource_url(path, Some(id), None)?;
        let builder = match method {
            UpdateMethod::Patch => {
                debug!("PATCH {}", url);
                self.http.patch(url)
            }
            UpdateMethod::Put => {
                debug!("PUT {}", url);
                self.http.put(url)
            }
        };
        let resp = self.authorized(builder).json(body).send().await?;
        parse_body(check_status(resp).await?).await
    }

    /// `DELETE {path}/{id}`
    pub async fn remove(&self, path: &str, id: &str) -> Result<(), Error> {
        let url = self.resource_url(path, Some(id), None)?;
        debug!("DELETE {}", url);
        let resp = self.authorized(self.http.delete(url)).send().await?;
        check_status(resp).await.map(|_| ())
    }

    /// `POST {path}/{id}/{task}` with optional JSON arguments.
    pub async fn task<T: DeserializeOwned>(
        &self,
        path: &str,
        id: &str,
        task: &str,
        args: Option<&serde_json::Value>,
    ) -> Result<T, Error> {
        let url = self.resource_url(path, Some(id), Some(task))?;
        debug!("POST {}", url);
        let mut builder = self.authorized(self.http.post(url));
        if let Some(args) = args {
            builder = builder.json(args);
        }
        let resp = builder.send().await?;
        parse_body(check_status(resp).await?).await
    }
}

/// Decode a JSON body; an empty body decodes as `null`.
async fn parse_body<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, Error> {
    let body = resp.text().await?;
    let text = if body.trim().is_empty() { "null" } else { body.as_str() };
    serde_json::from_str(text).map_err(|e| Error::Deserialization {
        message: e.to_string(),
        body: body.clone(),
    })
}

/// Extract the `rel="next"` target from an RFC 8288 `Link` header.
fn next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|entry| {
        let mut parts = entry.split(';');
        let target = parts.next()?.trim();
        let is_next = parts.any(|param| {
            let param = param.trim();
            param == "rel=\"next\"" || param == "rel=next"
        });
        if !is_next {
            return None;
        }
        target
            .strip_prefix('<')
            .and_then(|t| t.strip_suffix('>'))
            .map(str::to_owned)
    })
}
