use std::{ops::Deref, sync::Arc, time::Duration};

use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Client, ClientBuilder, IntoUrl,
};
use reqwest_cookie_store::{CookieStore, CookieStoreMutex};

use crate::error::{DashError, DashResult};

/// Shared HTTP client for manifests, clock sync and segments.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    cookies_store: Arc<CookieStoreMutex>,
}

impl HttpClient {
    pub fn new(builder: ClientBuilder) -> DashResult<Self> {
        let cookies_store = Arc::new(CookieStoreMutex::new(CookieStore::default()));
        let client = builder.cookie_provider(cookies_store.clone()).build()?;

        Ok(Self {
            client,
            cookies_store,
        })
    }

    /// Builds a client with extra default headers and a connect timeout.
    pub fn with_headers<I, K, V>(headers: I, connect_timeout: Duration) -> DashResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut map = HeaderMap::new();
        for (key, value) in headers {
            let key = HeaderName::from_bytes(key.as_ref().as_bytes())
                .map_err(|e| DashError::InvalidHeader(format!("{}: {e}", key.as_ref())))?;
            let value = HeaderValue::from_str(value.as_ref())
                .map_err(|e| DashError::InvalidHeader(format!("{}: {e}", value.as_ref())))?;
            map.insert(key, value);
        }

        Self::new(
            Client::builder()
                .default_headers(map)
                .connect_timeout(connect_timeout),
        )
    }

    pub fn add_cookies(&self, cookies: Vec<String>, url: impl IntoUrl) -> DashResult<()> {
        let url = url.into_url()?;
        let mut lock = self
            .cookies_store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for cookie in cookies {
            if let Err(e) = lock.parse(&cookie, &url) {
                tracing::warn!(%url, error = %e, "Ignoring malformed cookie");
            }
        }
        Ok(())
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        let cookies_store = Arc::new(CookieStoreMutex::new(CookieStore::default()));
        let client = Client::builder()
            .cookie_provider(cookies_store.clone())
            .build()
            .unwrap_or_default();

        Self {
            client,
            cookies_store,
        }
    }
}

impl Deref for HttpClient {
    type Target = Client;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}
