//! App registration and client-credentials tokens for servers that refuse
//! anonymous streaming.

use moka::future::Cache;
use serde::Deserialize;

use crate::Result;

const APP_NAME: &str = "FediverseArchiveBot";
const REDIRECT_URI: &str = "urn:ietf:wg:oauth:2.0:oob";
const SCOPE: &str = "read:statuses";

#[derive(Debug, Deserialize)]
struct AppCredentials {
    client_id: String,
    client_secret: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Access tokens keyed by host, shared by every Mastodon provider.
#[derive(Clone)]
pub struct TokenCache {
    tokens: Cache<String, String>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self {
            tokens: Cache::builder().max_capacity(10_000).build(),
        }
    }

    pub async fn get(&self, host: &str) -> Option<String> {
        self.tokens.get(host).await
    }

    pub async fn insert(&self, host: &str, token: String) {
        self.tokens.insert(host.to_string(), token).await;
    }
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Return a cached token for `host`, or register an app and request one.
pub async fn get_access_token(
    http: &reqwest::Client,
    host: &str,
    cache: &TokenCache,
) -> Result<String> {
    if let Some(token) = cache.get(host).await {
        tracing::debug!("Token cache hit for {}", host);
        return Ok(token);
    }

    tracing::debug!("Token cache miss for {}, registering app", host);
    let app = register_app(http, host).await?;
    let token = client_credentials_token(http, host, &app).await?;

    cache.insert(host, token.clone()).await;
    tracing::info!("Obtained access token for {}", host);
    Ok(token)
}

async fn register_app(http: &reqwest::Client, host: &str) -> Result<AppCredentials> {
    let app = http
        .post(format!("https://{host}/api/v1/apps"))
        .form(&[
            ("client_name", APP_NAME),
            ("redirect_uris", REDIRECT_URI),
            ("scopes", SCOPE),
        ])
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    Ok(app)
}

async fn client_credentials_token(
    http: &reqwest::Client,
    host: &str,
    app: &AppCredentials,
) -> Result<String> {
    let response: TokenResponse = http
        .post(format!("https://{host}/oauth/token"))
        .form(&[
            ("client_id", app.client_id.as_str()),
            ("client_secret", app.client_secret.as_str()),
            ("grant_type", "client_credentials"),
            ("scope", SCOPE),
        ])
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    Ok(response.access_token)
}
