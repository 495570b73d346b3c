//! Google OAuth2 token storage, interactive fetch and refresh.

use std::future::Future;
use std::io::{self, BufRead, Write};
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::remote::RemoteError;
use crate::utils::errors::BackupError;

const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/auth";
const TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const CERTS_URL: &str = "https://www.googleapis.com/oauth2/v1/certs";
const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";
const REDIRECT_URI: &str = "urn:ietf:wg:oauth:2.0:oob";

/// Lifetime assumed when the token endpoint does not send `expires_in`
const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// Tokens this close to expiry are refreshed before use
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

const MISSING_TOKEN: &str = "No Google OAuth2 token found. Fetch it using --fetch-token argument.";

fn default_token_uri() -> String {
    TOKEN_URI.to_string()
}

/// Authorization state persisted in the token file.
///
/// Fields the program does not use are kept in `extra` and written back as is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    #[serde(default)]
    pub access_token: Option<String>,

    #[serde(default)]
    pub refresh_token: Option<String>,

    #[serde(default = "default_token_uri")]
    pub token_uri: String,

    pub client_id: String,
    pub client_secret: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_expires_in() -> u64 {
    DEFAULT_EXPIRES_IN_SECS
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

/// Short-lived bearer token
#[derive(Debug, Clone, PartialEq)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: Instant,
}

impl AccessToken {
    pub fn new(value: impl Into<String>, lifetime: Duration) -> Self {
        Self {
            value: value.into(),
            expires_at: Instant::now() + lifetime,
        }
    }

    fn expires_soon(&self) -> bool {
        Instant::now() + EXPIRY_MARGIN >= self.expires_at
    }
}

impl TokenRecord {
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(BackupError::Authentication(MISSING_TOKEN.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&content)?)
    }

    /// Write the record, readable by the owner only on unix
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        write_private(path, content.as_bytes())?;
        debug!("Token saved to {}", path.display());
        Ok(())
    }

    /// Merge a token endpoint response with the client credentials
    fn from_response(
        mut response: Map<String, Value>,
        client_id: &str,
        client_secret: &str,
    ) -> crate::Result<Self> {
        response.insert("token_uri".to_string(), Value::from(TOKEN_URI));
        response.insert("client_id".to_string(), Value::from(client_id));
        response.insert("client_secret".to_string(), Value::from(client_secret));
        response.insert("auth_provider_x509_cert_url".to_string(), Value::from(CERTS_URL));
        Ok(serde_json::from_value(Value::Object(response))?)
    }
}

#[cfg(unix)]
fn write_private(path: &Path, content: &[u8]) -> io::Result<()> {
    use std::fs::{OpenOptions, Permissions};
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // mode() only applies to newly created files
    file.set_permissions(Permissions::from_mode(0o600))?;
    file.write_all(content)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private(path: &Path, content: &[u8]) -> io::Result<()> {
    std::fs::write(path, content)
}

/// Fail early when the token file is absent
pub fn check_token(path: &Path) -> crate::Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(BackupError::Authentication(MISSING_TOKEN.to_string()))
    }
}

/// Consent page URL for an installed ("Desktop App") client
pub fn authorization_url(client_id: &str, state: &str) -> crate::Result<reqwest::Url> {
    reqwest::Url::parse_with_params(
        AUTH_URL,
        &[
            ("response_type", "code"),
            ("client_id", client_id),
            ("redirect_uri", REDIRECT_URI),
            ("scope", DRIVE_SCOPE),
            ("state", state),
            ("access_type", "offline"),
            ("prompt", "consent"),
        ],
    )
    .map_err(|e| BackupError::Authentication(format!("Invalid authorization URL: {}", e)))
}

/// Print `message` and read one trimmed line of input
fn prompt(input: &mut impl BufRead, output: &mut impl Write, message: &str) -> io::Result<String> {
    write!(output, "{}", message)?;
    output.flush()?;

    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "input closed"));
    }
    Ok(line.trim().to_string())
}

fn required(value: String, what: &str) -> crate::Result<String> {
    if value.is_empty() {
        Err(BackupError::Authentication(format!("{} must not be empty", what)))
    } else {
        Ok(value)
    }
}

/// Run the interactive consent flow and store the token at `token_file`.
///
/// Returns `false` without prompting when the token file already exists.
pub async fn fetch_token(token_file: &Path) -> crate::Result<bool> {
    if token_file.is_file() {
        info!("Google Drive token already present at {}", token_file.display());
        return Ok(false);
    }

    let (client_id, client_secret, code) = {
        let stdin = io::stdin();
        let mut input = stdin.lock();
        let mut output = io::stdout().lock();

        writeln!(
            output,
            "Fetching Google Drive OAuth2 token.\nWARNING: Only \"Desktop App\" Google app type supported!"
        )?;
        let client_id = required(prompt(&mut input, &mut output, "Enter your Google Client ID: ")?, "Client ID")?;
        let client_secret = required(
            prompt(&mut input, &mut output, "Enter your Google Client secret: ")?,
            "Client secret",
        )?;

        let state = Uuid::new_v4().simple().to_string();
        let url = authorization_url(&client_id, &state)?;
        writeln!(output, "Go to URL and authorize access: {}", url)?;
        let code = required(prompt(&mut input, &mut output, "Enter auth code: ")?, "Auth code")?;

        (client_id, client_secret, code)
    };

    let client = reqwest::Client::new();
    let response = client
        .post(TOKEN_URI)
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("client_id", client_id.as_str()),
            ("client_secret", client_secret.as_str()),
            ("redirect_uri", REDIRECT_URI),
        ])
        .send()
        .await
        .map_err(RemoteError::from)?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(BackupError::Authentication(format!(
            "Token request failed with HTTP {}: {}",
            status,
            text.trim()
        )));
    }

    let body: Map<String, Value> = response.json().await.map_err(RemoteError::from)?;
    let record = TokenRecord::from_response(body, &client_id, &client_secret)?;
    record.save(token_file)?;

    info!("Google Drive OAuth2 token fetched");
    Ok(true)
}

/// Exchange the stored refresh token for a fresh access token
pub async fn refresh_access_token(client: &reqwest::Client, token: &TokenRecord) -> crate::Result<AccessToken> {
    let refresh_token = token.refresh_token.as_deref().ok_or_else(|| {
        BackupError::Authentication(
            "Token has no refresh token. Remove it and fetch a new one using --fetch-token argument.".to_string(),
        )
    })?;

    let response = client
        .post(&token.token_uri)
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", token.client_id.as_str()),
            ("client_secret", token.client_secret.as_str()),
        ])
        .send()
        .await
        .map_err(RemoteError::from)?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(BackupError::Authentication(format!(
            "Token refresh failed with HTTP {}: {}",
            status,
            text.trim()
        )));
    }

    let refreshed: RefreshResponse = response.json().await.map_err(RemoteError::from)?;
    debug!("Access token refreshed, valid for {}s", refreshed.expires_in);
    Ok(AccessToken::new(
        refreshed.access_token,
        Duration::from_secs(refreshed.expires_in),
    ))
}

/// Where fresh access tokens come from
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self) -> crate::Result<AccessToken>;
}

/// Refresh-token grant against the stored record's token endpoint
pub struct RefreshTokenSource {
    client: reqwest::Client,
    record: TokenRecord,
}

impl RefreshTokenSource {
    pub fn new(client: reqwest::Client, record: TokenRecord) -> Self {
        Self { client, record }
    }
}

#[async_trait]
impl TokenSource for RefreshTokenSource {
    async fn fetch(&self) -> crate::Result<AccessToken> {
        refresh_access_token(&self.client, &self.record).await
    }
}

/// Caches the current access token and refreshes it when it is about to
/// expire or when the service rejects it.
pub struct TokenCache<T> {
    source: T,
    current: RwLock<Option<AccessToken>>,
}

impl<T: TokenSource> TokenCache<T> {
    pub fn new(source: T) -> Self {
        Self {
            source,
            current: RwLock::new(None),
        }
    }

    /// Fetch the first token, failing with the source's error
    pub async fn prime(&self) -> crate::Result<()> {
        let token = self.source.fetch().await?;
        *self.current.write().await = Some(token);
        Ok(())
    }

    /// A token that is valid for at least [`EXPIRY_MARGIN`]
    pub async fn bearer(&self) -> Result<String, RemoteError> {
        if let Some(token) = self.current.read().await.as_ref() {
            if !token.expires_soon() {
                return Ok(token.value.clone());
            }
        }
        self.refresh(None).await
    }

    /// Replace the cached token unless another caller already replaced `stale`
    async fn refresh(&self, stale: Option<&str>) -> Result<String, RemoteError> {
        let mut current = self.current.write().await;
        if let Some(token) = current.as_ref() {
            if !token.expires_soon() && stale != Some(token.value.as_str()) {
                return Ok(token.value.clone());
            }
        }

        let token = self
            .source
            .fetch()
            .await
            .map_err(|e| RemoteError::Authorization(e.to_string()))?;
        let value = token.value.clone();
        *current = Some(token);
        Ok(value)
    }

    /// Run `call` with a bearer token; on HTTP 401 refresh once and call again
    pub async fn authorized<R, F, Fut>(&self, mut call: F) -> Result<R, RemoteError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<R, RemoteError>>,
    {
        let token = self.bearer().await?;
        match call(token.clone()).await {
            Err(e) if e.status() == Some(401) => {
                warn!("Access token rejected, refreshing");
                let token = self.refresh(Some(&token)).await?;
                call(token).await
            }
            other => other,
        }
    }
}
