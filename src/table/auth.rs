// src/table/auth.rs

use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
    time::{Duration, Instant},
};
use tracing::{debug, info};

use crate::error::{Result, StoreError};

pub const SHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Lifetime requested for the signed assertion; Google caps it at one hour.
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// Tokens with less than this left are minted again. Must stay above the
/// table handle TTL, since a connected table keeps the token it was given.
const REFRESH_MARGIN: Duration = Duration::from_secs(600);

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// The fields of a Google service-account JSON key that signing needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenReply {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

impl ServiceAccountKey {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| StoreError::Auth(format!("malformed service-account key: {}", e)))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            StoreError::Auth(format!(
                "reading service-account key {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json(&text)
    }

    /// RS256-signed JWT asking for the Sheets scope, issued at `now`
    /// (unix seconds).
    pub fn assertion(&self, now: i64) -> Result<String> {
        let key = EncodingKey::from_rsa_pem(self.private_key.as_bytes()).map_err(|e| {
            StoreError::Auth(format!("service-account private_key is unusable: {}", e))
        })?;
        let claims = Claims {
            iss: &self.client_email,
            scope: SHEETS_SCOPE,
            aud: &self.token_uri,
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| StoreError::Auth(format!("signing token request: {}", e)))
    }
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Access tokens minted from a service-account key file, reused until they
/// get close to expiry. The key file is re-read on every mint so a rotated
/// key is picked up without a restart.
pub struct ServiceAccountTokens {
    key_path: PathBuf,
    cached: Mutex<Option<CachedToken>>,
}

impl ServiceAccountTokens {
    pub fn new(key_path: impl Into<PathBuf>) -> Self {
        Self {
            key_path: key_path.into(),
            cached: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<CachedToken>> {
        self.cached.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// A token valid for at least `REFRESH_MARGIN`, exchanging a fresh
    /// assertion at the key's `token_uri` when needed.
    pub fn token(&self, http: &Client) -> Result<String> {
        let mut slot = self.lock();
        if let Some(cached) = slot.as_ref() {
            if cached.expires_at.saturating_duration_since(Instant::now()) > REFRESH_MARGIN {
                debug!("reusing service-account token");
                return Ok(cached.token.clone());
            }
        }

        let key = ServiceAccountKey::from_file(&self.key_path)?;
        let assertion = key.assertion(Utc::now().timestamp())?;
        let resp = http
            .post(&key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(match super::sheets::classify(status, &body) {
                StoreError::Quota(msg) => StoreError::Quota(msg),
                _ => StoreError::Auth(format!("token exchange failed: {}: {}", status, body.trim())),
            });
        }
        let reply: TokenReply = resp.json()?;
        if reply.access_token.trim().is_empty() {
            return Err(StoreError::Auth("token endpoint returned an empty token".into()));
        }

        let lifetime = Duration::from_secs(reply.expires_in.unwrap_or(3600));
        info!(
            client = %key.client_email,
            expires_in_secs = lifetime.as_secs(),
            "minted service-account token"
        );
        *slot = Some(CachedToken {
            token: reply.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(reply.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{DecodingKey, Validation};
    use std::io::Write;
    use tempfile::NamedTempFile;

    const PRIVATE_PEM: &str = include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/testdata/service_account_key.pem"
    ));
    const PUBLIC_PEM: &str = include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/testdata/service_account_key.pub.pem"
    ));

    fn key_json(private_key: &str) -> String {
        serde_json::json!({
            "type": "service_account",
            "client_email": "store@project.iam.gserviceaccount.com",
            "private_key": private_key,
            "token_uri": "https://oauth2.example.test/token",
        })
        .to_string()
    }

    #[test]
    fn key_file_defaults_token_uri() {
        let key = ServiceAccountKey::from_json(
            r#"{"client_email":"a@b.c","private_key":"pem","project_id":"p"}"#,
        )
        .unwrap();
        assert_eq!(key.token_uri, DEFAULT_TOKEN_URI);

        let err = ServiceAccountKey::from_json(r#"{"client_email":"a@b.c"}"#).unwrap_err();
        assert!(matches!(err, StoreError::Auth(_)));
    }

    #[test]
    fn assertion_is_signed_for_the_sheets_scope() {
        let key = ServiceAccountKey::from_json(&key_json(PRIVATE_PEM)).unwrap();
        let now = Utc::now().timestamp();
        let jwt = key.assertion(now).unwrap();

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&["https://oauth2.example.test/token"]);
        let decoded = jsonwebtoken::decode::<serde_json::Value>(
            &jwt,
            &DecodingKey::from_rsa_pem(PUBLIC_PEM.as_bytes()).unwrap(),
            &validation,
        )
        .unwrap();

        let claims = decoded.claims;
        assert_eq!(claims["iss"], "store@project.iam.gserviceaccount.com");
        assert_eq!(claims["scope"], SHEETS_SCOPE);
        assert_eq!(claims["iat"], now);
        assert_eq!(claims["exp"], now + ASSERTION_LIFETIME_SECS);
    }

    #[test]
    fn unusable_private_key_is_an_auth_error() {
        let key = ServiceAccountKey::from_json(&key_json("not a pem")).unwrap();
        let err = key.assertion(0).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn fresh_tokens_are_reused_and_stale_ones_reminted() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", key_json("not a pem")).unwrap();
        let tokens = ServiceAccountTokens::new(file.path());
        let http = Client::new();

        *tokens.lock() = Some(CachedToken {
            token: "cached".into(),
            expires_at: Instant::now() + Duration::from_secs(3600),
        });
        assert_eq!(tokens.token(&http).unwrap(), "cached");

        // near expiry: goes back to the key, which cannot sign
        *tokens.lock() = Some(CachedToken {
            token: "cached".into(),
            expires_at: Instant::now() + Duration::from_secs(60),
        });
        assert!(matches!(tokens.token(&http), Err(StoreError::Auth(_))));
    }

    #[test]
    fn missing_key_file_is_an_auth_error() {
        let tokens = ServiceAccountTokens::new("/nonexistent/surveystore-key.json");
        let err = tokens.token(&Client::new()).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("surveystore-key.json"));
    }
}
