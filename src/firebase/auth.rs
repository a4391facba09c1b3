use std::{cell::RefCell, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use log::debug;
use reqwest::blocking::Client;
use serde_derive::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use super::credentials::ServiceAccountKey;

const DATASTORE_SCOPE: &str = "https://www.googleapis.com/auth/datastore";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

// Refresh a little before Google would reject the token.
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Clone)]
pub struct AccessToken {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Produces `Authorization` header values for Firestore requests.
pub enum Authenticator {
    ServiceAccount {
        key: ServiceAccountKey,
        http: Client,
        cached: RefCell<Option<AccessToken>>,
    },
    /// The Firestore emulator accepts this fixed token.
    Emulator,
}

impl Authenticator {
    pub fn service_account(key: ServiceAccountKey, timeout: Duration) -> Result<Self, AuthError> {
        let http = Client::builder().timeout(timeout).build().context(HttpSnafu)?;
        Ok(Authenticator::ServiceAccount { key, http, cached: RefCell::new(None) })
    }

    pub fn authorization(&self) -> Result<String, AuthError> {
        match self {
            Authenticator::Emulator => Ok("Bearer owner".to_string()),
            Authenticator::ServiceAccount { key, http, cached } => {
                let now = Utc::now();
                if let Some(token) = cached.borrow().as_ref().filter(|t| t.expires_at - TimeDelta::seconds(EXPIRY_MARGIN_SECS) > now) {
                    return Ok(format!("Bearer {}", token.value));
                }

                let token = fetch_access_token(http, key, now)?;
                let header = format!("Bearer {}", token.value);
                *cached.borrow_mut() = Some(token);
                Ok(header)
            }
        }
    }

    /// Forget the cached token, e.g. after the server answered 401.
    pub fn invalidate(&self) {
        if let Authenticator::ServiceAccount { cached, .. } = self {
            cached.borrow_mut().take();
        }
    }
}

fn sign_assertion(key: &ServiceAccountKey, now: DateTime<Utc>) -> Result<String, AuthError> {
    let claims = Claims {
        iss: &key.client_email,
        scope: DATASTORE_SCOPE,
        aud: &key.token_uri,
        iat: now.timestamp(),
        exp: (now + TimeDelta::hours(1)).timestamp(),
    };

    let mut header = Header::new(Algorithm::RS256);
    if !key.private_key_id.is_empty() {
        header.kid = Some(key.private_key_id.clone());
    }

    let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes()).context(SigningSnafu)?;
    jsonwebtoken::encode(&header, &claims, &encoding_key).context(SigningSnafu)
}

fn fetch_access_token(http: &Client, key: &ServiceAccountKey, now: DateTime<Utc>) -> Result<AccessToken, AuthError> {
    let assertion = sign_assertion(key, now)?;
    debug!("Requesting access token for {}", key.client_email);

    let response = http.post(&key.token_uri)
        .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
        .send()
        .context(HttpSnafu)?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return RejectedSnafu { status: status.as_u16(), body }.fail();
    }

    let token: TokenResponse = response.json().context(HttpSnafu)?;
    Ok(AccessToken {
        value: token.access_token,
        expires_at: now + TimeDelta::seconds(token.expires_in),
    })
}

// ////// //
// Errors //
// ////// //

#[derive(Debug, Snafu)]
pub enum AuthError {
    #[snafu(display("could not sign token request: {source}"))]
    Signing { source: jsonwebtoken::errors::Error },

    #[snafu(display("token request failed: {source}"))]
    Http { source: reqwest::Error },

    #[snafu(display("token endpoint answered {status}: {body}"))]
    Rejected { status: u16, body: String },
}

impl AuthError {
    pub fn is_transient(&self) -> bool {
        match self {
            AuthError::Http { .. } => true,
            AuthError::Rejected { status, .. } => *status >= 500 || *status == 429,
            AuthError::Signing { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(private_key: &str) -> ServiceAccountKey {
        serde_json::from_value(serde_json::json!({
            "type": "service_account",
            "project_id": "printersync-test",
            "private_key": private_key,
            "client_email": "agent@printersync-test.iam.gserviceaccount.com",
        }))
        .unwrap()
    }

    #[test]
    fn emulator_uses_the_owner_token() {
        assert_eq!(Authenticator::Emulator.authorization().unwrap(), "Bearer owner");
    }

    #[test]
    fn malformed_private_key_fails_before_any_request() {
        let auth = Authenticator::service_account(key("not a pem"), Duration::from_secs(1)).unwrap();
        let err = auth.authorization().unwrap_err();
        assert!(matches!(err, AuthError::Signing { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn cached_token_is_reused_until_close_to_expiry() {
        let auth = Authenticator::service_account(key("not a pem"), Duration::from_secs(1)).unwrap();
        if let Authenticator::ServiceAccount { cached, .. } = &auth {
            *cached.borrow_mut() = Some(AccessToken {
                value: "ya29.cached".to_string(),
                expires_at: Utc::now() + TimeDelta::minutes(30),
            });
        }

        assert_eq!(auth.authorization().unwrap(), "Bearer ya29.cached");

        auth.invalidate();
        assert!(auth.authorization().is_err());
    }
}
