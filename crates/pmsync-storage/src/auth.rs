//! Bearer tokens for the Google Drive and Sheets APIs.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use gcp_auth::{CustomServiceAccount, TokenProvider};
use tracing::debug;

use crate::FetchError;

pub const GOOGLE_SCOPES: [&str; 2] = [
    "https://www.googleapis.com/auth/drive",
    "https://www.googleapis.com/auth/spreadsheets",
];

#[derive(Clone)]
pub enum GoogleCredentials {
    /// Pre-minted token, sent as-is until it expires.
    AccessToken(String),
    /// Service account; tokens are minted on first use and refreshed before expiry.
    ServiceAccount(Arc<dyn TokenProvider>),
}

impl fmt::Debug for GoogleCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GoogleCredentials::AccessToken(_) => f.write_str("AccessToken(..)"),
            GoogleCredentials::ServiceAccount(_) => f.write_str("ServiceAccount(..)"),
        }
    }
}

impl GoogleCredentials {
    pub fn access_token(token: impl Into<String>) -> Self {
        GoogleCredentials::AccessToken(token.into())
    }

    /// Load a service-account JSON key file.
    pub fn service_account_file(path: &Path) -> Result<Self, FetchError> {
        let account = CustomServiceAccount::from_file(path)
            .map_err(|e| FetchError::Auth(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), "loaded service account key");
        Ok(GoogleCredentials::ServiceAccount(Arc::new(account)))
    }

    pub async fn bearer(&self) -> Result<String, FetchError> {
        match self {
            GoogleCredentials::AccessToken(token) => Ok(token.clone()),
            GoogleCredentials::ServiceAccount(provider) => {
                let token = provider
                    .token(&GOOGLE_SCOPES)
                    .await
                    .map_err(|e| FetchError::Auth(e.to_string()))?;
                Ok(token.as_str().to_string())
            }
        }
    }
}
