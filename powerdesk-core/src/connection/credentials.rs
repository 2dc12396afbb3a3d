//! Credential sources for channel endpoints
//!
//! The credential is read once per connection attempt and embedded in the URL,
//! so a rotated credential only takes effect on the next connect.

use parking_lot::RwLock;
use std::sync::Arc;
use url::Url;

use crate::error::SyncResult;

pub trait CredentialSource: Send + Sync {
    fn credential(&self) -> Option<String>;
}

/// Fixed token, or none for anonymous endpoints
#[derive(Debug, Clone, Default)]
pub struct StaticCredential(Option<String>);

impl StaticCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn anonymous() -> Self {
        Self(None)
    }
}

impl CredentialSource for StaticCredential {
    fn credential(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Token owned by the login flow and swapped when it is refreshed
#[derive(Debug, Clone, Default)]
pub struct SharedCredential {
    token: Arc<RwLock<Option<String>>>,
}

impl SharedCredential {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: Arc::new(RwLock::new(token)),
        }
    }

    pub fn rotate(&self, token: impl Into<String>) {
        *self.token.write() = Some(token.into());
    }

    pub fn revoke(&self) {
        *self.token.write() = None;
    }
}

impl CredentialSource for SharedCredential {
    fn credential(&self) -> Option<String> {
        self.token.read().clone()
    }
}

/// Base URL with the current credential appended as `param`
pub fn resolve_url(
    base: &str,
    param: &str,
    credentials: &dyn CredentialSource,
) -> SyncResult<Url> {
    let mut url = Url::parse(base)?;
    if let Some(token) = credentials.credential() {
        url.query_pairs_mut().append_pair(param, &token);
    }
    Ok(url)
}
