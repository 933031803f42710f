//! Session authentication against Frappe's method endpoints.
//!
//! Login is cookie-based: a successful `/api/method/login` response sets the
//! session cookie inside the client's cookie store, and every later request
//! carries it.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::client::{parse_message_envelope, ClientError, FrappeClient};

/// Sentinel identity meaning "not authenticated".
pub const GUEST_USER: &str = "Guest";

/// Server response for a successful login.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct LoginResponse {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub home_page: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
}

impl FrappeClient {
    /// Authenticates with username and password.
    pub async fn login(
        &self,
        username: &str,
        password: &SecretString,
    ) -> Result<LoginResponse, ClientError> {
        let params = json!({
            "usr": username,
            "pwd": password.expose_secret(),
        });
        let body = self.post_json("/api/method/login", &params).await?;
        serde_json::from_str(&body).map_err(|err| ClientError::Parse(format!("login: {err}")))
    }

    /// Ends the current session.
    pub async fn logout(&self) -> Result<(), ClientError> {
        self.post_json("/api/method/logout", &json!({})).await?;
        Ok(())
    }

    /// Returns the identity of the current session.
    ///
    /// Resolves to [`GUEST_USER`] when no session is active.
    pub async fn get_current_user(&self) -> Result<String, ClientError> {
        let body = self
            .get_json("/api/method/frappe.auth.get_logged_in_user", &[])
            .await?;
        parse_message_envelope(&body)
    }

    /// Whether an authenticated (non-Guest) session is active.
    ///
    /// Any failure of the identity call is downgraded to `false` instead of
    /// propagating; this is the only locally-recovered error in the crate.
    pub async fn is_logged_in(&self) -> bool {
        match self.get_current_user().await {
            Ok(user) => identity_is_authenticated(&user),
            Err(error) => {
                debug!(event = "identity_check_failed", error = %error);
                false
            }
        }
    }
}

/// Whether an identity string represents an authenticated user.
pub(crate) fn identity_is_authenticated(user: &str) -> bool {
    !user.is_empty() && user != GUEST_USER
}
