//! Virtual user identities and the register-then-login bootstrap.
//!
//! Each virtual user synthesizes a unique [`Identity`] and, if an [`AuthFlow`] is
//! configured, runs it exactly once before it starts running tasks. A successful
//! login yields a [`Credential`] owned by that user alone.

use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

use crate::executor::{ActionResult, Outcome, RequestExecutor};
use crate::metrics::MetricMessage;
use crate::task::TaskRequest;
use crate::HatchlingError;

/// Length of the random suffix of each synthesized identity.
const IDENTITY_SUFFIX_LENGTH: usize = 8;

/// The identity a virtual user registers and logs in with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Random lowercase alphanumeric suffix shared by the username and email.
    pub id: String,
    /// Index of the virtual user the identity belongs to.
    pub user_index: usize,
    pub username: String,
    pub email: String,
    pub password: String,
}
impl Identity {
    /// Synthesize a new identity using the thread-local random number generator.
    pub fn generate(password: &str) -> Self {
        Identity::generate_with(&mut rand::rng(), password)
    }

    /// Assign the identity to a virtual user.
    pub fn set_user_index(mut self, user_index: usize) -> Self {
        self.user_index = user_index;
        self
    }

    /// Synthesize a new identity using the provided random number generator.
    pub fn generate_with<R: Rng>(rng: &mut R, password: &str) -> Self {
        let id: String = rng
            .sample_iter(&Alphanumeric)
            .take(IDENTITY_SUFFIX_LENGTH)
            .map(|c| char::from(c).to_ascii_lowercase())
            .collect();
        Identity {
            username: format!("User {}", id),
            email: format!("user_{}@test.com", id),
            password: password.to_string(),
            user_index: 0,
            id,
        }
    }
}

/// A bearer token and the identity it was issued to.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
    pub identity: Identity,
}
impl Credential {
    pub fn new(token: &str, identity: Identity) -> Self {
        Credential {
            token: token.to_string(),
            identity,
        }
    }

    /// The opaque bearer token.
    pub fn token(&self) -> &str {
        &self.token
    }
}
// Keep tokens out of logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("identity", &self.identity)
            .finish()
    }
}

/// How a virtual user registers and logs in.
///
/// String values in the request bodies may contain `{username}`, `{email}`,
/// `{password}` and `{user_index}` placeholders, which are replaced with the virtual
/// user's [`Identity`].
///
/// # Example
/// ```rust
/// use hatchling::session::AuthFlow;
///
/// let auth = AuthFlow {
///     register_path: None,
///     login_path: "/api/login".to_string(),
///     token_pointer: "/data/access_token".to_string(),
///     ..Default::default()
/// };
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthFlow {
    /// Path to register new users, or `None` to only log in.
    pub register_path: Option<String>,
    /// Path to log in.
    pub login_path: String,
    /// Status returned by a successful registration.
    pub register_status: u16,
    /// Status returned by a successful login.
    pub login_status: u16,
    /// JSON pointer locating the bearer token in the login response.
    pub token_pointer: String,
    /// Template for the registration request body.
    pub register_body: Value,
    /// Template for the login request body.
    pub login_body: Value,
    /// How many more times to try logging in after a failed login.
    pub login_retries: usize,
    /// Password used by every synthesized identity.
    pub password: String,
}
impl Default for AuthFlow {
    fn default() -> Self {
        AuthFlow {
            register_path: Some("/register".to_string()),
            login_path: "/login".to_string(),
            register_status: 201,
            login_status: 200,
            token_pointer: "/token".to_string(),
            register_body: json!({
                "username": "{username}",
                "email": "{email}",
                "password": "{password}",
            }),
            login_body: json!({
                "email": "{email}",
                "password": "{password}",
            }),
            login_retries: 0,
            password: "123".to_string(),
        }
    }
}
impl AuthFlow {
    /// Register (if configured) then log in, returning a credential on success.
    ///
    /// Registration failures are logged and recorded, but login is attempted
    /// regardless. Every request is reported to the metrics aggregator under the
    /// `register` and `login` labels.
    pub async fn bootstrap(
        &self,
        executor: &RequestExecutor,
        identity: &Identity,
        metrics: &flume::Sender<MetricMessage>,
    ) -> Result<Credential, HatchlingError> {
        if let Some(register_path) = self.register_path.as_ref() {
            let request =
                TaskRequest::post_json(register_path, render(&self.register_body, identity));
            let (mut result, _) = executor
                .execute_with_body("register", &request, None)
                .await;
            expect_status(&mut result, self.register_status);
            if result.outcome != Outcome::Success {
                warn!(
                    "{}: registration failed: {}",
                    identity.email,
                    result.error.as_deref().unwrap_or("unknown error")
                );
            }
            let _ = metrics.send(MetricMessage::Action(result));
        }

        let request = TaskRequest::post_json(&self.login_path, render(&self.login_body, identity));
        let mut last_error = String::new();
        for attempt in 0..=self.login_retries {
            if attempt > 0 {
                debug!("{}: login retry {}", identity.email, attempt);
            }
            let (mut result, body) = executor.execute_with_body("login", &request, None).await;
            expect_status(&mut result, self.login_status);

            let token = if result.outcome == Outcome::Success {
                match body.as_deref().map(|body| self.extract_token(body)) {
                    Some(Ok(token)) => Some(token),
                    Some(Err(detail)) => {
                        result.outcome = Outcome::ClientError;
                        result.error = Some(detail);
                        None
                    }
                    None => {
                        result.outcome = Outcome::ClientError;
                        result.error = Some("empty login response".to_string());
                        None
                    }
                }
            } else {
                None
            };
            last_error = result.error.clone().unwrap_or_default();
            let _ = metrics.send(MetricMessage::Action(result));

            if let Some(token) = token {
                return Ok(Credential::new(&token, identity.clone()));
            }
        }

        warn!("{}: login failed: {}", identity.email, last_error);
        Err(HatchlingError::Bootstrap {
            user: identity.email.to_string(),
            detail: last_error,
        })
    }

    /// Find the bearer token in a login response body.
    fn extract_token(&self, body: &str) -> Result<String, String> {
        let value: Value =
            serde_json::from_str(body).map_err(|e| format!("invalid login response: {}", e))?;
        value
            .pointer(&self.token_pointer)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| format!("no token at {} in login response", self.token_pointer))
    }
}

/// Downgrade a response that didn't return the configured status.
fn expect_status(result: &mut ActionResult, expected: u16) {
    if let Some(status) = result.status_code {
        if status != expected && result.outcome == Outcome::Success {
            result.outcome = Outcome::ClientError;
            result.error = Some(format!(
                "unexpected status: {} (expected {})",
                status, expected
            ));
        }
    }
}

/// Replace identity placeholders in every string of a JSON template.
fn render(template: &Value, identity: &Identity) -> Value {
    match template {
        Value::String(s) => Value::String(
            s.replace("{username}", &identity.username)
                .replace("{email}", &identity.email)
                .replace("{password}", &identity.password)
                .replace("{user_index}", &identity.user_index.to_string()),
        ),
        Value::Array(values) => Value::Array(values.iter().map(|v| render(v, identity)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.to_string(), render(v, identity)))
                .collect(),
        ),
        other => other.clone(),
    }
}
