use std::env;
use std::time::Duration;

use tracing::info;

use crate::error::ScrapeError;
use crate::page::PageSession;

const USERNAME_FIELD_TIMEOUT: Duration = Duration::from_secs(10);
const POST_LOGIN_LOAD_TIMEOUT: Duration = Duration::from_secs(30);
// Dashboard widgets keep rendering after the load event fires.
const POST_LOGIN_SETTLE: Duration = Duration::from_secs(5);

/// Dashboard login credentials.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Read credentials from `FOLLOWSNAP_USERNAME` / `FOLLOWSNAP_PASSWORD`.
    pub fn from_env() -> Result<Self, ScrapeError> {
        let username = env::var("FOLLOWSNAP_USERNAME").unwrap_or_default();
        let password = env::var("FOLLOWSNAP_PASSWORD").unwrap_or_default();

        if username.trim().is_empty() || password.trim().is_empty() {
            return Err(ScrapeError::CredentialsMissing(
                "set FOLLOWSNAP_USERNAME and FOLLOWSNAP_PASSWORD".to_string(),
            ));
        }

        Ok(Self { username, password })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Authenticate and wait for the dashboard to settle.
pub async fn login(
    session: &dyn PageSession,
    url: &str,
    credentials: &Credentials,
) -> Result<(), ScrapeError> {
    info!(url, "navigating to dashboard");
    session.goto(url).await?;

    info!("waiting for login form");
    session
        .wait_for_selector("input[name=\"username\"]", USERNAME_FIELD_TIMEOUT)
        .await
        .map_err(login_timeout)?;

    info!("entering credentials");
    session
        .fill("input[name=\"username\"]", &credentials.username)
        .await?;
    session
        .fill("input[type=\"password\"]", &credentials.password)
        .await?;

    info!("submitting login");
    session.click("button[type=\"submit\"]").await?;

    session
        .wait_for_load(POST_LOGIN_LOAD_TIMEOUT)
        .await
        .map_err(login_timeout)?;
    tokio::time::sleep(POST_LOGIN_SETTLE).await;

    info!("login successful");
    Ok(())
}

fn login_timeout(err: ScrapeError) -> ScrapeError {
    match err {
        ScrapeError::Timeout(msg) => ScrapeError::LoginTimeout(msg),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_never_prints_password() {
        let credentials = Credentials {
            username: "ops".to_string(),
            password: "hunter2".to_string(),
        };
        let printed = format!("{credentials:?}");
        assert!(printed.contains("ops"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn test_login_timeout_maps_only_timeouts() {
        match login_timeout(ScrapeError::Timeout("form".to_string())) {
            ScrapeError::LoginTimeout(_) => {}
            other => panic!("expected LoginTimeout, got {other:?}"),
        }
        match login_timeout(ScrapeError::Driver("ws".to_string())) {
            ScrapeError::Driver(_) => {}
            other => panic!("expected Driver, got {other:?}"),
        }
    }
}
