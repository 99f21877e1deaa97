use crate::config::ProviderConfig;
use crate::util::resolve_tilde;
use secrecy::{ExposeSecret, SecretString};

/// Resolved login for a remote service.
///
/// Either a token, or a user/password pair. Empty credentials make
/// `authenticate()` fail without a network round trip.
#[derive(Clone)]
pub struct Credentials {
    pub user: String,
    pub pass: SecretString,
    pub token: Option<SecretString>,
}

impl Credentials {
    pub fn new(user: impl Into<String>, pass: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            pass: SecretString::from(pass.into()),
            token: None,
        }
    }

    pub fn from_token(token: impl Into<String>) -> Self {
        Self {
            user: String::new(),
            pass: SecretString::from(String::new()),
            token: Some(SecretString::from(token.into())),
        }
    }

    pub fn empty() -> Self {
        Self::new("", "")
    }

    /// True when neither a token nor a complete user/password pair is set.
    pub fn is_empty(&self) -> bool {
        let has_token = self
            .token
            .as_ref()
            .is_some_and(|t| !t.expose_secret().is_empty());
        !has_token && (self.user.is_empty() || self.pass.expose_secret().is_empty())
    }
}

/// SEC-015: Never print secrets.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("pass", &"[REDACTED]")
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Resolves the credentials configured for one service.
///
/// Token sources win over passwords: `token`, then `token_file`, then
/// `token_eval`. Otherwise `login` plus `password`, falling back to the first
/// line of `password_file` or of `password_eval`'s output. Nothing is
/// prompted for; an unresolvable password yields empty credentials.
pub async fn resolve(config: &ProviderConfig, service: &str) -> Credentials {
    if let Some(token) = config.token.as_deref().filter(|t| !t.is_empty()) {
        return Credentials::from_token(token);
    }
    if let Some(file) = config.token_file.as_deref().filter(|f| !f.is_empty()) {
        return Credentials::from_token(read_first_line(file).await);
    }
    if let Some(cmd) = config.token_eval.as_deref().filter(|c| !c.is_empty()) {
        return Credentials::from_token(eval_first_line(cmd).await);
    }

    if config.login.is_empty() {
        tracing::warn!(service = %service, "No login configured");
        return Credentials::empty();
    }

    let pass = match config.password.as_deref().filter(|p| !p.is_empty()) {
        Some(pass) => pass.to_string(),
        None => {
            if let Some(file) = config.password_file.as_deref().filter(|f| !f.is_empty()) {
                read_first_line(file).await
            } else if let Some(cmd) = config.password_eval.as_deref().filter(|c| !c.is_empty()) {
                eval_first_line(cmd).await
            } else {
                String::new()
            }
        }
    };

    if pass.is_empty() {
        tracing::warn!(service = %service, login = %config.login, "No password available");
        return Credentials::empty();
    }

    Credentials::new(config.login.clone(), pass)
}

async fn read_first_line(path: &str) -> String {
    let path = resolve_tilde(path);
    match tokio::fs::read_to_string(&path).await {
        Ok(content) => content.lines().next().unwrap_or_default().to_string(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read password file");
            String::new()
        }
    }
}

async fn eval_first_line(cmd: &str) -> String {
    tracing::debug!(command = %cmd, "Evaluating password command");
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .stdin(std::process::Stdio::inherit())
        .output()
        .await;
    match output {
        Ok(output) => String::from_utf8_lossy(&output.stdout)
            .split(['\n', '\r'])
            .next()
            .unwrap_or_default()
            .to_string(),
        Err(e) => {
            tracing::warn!(command = %cmd, error = %e, "Failed to run password command");
            String::new()
        }
    }
}
