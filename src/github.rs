use anyhow::{anyhow, Context, Result};
use octocrab::Octocrab;
use std::env;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::executor::{BackoffPolicy, RequestExecutor, INITIAL_BACKOFF};
use crate::transport::HttpTransport;

/// Authenticated GitHub session: verified token plus the viewer login
pub struct GitHubClient {
    token: String,
    username: String,
    strategy: AuthStrategy,
}

/// GitHub authentication strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStrategy {
    /// Use GitHub CLI authentication
    GitHubCLI,
    /// Use environment variable token
    EnvironmentToken,
}

impl GitHubClient {
    /// Resolve a token per `github.auth_method` and verify it against the REST API
    pub async fn new(config: &Config) -> Result<Self> {
        let (strategy, token) = Self::detect_authentication(config)?;

        info!("Using authentication strategy: {:?}", strategy);

        let client = Octocrab::builder()
            .personal_token(token.clone())
            .build()
            .context("Failed to create GitHub client")?;

        let user = client
            .current()
            .user()
            .await
            .context("Failed to get current user information. Check your authentication.")?;

        info!("Authenticated as GitHub user: {}", user.login);

        Ok(Self {
            token,
            username: user.login,
            strategy,
        })
    }

    /// Detect and obtain GitHub authentication
    fn detect_authentication(config: &Config) -> Result<(AuthStrategy, String)> {
        match config.github.auth_method.as_str() {
            "auto" => {
                // Try GitHub CLI first, then environment token
                if let Ok(token) = Self::try_github_cli() {
                    Ok((AuthStrategy::GitHubCLI, token))
                } else if let Ok(token) = Self::try_environment_token() {
                    Ok((AuthStrategy::EnvironmentToken, token))
                } else {
                    Err(anyhow!(
                        "No GitHub authentication found. Please either:\n\
                         1. Install and authenticate GitHub CLI: gh auth login\n\
                         2. Set GITHUB_TOKEN environment variable"
                    ))
                }
            }
            "gh_cli" => {
                let token = Self::try_github_cli()
                    .context("GitHub CLI authentication failed. Run: gh auth login")?;
                Ok((AuthStrategy::GitHubCLI, token))
            }
            "token" => {
                let token = Self::try_environment_token()
                    .context("GITHUB_TOKEN environment variable not found or invalid")?;
                Ok((AuthStrategy::EnvironmentToken, token))
            }
            other => Err(anyhow!("Unknown auth method: {}", other)),
        }
    }

    /// Try to get token from GitHub CLI
    fn try_github_cli() -> Result<String> {
        debug!("Attempting GitHub CLI authentication");

        if !Self::is_command_available("gh") {
            return Err(anyhow!("GitHub CLI (gh) is not installed"));
        }

        let token_output = Command::new("gh")
            .args(["auth", "token"])
            .output()
            .context("Failed to get GitHub CLI token")?;

        if !token_output.status.success() {
            return Err(anyhow!(
                "Failed to retrieve token from GitHub CLI: {}",
                String::from_utf8_lossy(&token_output.stderr).trim()
            ));
        }

        let token = String::from_utf8(token_output.stdout)
            .context("GitHub CLI token is not valid UTF-8")?
            .trim()
            .to_string();

        if token.is_empty() {
            return Err(anyhow!("GitHub CLI returned empty token"));
        }

        debug!("Successfully obtained token from GitHub CLI");
        Ok(token)
    }

    /// Try to get token from environment variable
    fn try_environment_token() -> Result<String> {
        debug!("Attempting environment variable authentication");

        let token = env::var("GITHUB_TOKEN").context("GITHUB_TOKEN environment variable not set")?;

        if token.is_empty() {
            return Err(anyhow!("GITHUB_TOKEN is empty"));
        }

        if !["ghp_", "gho_", "ghs_", "github_pat_"]
            .iter()
            .any(|prefix| token.starts_with(prefix))
        {
            warn!("GITHUB_TOKEN doesn't look like a GitHub token");
        }

        debug!("Successfully found GITHUB_TOKEN environment variable");
        Ok(token)
    }

    /// Check if a command is available in PATH
    fn is_command_available(command: &str) -> bool {
        Command::new("which")
            .arg(command)
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    /// Get the authenticated username
    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn strategy(&self) -> AuthStrategy {
        self.strategy
    }

    /// Request executor for the configured GraphQL endpoint
    pub fn executor(&self, config: &Config) -> Result<RequestExecutor> {
        let transport = HttpTransport::new(
            config.github.api_url.clone(),
            self.token.clone(),
            Duration::from_secs(config.sync.request_timeout_secs),
        )?;

        Ok(
            RequestExecutor::new(Arc::new(transport)).with_backoff(BackoffPolicy {
                max_attempts: config.sync.max_attempts,
                initial_delay: INITIAL_BACKOFF,
            }),
        )
    }
}

/// Print the result of verifying the configured credentials
pub async fn test_authentication(config: &Config) -> Result<()> {
    println!("Testing GitHub authentication...");

    match GitHubClient::new(config).await {
        Ok(client) => {
            println!("Authentication successful");
            println!("   Strategy: {:?}", client.strategy());
            println!("   Username: {}", client.username());
            println!("   Endpoint: {}", config.github.api_url);
            Ok(())
        }
        Err(e) => {
            println!("Authentication failed: {:#}", e);
            println!();
            println!("Run `gh auth login` or export GITHUB_TOKEN");
            Err(e)
        }
    }
}
