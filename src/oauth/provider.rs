//! OAuth provider configurations.
//!
//! A provider is resolved from built-in endpoint defaults, `[providers.<name>]`
//! overrides, and `TOKENVAULT_OAUTH_<NAME>_CLIENT_ID/_SECRET` variables.

use std::collections::HashMap;
use std::fmt;
use tracing::debug;

use crate::config::VaultConfig;

/// Providers with built-in endpoint URLs
pub const BUILTIN_PROVIDERS: &[&str] = &["github", "google", "linkedin", "twitter"];

/// OAuth provider configuration
#[derive(Clone)]
pub struct ProviderConfig {
    /// Provider name (e.g. "github")
    pub name: String,

    /// OAuth authorization endpoint URL
    pub auth_url: String,

    /// OAuth token endpoint URL (exchange and refresh)
    pub token_url: String,

    /// Requested OAuth scopes
    pub scopes: Vec<String>,

    pub client_id: String,

    /// Absent for public clients
    pub client_secret: Option<String>,

    /// Callback URL registered with the provider
    pub redirect_uri: String,
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("name", &self.name)
            .field("auth_url", &self.auth_url)
            .field("token_url", &self.token_url)
            .field("scopes", &self.scopes)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .field("redirect_uri", &self.redirect_uri)
            .finish()
    }
}

impl ProviderConfig {
    /// Build authorization URL with state
    pub fn build_auth_url(&self, state: &str) -> String {
        let scopes = self.scopes.join(" ");
        let separator = if self.auth_url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}client_id={}&redirect_uri={}&scope={}&state={}&response_type=code",
            self.auth_url,
            separator,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&self.redirect_uri),
            urlencoding::encode(&scopes),
            urlencoding::encode(state)
        )
    }
}

/// Built-in (auth_url, token_url, default scopes) for a provider name
fn builtin_endpoints(name: &str) -> Option<(&'static str, &'static str, &'static [&'static str])> {
    match name {
        "github" => Some((
            "https://github.com/login/oauth/authorize",
            "https://github.com/login/oauth/access_token",
            &["repo", "read:user"],
        )),
        "google" => Some((
            "https://accounts.google.com/o/oauth2/v2/auth",
            "https://oauth2.googleapis.com/token",
            &["openid", "email"],
        )),
        "linkedin" => Some((
            "https://www.linkedin.com/oauth/v2/authorization",
            "https://www.linkedin.com/oauth/v2/accessToken",
            &["openid", "profile", "w_member_social"],
        )),
        "twitter" => Some((
            "https://twitter.com/i/oauth2/authorize",
            "https://api.twitter.com/2/oauth2/token",
            &["tweet.read", "tweet.write", "users.read", "offline.access"],
        )),
        _ => None,
    }
}

/// Provider name for an identifier: the last `:`-separated segment.
///
/// `"alice:github"` → `"github"`, `"github"` → `"github"`.
pub fn provider_of(identifier: &str) -> &str {
    identifier.rsplit(':').next().unwrap_or(identifier)
}

/// Resolved provider configurations, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, ProviderConfig>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves every provider that has a client id and both endpoint URLs.
    ///
    /// Providers missing either are skipped; asking for them later yields
    /// `UnknownProvider`.
    pub fn from_config(config: &VaultConfig) -> Self {
        let mut registry = Self::new();
        let callback_base = config.oauth.callback_base_url.trim_end_matches('/');

        for (name, settings) in &config.providers {
            let builtin = builtin_endpoints(name);

            let Some(client_id) = settings.client_id.clone() else {
                debug!(provider = %name, "Skipping provider without client_id");
                continue;
            };
            let auth_url = settings
                .auth_url
                .clone()
                .or_else(|| builtin.map(|(auth, _, _)| auth.to_string()));
            let token_url = settings
                .token_url
                .clone()
                .or_else(|| builtin.map(|(_, token, _)| token.to_string()));
            let (Some(auth_url), Some(token_url)) = (auth_url, token_url) else {
                debug!(provider = %name, "Skipping provider without endpoint URLs");
                continue;
            };
            let scopes = settings.scopes.clone().unwrap_or_else(|| {
                builtin
                    .map(|(_, _, scopes)| scopes.iter().map(|s| s.to_string()).collect())
                    .unwrap_or_default()
            });
            let redirect_uri = settings
                .redirect_uri
                .clone()
                .unwrap_or_else(|| format!("{}/oauth/{}/callback", callback_base, name));

            registry.insert(ProviderConfig {
                name: name.clone(),
                auth_url,
                token_url,
                scopes,
                client_id,
                client_secret: settings.client_secret.clone(),
                redirect_uri,
            });
        }

        registry
    }

    pub fn insert(&mut self, provider: ProviderConfig) {
        self.providers.insert(provider.name.clone(), provider);
    }

    pub fn get(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }

    /// Provider responsible for `identifier`
    pub fn for_identifier(&self, identifier: &str) -> Option<&ProviderConfig> {
        self.get(provider_of(identifier))
    }

    /// Configured provider names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
