//! Environment overrides layered on top of the TOML configuration.

use tracing::warn;

use super::{BackendKind, ProviderSettings, VaultConfig};
use crate::oauth::BUILTIN_PROVIDERS;

impl VaultConfig {
    /// Build from env vars, falling back to defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env();
        cfg
    }

    /// Apply `TOKENVAULT_*` environment overrides in place.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub(crate) fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("TOKENVAULT_STORE_DIR") {
            self.storage.directory = v.into();
        }
        if let Some(v) = lookup("TOKENVAULT_SQLITE_PATH") {
            self.storage.sqlite_path = v.into();
        }
        if let Some(v) = lookup("TOKENVAULT_STORAGE_BACKEND") {
            match v.to_ascii_lowercase().as_str() {
                "file" => self.storage.backend = BackendKind::File,
                "sqlite" => self.storage.backend = BackendKind::Sqlite,
                other => warn!(value = %other, "Ignoring unknown TOKENVAULT_STORAGE_BACKEND"),
            }
        }
        if let Some(v) = lookup("TOKENVAULT_REFRESH_SKEW_SECONDS") {
            if let Ok(n) = v.parse::<i64>() {
                self.refresh.skew_seconds = n;
            }
        }
        if let Some(v) = lookup("TOKENVAULT_CALLBACK_BASE_URL") {
            self.oauth.callback_base_url = v;
        }

        let mut names: Vec<String> = BUILTIN_PROVIDERS.iter().map(|s| s.to_string()).collect();
        names.extend(self.providers.keys().cloned());
        names.sort();
        names.dedup();

        for name in names {
            let prefix = format!("TOKENVAULT_OAUTH_{}", name.to_uppercase().replace('-', "_"));
            let client_id = lookup(&format!("{}_CLIENT_ID", prefix));
            let client_secret = lookup(&format!("{}_CLIENT_SECRET", prefix));
            if client_id.is_none() && client_secret.is_none() {
                continue;
            }

            let settings = self
                .providers
                .entry(name)
                .or_insert_with(ProviderSettings::default);
            if client_id.is_some() {
                settings.client_id = client_id;
            }
            if client_secret.is_some() {
                settings.client_secret = client_secret;
            }
        }
    }
}
