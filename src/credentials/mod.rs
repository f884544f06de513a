//! Registry credentials for pulling images through the daemon API.
//!
//! Sources are checked in this order:
//!
//! 1. `DOCKER_AUTH_CONFIG`, with the same payload of the `X-Registry-Auth`
//!    header (base64-encoded JSON), or plain JSON.
//! 2. `DOCKER_USER`, `DOCKER_PASSWORD` and `DOCKER_EMAIL`.
//! 3. The `config.json` file of the Docker CLI: inline `auths`, then
//!    `credHelpers`, then `credsStore`.

mod helper;

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bollard::auth::DockerCredentials;

use crate::{reference::DOCKER_HUB_REGISTRY, Settings};

/// User name to send the password as an identity token.
pub(crate) const TOKEN_USER: &str = "<token>";

#[derive(serde::Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct DockerConfig {
    #[serde(default)]
    auths: BTreeMap<String, AuthEntry>,

    #[serde(default)]
    cred_helpers: BTreeMap<String, String>,

    creds_store: Option<String>,
}

#[derive(serde::Deserialize, Debug, Default)]
struct AuthEntry {
    auth: Option<String>,
    identitytoken: Option<String>,
}

/// Resolve credentials for registry servers.
///
/// Results (including missing credentials) are cached for the lifetime of
/// the store.
pub struct CredentialStore {
    settings: Arc<Settings>,
    cache: Mutex<HashMap<String, Option<DockerCredentials>>>,
}

impl CredentialStore {
    pub fn new(settings: Arc<Settings>) -> Self {
        CredentialStore {
            settings,
            cache: Mutex::default(),
        }
    }

    /// Get the credentials for `server`.
    ///
    /// If `server` is empty, `DOCKER_SERVER_ADDRESS` or Docker Hub is used.
    pub async fn resolve(&self, server: &str) -> Option<DockerCredentials> {
        let server = self.normalize_server(server);

        if let Some(cached) = self.cache_lock().get(&server) {
            return cached.clone();
        }

        let credentials = self.lookup(&server).await;

        self.cache_lock().insert(server, credentials.clone());

        credentials
    }

    fn cache_lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Option<DockerCredentials>>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Remove the scheme and the path from a server address.
    fn normalize_server(&self, server: &str) -> String {
        let server = match server.trim() {
            "" => self
                .settings
                .server_address
                .as_deref()
                .unwrap_or(DOCKER_HUB_REGISTRY),
            s => s,
        };

        let server = server
            .strip_prefix("https://")
            .or_else(|| server.strip_prefix("http://"))
            .unwrap_or(server);

        server.split('/').next().unwrap_or(server).to_owned()
    }

    async fn lookup(&self, server: &str) -> Option<DockerCredentials> {
        let settings = &self.settings;

        if let Some(auth_config) = &settings.auth_config {
            match parse_auth_config(auth_config) {
                Some(credentials) => return Some(credentials),
                None => tracing::warn!("DOCKER_AUTH_CONFIG does not contain valid credentials"),
            }
        }

        if let (Some(user), Some(password), Some(email)) =
            (&settings.user, &settings.password, &settings.email)
        {
            let mut credentials = DockerCredentials {
                username: Some(user.clone()),
                email: Some(email.clone()),
                serveraddress: Some(server.to_owned()),
                ..DockerCredentials::default()
            };

            if user == TOKEN_USER {
                credentials.identitytoken = Some(password.clone());
            } else {
                credentials.password = Some(password.clone());
            }

            return Some(credentials);
        }

        self.from_config_file(server).await
    }

    async fn from_config_file(&self, server: &str) -> Option<DockerCredentials> {
        let path = self.settings.docker_config_dir()?.join("config.json");

        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(err) => {
                tracing::debug!(%err, path = %path.display(), "no Docker configuration");
                return None;
            }
        };

        let config: DockerConfig = match serde_json::from_slice(&data) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(%err, path = %path.display(), "invalid Docker configuration");
                return None;
            }
        };

        let matching_auths = || config.auths.iter().filter(|(key, _)| key.contains(server));

        // Inline tokens.
        for (key, entry) in matching_auths() {
            if let Some(credentials) = entry.to_credentials(key) {
                return Some(credentials);
            }
        }

        for (key, helper) in &config.cred_helpers {
            if key.contains(server) {
                if let Some(credentials) = helper::get(helper, key, &self.settings).await {
                    return Some(credentials);
                }
            }
        }

        if let Some(store) = &config.creds_store {
            for (key, _) in matching_auths() {
                if let Some(credentials) = helper::get(store, key, &self.settings).await {
                    return Some(credentials);
                }
            }
        }

        None
    }
}

impl AuthEntry {
    /// Decode the `auth` field (`base64(user:password)`).
    fn to_credentials(&self, server: &str) -> Option<DockerCredentials> {
        let decoded = STANDARD.decode(self.auth.as_deref()?.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, password) = decoded.split_once(':')?;

        Some(DockerCredentials {
            username: Some(username.to_owned()),
            password: Some(password.to_owned()),
            identitytoken: self.identitytoken.clone(),
            serveraddress: Some(server.to_owned()),
            ..DockerCredentials::default()
        })
    }
}

/// Parse the value of `DOCKER_AUTH_CONFIG`.
fn parse_auth_config(value: &str) -> Option<DockerCredentials> {
    let value = value.trim();

    if value.starts_with('{') {
        return serde_json::from_str(value).ok();
    }

    let decoded = STANDARD
        .decode(value)
        .or_else(|_| base64::engine::general_purpose::URL_SAFE.decode(value))
        .ok()?;

    serde_json::from_slice(&decoded).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(settings: Settings) -> CredentialStore {
        CredentialStore::new(Arc::new(settings))
    }

    #[tokio::test]
    async fn auth_config_variable() {
        let payload = r#"{"username":"ci","password":"secret","serveraddress":"ghcr.io"}"#;

        for value in [payload.to_owned(), STANDARD.encode(payload)] {
            let credentials = store(Settings {
                auth_config: Some(value),
                ..Settings::default()
            })
            .resolve("ghcr.io")
            .await
            .unwrap();

            assert_eq!(credentials.username.as_deref(), Some("ci"));
            assert_eq!(credentials.password.as_deref(), Some("secret"));
        }
    }

    #[tokio::test]
    async fn identity_token_user() {
        let credentials = store(Settings {
            user: Some(TOKEN_USER.into()),
            password: Some("tkn".into()),
            email: Some("a@b.c".into()),
            ..Settings::default()
        })
        .resolve("")
        .await
        .unwrap();

        assert_eq!(credentials.identitytoken.as_deref(), Some("tkn"));
        assert_eq!(credentials.password, None);
        assert_eq!(credentials.serveraddress.as_deref(), Some(DOCKER_HUB_REGISTRY));
    }

    #[tokio::test]
    async fn inline_auth_in_config_file() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.json"),
            format!(
                r#"{{"auths": {{"https://registry.example.com/v1/": {{"auth": "{}"}}}}}}"#,
                STANDARD.encode("user:pa:ss")
            ),
        )
        .unwrap();

        let store = store(Settings {
            config_dir: Some(tmp.path().to_owned()),
            ..Settings::default()
        });

        let credentials = store
            .resolve("https://registry.example.com/v2/foo")
            .await
            .unwrap();

        assert_eq!(credentials.username.as_deref(), Some("user"));
        assert_eq!(credentials.password.as_deref(), Some("pa:ss"));

        assert!(store.resolve("ghcr.io").await.is_none());
    }

    #[test]
    fn normalize_servers() {
        let store = store(Settings {
            server_address: Some("quay.io".into()),
            ..Settings::default()
        });

        assert_eq!(store.normalize_server(""), "quay.io");
        assert_eq!(store.normalize_server("https://ghcr.io/v2/"), "ghcr.io");
        assert_eq!(store.normalize_server("localhost:5000"), "localhost:5000");
    }
}
