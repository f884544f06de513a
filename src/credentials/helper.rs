//! Protocol of the [Docker credential helpers][helpers].
//!
//! The helper is invoked as `docker-credential-<name> get`, with the
//! server address in its standard input. The response is a JSON object
//! with `Username` and `Secret`.
//!
//! [helpers]: https://github.com/docker/docker-credential-helpers

use std::time::Duration;

use bollard::auth::DockerCredentials;

use super::TOKEN_USER;
use crate::{process, HostOs, Settings};

const HELPER_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(serde::Deserialize, Debug, Default)]
struct HelperResponse {
    #[serde(alias = "Username")]
    username: Option<String>,

    #[serde(alias = "Secret")]
    password: Option<String>,
}

fn helper_program(helper: &str, os: HostOs) -> String {
    match os {
        HostOs::Windows => format!("docker-credential-{helper}.exe"),
        _ => format!("docker-credential-{helper}"),
    }
}

/// Get the credentials for `server` from a credential helper.
pub(super) async fn get(helper: &str, server: &str, settings: &Settings) -> Option<DockerCredentials> {
    let program = helper_program(helper, settings.os);

    let stdout = match process::run_checked(&program, &["get"], Some(server), HELPER_TIMEOUT).await {
        Ok(stdout) => stdout,
        Err(err) => {
            tracing::debug!(%err, helper = %program, server, "credential helper failed");
            return None;
        }
    };

    let response: HelperResponse = match serde_json::from_str(stdout.trim()) {
        Ok(response) => response,
        Err(err) => {
            tracing::debug!(%err, helper = %program, "invalid response from credential helper");
            return None;
        }
    };

    Some(to_credentials(response, server, settings))
}

fn to_credentials(response: HelperResponse, server: &str, settings: &Settings) -> DockerCredentials {
    let username = response.username.or_else(|| settings.user.clone());
    let secret = response.password.or_else(|| settings.password.clone());

    let mut credentials = DockerCredentials {
        serveraddress: Some(server.to_owned()),
        email: settings.email.clone(),
        ..DockerCredentials::default()
    };

    if username.as_deref() == Some(TOKEN_USER) {
        credentials.identitytoken = secret;
    } else {
        credentials.username = username;
        credentials.password = secret;
    }

    credentials
}

#[test]
fn helper_responses() {
    let settings = Settings {
        password: Some("fallback".into()),
        ..Settings::default()
    };

    let response = serde_json::from_str(r#"{"ServerURL":"ghcr.io","Username":"u","Secret":"s"}"#).unwrap();
    let credentials = to_credentials(response, "ghcr.io", &settings);
    assert_eq!(credentials.username.as_deref(), Some("u"));
    assert_eq!(credentials.password.as_deref(), Some("s"));

    let response = serde_json::from_str(r#"{"username":"u"}"#).unwrap();
    let credentials = to_credentials(response, "ghcr.io", &settings);
    assert_eq!(credentials.password.as_deref(), Some("fallback"));

    let response = serde_json::from_str(r#"{"Username":"<token>","Secret":"t"}"#).unwrap();
    let credentials = to_credentials(response, "ghcr.io", &settings);
    assert_eq!(credentials.identitytoken.as_deref(), Some("t"));
    assert_eq!(credentials.username, None);

    assert_eq!(helper_program("desktop", HostOs::Windows), "docker-credential-desktop.exe");
    assert_eq!(helper_program("pass", HostOs::Linux), "docker-credential-pass");
}
