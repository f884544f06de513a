use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use tiny_http::{Header, Method, Request, Response, Server};

/// Behaviour of the image creation endpoint.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Pull {
    /// The image is already in the daemon.
    Cached,

    /// The image is available after `POST /images/create`.
    Succeed,

    /// Pull fails because the image has no variant for the platform.
    WrongPlatform,

    /// Pull works only when the name is exactly the served image.
    ExactName,
}

/// Fake daemon with a Docker-compatible API, listening on a unix socket.
pub struct Daemon {
    pub socket: PathBuf,
    requests: Arc<Mutex<Vec<String>>>,
    pulls: Arc<Mutex<Vec<String>>>,
}

impl Daemon {
    /// Start a daemon in `dir` that serves one image.
    ///
    /// `archive` is the response to the export request.
    pub fn start(dir: &Path, image: &'static str, pull: Pull, archive: Vec<u8>) -> Daemon {
        let socket = dir.join("docker.sock");
        let server = Server::http_unix(&socket).expect("start daemon");

        let requests = Arc::new(Mutex::new(Vec::new()));
        let pulls = Arc::new(Mutex::new(Vec::new()));

        let state = State {
            server,
            image,
            pull,
            pulled: pull == Pull::Cached,
            archive,
            requests: Arc::clone(&requests),
            pulls: Arc::clone(&pulls),
        };

        std::thread::spawn(move || state.run());

        Daemon {
            socket,
            requests,
            pulls,
        }
    }

    /// Value for `DOCKER_HOST`.
    pub fn host(&self) -> String {
        format!("unix://{}", self.socket.display())
    }

    /// Requests received by the daemon, as `METHOD /path`, without the
    /// API version and the query string.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    /// Value of `fromImage` in every pull request.
    pub fn pulls(&self) -> Vec<String> {
        self.pulls.lock().unwrap().clone()
    }
}

struct State {
    server: Server,
    image: &'static str,
    pull: Pull,
    pulled: bool,
    archive: Vec<u8>,
    requests: Arc<Mutex<Vec<String>>>,
    pulls: Arc<Mutex<Vec<String>>>,
}

impl State {
    fn run(mut self) {
        let timeout = Duration::from_secs(30);

        while let Ok(Some(request)) = self.server.recv_timeout(timeout) {
            self.handle(request);
        }
    }

    fn handle(&mut self, request: Request) {
        let path = route(request.url());
        let method = request.method().clone();

        self.requests
            .lock()
            .unwrap()
            .push(format!("{method} {path}"));

        match (&method, path.as_str()) {
            (Method::Get | Method::Head, "/_ping") => send(request, 200, "text/plain", "OK"),

            (Method::Post, "/images/create") => self.create(request),

            (Method::Get, p) if p.starts_with("/images/") && p.ends_with("/json") => {
                let name = &p["/images/".len()..p.len() - "/json".len()];

                if self.pulled && name == self.image {
                    let inspect = serde_json::json!({
                        "Id": "sha256:0123456789abcdef",
                        "RepoTags": [self.image],
                        "Config": {
                            "Env": ["PATH=/usr/local/sbin:/usr/local/bin:/usr/bin"],
                            "WorkingDir": "/app",
                        },
                    });

                    send(request, 200, "application/json", inspect.to_string());
                } else {
                    not_found(request, name);
                }
            }

            (Method::Get, p) if p.starts_with("/images/") && p.ends_with("/get") => {
                let name = &p["/images/".len()..p.len() - "/get".len()];

                if self.pulled && name == self.image {
                    send(request, 200, "application/x-tar", self.archive.clone());
                } else {
                    not_found(request, name);
                }
            }

            (Method::Delete, p) if p.starts_with("/images/") => {
                send(request, 200, "application/json", r#"[{"Untagged":"x"}]"#);
            }

            _ => not_found(request, &path),
        }
    }

    fn create(&mut self, request: Request) {
        let from_image = request
            .url()
            .split_once('?')
            .and_then(|(_, query)| {
                query
                    .split('&')
                    .find_map(|param| param.strip_prefix("fromImage="))
            })
            .map(decode)
            .unwrap_or_default();

        self.pulls.lock().unwrap().push(from_image.clone());

        let body = match self.pull {
            Pull::ExactName if from_image != self.image => concat!(
                r#"{"errorDetail":{"message":"pull access denied"},"error":"pull access denied"}"#,
                "\n",
            ),

            Pull::WrongPlatform => concat!(
                r#"{"status":"Pulling from library/image"}"#,
                "\n",
                r#"{"errorDetail":{"message":"no match for platform in manifest"},"error":"no match for platform in manifest"}"#,
                "\n",
            ),

            Pull::Cached | Pull::Succeed | Pull::ExactName => {
                self.pulled = true;
                concat!(
                    r#"{"status":"Pulling from library/image"}"#,
                    "\n",
                    r#"{"status":"Download complete"}"#,
                    "\n",
                )
            }
        };

        send(request, 200, "application/json", body);
    }
}

/// Remove the query string and the version prefix (`/v1.45`) of a URL.
fn route(url: &str) -> String {
    let path = decode(url.split('?').next().unwrap_or(url));

    if let Some((version, tail)) = path.strip_prefix("/v").and_then(|rest| rest.split_once('/')) {
        if version.chars().all(|c| c.is_ascii_digit() || c == '.') {
            return format!("/{tail}");
        }
    }

    path
}

fn decode(value: &str) -> String {
    value.replace("%3A", ":").replace("%2F", "/")
}

fn not_found(request: Request, name: &str) {
    let body = serde_json::json!({ "message": format!("No such image: {name}") });
    send(request, 404, "application/json", body.to_string());
}

fn send(request: Request, status: u16, content_type: &str, body: impl Into<Vec<u8>>) {
    let response = Response::from_data(body)
        .with_status_code(status)
        .with_header(Header::from_bytes("Content-Type", content_type).unwrap());

    let _ = request.respond(response);
}
