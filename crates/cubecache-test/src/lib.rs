//! Helpers for testing the storage client against a fake blob origin.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`BlobServer`], make sure that the server is held until all requests to
//!    the server have been made. If the server is dropped, the port is closed and all
//!    connections to it will fail. To avoid this, assign it to a variable:
//!    `let server = BlobServer::new();`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{self, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use reqwest::Url;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `cubecache_service` crate and mutes
///    all other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("cubecache_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A single request as seen by the [`BlobServer`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedRequest {
    /// The request path, without query string.
    pub path: String,
    /// The `If-None-Match` header, if the request was conditional.
    pub if_none_match: Option<String>,
}

#[derive(Clone, Debug, Default)]
struct BlobState {
    blobs: Arc<Mutex<BTreeMap<String, (Bytes, String)>>>,
}

impl BlobState {
    fn lookup(&self, path: &str) -> Option<(Bytes, String)> {
        self.blobs.lock().unwrap().get(path).cloned()
    }
}

/// A fake blob origin that speaks the subset of the Azure Blob protocol the storage client uses.
///
/// Routes:
///
///  - `/blobs/*path`: serves blobs registered with [`put`](Self::put). Honors `If-None-Match`
///    with `304 Not Modified` and responds `404` with a `BlobNotFound` error code for unknown
///    blobs.
///  - `/stale/*path`: serves the same blobs, but always responds with the full content,
///    ignoring any presented validator.
///  - `/respond_statuscode/:num/*tail`: responds with the given status code.
///  - `/delay/:time/*path`: sleeps for the given duration, then serves like `/blobs/`.
///
/// Every request is recorded and can be inspected via [`requests`](Self::requests).
pub struct BlobServer {
    server: Server,
    state: BlobState,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl BlobServer {
    pub fn new() -> Self {
        let state = BlobState::default();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let recorder = {
            let requests = requests.clone();
            move |req: Request, next: Next| {
                let requests = requests.clone();
                async move {
                    {
                        let if_none_match = req
                            .headers()
                            .get(header::IF_NONE_MATCH)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_owned);
                        let mut requests = requests.lock().unwrap();
                        requests.push(RecordedRequest {
                            path: req.uri().path().to_owned(),
                            if_none_match,
                        });
                    }

                    next.run(req).await
                }
            }
        };

        let router = Router::new()
            .route(
                "/blobs/*path",
                get(
                    |State(state): State<BlobState>,
                     extract::Path(path): extract::Path<String>,
                     headers: HeaderMap| async move {
                        serve_blob(&state, &path, &headers)
                    },
                ),
            )
            .route(
                "/stale/*path",
                get(
                    |State(state): State<BlobState>,
                     extract::Path(path): extract::Path<String>| async move {
                        serve_blob(&state, &path, &HeaderMap::new())
                    },
                ),
            )
            .route(
                "/respond_statuscode/:num/*tail",
                get(
                    |extract::Path((num, _)): extract::Path<(u16, String)>| async move {
                        let status =
                            StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                        (status, [("x-ms-error-code", error_code(status))])
                    },
                ),
            )
            .route(
                "/delay/:time/*path",
                get(
                    |State(state): State<BlobState>,
                     extract::Path((time, path)): extract::Path<(String, String)>,
                     headers: HeaderMap| async move {
                        let duration = humantime::parse_duration(&time).unwrap();
                        tokio::time::sleep(duration).await;
                        serve_blob(&state, &path, &headers)
                    },
                ),
            )
            .layer(middleware::from_fn(recorder))
            .with_state(state.clone());

        let server = Server::with_router(router);

        Self {
            server,
            state,
            requests,
        }
    }

    /// Registers a blob under `path`, replacing any previous version.
    pub fn put(&self, path: &str, content: impl Into<Bytes>, etag: &str) {
        let path = path.trim_start_matches('/').to_owned();
        self.state
            .blobs
            .lock()
            .unwrap()
            .insert(path, (content.into(), etag.to_owned()));
    }

    /// Returns the URL of a blob served via the `/blobs/` route.
    pub fn blob_url(&self, path: &str) -> Url {
        self.server
            .url(&format!("blobs/{}", path.trim_start_matches('/')))
    }

    /// Returns a full URL pointing to the given route.
    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }

    /// Takes all requests recorded so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        std::mem::take(&mut *self.requests.lock().unwrap())
    }

    /// Takes the number of requests recorded so far.
    pub fn accesses(&self) -> usize {
        self.requests().len()
    }

    /// Takes the recorded requests, grouped and counted by path.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let mut hits = BTreeMap::<String, usize>::new();
        for request in self.requests() {
            *hits.entry(request.path).or_default() += 1;
        }
        hits.into_iter().collect()
    }
}

impl Default for BlobServer {
    fn default() -> Self {
        Self::new()
    }
}

fn serve_blob(state: &BlobState, path: &str, headers: &HeaderMap) -> Response {
    let Some((content, etag)) = state.lookup(path) else {
        return (
            StatusCode::NOT_FOUND,
            [("x-ms-error-code", error_code(StatusCode::NOT_FOUND))],
            "The specified blob does not exist.",
        )
            .into_response();
    };

    let presented = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok());
    if presented == Some(etag.as_str()) {
        return (StatusCode::NOT_MODIFIED, [(header::ETAG, etag)]).into_response();
    }

    (StatusCode::OK, [(header::ETAG, etag)], content).into_response()
}

/// The Azure storage error code a status would typically carry.
fn error_code(status: StatusCode) -> &'static str {
    match status {
        StatusCode::NOT_FOUND => "BlobNotFound",
        StatusCode::FORBIDDEN => "AuthorizationFailure",
        StatusCode::UNAUTHORIZED => "NoAuthenticationInformation",
        StatusCode::NOT_MODIFIED => "ConditionNotMet",
        StatusCode::SERVICE_UNAVAILABLE => "ServerBusy",
        _ => "InternalError",
    }
}
