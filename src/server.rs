use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::watch;

use crate::config::Bootstrap;
use crate::engine::Engine;
use crate::policy::{self, FreshnessPolicy};
use crate::storage::disk::DiskStore;
use crate::storage::memory::MemoryStore;
use crate::storage::{BlobCache, HeaderCache};
use crate::upstream::OriginClient;

pub async fn run(cfg: Arc<Bootstrap>) -> Result<()> {
    let state = Arc::new(AppState::new(&cfg)?);
    let listener = bind_listener(&cfg.server.addr)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx);
    log::info!("listening on {}", cfg.server.addr);
    match listener {
        ListenerKind::Tcp(listener) => run_tcp(listener, shutdown_rx, state).await,
        ListenerKind::Unix(listener) => run_unix(listener, shutdown_rx, state).await,
    }
}

pub struct AppState {
    routes: Vec<RepoRoute>,
    log_requests: bool,
}

struct RepoRoute {
    prefix: String,
    engine: Engine,
}

impl AppState {
    pub fn new(cfg: &Bootstrap) -> Result<Self> {
        let timeout = cfg.origin_timeout();
        let mut routes = Vec::new();
        for repo in &cfg.repositories {
            let origin = OriginClient::new(repo.upstream.trim_end_matches('/'), timeout);
            let (blobs, headers): (Arc<dyn BlobCache>, Arc<dyn HeaderCache>) =
                match cfg.cache.driver.as_str() {
                    "memory" => {
                        let store = Arc::new(MemoryStore::new());
                        let headers: Arc<dyn HeaderCache> = store.clone();
                        let blobs: Arc<dyn BlobCache> = store;
                        (blobs, headers)
                    }
                    _ => {
                        let dir = Path::new(&cfg.cache.dir).join(&repo.name);
                        let store = Arc::new(DiskStore::new(&dir)?);
                        let headers: Arc<dyn HeaderCache> = store.clone();
                        let blobs: Arc<dyn BlobCache> = store;
                        (blobs, headers)
                    }
                };
            let engine = Engine::new(origin, blobs, headers, cfg.server.log_requests);
            routes.push(RepoRoute {
                prefix: repo.prefix.trim_end_matches('/').to_string(),
                engine,
            });
        }
        // Longest prefix wins.
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Ok(Self {
            routes,
            log_requests: cfg.server.log_requests,
        })
    }

    fn resolve<'a>(&'a self, path: &str) -> Option<(&'a RepoRoute, String)> {
        for route in &self.routes {
            if let Some(rest) = path.strip_prefix(&route.prefix) {
                if rest.is_empty() {
                    return Some((route, "/".to_string()));
                }
                if rest.starts_with('/') {
                    return Some((route, rest.to_string()));
                }
            }
        }
        None
    }
}

pub async fn route_request(req: Request<Incoming>, state: &AppState) -> Response<Full<Bytes>> {
    let method = req.method();
    if method != Method::GET && method != Method::HEAD {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }
    if req.uri().query().is_some_and(|q| !q.is_empty()) {
        return text_response(StatusCode::FORBIDDEN, "forbidden");
    }
    let path = req.uri().path();
    let Some((route, origin_path)) = state.resolve(path) else {
        return text_response(StatusCode::NOT_FOUND, "not found");
    };
    if state.log_requests {
        log::info!("{method} {path}");
    }
    let policy = if policy::is_release_route(&origin_path) {
        FreshnessPolicy::FORCE_REVALIDATE
    } else {
        policy::classify(&origin_path)
    };
    route
        .engine
        .serve(method, &origin_path, req.headers(), policy)
        .await
}

async fn handle(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    Ok(route_request(req, &state).await)
}

enum ListenerKind {
    Tcp(TcpListener),
    Unix(UnixListener),
}

fn is_unix_addr(addr: &str) -> bool {
    addr.starts_with("unix://") || addr.ends_with(".sock") || addr.starts_with('/')
}

fn bind_listener(addr: &str) -> Result<ListenerKind> {
    if is_unix_addr(addr) {
        let path = addr.strip_prefix("unix://").unwrap_or(addr);
        let path_ref = Path::new(path);
        if path_ref.exists() {
            std::fs::remove_file(path_ref).ok();
        }
        let listener =
            std::os::unix::net::UnixListener::bind(path_ref).context("bind unix socket")?;
        listener.set_nonblocking(true)?;
        return Ok(ListenerKind::Unix(UnixListener::from_std(listener)?));
    }

    let bind_addr = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };
    let socket_addr: SocketAddr = bind_addr.parse().context("parse server.addr")?;
    let listener = std::net::TcpListener::bind(socket_addr).context("bind tcp")?;
    listener.set_nonblocking(true)?;
    Ok(ListenerKind::Tcp(TcpListener::from_std(listener)?))
}

fn spawn_signal_handler(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();
        tokio::select! {
            _ = async {
                if let Some(sig) = sigterm.as_mut() {
                    let _ = sig.recv().await;
                }
            } => {}
            _ = async {
                if let Some(sig) = sigint.as_mut() {
                    let _ = sig.recv().await;
                }
            } => {}
        }
        let _ = shutdown.send(true);
    });
}

async fn run_tcp(
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
    state: Arc<AppState>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            res = listener.accept() => {
                let (stream, _) = res.context("accept tcp")?;
                let io = TokioIo::new(stream);
                let state = Arc::clone(&state);

                tokio::spawn(async move {
                    let service = service_fn(move |req| handle(req, Arc::clone(&state)));
                    let builder = ConnBuilder::new(TokioExecutor::new());
                    if let Err(err) = builder.serve_connection(io, service).await {
                        log::error!("http connection error: {err}");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn run_unix(
    listener: UnixListener,
    mut shutdown: watch::Receiver<bool>,
    state: Arc<AppState>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            res = listener.accept() => {
                let (stream, _) = res.context("accept unix")?;
                let io = TokioIo::new(stream);
                let state = Arc::clone(&state);

                tokio::spawn(async move {
                    let service = service_fn(move |req| handle(req, Arc::clone(&state)));
                    let builder = ConnBuilder::new(TokioExecutor::new());
                    if let Err(err) = builder.serve_connection(io, service).await {
                        log::error!("http connection error: {err}");
                    }
                });
            }
        }
    }
    Ok(())
}

fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}
