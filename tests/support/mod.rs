use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;

use apt_pantry::engine::Engine;
use apt_pantry::storage::memory::MemoryStore;
use apt_pantry::storage::{BlobCache, HeaderCache};
use apt_pantry::upstream::OriginClient;

pub struct MockServer {
    addr: SocketAddr,
    stop: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MockServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(http::Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("local addr");
        let (stop, stopped) = tokio::sync::oneshot::channel();
        tokio::spawn(accept_loop(listener, Arc::new(handler), stopped));
        Self {
            addr,
            stop: Some(stop),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

async fn accept_loop<F>(
    listener: TcpListener,
    handler: Arc<F>,
    mut stopped: tokio::sync::oneshot::Receiver<()>,
) where
    F: Fn(http::Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static,
{
    loop {
        let stream = tokio::select! {
            _ = &mut stopped => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(_) => return,
            },
        };
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let resp = handler(req);
                async move { Ok::<_, hyper::Error>(resp) }
            });
            let _ = ConnBuilder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(stream), service)
                .await;
        });
    }
}

#[derive(Clone, Default)]
pub struct Counters {
    gets: Arc<AtomicUsize>,
    heads: Arc<AtomicUsize>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, method: &Method) {
        if method == Method::GET {
            self.gets.fetch_add(1, Ordering::SeqCst);
        } else if method == Method::HEAD {
            self.heads.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn heads(&self) -> usize {
        self.heads.load(Ordering::SeqCst)
    }
}

pub fn engine_for(addr: SocketAddr) -> Engine {
    engine_with_timeout(addr, Duration::from_secs(5))
}

pub fn engine_with_timeout(addr: SocketAddr, timeout: Duration) -> Engine {
    let store = Arc::new(MemoryStore::new());
    let headers: Arc<dyn HeaderCache> = store.clone();
    let blobs: Arc<dyn BlobCache> = store;
    engine_with_stores(addr, blobs, headers)
}

pub fn engine_with_stores(
    addr: SocketAddr,
    blobs: Arc<dyn BlobCache>,
    headers: Arc<dyn HeaderCache>,
) -> Engine {
    let origin = OriginClient::new(&format!("http://{addr}"), Duration::from_secs(5));
    Engine::new(origin, blobs, headers, false)
}

pub async fn body_bytes(resp: Response<Full<Bytes>>) -> Bytes {
    resp.into_body().collect().await.expect("body").to_bytes()
}

pub fn build_response(status: StatusCode, headers: HeaderMap, body: Bytes) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(body));
    *resp.status_mut() = status;
    *resp.headers_mut() = headers;
    resp
}
