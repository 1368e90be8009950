//! Async request server.

use std::ffi::OsStr;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{Instant, timeout};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use glyph_core::Config;
use glyph_vision::EngineCell;
use glyph_vision::error::EngineError;

use crate::protocol::{
    FailureReply, OcrReply, Request, Response, ShutdownReply, StatusReply, WireCodec,
};
use crate::sink::{FileSink, ResultSink};

struct Shared {
    cell: Arc<EngineCell>,
    sink: Arc<dyn ResultSink>,
    token: CancellationToken,
    host: String,
    port: u16,
    read_timeout: Duration,
}

/// What the connection loop does after sending a response.
enum Action {
    /// Keep reading requests on this connection.
    Continue,
    /// Close the connection.
    Close,
    /// Close the connection and stop the server.
    Stop,
}

/// A bound server that has not started accepting yet.
///
/// Splitting bind from serve lets callers learn the actual listen
/// address (relevant with port 0) and hold the cancellation token
/// before the accept loop runs.
pub struct RequestServer {
    listener: TcpListener,
    shared: Arc<Shared>,
    tracker: TaskTracker,
}

impl RequestServer {
    /// Bind the configured endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error when the host does not resolve or no resolved
    /// address can be bound.
    pub async fn bind(
        config: &Config,
        cell: Arc<EngineCell>,
        sink: Arc<dyn ResultSink>,
    ) -> eyre::Result<Self> {
        let listener = bind_listener(&config.host, config.port)?;
        let port = listener.local_addr()?.port();
        info!(host = %config.host, port, "listening");

        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                cell,
                sink,
                token: CancellationToken::new(),
                host: config.host.clone(),
                port,
                read_timeout: config.read_timeout,
            }),
            tracker: TaskTracker::new(),
        })
    }

    /// Address the listener actually bound.
    ///
    /// # Errors
    ///
    /// Propagates the socket lookup failure.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Token observed by every connection. Cancelling it stops the
    /// server the same way a `shutdown` request does.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.token.clone()
    }

    /// Accept and serve until shutdown, then drain connections and
    /// release the engine.
    ///
    /// # Errors
    ///
    /// Returns an error only for unrecoverable accept-loop failures;
    /// per-connection errors are logged and absorbed.
    pub async fn serve(self) -> eyre::Result<()> {
        let Self {
            listener,
            shared,
            tracker,
        } = self;

        loop {
            tokio::select! {
                () = shared.token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "client connected");
                        tracker.spawn(handle_connection(stream, peer, Arc::clone(&shared)));
                    }
                    Err(e) => warn!(%e, "accept error"),
                },
            }
        }

        // no new connections during teardown
        drop(listener);
        shared.cell.begin_stop();
        tracker.close();
        tracker.wait().await;
        shared.cell.release().await;
        info!("server stopped");

        Ok(())
    }
}

/// Initialize the engine, bind, and serve until a `shutdown` request or
/// a termination signal.
///
/// The engine is built before the listener binds, so clients can never
/// reach a server that will not become ready.
///
/// # Errors
///
/// Refuses to serve when initialization fails, and propagates bind
/// failures.
#[instrument(skip(config), fields(endpoint = %config.endpoint(), backend = ?config.backend))]
pub async fn run(config: &Config) -> eyre::Result<()> {
    let cell = Arc::new(EngineCell::new());

    let init_cell = Arc::clone(&cell);
    let init_config = config.clone();
    tokio::task::spawn_blocking(move || {
        init_cell.initialize(|| glyph_vision::build_engine(&init_config))
    })
    .await??;

    let server = RequestServer::bind(config, cell, Arc::new(FileSink)).await?;
    tokio::spawn(watch_signals(server.cancellation_token()));
    server.serve().await
}

fn bind_listener(host: &str, port: u16) -> eyre::Result<TcpListener> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| eyre::eyre!("cannot resolve {host}:{port}: {e}"))?
        .collect();

    let mut last_err = None;
    for addr in addrs {
        let bound = new_socket(addr).and_then(|socket| {
            socket.set_reuseaddr(true)?;
            socket.bind(addr)?;
            socket.listen(1024)
        });
        match bound {
            Ok(listener) => return Ok(listener),
            Err(e) => last_err = Some((addr, e)),
        }
    }

    match last_err {
        Some((addr, e)) => Err(eyre::eyre!("cannot bind {addr}: {e}")),
        None => Err(eyre::eyre!("{host}:{port} resolves to no addresses")),
    }
}

fn new_socket(addr: SocketAddr) -> io::Result<TcpSocket> {
    if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
}

async fn watch_signals(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                    _ = term.recv() => info!("received SIGTERM"),
                }
            }
            Err(e) => {
                warn!(%e, "cannot install SIGTERM handler");
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                info!("received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        info!("received SIGINT");
    }
    token.cancel();
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, shared: Arc<Shared>) {
    let mut framed = Framed::new(stream, WireCodec);

    loop {
        let frame = tokio::select! {
            () = shared.token.cancelled() => break,
            next = timeout(shared.read_timeout, framed.next()) => match next {
                Err(_) => {
                    debug!(%peer, "connection idle past read timeout");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    warn!(%peer, %e, "connection error");
                    break;
                }
                Ok(Some(Ok(frame))) => frame,
            },
        };

        let (response, action) = match Request::from_json(&frame) {
            Ok(request) => dispatch(request, &shared).await,
            Err(e) => {
                debug!(%peer, %e, "rejected request payload");
                (Response::failure(e.to_string()), Action::Continue)
            }
        };

        if let Err(e) = framed.send(response).await {
            warn!(%peer, %e, "failed to send response");
            break;
        }

        match action {
            Action::Continue => {}
            Action::Close => break,
            Action::Stop => {
                shared.token.cancel();
                break;
            }
        }
    }

    debug!(%peer, "client disconnected");
}

async fn dispatch(request: Request, shared: &Shared) -> (Response, Action) {
    match request {
        Request::Status => {
            debug!("status request");
            let response = Response::Status(StatusReply {
                success: true,
                server_running: !shared.token.is_cancelled(),
                model_loaded: shared.cell.is_ready(),
                host: shared.host.clone(),
                port: shared.port,
            });
            // status is a one-exchange probe; the connection closes after it
            (response, Action::Close)
        }
        Request::Shutdown => {
            info!("shutdown requested");
            shared.cell.begin_stop();
            let response = Response::Shutdown(ShutdownReply {
                success: true,
                message: "server shutting down".to_string(),
            });
            (response, Action::Stop)
        }
        Request::Ocr {
            image_path,
            output_dir,
        } => (
            handle_ocr(shared, &image_path, &output_dir).await,
            Action::Continue,
        ),
    }
}

#[instrument(skip_all, fields(image = %image_path.display()))]
async fn handle_ocr(shared: &Shared, image_path: &Path, output_dir: &Path) -> Response {
    if !matches!(tokio::fs::try_exists(image_path).await, Ok(true)) {
        return Response::failure(format!("image file not found: {}", image_path.display()));
    }

    let started = Instant::now();
    let pages = match shared.cell.infer(image_path).await {
        Ok(pages) => pages,
        Err(e) => return engine_failure(&e),
    };
    let processing_time = started.elapsed().as_secs_f64();

    let save_path = output_dir.join(image_stem(image_path));
    let results = match shared.sink.persist(&save_path, &pages) {
        Ok(results) => results,
        Err(e) => return Response::failure(format!("failed to persist results: {e:#}")),
    };

    debug!(pages = pages.len(), processing_time, "ocr complete");
    Response::Ocr(OcrReply {
        success: true,
        processing_time,
        results,
        save_path: save_path.display().to_string(),
    })
}

fn engine_failure(e: &EngineError) -> Response {
    let details = match e {
        EngineError::Inference { details, .. } => details.clone(),
        _ => None,
    };
    Response::Failure(FailureReply {
        success: false,
        error: e.to_string(),
        details,
    })
}

/// Save directory name for an image: file name without its extension.
fn image_stem(path: &Path) -> &OsStr {
    path.file_stem()
        .or_else(|| path.file_name())
        .unwrap_or_else(|| OsStr::new("result"))
}
