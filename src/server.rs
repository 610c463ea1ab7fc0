use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::StatusCode;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::assets;
use crate::config::Config;
use crate::credentials;
use crate::guard::BruteForceGuard;
use crate::request::{parse_form, parse_request, Request};
use crate::response::{attachment_header, Response};
use crate::sandbox::{DownloadKind, Sandbox, SandboxError, VirtualPath};
use crate::session::{set_cookie_header, Session, SessionStore};

/// Largest login form body accepted.
const MAX_FORM_BYTES: u64 = 16 * 1024;

/// Routes and the methods each accepts.
const ROUTES: &[(&str, &[&str])] = &[
    ("/log", &["GET", "POST"]),
    ("/home", &["GET"]),
    ("/directory", &["GET"]),
    ("/download", &["GET"]),
    ("/upload", &["POST"]),
    ("/create-directory", &["POST"]),
    ("/delete", &["POST"]),
    ("/rename", &["POST"]),
];

pub struct AppState {
    pub users: PathBuf,
    pub read_timeout: Duration,
    pub sessions: SessionStore,
    pub guard: BruteForceGuard,
    pub sandbox: Sandbox,
}

impl AppState {
    pub fn new(config: &Config) -> Self {
        Self {
            users: config.users.clone(),
            read_timeout: config.read_timeout(),
            sessions: SessionStore::new(config.session_ttl()),
            guard: BruteForceGuard::default(),
            sandbox: Sandbox::local(config.uploads.clone()),
        }
    }
}

/// Accept TCP connections forever, handing each one to its own task.
pub async fn accept_loop(listener: TcpListener, acceptor: TlsAcceptor, state: Arc<AppState>) {
    loop {
        let (tcp, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(target: "server", %err, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            match timeout(state.read_timeout, acceptor.accept(tcp)).await {
                Ok(Ok(tls)) => serve_connection(state, tls, peer).await,
                Ok(Err(err)) => debug!(target: "server", %peer, %err, "TLS handshake failed"),
                Err(_) => debug!(target: "server", %peer, "TLS handshake timed out"),
            }
        });
    }
}

/// Serve exactly one request on `stream`, then close it.
pub async fn serve_connection<S>(state: Arc<AppState>, stream: S, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut stream = BufReader::new(stream);

    let response = if state.guard.check(peer.ip(), Instant::now()) {
        warn!(
            target: "guard",
            %peer,
            tracked = state.guard.tracked_peers(),
            "connection rate exceeded"
        );
        Response::text(StatusCode::TOO_MANY_REQUESTS, "Too many requests")
            .with_header("Retry-After", state.guard.window().as_secs().to_string())
    } else {
        match timeout(state.read_timeout, parse_request(&mut stream, peer)).await {
            Ok(Ok(request)) => {
                let response = dispatch(&state, &request, &mut stream).await;
                info!(
                    target: "server",
                    %peer,
                    method = %request.method,
                    route = %request.route(),
                    version = %request.version,
                    status = response.status.as_u16(),
                    content_type = response.header("Content-Type").unwrap_or("-"),
                    "request"
                );
                response
            }
            Ok(Err(err)) if err.is_client_error() => {
                debug!(target: "server", %peer, %err, "rejecting request");
                Response::text(StatusCode::BAD_REQUEST, "Bad request")
            }
            Ok(Err(err)) => {
                debug!(target: "server", %peer, %err, "closing connection");
                return;
            }
            Err(_) => {
                debug!(target: "server", %peer, "timed out reading request head");
                return;
            }
        }
    };

    let stream = stream.get_mut();
    if let Err(err) = response.write_to(stream, state.read_timeout).await {
        debug!(target: "server", %peer, %err, "failed to write response");
    }
    let _ = stream.shutdown().await;
}

fn allowed_methods(route: &str) -> Option<&'static [&'static str]> {
    ROUTES
        .iter()
        .find(|(path, _)| *path == route)
        .map(|(_, methods)| *methods)
}

/// Route one parsed request. `body` is positioned at the first body byte.
pub async fn dispatch<R>(state: &AppState, request: &Request, body: &mut R) -> Response
where
    R: AsyncBufRead + Unpin + Send,
{
    let route = request.route();
    let Some(methods) = allowed_methods(route) else {
        return Response::text(StatusCode::NOT_FOUND, "Not found");
    };
    if !methods.contains(&request.method.as_str()) {
        return Response::text(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
            .with_header("Allow", methods.join(", "));
    }

    if route == "/log" {
        return match request.method.as_str() {
            "GET" => login_form(),
            _ => login(state, request, body).await,
        };
    }

    let Some(session) = state
        .sessions
        .get(request.header("Cookie"), Instant::now())
    else {
        return Response::text(StatusCode::UNAUTHORIZED, "User not logged in");
    };

    let result = match route {
        "/home" => home(state, &session, request).await,
        "/directory" => directory(state, &session, request).await,
        "/download" => download(state, &session, request).await,
        "/upload" => upload(state, &session, request, body).await,
        "/create-directory" => create_directory(state, &session, request).await,
        "/delete" => delete(state, &session, request).await,
        "/rename" => rename(state, &session, request).await,
        _ => return Response::text(StatusCode::NOT_FOUND, "Not found"),
    };
    result.unwrap_or_else(|err| {
        match &err {
            SandboxError::Io(source) => {
                error!(target: "files", user = %session.username, %route, %source, "filesystem failure")
            }
            other => debug!(target: "files", user = %session.username, %route, err = %other, "request refused"),
        }
        Response::from(err)
    })
}

fn internal_error() -> Response {
    Response::text(
        StatusCode::INTERNAL_SERVER_ERROR,
        "Unable to process your request. Please try again later.",
    )
}

fn login_form() -> Response {
    match assets::login_page() {
        Some(page) => Response::html(StatusCode::OK, page),
        None => internal_error(),
    }
}

async fn read_form<R>(request: &Request, body: &mut R, idle: Duration) -> Result<String, Response>
where
    R: AsyncBufRead + Unpin + Send,
{
    let len = request.content_length().unwrap_or(0);
    if len > MAX_FORM_BYTES {
        return Err(Response::text(StatusCode::PAYLOAD_TOO_LARGE, "Form too large"));
    }
    let mut buf = vec![0u8; len as usize];
    match timeout(idle, body.read_exact(&mut buf)).await {
        Ok(Ok(_)) => Ok(String::from_utf8_lossy(&buf).into_owned()),
        _ => Err(Response::text(StatusCode::BAD_REQUEST, "Incomplete request body")),
    }
}

async fn login<R>(state: &AppState, request: &Request, body: &mut R) -> Response
where
    R: AsyncBufRead + Unpin + Send,
{
    let form = match read_form(request, body, state.read_timeout).await {
        Ok(form) => parse_form(&form),
        Err(response) => return response,
    };
    let username = form.get("username").map(String::as_str).unwrap_or("");
    let password = form.get("password").map(String::as_str).unwrap_or("");

    let users = match credentials::load_credentials(&state.users).await {
        Ok(users) => users,
        Err(err) => {
            error!(target: "auth", %err, "cannot check login");
            return internal_error();
        }
    };
    if !credentials::verify(&users, username, password) {
        warn!(target: "auth", peer = %request.peer, %username, "failed login");
        return Response::text(StatusCode::UNAUTHORIZED, "Invalid username or password");
    }

    // Users added to the credentials file after startup get their directory
    // on first login.
    if let Err(err) = state.sandbox.ensure_user_root(username).await {
        error!(target: "files", %username, %err, "cannot create user directory");
        return internal_error();
    }

    let session = state.sessions.create(username, Instant::now());
    info!(
        target: "auth",
        peer = %request.peer,
        %username,
        active_sessions = state.sessions.len(),
        "login"
    );
    Response::redirect("/home")
        .with_header("Set-Cookie", set_cookie_header(&session, state.sessions.ttl()))
}

async fn home(state: &AppState, session: &Session, request: &Request) -> Result<Response, SandboxError> {
    let query = request.query();
    let raw = query.get("path").map(String::as_str).unwrap_or("/");
    let shown = VirtualPath::parse(Some(raw))?.to_virtual_string();
    let entries = state
        .sandbox
        .list_with_tree_sizes(&session.username, Some(raw))
        .await?;
    Ok(match assets::directory_page(&shown, &entries) {
        Some(page) => Response::html(StatusCode::OK, page),
        None => internal_error(),
    })
}

async fn directory(
    state: &AppState,
    session: &Session,
    request: &Request,
) -> Result<Response, SandboxError> {
    let query = request.query();
    let entries = state
        .sandbox
        .list(
            &session.username,
            query.get("path").map(String::as_str),
            query.get("filter").map(String::as_str),
        )
        .await?;
    Ok(Response::json(StatusCode::OK, &entries))
}

async fn download(
    state: &AppState,
    session: &Session,
    request: &Request,
) -> Result<Response, SandboxError> {
    let query = request.query();
    let download = state
        .sandbox
        .download(&session.username, query.get("path").map(String::as_str))
        .await?;
    let content_type = match download.kind {
        DownloadKind::Archive => "application/zip",
        DownloadKind::File => "application/octet-stream",
    };
    debug!(target: "files", user = %session.username, file = %download.file_name, len = download.len, "download");
    Ok(Response::stream(download.body, download.len)
        .with_content_type(content_type)
        .with_header("Content-Disposition", attachment_header(&download.file_name)))
}

async fn upload<R>(
    state: &AppState,
    session: &Session,
    request: &Request,
    body: &mut R,
) -> Result<Response, SandboxError>
where
    R: AsyncBufRead + Unpin + Send,
{
    let query = request.query();
    let limit = request.content_length().unwrap_or(u64::MAX);
    let stored = state
        .sandbox
        .upload(
            &session.username,
            query.get("path").map(String::as_str),
            request.header("Content-Type"),
            body.take(limit),
            state.read_timeout,
        )
        .await?;
    info!(target: "files", user = %session.username, count = stored.len(), "upload");
    Ok(Response::json(StatusCode::OK, &stored))
}

async fn create_directory(
    state: &AppState,
    session: &Session,
    request: &Request,
) -> Result<Response, SandboxError> {
    let query = request.query();
    state
        .sandbox
        .create_directory(&session.username, query.get("path").map(String::as_str))
        .await?;
    Ok(Response::text(StatusCode::OK, "Directory created"))
}

async fn delete(state: &AppState, session: &Session, request: &Request) -> Result<Response, SandboxError> {
    let query = request.query();
    state
        .sandbox
        .delete(&session.username, query.get("path").map(String::as_str))
        .await?;
    info!(target: "files", user = %session.username, path = ?query.get("path"), "delete");
    Ok(Response::text(StatusCode::OK, "Deleted"))
}

async fn rename(state: &AppState, session: &Session, request: &Request) -> Result<Response, SandboxError> {
    let query = request.query();
    state
        .sandbox
        .rename(
            &session.username,
            query.get("old").map(String::as_str),
            query.get("new").map(String::as_str),
        )
        .await?;
    Ok(Response::text(StatusCode::OK, "Renamed"))
}
