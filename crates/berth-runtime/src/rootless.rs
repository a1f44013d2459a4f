//! Rootless mode detection and clients for the rootless helpers.
//!
//! Both the port manager (served by the rootless namespace daemon at
//! `$ROOTLESSKIT_STATE_DIR/api.sock`) and the bypass4netns daemon speak
//! JSON over HTTP/1.1 on a unix socket.

use crate::RuntimeError;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE, HOST};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;
use tracing::debug;

pub const STATE_DIR_ENV: &str = "ROOTLESSKIT_STATE_DIR";
const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Running inside the rootless namespace set up by the rootless daemon.
pub fn is_rootless_child() -> bool {
    std::env::var_os(STATE_DIR_ENV).is_some_and(|v| !v.is_empty())
}

/// Running as an unprivileged user outside any rootless namespace.
pub fn is_rootless_parent() -> bool {
    crate::current_uid() != 0 && !is_rootless_child()
}

pub fn is_rootless() -> bool {
    is_rootless_parent() || is_rootless_child()
}

pub fn rootless_state_dir() -> Option<PathBuf> {
    std::env::var_os(STATE_DIR_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Blocking HTTP/1.1 client over a unix socket.
///
/// Each request drives one connection on a private current-thread runtime.
#[derive(Debug, Clone)]
pub struct UnixHttpClient {
    socket_path: PathBuf,
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

fn http_failure(what: &str, e: impl Display) -> RuntimeError {
    RuntimeError::ExecFailed(format!("{what}: {e}"))
}

impl UnixHttpClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<HttpResponse, RuntimeError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let label = format!("{method} {path} on {}", self.socket_path.display());
        let resp = runtime
            .block_on(tokio::time::timeout(IO_TIMEOUT, self.send(method, path, body)))
            .map_err(|e| http_failure(&label, e))??;
        debug!("{label} -> {}", resp.status);
        Ok(resp)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<HttpResponse, RuntimeError> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            http_failure(
                &format!("failed to connect to {}", self.socket_path.display()),
                e,
            )
        })?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| http_failure("HTTP handshake failed", e))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("helper connection closed: {e}");
            }
        });

        let mut builder = Request::builder()
            .method(method)
            .uri(format!("http://localhost{path}"))
            .header(HOST, "localhost");
        let body = match body {
            Some(bytes) => {
                builder = builder
                    .header(CONTENT_TYPE, "application/json")
                    .header(CONTENT_LENGTH, bytes.len());
                Bytes::from(bytes)
            }
            None => Bytes::new(),
        };
        let request = builder
            .body(Full::new(body))
            .map_err(|e| http_failure("failed to build request", e))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| http_failure("failed to send request", e))?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| http_failure("failed to read response", e))?
            .to_bytes();
        Ok(HttpResponse { status, body })
    }

    fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<T, RuntimeError> {
        let resp = self.request(method.clone(), path, body)?;
        check_status(&method, path, &resp)?;
        Ok(serde_json::from_slice(&resp.body)?)
    }

    fn call_empty(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<(), RuntimeError> {
        let resp = self.request(method.clone(), path, body)?;
        check_status(&method, path, &resp)
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

fn check_status(method: &Method, path: &str, resp: &HttpResponse) -> Result<(), RuntimeError> {
    if resp.status.is_success() {
        return Ok(());
    }
    let msg = serde_json::from_slice::<ErrorBody>(&resp.body)
        .map(|e| e.message)
        .ok()
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| String::from_utf8_lossy(&resp.body).trim().to_owned());
    let err = format!("{method} {path}: status {}: {msg}", resp.status.as_u16());
    if resp.status == StatusCode::NOT_FOUND {
        Err(RuntimeError::NotFound(err))
    } else if msg.contains("address already in use") {
        Err(RuntimeError::AddrInUse(err))
    } else {
        Err(RuntimeError::ExecFailed(err))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkDriverInfo {
    #[serde(default)]
    pub driver: String,
    #[serde(default, rename = "childIP")]
    pub child_ip: String,
    #[serde(default)]
    pub dns: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortDriverInfo {
    #[serde(default)]
    pub driver: String,
    #[serde(default)]
    pub protos: Vec<String>,
    #[serde(default, rename = "disallowLoopbackChildIP")]
    pub disallow_loopback_child_ip: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootlessInfo {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, rename = "childPID")]
    pub child_pid: u32,
    #[serde(default)]
    pub network_driver: Option<NetworkDriverInfo>,
    #[serde(default)]
    pub port_driver: Option<PortDriverInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortSpec {
    pub proto: String,
    #[serde(default, rename = "parentIP")]
    pub parent_ip: String,
    pub parent_port: u16,
    #[serde(default, rename = "childIP", skip_serializing_if = "String::is_empty")]
    pub child_ip: String,
    pub child_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortStatus {
    pub id: u64,
    pub spec: PortSpec,
}

/// Client for the rootless port manager.
pub struct PortManagerClient {
    http: UnixHttpClient,
}

impl PortManagerClient {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            http: UnixHttpClient::new(state_dir.join("api.sock")),
        }
    }

    pub fn from_env() -> Result<Self, RuntimeError> {
        rootless_state_dir()
            .map(|dir| Self::new(&dir))
            .ok_or_else(|| RuntimeError::Precondition(format!("{STATE_DIR_ENV} is not set")))
    }

    pub fn info(&self) -> Result<RootlessInfo, RuntimeError> {
        self.http.call(Method::GET, "/v1/info", None)
    }

    pub fn add_port(&self, spec: &PortSpec) -> Result<PortStatus, RuntimeError> {
        let body = serde_json::to_vec(spec)?;
        self.http.call(Method::POST, "/v1/ports", Some(body))
    }

    pub fn list_ports(&self) -> Result<Vec<PortStatus>, RuntimeError> {
        self.http.call(Method::GET, "/v1/ports", None)
    }

    pub fn remove_port(&self, id: u64) -> Result<(), RuntimeError> {
        self.http
            .call_empty(Method::DELETE, &format!("/v1/ports/{id}"), None)
    }
}

/// Host IP the port manager should bind for a published port.
///
/// Loopback and the child IP are passed through. Any other address becomes
/// the child IP when the port driver disallows a loopback child IP, and
/// `127.0.0.1` otherwise.
pub fn rewrite_child_ip(host_ip: &str, info: &RootlessInfo) -> String {
    let child_ip = info
        .network_driver
        .as_ref()
        .map(|n| n.child_ip.clone())
        .unwrap_or_default();
    let disallow_loopback = info
        .port_driver
        .as_ref()
        .is_some_and(|p| p.disallow_loopback_child_ip);
    let is_loopback = host_ip
        .parse::<std::net::IpAddr>()
        .is_ok_and(|ip| ip.is_loopback());
    if is_loopback || (!child_ip.is_empty() && host_ip == child_ip) {
        return host_ip.to_owned();
    }
    if disallow_loopback && !child_ip.is_empty() {
        child_ip
    } else {
        "127.0.0.1".to_owned()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BypassPortMapping {
    pub child_port: u16,
    pub parent_port: u16,
    pub protocol: String,
    #[serde(rename = "parentIP")]
    pub parent_ip: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BypassSpec {
    pub id: String,
    pub pid: u32,
    #[serde(default)]
    pub log_file_path: String,
    #[serde(default)]
    pub port_mapping: Vec<BypassPortMapping>,
    #[serde(default)]
    pub ignore_subnets: Vec<String>,
}

/// Client for the bypass4netns daemon.
pub struct Bypass4netnsClient {
    http: UnixHttpClient,
}

impl Bypass4netnsClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            http: UnixHttpClient::new(socket_path),
        }
    }

    /// `$XDG_RUNTIME_DIR/bypass4netnsd.sock`.
    pub fn default_socket() -> Option<PathBuf> {
        std::env::var_os("XDG_RUNTIME_DIR").map(|d| PathBuf::from(d).join("bypass4netnsd.sock"))
    }

    pub fn start_bypass(&self, spec: &BypassSpec) -> Result<(), RuntimeError> {
        let body = serde_json::to_vec(spec)?;
        self.http.call_empty(Method::POST, "/bypass", Some(body))
    }

    pub fn stop_bypass(&self, id: &str) -> Result<(), RuntimeError> {
        self.http
            .call_empty(Method::DELETE, &format!("/bypass/{id}"), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::body::Incoming;
    use hyper::service::service_fn;
    use hyper::Response;
    use std::os::unix::net::UnixListener;
    use std::sync::{Arc, Mutex};

    /// Serve one connection with a canned reply; yields "METHOD PATH BODY" of the request.
    fn serve_once(
        listener: UnixListener,
        status: u16,
        reply: &'static str,
    ) -> std::thread::JoinHandle<String> {
        std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async move {
                listener.set_nonblocking(true).unwrap();
                let listener = tokio::net::UnixListener::from_std(listener).unwrap();
                let (stream, _) = listener.accept().await.unwrap();
                let seen = Arc::new(Mutex::new(String::new()));
                let record = seen.clone();
                let service = service_fn(move |req: Request<Incoming>| {
                    let record = record.clone();
                    async move {
                        let head = format!("{} {}", req.method(), req.uri().path());
                        let body = req.into_body().collect().await?.to_bytes();
                        *record.lock().unwrap() =
                            format!("{head} {}", String::from_utf8_lossy(&body));
                        Ok::<_, hyper::Error>(
                            Response::builder()
                                .status(status)
                                .header(CONTENT_TYPE, "application/json")
                                .body(Full::new(Bytes::from_static(reply.as_bytes())))
                                .unwrap(),
                        )
                    }
                });
                hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                    .unwrap();
                let request = seen.lock().unwrap().clone();
                request
            })
        })
    }

    #[test]
    fn port_manager_add_port() {
        let dir = tempfile::tempdir().unwrap();
        let listener = UnixListener::bind(dir.path().join("api.sock")).unwrap();
        let server = serve_once(
            listener,
            200,
            r#"{"id":7,"spec":{"proto":"tcp","parentIP":"127.0.0.1","parentPort":8080,"childPort":80}}"#,
        );
        let client = PortManagerClient::new(dir.path());
        let status = client
            .add_port(&PortSpec {
                proto: "tcp".to_owned(),
                parent_ip: "127.0.0.1".to_owned(),
                parent_port: 8080,
                child_ip: String::new(),
                child_port: 80,
            })
            .unwrap();
        assert_eq!(status.id, 7);
        assert_eq!(status.spec.parent_port, 8080);
        let request = server.join().unwrap();
        assert!(request.starts_with("POST /v1/ports "));
        assert!(request.contains("\"parentPort\":8080"));
    }

    #[test]
    fn error_replies_map_to_runtime_errors() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("bypass.sock");
        let server = serve_once(
            UnixListener::bind(&socket).unwrap(),
            404,
            r#"{"message":"no such bypass"}"#,
        );
        let err = Bypass4netnsClient::new(socket.clone()).stop_bypass("abc").unwrap_err();
        assert!(err.is_not_found(), "{err}");
        assert!(err.to_string().contains("no such bypass"));
        assert_eq!(server.join().unwrap().trim_end(), "DELETE /bypass/abc");

        let resp = HttpResponse {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: Bytes::from_static(b"listen tcp 0.0.0.0:80: bind: address already in use"),
        };
        assert!(matches!(
            check_status(&Method::POST, "/v1/ports", &resp),
            Err(RuntimeError::AddrInUse(_))
        ));
    }

    #[test]
    fn child_ip_rewrite() {
        let mut info = RootlessInfo {
            network_driver: Some(NetworkDriverInfo {
                driver: "slirp4netns".to_owned(),
                child_ip: "10.0.2.100".to_owned(),
                dns: Vec::new(),
            }),
            port_driver: Some(PortDriverInfo::default()),
            ..RootlessInfo::default()
        };
        assert_eq!(rewrite_child_ip("127.0.0.1", &info), "127.0.0.1");
        assert_eq!(rewrite_child_ip("10.0.2.100", &info), "10.0.2.100");
        assert_eq!(rewrite_child_ip("0.0.0.0", &info), "127.0.0.1");
        info.port_driver = Some(PortDriverInfo {
            disallow_loopback_child_ip: true,
            ..PortDriverInfo::default()
        });
        assert_eq!(rewrite_child_ip("0.0.0.0", &info), "10.0.2.100");
    }

    #[test]
    fn unreachable_socket_fails() {
        let dir = tempfile::tempdir().unwrap();
        let client = Bypass4netnsClient::new(dir.path().join("missing.sock"));
        assert!(client.stop_bypass("abc").is_err());
    }
}
