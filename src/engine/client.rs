//! Engine client over the Docker-compatible HTTP API.
//!
//! Every call opens a fresh HTTP/1 connection on the unix socket. Attach and
//! exec-start upgrade that connection into a raw bidirectional stream.

use super::{
    ArchiveReader, AttachOptions, ContainerInspect, ContainerRef, ContainerSummary, CopyToOptions,
    CreateContainerRequest, CreateContainerResponse, Engine, EngineError, ExecConfig,
    ExecCreateResponse, ExecInspect, HijackedStream, ImageDeleteItem, ImageSummary, LogsOptions,
    PathStat, StatsSample, TerminalSize, TopResponse, WaitCondition, WaitHandle, WaitResponse,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, BodyStream, Empty, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::client::conn::http1::SendRequest;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, trace};

/// API version prefix used for every request.
pub const API_VERSION: &str = "v1.43";

const DEFAULT_SOCKET_PATH: &str = "/var/run/docker.sock";
const PATH_STAT_HEADER: &str = "X-Docker-Container-Path-Stat";

type Body = UnsyncBoxBody<Bytes, std::io::Error>;

/// Default engine socket path.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_PATH)
}

/// Error body returned by the engine.
#[derive(Deserialize)]
struct ApiMessage {
    message: String,
}

/// What a 404 means for a given endpoint.
#[derive(Clone, Copy)]
enum Missing<'a> {
    Container(&'a str),
    Path(&'a str),
    Other,
}

/// Engine client speaking HTTP over a unix socket.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    socket_path: PathBuf,
}

impl DockerEngine {
    /// Create a client for the engine listening on `socket_path`.
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    /// Returns the socket path.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    fn uri(path: &str) -> String {
        format!("http://localhost/{API_VERSION}{path}")
    }

    async fn connect(&self, upgrades: bool) -> Result<SendRequest<Body>, EngineError> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|source| EngineError::Unavailable {
                path: self.socket_path.clone(),
                source,
            })?;

        let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(EngineError::Http)?;

        if upgrades {
            tokio::spawn(async move {
                if let Err(e) = conn.with_upgrades().await {
                    debug!("Upgraded connection closed: {e}");
                }
            });
        } else {
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!("Connection closed: {e}");
                }
            });
        }

        Ok(sender)
    }

    fn empty() -> Body {
        Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync()
    }

    fn json_body<B: Serialize>(body: &B) -> Result<(Body, usize), EngineError> {
        let bytes = serde_json::to_vec(body).map_err(EngineError::Encode)?;
        let len = bytes.len();
        Ok((
            Full::new(Bytes::from(bytes))
                .map_err(|never| match never {})
                .boxed_unsync(),
            len,
        ))
    }

    /// Send a request and check its status.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
        missing: Missing<'_>,
    ) -> Result<Response<Incoming>, EngineError> {
        let mut sender = self.connect(false).await?;
        let builder = Request::builder()
            .method(method.clone())
            .uri(Self::uri(path))
            .header("Host", "localhost");

        let request = match body {
            Some(value) => {
                let (body, len) = Self::json_body(value)?;
                builder
                    .header("Content-Type", "application/json")
                    .header("Content-Length", len)
                    .body(body)
            }
            None => builder.body(Self::empty()),
        }
        .map_err(|e| EngineError::Request(e.to_string()))?;

        trace!(%method, path, "engine request");
        let response = sender.send_request(request).await.map_err(EngineError::Http)?;
        check_status(response, missing).await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        missing: Missing<'_>,
    ) -> Result<T, EngineError> {
        let response = self.send(Method::GET, path, None, missing).await?;
        read_json(response).await
    }

    async fn post_json<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
        missing: Missing<'_>,
    ) -> Result<T, EngineError> {
        let value = serde_json::to_value(body).map_err(EngineError::Encode)?;
        let response = self.send(Method::POST, path, Some(&value), missing).await?;
        read_json(response).await
    }

    async fn post_empty(&self, path: &str, missing: Missing<'_>) -> Result<(), EngineError> {
        let response = self.send(Method::POST, path, None, missing).await?;
        drain(response).await
    }

    /// Send a request with `Upgrade: tcp` and return the hijacked stream.
    async fn upgrade(
        &self,
        path: &str,
        body: Option<&serde_json::Value>,
        tty: bool,
        missing: Missing<'_>,
    ) -> Result<HijackedStream, EngineError> {
        let mut sender = self.connect(true).await?;
        let builder = Request::builder()
            .method(Method::POST)
            .uri(Self::uri(path))
            .header("Host", "localhost")
            .header("Connection", "Upgrade")
            .header("Upgrade", "tcp");

        let request = match body {
            Some(value) => {
                let (body, len) = Self::json_body(value)?;
                builder
                    .header("Content-Type", "application/json")
                    .header("Content-Length", len)
                    .body(body)
            }
            None => builder.body(Self::empty()),
        }
        .map_err(|e| EngineError::Request(e.to_string()))?;

        let response = sender.send_request(request).await.map_err(EngineError::Http)?;
        let response = check_status(response, missing).await?;
        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Err(EngineError::Upgrade(format!(
                "expected 101 Switching Protocols, got {}",
                response.status()
            )));
        }

        let upgraded = hyper::upgrade::on(response)
            .await
            .map_err(|e| EngineError::Upgrade(e.to_string()))?;
        let (reader, writer) = tokio::io::split(TokioIo::new(upgraded));
        debug!(path, tty, "stream hijacked");
        Ok(HijackedStream::new(reader, writer, tty))
    }
}

/// Turn non-success statuses into errors, using the engine's message.
async fn check_status(
    response: Response<Incoming>,
    missing: Missing<'_>,
) -> Result<Response<Incoming>, EngineError> {
    let status = response.status();
    if status.is_success()
        || status == StatusCode::SWITCHING_PROTOCOLS
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok(response);
    }

    let body = response
        .into_body()
        .collect()
        .await
        .map_err(EngineError::Http)?
        .to_bytes();
    let message = serde_json::from_slice::<ApiMessage>(&body).map_or_else(
        |_| String::from_utf8_lossy(&body).trim().to_string(),
        |m| m.message,
    );

    if status == StatusCode::NOT_FOUND {
        match missing {
            Missing::Container(what) => return Err(EngineError::NotFound(what.to_string())),
            Missing::Path(what) => return Err(EngineError::PathNotFound(what.to_string())),
            Missing::Other => {}
        }
    }

    Err(EngineError::Api {
        status: status.as_u16(),
        message,
    })
}

async fn read_json<T: DeserializeOwned>(response: Response<Incoming>) -> Result<T, EngineError> {
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(EngineError::Http)?
        .to_bytes();
    serde_json::from_slice(&body).map_err(EngineError::Decode)
}

async fn drain(response: Response<Incoming>) -> Result<(), EngineError> {
    response
        .into_body()
        .collect()
        .await
        .map_err(EngineError::Http)?;
    Ok(())
}

/// Data chunks of a streaming response body.
fn body_chunks(body: Incoming) -> impl futures::Stream<Item = Result<Bytes, std::io::Error>> {
    TryStreamExt::map_err(BodyStream::new(body), std::io::Error::other)
        .try_filter_map(|frame| futures::future::ready(Ok(frame.into_data().ok())))
}

/// Encode label filters as the engine's JSON filter argument.
fn label_filters(labels: &[String]) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let filters = serde_json::json!({ "label": labels });
    format!("&filters={}", urlencoding::encode(&filters.to_string()))
}

fn flag(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

fn decode_path_stat(response: &Response<Incoming>) -> Result<PathStat, EngineError> {
    use base64::Engine as _;

    let header = response
        .headers()
        .get(PATH_STAT_HEADER)
        .ok_or_else(|| {
            EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("missing {PATH_STAT_HEADER} header"),
            ))
        })?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(header.as_bytes())
        .map_err(|e| EngineError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    serde_json::from_slice(&decoded).map_err(EngineError::Decode)
}

#[async_trait]
impl Engine for DockerEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        let response = self.send(Method::GET, "/_ping", None, Missing::Other).await?;
        drain(response).await
    }

    async fn inspect_container(&self, name_or_id: &str) -> Result<ContainerRef, EngineError> {
        let path = format!("/containers/{}/json", urlencoding::encode(name_or_id));
        let inspect: ContainerInspect = self.get_json(&path, Missing::Container(name_or_id)).await?;
        Ok(inspect.into())
    }

    async fn inspect_container_raw(
        &self,
        name_or_id: &str,
    ) -> Result<serde_json::Value, EngineError> {
        let path = format!("/containers/{}/json", urlencoding::encode(name_or_id));
        self.get_json(&path, Missing::Container(name_or_id)).await
    }

    async fn list_containers(
        &self,
        all: bool,
        labels: &[String],
    ) -> Result<Vec<ContainerSummary>, EngineError> {
        let path = format!("/containers/json?all={}{}", flag(all), label_filters(labels));
        self.get_json(&path, Missing::Other).await
    }

    async fn create_container(
        &self,
        name: Option<&str>,
        config: &CreateContainerRequest,
    ) -> Result<CreateContainerResponse, EngineError> {
        let path = name.map_or_else(
            || "/containers/create".to_string(),
            |n| format!("/containers/create?name={}", urlencoding::encode(n)),
        );
        self.post_json(&path, config, Missing::Other).await
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.post_empty(&format!("/containers/{id}/start"), Missing::Container(id))
            .await
    }

    async fn stop_container(&self, id: &str, timeout: Option<i64>) -> Result<(), EngineError> {
        let query = timeout.map(|t| format!("?t={t}")).unwrap_or_default();
        self.post_empty(&format!("/containers/{id}/stop{query}"), Missing::Container(id))
            .await
    }

    async fn restart_container(&self, id: &str, timeout: Option<i64>) -> Result<(), EngineError> {
        let query = timeout.map(|t| format!("?t={t}")).unwrap_or_default();
        self.post_empty(&format!("/containers/{id}/restart{query}"), Missing::Container(id))
            .await
    }

    async fn kill_container(&self, id: &str, signal: Option<&str>) -> Result<(), EngineError> {
        let query = signal
            .map(|s| format!("?signal={}", urlencoding::encode(s)))
            .unwrap_or_default();
        self.post_empty(&format!("/containers/{id}/kill{query}"), Missing::Container(id))
            .await
    }

    async fn pause_container(&self, id: &str) -> Result<(), EngineError> {
        self.post_empty(&format!("/containers/{id}/pause"), Missing::Container(id))
            .await
    }

    async fn unpause_container(&self, id: &str) -> Result<(), EngineError> {
        self.post_empty(&format!("/containers/{id}/unpause"), Missing::Container(id))
            .await
    }

    async fn rename_container(&self, id: &str, new_name: &str) -> Result<(), EngineError> {
        let path = format!("/containers/{id}/rename?name={}", urlencoding::encode(new_name));
        self.post_empty(&path, Missing::Container(id)).await
    }

    async fn remove_container(
        &self,
        id: &str,
        force: bool,
        volumes: bool,
    ) -> Result<(), EngineError> {
        let path = format!("/containers/{id}?force={}&v={}", flag(force), flag(volumes));
        let response = self.send(Method::DELETE, &path, None, Missing::Container(id)).await?;
        drain(response).await
    }

    async fn wait_container(
        &self,
        id: &str,
        condition: WaitCondition,
    ) -> Result<WaitHandle, EngineError> {
        let path = format!("/containers/{id}/wait?condition={}", condition.as_str());
        // Response headers arrive once the engine has registered the wait.
        let response = self.send(Method::POST, &path, None, Missing::Container(id)).await?;

        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = read_json::<WaitResponse>(response).await.and_then(|r| {
                match r.error {
                    Some(e) if !e.message.is_empty() => Err(EngineError::Wait(e.message)),
                    _ => Ok(r.status_code),
                }
            });
            let _ = tx.send(result);
        });

        Ok(WaitHandle::new(rx))
    }

    async fn attach_container(
        &self,
        id: &str,
        options: &AttachOptions,
        tty: bool,
    ) -> Result<HijackedStream, EngineError> {
        let mut path = format!(
            "/containers/{id}/attach?stream=1&stdin={}&stdout={}&stderr={}",
            flag(options.stdin),
            flag(options.stdout),
            flag(options.stderr),
        );
        if let Some(keys) = &options.detach_keys {
            path.push_str(&format!("&detachKeys={}", urlencoding::encode(keys)));
        }
        self.upgrade(&path, None, tty, Missing::Container(id)).await
    }

    async fn resize_container(&self, id: &str, size: TerminalSize) -> Result<(), EngineError> {
        let path = format!("/containers/{id}/resize?h={}&w={}", size.rows, size.cols);
        self.post_empty(&path, Missing::Container(id)).await
    }

    async fn create_exec(&self, id: &str, config: &ExecConfig) -> Result<String, EngineError> {
        let response: ExecCreateResponse = self
            .post_json(&format!("/containers/{id}/exec"), config, Missing::Container(id))
            .await?;
        Ok(response.id)
    }

    async fn start_exec_detached(&self, exec_id: &str) -> Result<(), EngineError> {
        let body = serde_json::json!({ "Detach": true, "Tty": false });
        let response = self
            .send(Method::POST, &format!("/exec/{exec_id}/start"), Some(&body), Missing::Other)
            .await?;
        drain(response).await
    }

    async fn attach_exec(&self, exec_id: &str, tty: bool) -> Result<HijackedStream, EngineError> {
        let body = serde_json::json!({ "Detach": false, "Tty": tty });
        self.upgrade(&format!("/exec/{exec_id}/start"), Some(&body), tty, Missing::Other)
            .await
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecInspect, EngineError> {
        self.get_json(&format!("/exec/{exec_id}/json"), Missing::Other)
            .await
    }

    async fn resize_exec(&self, exec_id: &str, size: TerminalSize) -> Result<(), EngineError> {
        let path = format!("/exec/{exec_id}/resize?h={}&w={}", size.rows, size.cols);
        self.post_empty(&path, Missing::Other).await
    }

    async fn stats_once(&self, id: &str) -> Result<StatsSample, EngineError> {
        let path = format!("/containers/{id}/stats?stream=0");
        self.get_json(&path, Missing::Container(id)).await
    }

    async fn stats_stream(
        &self,
        id: &str,
    ) -> Result<BoxStream<'static, Result<StatsSample, EngineError>>, EngineError> {
        let path = format!("/containers/{id}/stats?stream=1");
        let response = self.send(Method::GET, &path, None, Missing::Container(id)).await?;

        let reader = StreamReader::new(body_chunks(response.into_body()));
        let samples = FramedRead::new(reader, LinesCodec::new())
            .map_err(|e| EngineError::Io(std::io::Error::other(e)))
            .try_filter(|line| futures::future::ready(!line.trim().is_empty()))
            .and_then(|line| {
                futures::future::ready(
                    serde_json::from_str::<StatsSample>(&line).map_err(EngineError::Decode),
                )
            });
        Ok(samples.boxed())
    }

    async fn top(&self, id: &str, ps_args: Option<&str>) -> Result<TopResponse, EngineError> {
        let query = ps_args
            .map(|a| format!("?ps_args={}", urlencoding::encode(a)))
            .unwrap_or_default();
        self.get_json(&format!("/containers/{id}/top{query}"), Missing::Container(id))
            .await
    }

    async fn logs(
        &self,
        id: &str,
        options: &LogsOptions,
    ) -> Result<BoxStream<'static, Result<Bytes, EngineError>>, EngineError> {
        let mut path = format!(
            "/containers/{id}/logs?stdout=1&stderr=1&follow={}&timestamps={}&details={}",
            flag(options.follow),
            flag(options.timestamps),
            flag(options.details),
        );
        for (key, value) in [
            ("tail", &options.tail),
            ("since", &options.since),
            ("until", &options.until),
        ] {
            if let Some(v) = value {
                path.push_str(&format!("&{key}={}", urlencoding::encode(v)));
            }
        }
        let response = self.send(Method::GET, &path, None, Missing::Container(id)).await?;
        Ok(body_chunks(response.into_body())
            .map_err(EngineError::Io)
            .boxed())
    }

    async fn stat_container_path(&self, id: &str, path: &str) -> Result<PathStat, EngineError> {
        let uri = format!("/containers/{id}/archive?path={}", urlencoding::encode(path));
        let response = self.send(Method::HEAD, &uri, None, Missing::Path(path)).await?;
        decode_path_stat(&response)
    }

    async fn copy_from_container(
        &self,
        id: &str,
        path: &str,
    ) -> Result<(PathStat, ArchiveReader), EngineError> {
        let uri = format!("/containers/{id}/archive?path={}", urlencoding::encode(path));
        let response = self.send(Method::GET, &uri, None, Missing::Path(path)).await?;
        let stat = decode_path_stat(&response)?;
        let reader = StreamReader::new(body_chunks(response.into_body()));
        Ok((stat, Box::pin(reader)))
    }

    async fn copy_to_container(
        &self,
        id: &str,
        path: &str,
        archive: ArchiveReader,
        options: CopyToOptions,
    ) -> Result<(), EngineError> {
        let uri = format!(
            "/containers/{id}/archive?path={}&noOverwriteDirNonDir={}&copyUIDGID={}",
            urlencoding::encode(path),
            !options.allow_overwrite_dir_with_file,
            options.copy_uid_gid,
        );
        let body = StreamBody::new(ReaderStream::new(archive).map_ok(Frame::data)).boxed_unsync();
        let request = Request::builder()
            .method(Method::PUT)
            .uri(Self::uri(&uri))
            .header("Host", "localhost")
            .header("Content-Type", "application/x-tar")
            .body(body)
            .map_err(|e| EngineError::Request(e.to_string()))?;

        let mut sender = self.connect(false).await?;
        let response = sender.send_request(request).await.map_err(EngineError::Http)?;
        let response = check_status(response, Missing::Path(path)).await?;
        drain(response).await
    }

    async fn list_images(&self, labels: &[String]) -> Result<Vec<ImageSummary>, EngineError> {
        let path = format!("/images/json?all=0{}", label_filters(labels));
        self.get_json(&path, Missing::Other).await
    }

    async fn remove_image(
        &self,
        name: &str,
        force: bool,
    ) -> Result<Vec<ImageDeleteItem>, EngineError> {
        let path = format!("/images/{}?force={}", urlencoding::encode(name), flag(force));
        let response = self.send(Method::DELETE, &path, None, Missing::Other).await?;
        read_json(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_filters_encoding() {
        assert_eq!(label_filters(&[]), "");
        let encoded = label_filters(&["agentbox.project=myapp".to_string()]);
        assert!(encoded.starts_with("&filters="));
        let decoded = urlencoding::decode(encoded.trim_start_matches("&filters=")).unwrap();
        assert_eq!(decoded, r#"{"label":["agentbox.project=myapp"]}"#);
    }

    #[test]
    fn test_uri_carries_api_version() {
        assert_eq!(
            DockerEngine::uri("/containers/json"),
            "http://localhost/v1.43/containers/json"
        );
    }

    #[tokio::test]
    async fn test_unreachable_socket_is_unavailable() {
        let engine = DockerEngine::new("/nonexistent/agentbox-test.sock");
        let err = engine.ping().await.unwrap_err();
        assert!(err.is_unavailable());
        assert!(err.to_string().starts_with("connecting to engine at /nonexistent"));
    }
}
