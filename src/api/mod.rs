use crate::scene::{RegistrationError, SceneRegistration, SceneRegistry};
use crate::SceneState;
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_REQUEST_BYTES: usize = 16 * 1024;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8790".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

/// Polling status surface over the scene registry and alert ring.
pub struct ApiServer {
    cfg: ApiConfig,
    scenes: Arc<SceneRegistry>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, scenes: Arc<SceneRegistry>) -> Self {
        Self { cfg, scenes }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let scenes = self.scenes;
        let join = std::thread::Builder::new()
            .name("status-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, scenes, shutdown_thread) {
                    log::error!("status api stopped: {}", err);
                }
            })?;
        log::info!("status api listening on http://{}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, scenes: Arc<SceneRegistry>, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, &scenes) {
                    log::warn!("status api request rejected: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, scenes: &SceneRegistry) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, r#"{"error":"forbidden"}"#)?;
        return Ok(());
    }

    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            write_json_response(&mut stream, 400, r#"{"error":"bad_request"}"#)?;
            return Err(err);
        }
    };
    let (status, body) = route(&request, scenes);
    write_response(&mut stream, status, "application/json", &body)
}

/// Maps a parsed request to `(status, json body)`.
fn route(request: &HttpRequest, scenes: &SceneRegistry) -> (u16, Vec<u8>) {
    let segments: Vec<&str> = request
        .path
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    match (request.method.as_str(), segments.as_slice()) {
        ("GET", ["health"]) => json(
            200,
            &serde_json::json!({"status": "ok", "scenes": scenes.states().len()}),
        ),
        ("GET", ["scenes"]) => json(200, &scenes.states()),
        ("GET", ["scenes", id]) => {
            // Unknown scenes read as offline rather than 404.
            let state = scenes
                .state(id)
                .unwrap_or_else(|| SceneState::offline(id, None));
            json(200, &state)
        }
        ("GET", ["alerts"]) => match request.query("scene_id") {
            Some(scene_id) => json(200, &scenes.alerts().recent_for(scene_id)),
            None => json(200, &scenes.alerts().recent()),
        },
        ("POST", ["scenes"]) => {
            let registration: SceneRegistration = match serde_json::from_slice(&request.body) {
                Ok(registration) => registration,
                Err(err) => return error(400, "invalid_json", &err.to_string()),
            };
            match scenes.register(&registration) {
                Ok(state) => json(201, &state),
                Err(err) => registration_error(err),
            }
        }
        ("POST", ["scenes", id, "stop"]) => match scenes.stop(id) {
            Ok(state) => json(200, &state),
            Err(err) => registration_error(err),
        },
        ("DELETE", ["scenes", id]) => match scenes.remove(id) {
            Ok(state) => json(200, &state),
            Err(err) => registration_error(err),
        },
        (_, ["health"]) | (_, ["scenes"]) | (_, ["scenes", _]) | (_, ["alerts"])
        | (_, ["scenes", _, "stop"]) => error(405, "method_not_allowed", "method not allowed"),
        _ => error(404, "not_found", "not found"),
    }
}

fn registration_error(err: anyhow::Error) -> (u16, Vec<u8>) {
    match err.downcast_ref::<RegistrationError>() {
        Some(e) => {
            let status = match e.code {
                "duplicate_scene" => 409,
                "unknown_scene" => 404,
                _ => 400,
            };
            error(status, e.code, &e.message)
        }
        None => {
            log::error!("status api internal error: {:#}", err);
            error(500, "internal", "internal error")
        }
    }
}

fn json<T: Serialize + ?Sized>(status: u16, value: &T) -> (u16, Vec<u8>) {
    match serde_json::to_vec(value) {
        Ok(body) => (status, body),
        Err(err) => error(500, "internal", &err.to_string()),
    }
}

fn error(status: u16, code: &str, message: &str) -> (u16, Vec<u8>) {
    let body = serde_json::json!({"error": code, "message": message});
    (status, body.to_string().into_bytes())
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break data.len();
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let text = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length: usize = match headers.get("content-length") {
        Some(value) => value
            .parse()
            .map_err(|_| anyhow!("invalid content-length"))?,
        None => 0,
    };
    if header_end + content_length > MAX_REQUEST_BYTES {
        return Err(anyhow!("request too large"));
    }
    let mut body = data[header_end.min(data.len())..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("request body truncated"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        raw_path: raw_path.to_string(),
        body,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        201 => "HTTP/1.1 201 Created",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        409 => "HTTP/1.1 409 Conflict",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    raw_path: String,
    body: Vec<u8>,
}

impl HttpRequest {
    fn query(&self, key: &str) -> Option<&str> {
        let query = self.raw_path.split_once('?')?.1;
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertManager;
    use crate::config::SentinelConfig;
    use crate::detect::SourceRegistry;

    fn registry() -> SceneRegistry {
        let mut config = SentinelConfig::default();
        config.pipeline.realtime = false;
        let alerts = Arc::new(AlertManager::new(&config.alerts));
        SceneRegistry::new(
            Arc::new(config),
            Arc::new(SourceRegistry::with_defaults()),
            alerts,
        )
    }

    fn request(method: &str, raw_path: &str, body: &str) -> HttpRequest {
        HttpRequest {
            method: method.to_string(),
            path: raw_path.split('?').next().unwrap().to_string(),
            raw_path: raw_path.to_string(),
            body: body.as_bytes().to_vec(),
        }
    }

    fn body(response: &(u16, Vec<u8>)) -> serde_json::Value {
        serde_json::from_slice(&response.1).unwrap()
    }

    #[test]
    fn unknown_scene_reads_offline() {
        let scenes = registry();
        let response = route(&request("GET", "/scenes/tankZ", ""), &scenes);
        assert_eq!(response.0, 200);
        let state = body(&response);
        assert_eq!(state["status"], "Offline");
        assert_eq!(state["health"], "Unknown");
        assert_eq!(state["species"], "Unknown");
    }

    #[test]
    fn registration_status_codes() {
        let scenes = registry();
        let created = route(
            &request("POST", "/scenes", r#"{"scene_id":"tankA","source":"stub://a"}"#),
            &scenes,
        );
        assert_eq!(created.0, 201);

        let duplicate = route(
            &request("POST", "/scenes", r#"{"scene_id":"tankA","source":"stub://b"}"#),
            &scenes,
        );
        assert_eq!(duplicate.0, 409);
        assert_eq!(body(&duplicate)["error"], "duplicate_scene");

        let missing = route(&request("POST", "/scenes", r#"{"scene_id":"tankB"}"#), &scenes);
        assert_eq!(missing.0, 400);
        assert_eq!(body(&missing)["error"], "missing_field");

        let garbage = route(&request("POST", "/scenes", "not json"), &scenes);
        assert_eq!(garbage.0, 400);

        assert_eq!(route(&request("DELETE", "/scenes/tankA", ""), &scenes).0, 200);
        assert_eq!(route(&request("DELETE", "/scenes/tankA", ""), &scenes).0, 404);
    }

    #[test]
    fn unknown_routes_and_methods() {
        let scenes = registry();
        assert_eq!(route(&request("GET", "/nope", ""), &scenes).0, 404);
        assert_eq!(route(&request("PUT", "/alerts", ""), &scenes).0, 405);
        assert_eq!(route(&request("GET", "/health", ""), &scenes).0, 200);
    }

    #[test]
    fn query_lookup() {
        let req = request("GET", "/alerts?scene_id=tankA&x=1", "");
        assert_eq!(req.query("scene_id"), Some("tankA"));
        assert_eq!(req.query("missing"), None);
    }
}
