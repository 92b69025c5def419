// Liveness/readiness integration point for an external orchestrator.
//
// The image carries a HEALTHCHECK that the engine evaluates. `probe` does the same
// check from outside the container.

use std::time::Duration;

use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthCheck {
    /// HTTP status path. A plain TCP connect is used when unset.
    pub path: Option<String>,
    pub interval_secs: u32,
    pub timeout_secs: u32,
    pub retries: u32,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            path: None,
            interval_secs: 30,
            timeout_secs: 5,
            retries: 3,
        }
    }
}

impl HealthCheck {
    pub fn with_path(path: Option<String>) -> Self {
        Self {
            path: path.map(|p| normalize_path(&p)),
            ..Default::default()
        }
    }

    /// Exec-form command evaluated inside the container with the image's interpreter.
    pub fn command(&self, port: u16) -> Vec<String> {
        let script = match &self.path {
            Some(path) => format!(
                "import urllib.request; urllib.request.urlopen('http://127.0.0.1:{}{}', timeout={})",
                port, path, self.timeout_secs
            ),
            None => format!(
                "import socket; socket.create_connection(('127.0.0.1', {}), {}).close()",
                port, self.timeout_secs
            ),
        };
        vec!["python".to_string(), "-c".to_string(), script]
    }

    pub fn options(&self) -> String {
        format!(
            "--interval={}s --timeout={}s --retries={}",
            self.interval_secs, self.timeout_secs, self.retries
        )
    }
}

pub fn normalize_path(path: &str) -> String {
    let path = path.trim();
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

pub fn probe_url(host: &str, port: u16, path: Option<&str>) -> String {
    let path = path.map(normalize_path).unwrap_or_else(|| "/".to_string());
    format!("http://{}:{}{}", host, port, path)
}

/// Returns whether the endpoint answered with a success status.
/// A connection failure is an error.
pub fn probe(url: &str, timeout: Duration) -> Result<bool> {
    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .no_proxy()
        .build()?;
    let resp = client
        .get(url)
        .send()
        .with_context(|| format!("no response from {}", url))?;
    let status = resp.status();
    debug!("Probe {} answered {}", url, status);
    Ok(status.is_success())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn serve_once(status_line: &'static str) -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let resp = format!("{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n", status_line);
                let _ = stream.write_all(resp.as_bytes());
            }
        });
        port
    }

    #[test]
    fn test_tcp_command_by_default() {
        let check = HealthCheck::default();
        let cmd = check.command(5000);
        assert_eq!(cmd[0], "python");
        assert!(cmd[2].contains("create_connection(('127.0.0.1', 5000), 5)"));
        assert_eq!(check.options(), "--interval=30s --timeout=5s --retries=3");
    }

    #[test]
    fn test_http_command_with_path() {
        let check = HealthCheck::with_path(Some("healthz".to_string()));
        assert_eq!(check.path.as_deref(), Some("/healthz"));
        assert!(check.command(8080)[2].contains("http://127.0.0.1:8080/healthz"));
    }

    #[test]
    fn test_probe_url() {
        assert_eq!(probe_url("localhost", 8080, None), "http://localhost:8080/");
        assert_eq!(probe_url("localhost", 5000, Some("status")), "http://localhost:5000/status");
    }

    #[test]
    fn test_probe_success() {
        let port = serve_once("HTTP/1.1 200 OK");
        let url = probe_url("127.0.0.1", port, Some("/healthz"));
        assert!(probe(&url, Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn test_probe_server_error_is_unhealthy() {
        let port = serve_once("HTTP/1.1 503 Service Unavailable");
        let url = probe_url("127.0.0.1", port, None);
        assert!(!probe(&url, Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn test_probe_connection_refused() {
        let port = {
            let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
            listener.local_addr().unwrap().port()
        };
        let url = probe_url("127.0.0.1", port, None);
        assert!(probe(&url, Duration::from_secs(2)).is_err());
    }
}
