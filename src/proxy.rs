//! HTTPS proxy towards a runtime container's control-plane API.
//!
//! `run_command` payloads are forwarded to `https://{internal_ip}:8443/...`
//! over the container's internal network. The runtime presents a self-signed
//! certificate, so server verification is disabled for this client only; the
//! response body is returned verbatim inside the reply envelope.

use crate::defaults::RUNTIME_API_PORT;
use reqwest::blocking::Client;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const PROXY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("could not build proxy client: {0}")]
    ClientBuilder(String),
    #[error("runtime request failed: {0}")]
    Request(String),
    #[error("could not read runtime response: {0}")]
    ReadingResponse(String),
}

pub struct RuntimeProxy {
    client: Client,
}

impl RuntimeProxy {
    pub fn new() -> Result<Self, ProxyError> {
        let client = Client::builder()
            .use_rustls_tls()
            // The runtime API uses self-signed certificates.
            .danger_accept_invalid_certs(true)
            .timeout(PROXY_TIMEOUT)
            .build()
            .map_err(|e| ProxyError::ClientBuilder(e.to_string()))?;
        Ok(Self { client })
    }

    /// POSTs `command` to the runtime at `internal_ip` and returns the
    /// response body (JSON when parsable, raw text otherwise) plus status.
    pub fn forward(
        &self,
        internal_ip: &str,
        path: &str,
        command: &Value,
    ) -> Result<Value, ProxyError> {
        let url = format!(
            "https://{internal_ip}:{RUNTIME_API_PORT}/{}",
            path.trim_start_matches('/')
        );
        debug!(url = %url, "forwarding command to runtime");

        let response = self
            .client
            .post(&url)
            .json(command)
            .send()
            .map_err(|e| ProxyError::Request(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .map_err(|e| ProxyError::ReadingResponse(e.to_string()))?;
        let body_json =
            serde_json::from_str::<Value>(&body).unwrap_or(Value::String(body));

        Ok(serde_json::json!({
            "http_status": status,
            "response": body_json,
        }))
    }
}
