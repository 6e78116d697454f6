//! Stop request client
//!
//! Asks a running server to shut down via `GET {urlRoot}stop`.

#![allow(dead_code)]

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use std::error::Error as _;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::OrchestratorConfig;

/// Stop request failures
#[derive(Error, Debug)]
pub enum StopError {
    #[error("There is no server listening on port {0}")]
    ConnectionRefused(u16),

    #[error("Server returned status code: {0}")]
    Status(u16),

    #[error("Request failed: {0}")]
    RequestFailed(String),
}

impl StopError {
    /// Distinguishing reason code, as reported by the socket layer
    pub fn reason_code(&self) -> Option<&'static str> {
        match self {
            StopError::ConnectionRefused(_) => Some("ECONNREFUSED"),
            _ => None,
        }
    }
}

/// Client for the stop endpoint
#[derive(Clone)]
pub struct StopClient {
    client: Client,
    url: String,
    port: u16,
}

impl StopClient {
    pub fn new(config: &OrchestratorConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            url: format!(
                "http://{}:{}{}stop",
                config.hostname, config.port, config.url_root
            ),
            port: config.port,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn stop(&self) -> Result<(), StopError> {
        debug!("GET {}", self.url);

        let response = self.client.get(&self.url).send().await.map_err(|e| {
            if is_connection_refused(&e) {
                StopError::ConnectionRefused(self.port)
            } else {
                StopError::RequestFailed(e.to_string())
            }
        })?;

        match response.status() {
            StatusCode::OK => Ok(()),
            status => Err(StopError::Status(status.as_u16())),
        }
    }
}

fn is_connection_refused(err: &reqwest::Error) -> bool {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::ConnectionRefused {
                return true;
            }
        }
        source = cause.source();
    }
    false
}

/// Send the stop request and return the process exit code
pub async fn stop(config: &OrchestratorConfig) -> Result<i32> {
    let client = StopClient::new(config)?;

    match client.stop().await {
        Ok(()) => {
            info!("Server stopped.");
            Ok(0)
        }
        Err(e) => {
            match e.reason_code() {
                Some(code) => error!("{} ({})", e, code),
                None => error!("{}", e),
            }
            Ok(1)
        }
    }
}
