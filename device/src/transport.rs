use std::time::Duration;

use async_trait::async_trait;
use ota_schema::{CheckRequest, CheckResponse, ChunkResponse, Heartbeat, OutcomeReport, PatchId};
use reqwest::StatusCode;

const CBOR: &str = "application/cbor";

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("not found")]
    NotFound,
    #[error("chunk index out of range")]
    OutOfRange,
    #[error("request timed out")]
    Timeout,
    #[error("request rejected with status {0}")]
    Status(u16),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("decoding chunk: {0}")]
    Decode(#[from] serde_cbor::Error),
}

impl TransportError {
    /// Errors worth retrying with the same request.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::NotFound | TransportError::OutOfRange => false,
            TransportError::Status(status) => *status >= 500,
            _ => true,
        }
    }

    /// The service understood the request and will never accept it.
    pub fn is_refusal(&self) -> bool {
        match self {
            TransportError::NotFound | TransportError::OutOfRange => true,
            TransportError::Status(status) => matches!(status, 400 | 404 | 409 | 410 | 422),
            _ => false,
        }
    }
}

/// The device's view of the update service. Each instance speaks for one
/// device.
#[async_trait]
pub trait OtaTransport: Send + Sync {
    async fn check(&self, current_version: &str) -> Result<CheckResponse, TransportError>;

    async fn get_chunk(&self, patch_id: &PatchId, index: u32)
        -> Result<ChunkResponse, TransportError>;

    async fn report_outcome(&self, report: &OutcomeReport) -> Result<(), TransportError>;

    async fn heartbeat(&self, version: &str) -> Result<CheckResponse, TransportError>;
}

#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    device_id: String,
    token: String,
}

impl HttpTransport {
    pub fn new(
        url: &str,
        device_id: &str,
        token: &str,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            device_id: device_id.to_string(),
            token: token.to_string(),
        })
    }

    fn device_url(&self, path: &str) -> String {
        format!("{}/v1/devices/{}/{}", self.url, self.device_id, path)
    }

    fn status(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(TransportError::NotFound),
            StatusCode::RANGE_NOT_SATISFIABLE => Err(TransportError::OutOfRange),
            status => Err(TransportError::Status(status.as_u16())),
        }
    }

    async fn post_check<B: serde::Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<CheckResponse, TransportError> {
        let response = self
            .client
            .post(self.device_url(path))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .map_err(map_error)?;
        Ok(Self::status(response)?.json().await?)
    }
}

fn map_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Http(e)
    }
}

#[async_trait]
impl OtaTransport for HttpTransport {
    async fn check(&self, current_version: &str) -> Result<CheckResponse, TransportError> {
        self.post_check(
            "check",
            &CheckRequest {
                current_version: current_version.to_string(),
            },
        )
        .await
    }

    async fn get_chunk(
        &self,
        patch_id: &PatchId,
        index: u32,
    ) -> Result<ChunkResponse, TransportError> {
        let response = self
            .client
            .get(self.device_url(&format!("patches/{}/chunks/{}", patch_id, index)))
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, CBOR)
            .send()
            .await
            .map_err(map_error)?;
        let body = Self::status(response)?.bytes().await.map_err(map_error)?;
        log::trace!("Received chunk {} of {} ({} bytes)", index, patch_id, body.len());
        Ok(serde_cbor::from_slice(&body)?)
    }

    async fn report_outcome(&self, report: &OutcomeReport) -> Result<(), TransportError> {
        let response = self
            .client
            .post(self.device_url("outcome"))
            .bearer_auth(&self.token)
            .json(report)
            .send()
            .await
            .map_err(map_error)?;
        Self::status(response)?;
        Ok(())
    }

    async fn heartbeat(&self, version: &str) -> Result<CheckResponse, TransportError> {
        self.post_check(
            "heartbeat",
            &Heartbeat {
                version: version.to_string(),
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refusals_are_never_worth_resending() {
        assert!(TransportError::Status(400).is_refusal());
        assert!(TransportError::NotFound.is_refusal());
        assert!(!TransportError::Status(401).is_refusal());
        assert!(!TransportError::Status(503).is_refusal());
        assert!(!TransportError::Timeout.is_refusal());
    }
}
