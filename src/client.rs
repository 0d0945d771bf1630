//! Typed client for the node's `/api/v1/pow` surface.
//!
//! Used by operators driving a remote node and by the integration tests;
//! the request and response types are shared with the server so the two
//! cannot drift apart.

use reqwest::StatusCode;
use url::Url;

use crate::batch::ProofBatch;
use crate::manager::{PowInitRequest, PowStatusResponse};

/// Client-side failures: transport errors or non-2xx API answers.
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("api error {status}: {message}")]
    Api { status: StatusCode, message: String },
}

/// Thin `reqwest` wrapper over the PoW control endpoints.
#[derive(Debug, Clone)]
pub struct PowClient {
    base: Url,
    http: reqwest::Client,
}

impl PowClient {
    pub fn new(base: Url) -> Self {
        Self {
            base,
            http: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, path: &str) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty();
            for part in path.split('/') {
                segments.push(part);
            }
        }
        url
    }

    async fn expect_status(response: reqwest::Response) -> Result<PowStatusResponse, ClientError> {
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ClientError::Api { status, message });
        }
        Ok(response.json().await?)
    }

    pub async fn init(&self, request: &PowInitRequest) -> Result<PowStatusResponse, ClientError> {
        let response = self
            .http
            .post(self.endpoint("api/v1/pow/init"))
            .json(request)
            .send()
            .await?;
        Self::expect_status(response).await
    }

    pub async fn init_generate(
        &self,
        request: &PowInitRequest,
    ) -> Result<PowStatusResponse, ClientError> {
        let response = self
            .http
            .post(self.endpoint("api/v1/pow/init/generate"))
            .json(request)
            .send()
            .await?;
        Self::expect_status(response).await
    }

    pub async fn init_validate(
        &self,
        request: &PowInitRequest,
    ) -> Result<PowStatusResponse, ClientError> {
        let response = self
            .http
            .post(self.endpoint("api/v1/pow/init/validate"))
            .json(request)
            .send()
            .await?;
        Self::expect_status(response).await
    }

    pub async fn start_generation(&self) -> Result<PowStatusResponse, ClientError> {
        let response = self
            .http
            .post(self.endpoint("api/v1/pow/phase/generate"))
            .send()
            .await?;
        Self::expect_status(response).await
    }

    pub async fn start_validation(&self) -> Result<PowStatusResponse, ClientError> {
        let response = self
            .http
            .post(self.endpoint("api/v1/pow/phase/validate"))
            .send()
            .await?;
        Self::expect_status(response).await
    }

    /// Submits a peer batch for validation.
    pub async fn validate(&self, batch: &ProofBatch) -> Result<(), ClientError> {
        let response = self
            .http
            .post(self.endpoint("api/v1/pow/validate"))
            .json(batch)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ClientError::Api { status, message });
        }
        Ok(())
    }

    pub async fn status(&self) -> Result<PowStatusResponse, ClientError> {
        let response = self
            .http
            .get(self.endpoint("api/v1/pow/status"))
            .send()
            .await?;
        Self::expect_status(response).await
    }

    pub async fn stop(&self) -> Result<PowStatusResponse, ClientError> {
        let response = self
            .http
            .post(self.endpoint("api/v1/pow/stop"))
            .send()
            .await?;
        Self::expect_status(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_are_joined_onto_the_base() {
        let client = PowClient::new("http://node.example:8080".parse().unwrap());
        assert_eq!(
            client.endpoint("api/v1/pow/status").as_str(),
            "http://node.example:8080/api/v1/pow/status"
        );
    }
}
