//! HTTP client for the relay's request/response surface.

use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use pn_crypto::handshake::PrekeyBundle;
use pn_proto::api::{
    ErrorResponse, FetchBundleResponse, OkResponse, RegisterRequest, RegisterResponse,
    SendMessageRequest, SendMessageResponse,
};
use pn_proto::envelope::Envelope;

use crate::error::DaemonError;

#[derive(Clone)]
pub struct RelayClient {
    http: reqwest::Client,
    base_url: String,
}

impl RelayClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn register(&self, id: &str) -> Result<RegisterResponse, DaemonError> {
        let resp = self
            .http
            .post(format!("{}/v1/register", self.base_url))
            .json(&RegisterRequest { id: id.to_string() })
            .send()
            .await?;
        Self::decode(resp).await
    }

    pub async fn upload_bundle(&self, id: &str, bundle: &PrekeyBundle) -> Result<(), DaemonError> {
        let resp = self
            .http
            .post(format!("{}/v1/prekeys", self.base_url))
            .json(&serde_json::json!({ "id": id, "bundle": bundle }))
            .send()
            .await?;
        Self::decode::<OkResponse>(resp).await?;
        Ok(())
    }

    pub async fn fetch_bundle(&self, id: &str) -> Result<PrekeyBundle, DaemonError> {
        let resp = self
            .http
            .get(format!("{}/v1/prekeys/{id}", self.base_url))
            .send()
            .await?;
        Ok(Self::decode::<FetchBundleResponse>(resp).await?.bundle)
    }

    pub async fn send_message(
        &self,
        from: &str,
        to: &str,
        envelope: Envelope,
    ) -> Result<SendMessageResponse, DaemonError> {
        let resp = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .json(&SendMessageRequest { from: from.to_string(), to: to.to_string(), envelope })
            .send()
            .await?;
        Self::decode(resp).await
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, DaemonError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp.json().await?);
        }
        let kind = match resp.json::<ErrorResponse>().await {
            Ok(body) => body.error,
            Err(_) => StatusCode::as_str(&status).to_string(),
        };
        Err(DaemonError::Relay { status: status.as_u16(), kind })
    }
}
