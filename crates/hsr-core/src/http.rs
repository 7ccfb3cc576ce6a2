//! HTTP implementations of the gateway and signing backend contracts.

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::errors::TransportError;
use crate::message::{
    InboundEnvelope, MessageStatus, PairDeviceRequest, PairDeviceResponse, ResponseEnvelope,
    VerifiedMessage,
};
use crate::transport::{Gateway, OneOrMany, SigningBackend};
use crate::types::{CertificateSet, DeviceIdentity, MsgId};

fn build_client() -> Result<reqwest::Client, TransportError> {
    reqwest::Client::builder()
        .use_rustls_tls()
        .build()
        .map_err(|e| TransportError::Unavailable(e.to_string()))
}

async fn send(request: RequestBuilder) -> Result<Response, TransportError> {
    let resp = request
        .send()
        .await
        .map_err(|e| TransportError::Unavailable(e.to_string()))?;

    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        Err(TransportError::Rejected {
            status: status.as_u16(),
            reason: body,
        })
    } else {
        Err(TransportError::BadResponse(format!("status={} body={:?}", status, body)))
    }
}

async fn read_json<T: DeserializeOwned>(resp: Response) -> Result<T, TransportError> {
    resp.json::<T>()
        .await
        .map_err(|e| TransportError::BadResponse(e.to_string()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessTokenResponse {
    access_token: String,
}

#[derive(Clone)]
pub struct HttpGateway {
    base_url: String,
    client: reqwest::Client,
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>) -> Result<Self, TransportError> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: build_client()?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn pair_device(&self, request: &PairDeviceRequest) -> Result<PairDeviceResponse, TransportError> {
        let resp = send(self.client.post(self.url("/pair_device")).json(request)).await?;
        read_json(resp).await
    }

    async fn access_token(&self, identity: &DeviceIdentity) -> Result<String, TransportError> {
        let resp = send(self.client.post(self.url("/access_token")).json(identity)).await?;
        Ok(read_json::<AccessTokenResponse>(resp).await?.access_token)
    }

    async fn messages(&self, access_token: &str) -> Result<OneOrMany<InboundEnvelope>, TransportError> {
        let resp = send(self.client.get(self.url("/msgs")).bearer_auth(access_token)).await?;
        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(OneOrMany::Many(Vec::new()));
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(OneOrMany::Many(Vec::new()));
        }
        serde_json::from_slice(&body).map_err(|e| TransportError::BadResponse(e.to_string()))
    }

    async fn certificates(&self, access_token: &str) -> Result<CertificateSet, TransportError> {
        let resp = send(self.client.get(self.url("/certificates")).bearer_auth(access_token)).await?;
        read_json(resp).await
    }

    async fn acknowledge(&self, access_token: &str, msg_id: MsgId) -> Result<(), TransportError> {
        let url = self.url(&format!("/msgs/{msg_id}/ack"));
        send(self.client.put(url).bearer_auth(access_token)).await?;
        Ok(())
    }

    async fn broadcast(&self, access_token: &str, response: &ResponseEnvelope) -> Result<(), TransportError> {
        send(
            self.client
                .post(self.url("/broadcast"))
                .bearer_auth(access_token)
                .json(response),
        )
        .await?;
        Ok(())
    }
}

#[derive(Serialize)]
struct SubmitRequest<'a> {
    messages: &'a [VerifiedMessage],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusQuery<'a> {
    msg_ids: &'a [MsgId],
}

// Records stay raw until `accept_statuses` so one bad entry cannot sink
// the whole response.
#[derive(Deserialize)]
struct StatusesResponse {
    #[serde(default)]
    statuses: Vec<Value>,
}

/// Decode each status record on its own, skipping the ones that do not
/// form a valid status.
fn accept_statuses(records: Vec<Value>) -> Vec<MessageStatus> {
    records
        .into_iter()
        .filter_map(|record| {
            let msg_id = record.get("msgId").cloned();
            match MessageStatus::deserialize(record) {
                Ok(status) => Some(status),
                Err(e) => {
                    warn!(msg_id = ?msg_id, error = %e, "skipping malformed status record");
                    None
                }
            }
        })
        .collect()
}

#[derive(Clone)]
pub struct HttpSigningBackend {
    base_url: String,
    client: reqwest::Client,
    bearer_token: Option<String>,
}

impl HttpSigningBackend {
    pub fn new(base_url: impl Into<String>, bearer_token: Option<String>) -> Result<Self, TransportError> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: build_client()?,
            bearer_token,
        })
    }

    fn post(&self, path: &str) -> RequestBuilder {
        let request = self.client.post(format!("{}{}", self.base_url, path));
        match &self.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl SigningBackend for HttpSigningBackend {
    async fn submit(&self, messages: &[VerifiedMessage]) -> Result<Vec<MessageStatus>, TransportError> {
        let resp = send(self.post("/messagesToSign").json(&SubmitRequest { messages })).await?;
        Ok(accept_statuses(read_json::<StatusesResponse>(resp).await?.statuses))
    }

    async fn query_status(&self, msg_ids: &[MsgId]) -> Result<Vec<MessageStatus>, TransportError> {
        let resp = send(self.post("/messagesStatus").json(&StatusQuery { msg_ids })).await?;
        Ok(accept_statuses(read_json::<StatusesResponse>(resp).await?.statuses))
    }
}
