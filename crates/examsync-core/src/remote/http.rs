//! HTTP implementation of the remote store

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::error::{Error, Result};
use crate::models::SessionId;

use super::{RemoteKey, RemoteStore};

/// Remote store speaking a plain keyed-document HTTP API.
///
/// Routes: `PUT /collections/{name}/{session}[/{field}]` for upserts,
/// `DELETE` on the same path, `POST /attempts/{session}/finalize`, and
/// `GET /collections/progress/{session}` for the confirmed elapsed value.
#[derive(Clone)]
pub struct HttpRemoteStore {
    base_url: String,
    auth_token: Option<String>,
    client: reqwest::Client,
}

impl HttpRemoteStore {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        Ok(Self {
            base_url,
            auth_token: None,
            client: reqwest::Client::builder().build()?,
        })
    }

    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    fn document_url(&self, collection: &str, key: RemoteKey) -> String {
        match key.field_id {
            Some(field_id) => format!(
                "{}/collections/{collection}/{}/{field_id}",
                self.base_url, key.session_id
            ),
            None => format!(
                "{}/collections/{collection}/{}",
                self.base_url, key.session_id
            ),
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn upsert(
        &self,
        collection: &str,
        key: RemoteKey,
        payload: serde_json::Value,
    ) -> Result<()> {
        let url = self.document_url(collection, key);
        let response = self
            .authorize(self.client.put(&url))
            .json(&payload)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Error::Network(response_error(response).await))
        }
    }

    async fn delete(&self, collection: &str, key: RemoteKey) -> Result<()> {
        let url = self.document_url(collection, key);
        let response = self.authorize(self.client.delete(&url)).send().await?;

        // A document that is already gone counts as deleted
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(Error::Network(response_error(response).await))
        }
    }

    async fn finalize(&self, session_id: SessionId) -> Result<()> {
        let url = format!("{}/attempts/{session_id}/finalize", self.base_url);
        let response = self.authorize(self.client.post(&url)).send().await?;

        if response.status().is_success() {
            return Ok(());
        }
        // The remote reports an already-terminal attempt as a conflict; the
        // caller treats that as success.
        if response.status() == StatusCode::CONFLICT {
            return Err(Error::FinalizeConflict(session_id.as_str()));
        }
        Err(Error::Network(response_error(response).await))
    }

    async fn fetch_elapsed(&self, session_id: SessionId) -> Result<Option<u32>> {
        let url = format!("{}/collections/progress/{session_id}", self.base_url);
        let response = self.authorize(self.client.get(&url)).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Error::Network(response_error(response).await));
        }

        let doc = response.json::<serde_json::Value>().await?;
        Ok(doc
            .get("elapsed_seconds")
            .and_then(serde_json::Value::as_u64)
            .map(|v| u32::try_from(v).unwrap_or(u32::MAX)))
    }
}

async fn response_error(response: reqwest::Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{trimmed} ({})", status.as_u16())
    }
}

fn normalize_base_url(raw: String) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidInput("base URL must not be empty".into()));
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        Ok(trimmed.trim_end_matches('/').to_string())
    } else {
        Err(Error::InvalidInput(
            "base URL must include http:// or https://".into(),
        ))
    }
}
