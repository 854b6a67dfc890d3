//! The coordinating server's JSON API (spec §6): pending closures,
//! multipart part negotiation/completion, signing, garbage collection, and
//! pin management. All requests carry bearer-token authentication and go
//! through the shared retry/rate-limit transport.

use crate::transport::retry::{with_retry, BodyFactory};
use crate::transport::Transport;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

#[derive(Clone)]
pub struct ServerClient {
    transport: Transport,
    base_url: Url,
    auth_token: String,
}

#[derive(Debug, Serialize)]
pub struct PendingClosureObject {
    pub key: String,
    #[serde(rename = "type")]
    pub object_type: String,
    pub refs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nar_size: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct CreatePendingClosureRequest {
    pub closure: String,
    pub objects: Vec<PendingClosureObject>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MultipartInfo {
    pub upload_id: String,
    pub part_urls: Vec<String>,
}

/// `{type, presigned_url?, multipart_info?{upload_id, part_urls[]}}` as
/// named in spec §6. `object_type` is informational; callers branch on
/// which optional field is present.
#[derive(Debug, Clone, Deserialize)]
pub struct PendingObject {
    #[serde(rename = "type")]
    pub object_type: String,
    pub presigned_url: Option<String>,
    pub multipart_info: Option<MultipartInfo>,
}

#[derive(Debug, Deserialize)]
pub struct CreatePendingClosureResponse {
    pub id: String,
    pub started_at: String,
    pub pending_objects: HashMap<String, PendingObject>,
}

#[derive(Debug, Serialize)]
struct RequestMorePartsRequest<'a> {
    object_key: &'a str,
    upload_id: &'a str,
    start_part_number: u32,
    num_parts: u32,
}

#[derive(Debug, Deserialize)]
pub struct RequestMorePartsResponse {
    pub part_urls: Vec<String>,
    pub start_part_number: u32,
}

#[derive(Debug, Serialize)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

#[derive(Debug, Serialize)]
struct CompleteMultipartRequest<'a> {
    object_key: &'a str,
    upload_id: &'a str,
    parts: &'a [CompletedPart],
}

#[derive(Debug, Serialize)]
struct CompletePendingClosureRequest<'a> {
    narinfos: &'a HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct SignResponse {
    pub sigs: HashMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
pub struct GcStats {
    pub closures_removed: u64,
    pub objects_removed: u64,
}

/// A named pin keeping a closure alive past the GC expiration window it
/// would otherwise fall under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pin {
    pub name: String,
    pub closure: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_until: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListPinsResponse {
    pins: Vec<Pin>,
}

#[derive(Debug, Serialize)]
struct SetPinRequest<'a> {
    closure: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_until: Option<&'a str>,
}

const MULTIPART_BATCH_SIZE: u32 = 100;

impl ServerClient {
    pub fn new(base_url: Url, auth_token: String) -> Result<Self> {
        Ok(Self { transport: Transport::new()?, base_url, auth_token })
    }

    /// Build a server client sharing an existing `Transport` (and thus its
    /// rate limiters) with the object-store upload path, rather than
    /// standing up a second independent pair of limiters.
    pub fn with_transport(transport: Transport, base_url: Url, auth_token: String) -> Self {
        Self { transport, base_url, auth_token }
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.auth_token)
    }

    async fn post_json<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Resp> {
        let url = self.base_url.join(path).with_context(|| format!("building URL for {path}"))?;
        let bytes = Arc::new(serde_json::to_vec(body).context("serializing request body")?);

        struct JsonFactory(Arc<Vec<u8>>);
        impl BodyFactory for JsonFactory {
            fn make_body(&self) -> reqwest::Body {
                reqwest::Body::from(self.0.as_ref().clone())
            }
        }

        let auth = self.auth_header();
        let response = with_retry(
            &self.transport.server_limiter,
            &self.transport.retry_config,
            true,
            Some(&JsonFactory(bytes)),
            |reqwest_body| {
                self.transport
                    .client
                    .post(url.clone())
                    .header("Authorization", &auth)
                    .header("Content-Type", "application/json")
                    .body(reqwest_body.expect("json body factory always supplies a body"))
                    .send()
            },
        )
        .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("server request to {path} failed: {status} - {text}");
        }

        response.json::<Resp>().await.context("parsing server response")
    }

    /// `POST /api/pending_closures`
    pub async fn create_pending_closure(
        &self,
        closure: String,
        objects: Vec<PendingClosureObject>,
    ) -> Result<CreatePendingClosureResponse> {
        debug!(%closure, n_objects = objects.len(), "creating pending closure");
        let request = CreatePendingClosureRequest { closure, objects };
        let response: CreatePendingClosureResponse =
            self.post_json("api/pending_closures", &request).await?;
        info!(
            id = %response.id,
            n_pending = response.pending_objects.len(),
            "created pending closure"
        );
        Ok(response)
    }

    /// `POST /api/multipart/request-parts`. Requests additional part URLs
    /// in batches (spec default 100) when the streamer exhausts the
    /// preallocated list.
    pub async fn request_more_parts(
        &self,
        object_key: &str,
        upload_id: &str,
        start_part_number: u32,
    ) -> Result<RequestMorePartsResponse> {
        let request = RequestMorePartsRequest {
            object_key,
            upload_id,
            start_part_number,
            num_parts: MULTIPART_BATCH_SIZE,
        };
        self.post_json("api/multipart/request-parts", &request).await
    }

    /// `POST /api/multipart/complete`
    pub async fn complete_multipart(
        &self,
        object_key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()> {
        let request = CompleteMultipartRequest { object_key, upload_id, parts };
        let _: serde_json::Value = self.post_json("api/multipart/complete", &request).await?;
        Ok(())
    }

    /// `POST /api/pending_closures/{id}/sign`
    pub async fn sign_pending_closure(
        &self,
        closure_id: &str,
        metadata: &HashMap<String, serde_json::Value>,
    ) -> Result<SignResponse> {
        let path = format!("api/pending_closures/{closure_id}/sign");
        self.post_json(&path, metadata).await
    }

    /// `POST /api/pending_closures/{id}/complete`
    pub async fn complete_pending_closure(
        &self,
        closure_id: &str,
        narinfos: &HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        let path = format!("api/pending_closures/{closure_id}/complete");
        let request = CompletePendingClosureRequest { narinfos };
        let _: serde_json::Value = self.post_json(&path, &request).await?;
        info!(id = %closure_id, "committed pending closure");
        Ok(())
    }

    /// `DELETE /api/closures?older-than=...&failed-uploads-older-than=...[&force=true]`
    pub async fn gc_closures(
        &self,
        older_than: &str,
        failed_uploads_older_than: &str,
        force: bool,
    ) -> Result<GcStats> {
        let mut url = self.base_url.join("api/closures").context("building GC URL")?;
        {
            let mut qp = url.query_pairs_mut();
            qp.append_pair("older-than", older_than);
            qp.append_pair("failed-uploads-older-than", failed_uploads_older_than);
            if force {
                qp.append_pair("force", "true");
            }
        }

        let auth = self.auth_header();
        let response = self
            .transport
            .client
            .delete(url)
            .header("Authorization", &auth)
            .send()
            .await
            .context("sending GC request")?;

        if !response.status().is_success() {
            anyhow::bail!("GC request failed: {}", response.status());
        }

        response.json::<GcStats>().await.context("parsing GC response")
    }

    /// `GET /api/pins`
    pub async fn list_pins(&self) -> Result<Vec<Pin>> {
        let url = self.base_url.join("api/pins").context("building list-pins URL")?;
        let auth = self.auth_header();
        let response = self
            .transport
            .client
            .get(url)
            .header("Authorization", &auth)
            .send()
            .await
            .context("sending list-pins request")?;

        if !response.status().is_success() {
            anyhow::bail!("list-pins request failed: {}", response.status());
        }

        let parsed: ListPinsResponse =
            response.json().await.context("parsing list-pins response")?;
        Ok(parsed.pins)
    }

    /// `GET /api/pins/{name}`
    pub async fn get_pin(&self, name: &str) -> Result<Pin> {
        let path = format!("api/pins/{name}");
        let url = self.base_url.join(&path).context("building get-pin URL")?;
        let auth = self.auth_header();
        let response = self
            .transport
            .client
            .get(url)
            .header("Authorization", &auth)
            .send()
            .await
            .context("sending get-pin request")?;

        if !response.status().is_success() {
            anyhow::bail!("get-pin request for {name} failed: {}", response.status());
        }

        response.json::<Pin>().await.context("parsing get-pin response")
    }

    /// `POST /api/pins/{name}` — creates the pin if absent, otherwise
    /// updates its closure/expiry.
    pub async fn set_pin(&self, name: &str, closure: &str, keep_until: Option<&str>) -> Result<Pin> {
        let path = format!("api/pins/{name}");
        let request = SetPinRequest { closure, keep_until };
        self.post_json(&path, &request).await
    }

    /// `DELETE /api/pins/{name}`
    pub async fn delete_pin(&self, name: &str) -> Result<()> {
        let path = format!("api/pins/{name}");
        let url = self.base_url.join(&path).context("building delete-pin URL")?;
        let auth = self.auth_header();
        let response = self
            .transport
            .client
            .delete(url)
            .header("Authorization", &auth)
            .send()
            .await
            .context("sending delete-pin request")?;

        if !response.status().is_success() {
            anyhow::bail!("delete-pin request for {name} failed: {}", response.status());
        }
        info!(name, "removed pin");
        Ok(())
    }

    /// `GET /health`
    pub async fn health(&self) -> Result<bool> {
        let url = self.base_url.join("health").context("building health URL")?;
        let response = self.transport.client.get(url).send().await.context("health check")?;
        Ok(response.status().is_success())
    }
}
