//! Artifact store gateway: the only path binary artifacts take to durable
//! storage.
//!
//! Speaks the S3 REST protocol (path-style) over the same reqwest stack as
//! the provider clients, signed with SigV4. Enforces the canonical key
//! layout `episodes/{episode_id}/{asset_type}_v{version}.{ext}` and the
//! three-kind error contract: `not_found`, `storage_error` (transient,
//! retried in flight), and `misuse` (validation, never retried).

pub mod sigv4;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use md5::Md5;
use reqwest::Method;
use sha2::Digest;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::AssetType;
use crate::errors::{CoreError, Result};
use crate::providers::RetryPolicy;

use sigv4::{sha256_hex, Credentials};

pub const MIN_PRESIGN_TTL: Duration = Duration::from_secs(60);
pub const MAX_PRESIGN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

// ── Key layout ────────────────────────────────────────────────────────

/// Canonical object key for an episode asset.
pub fn episode_asset_key(episode_id: Uuid, asset_type: AssetType, version: u32, ext: &str) -> String {
    format!(
        "episodes/{episode_id}/{}_v{version}.{ext}",
        asset_type.as_str()
    )
}

/// Key for the i-th b-roll clip of a version (zero-based, cue order).
pub fn broll_clip_key(episode_id: Uuid, index: usize, version: u32) -> String {
    format!("episodes/{episode_id}/b_roll_{index}_v{version}.mp4")
}

pub fn episode_prefix(episode_id: Uuid) -> String {
    format!("episodes/{episode_id}/")
}

/// Clamp a presign TTL into `[60s, 24h]`, inclusive.
pub fn clamp_ttl(ttl: Duration) -> Duration {
    ttl.clamp(MIN_PRESIGN_TTL, MAX_PRESIGN_TTL)
}

// ── Results ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct UploadResult {
    pub bucket: String,
    pub key: String,
    pub uri: String,
    pub etag: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub checksum_md5: String,
}

#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub bucket: String,
    pub key: String,
    pub uri: String,
    pub content_type: Option<String>,
    pub size_bytes: Option<u64>,
    pub etag: Option<String>,
}

/// URL plus form fields for a direct browser upload.
#[derive(Debug, Clone)]
pub struct PresignedPost {
    pub url: String,
    pub fields: BTreeMap<String, String>,
}

// ── Trait ─────────────────────────────────────────────────────────────

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn ensure_bucket(&self, bucket: &str) -> Result<()>;

    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        content_type: Option<&str>,
        metadata: Option<&BTreeMap<String, String>>,
    ) -> Result<UploadResult>;

    /// Upload under the canonical episode key layout, tagging the object
    /// with its episode/type/version metadata.
    async fn upload_episode_asset(
        &self,
        bucket: &str,
        episode_id: Uuid,
        asset_type: AssetType,
        version: u32,
        ext: &str,
        data: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<UploadResult> {
        let key = episode_asset_key(episode_id, asset_type, version, ext);
        let metadata = BTreeMap::from([
            ("episode-id".to_string(), episode_id.to_string()),
            ("asset-type".to_string(), asset_type.as_str().to_string()),
            ("version".to_string(), version.to_string()),
        ]);
        self.upload(bucket, &key, data, content_type, Some(&metadata))
            .await
    }

    async fn download(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool>;

    async fn head(&self, bucket: &str, key: &str) -> Result<ObjectInfo>;

    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    /// Prefix scan + batched delete of everything under
    /// `episodes/{episode_id}/`. Returns the number of objects removed.
    async fn delete_episode_assets(&self, bucket: &str, episode_id: Uuid) -> Result<u64>;

    fn presign_get(&self, bucket: &str, key: &str, ttl: Duration) -> Result<String>;

    fn presign_post(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        ttl: Duration,
    ) -> Result<PresignedPost>;
}

// ── S3 gateway ────────────────────────────────────────────────────────

pub struct ArtifactStore {
    endpoint: String,
    host: String,
    creds: Credentials,
    client: reqwest::Client,
    retry: RetryPolicy,
}

fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

fn md5_base64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(Md5::digest(data))
}

fn guess_content_type(key: &str) -> String {
    mime_guess::from_path(key)
        .first_raw()
        .unwrap_or("application/octet-stream")
        .to_string()
}

fn check_args(bucket: &str, key: &str) -> Result<()> {
    if bucket.is_empty() {
        return Err(CoreError::validation("bucket must not be empty"));
    }
    if key.is_empty() || key.starts_with('/') {
        return Err(CoreError::validation(format!("invalid object key '{key}'")));
    }
    Ok(())
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Pull the text of every `<tag>…</tag>` out of a list response. The
/// listing payloads we consume are flat enough that a full XML parser
/// would be dead weight.
fn extract_xml_tags(body: &str, tag: &str) -> Vec<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut values = Vec::new();
    let mut rest = body;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        let Some(end) = after.find(&close) else { break };
        values.push(after[..end].to_string());
        rest = &after[end + close.len()..];
    }
    values
}

impl ArtifactStore {
    pub fn new(
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
        region: &str,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let endpoint = endpoint.trim_end_matches('/').to_string();
        let host = endpoint
            .strip_prefix("https://")
            .or_else(|| endpoint.strip_prefix("http://"))
            .ok_or_else(|| {
                CoreError::validation(format!("object store endpoint must be http(s): {endpoint}"))
            })?
            .to_string();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| CoreError::internal(format!("failed to build storage client: {e}")))?;
        Ok(Self {
            endpoint,
            host,
            creds: Credentials {
                access_key: access_key.to_string(),
                secret_key: secret_key.to_string(),
                region: region.to_string(),
            },
            client,
            retry,
        })
    }

    /// Signed request with in-flight retries for transient failures. 404
    /// maps to `not_found`; other 4xx fail immediately as `storage_error`.
    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        headers: &[(String, String)],
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response> {
        let payload_hash = match &body {
            Some(data) => sha256_hex(data),
            None => sha256_hex(b""),
        };
        let max = self.retry.max_retries.max(1);
        let mut last_error = String::new();

        for attempt in 0..max {
            let signed = sigv4::sign_headers(
                &self.creds,
                method.as_str(),
                &self.host,
                path,
                query,
                headers,
                &payload_hash,
                Utc::now(),
            );
            // Send the query exactly as signed.
            let query_string = query
                .iter()
                .map(|(k, v)| format!("{}={}", sigv4::uri_encode(k), sigv4::uri_encode(v)))
                .collect::<Vec<_>>()
                .join("&");
            let url = if query_string.is_empty() {
                format!("{}{path}", self.endpoint)
            } else {
                format!("{}{path}?{query_string}", self.endpoint)
            };

            let mut req = self.client.request(method.clone(), &url);
            for (name, value) in &signed {
                req = req.header(name.as_str(), value.as_str());
            }
            if let Some(data) = &body {
                req = req.body(data.clone());
            }

            match req.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    if status.as_u16() == 404 {
                        return Err(CoreError::not_found("S3Object", path.to_string()));
                    }
                    if status.is_server_error() {
                        last_error = format!("server error {}", status.as_u16());
                        if attempt + 1 < max {
                            tokio::time::sleep(self.retry.backoff_delay(attempt)).await;
                            continue;
                        }
                        break;
                    }
                    let text = response.text().await.unwrap_or_default();
                    let snippet: String = text.chars().take(300).collect();
                    return Err(CoreError::storage(format!(
                        "request failed with {}: {snippet}",
                        status.as_u16()
                    )));
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(
                        %path,
                        attempt = attempt + 1,
                        error = %last_error,
                        "storage transport error, retrying"
                    );
                    if attempt + 1 < max {
                        tokio::time::sleep(self.retry.backoff_delay(attempt)).await;
                    }
                }
            }
        }
        Err(CoreError::storage(format!(
            "request failed after retries: {last_error}"
        )))
    }

    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("prefix".to_string(), prefix.to_string()),
            ];
            if let Some(token) = &continuation {
                query.push(("continuation-token".to_string(), token.clone()));
            }
            query.sort();
            let response = self
                .request(Method::GET, &format!("/{bucket}"), &query, &[], None)
                .await?;
            let body = response
                .text()
                .await
                .map_err(|e| CoreError::storage(format!("list read failed: {e}")))?;
            keys.extend(extract_xml_tags(&body, "Key"));

            let truncated = extract_xml_tags(&body, "IsTruncated")
                .first()
                .map(|v| v == "true")
                .unwrap_or(false);
            if !truncated {
                break;
            }
            continuation = extract_xml_tags(&body, "NextContinuationToken")
                .first()
                .cloned();
            if continuation.is_none() {
                break;
            }
        }
        Ok(keys)
    }

    async fn delete_batch(&self, bucket: &str, keys: &[String]) -> Result<()> {
        let objects: String = keys
            .iter()
            .map(|k| format!("<Object><Key>{}</Key></Object>", xml_escape(k)))
            .collect();
        let body = format!("<Delete>{objects}<Quiet>true</Quiet></Delete>").into_bytes();
        let headers = vec![
            ("content-md5".to_string(), md5_base64(&body)),
            ("content-type".to_string(), "application/xml".to_string()),
        ];
        self.request(
            Method::POST,
            &format!("/{bucket}"),
            &[("delete".to_string(), String::new())],
            &headers,
            Some(body),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl BlobStore for ArtifactStore {
    async fn ensure_bucket(&self, bucket: &str) -> Result<()> {
        if bucket.is_empty() {
            return Err(CoreError::validation("bucket must not be empty"));
        }
        // Region-aware create: us-east-1 must not send a location constraint.
        let body = if self.creds.region == "us-east-1" {
            None
        } else {
            Some(
                format!(
                    "<CreateBucketConfiguration><LocationConstraint>{}</LocationConstraint></CreateBucketConfiguration>",
                    self.creds.region
                )
                .into_bytes(),
            )
        };
        match self
            .request(Method::PUT, &format!("/{bucket}"), &[], &[], body)
            .await
        {
            Ok(_) => Ok(()),
            // Already created (by us or a peer) is success for an
            // idempotent ensure.
            Err(CoreError::Storage(msg)) if msg.contains("409") => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        content_type: Option<&str>,
        metadata: Option<&BTreeMap<String, String>>,
    ) -> Result<UploadResult> {
        check_args(bucket, key)?;
        let content_type = content_type
            .map(str::to_string)
            .unwrap_or_else(|| guess_content_type(key));
        let checksum = md5_hex(&data);
        let size_bytes = data.len() as u64;

        let mut headers = vec![("content-type".to_string(), content_type.clone())];
        if let Some(metadata) = metadata {
            for (name, value) in metadata {
                headers.push((format!("x-amz-meta-{name}"), value.clone()));
            }
        }

        let response = self
            .request(
                Method::PUT,
                &format!("/{bucket}/{key}"),
                &[],
                &headers,
                Some(data),
            )
            .await?;
        let etag = response
            .headers()
            .get("ETag")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .trim_matches('"')
            .to_string();

        info!(bucket, key, size_bytes, %content_type, "artifact uploaded");

        Ok(UploadResult {
            bucket: bucket.to_string(),
            key: key.to_string(),
            uri: format!("s3://{bucket}/{key}"),
            etag,
            content_type,
            size_bytes,
            checksum_md5: checksum,
        })
    }

    async fn download(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        check_args(bucket, key)?;
        let response = self
            .request(Method::GET, &format!("/{bucket}/{key}"), &[], &[], None)
            .await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| CoreError::storage(format!("download read failed: {e}")))?;
        Ok(bytes.to_vec())
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        check_args(bucket, key)?;
        match self
            .request(Method::HEAD, &format!("/{bucket}/{key}"), &[], &[], None)
            .await
        {
            Ok(_) => Ok(true),
            Err(CoreError::NotFound { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<ObjectInfo> {
        check_args(bucket, key)?;
        let response = self
            .request(Method::HEAD, &format!("/{bucket}/{key}"), &[], &[], None)
            .await?;
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Ok(ObjectInfo {
            bucket: bucket.to_string(),
            key: key.to_string(),
            uri: format!("s3://{bucket}/{key}"),
            content_type: header("Content-Type"),
            size_bytes: header("Content-Length").and_then(|v| v.parse().ok()),
            etag: header("ETag").map(|v| v.trim_matches('"').to_string()),
        })
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        check_args(bucket, key)?;
        match self
            .request(Method::DELETE, &format!("/{bucket}/{key}"), &[], &[], None)
            .await
        {
            Ok(_) => Ok(()),
            // DELETE on a missing key is a no-op.
            Err(CoreError::NotFound { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn delete_episode_assets(&self, bucket: &str, episode_id: Uuid) -> Result<u64> {
        let prefix = episode_prefix(episode_id);
        let keys = self.list_keys(bucket, &prefix).await?;
        let mut deleted = 0u64;
        for chunk in keys.chunks(1000) {
            self.delete_batch(bucket, chunk).await?;
            deleted += chunk.len() as u64;
        }
        info!(bucket, %episode_id, deleted, "episode assets deleted");
        Ok(deleted)
    }

    fn presign_get(&self, bucket: &str, key: &str, ttl: Duration) -> Result<String> {
        check_args(bucket, key)?;
        let ttl = clamp_ttl(ttl);
        Ok(sigv4::presign_url(
            &self.creds,
            "GET",
            &self.endpoint,
            &self.host,
            &format!("/{bucket}/{key}"),
            ttl.as_secs(),
            Utc::now(),
        ))
    }

    fn presign_post(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        ttl: Duration,
    ) -> Result<PresignedPost> {
        check_args(bucket, key)?;
        let ttl = clamp_ttl(ttl);
        let now = Utc::now();
        let expiration = (now + chrono::Duration::from_std(ttl).unwrap_or_default())
            .format("%Y-%m-%dT%H:%M:%SZ")
            .to_string();

        // The policy must cover exactly what the form will post.
        let (credential, amz_date) = sigv4::post_credential(&self.creds, now);
        let policy_json = serde_json::json!({
            "expiration": expiration,
            "conditions": [
                {"bucket": bucket},
                {"key": key},
                {"Content-Type": content_type},
                {"x-amz-algorithm": "AWS4-HMAC-SHA256"},
                {"x-amz-credential": credential},
                {"x-amz-date": amz_date},
            ],
        })
        .to_string();

        let (policy_b64, signature) = sigv4::sign_post_policy(&self.creds, &policy_json, now);

        let mut fields = BTreeMap::new();
        fields.insert("key".to_string(), key.to_string());
        fields.insert("Content-Type".to_string(), content_type.to_string());
        fields.insert("policy".to_string(), policy_b64);
        fields.insert(
            "x-amz-algorithm".to_string(),
            "AWS4-HMAC-SHA256".to_string(),
        );
        fields.insert("x-amz-credential".to_string(), credential);
        fields.insert("x-amz-date".to_string(), amz_date);
        fields.insert("x-amz-signature".to_string(), signature);

        Ok(PresignedPost {
            url: format!("{}/{bucket}", self.endpoint),
            fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> ArtifactStore {
        ArtifactStore::new(
            "http://127.0.0.1:9000",
            "test-access",
            "test-secret",
            "us-east-1",
            RetryPolicy::default(),
        )
        .unwrap()
    }

    #[test]
    fn canonical_key_layout() {
        let id = Uuid::nil();
        assert_eq!(
            episode_asset_key(id, AssetType::Audio, 2, "mp3"),
            format!("episodes/{id}/audio_v2.mp3")
        );
        assert_eq!(
            broll_clip_key(id, 0, 3),
            format!("episodes/{id}/b_roll_0_v3.mp4")
        );
        assert_eq!(episode_prefix(id), format!("episodes/{id}/"));
    }

    #[test]
    fn ttl_is_clamped_inclusive() {
        assert_eq!(clamp_ttl(Duration::from_secs(1)), MIN_PRESIGN_TTL);
        assert_eq!(clamp_ttl(Duration::from_secs(60)), Duration::from_secs(60));
        assert_eq!(
            clamp_ttl(Duration::from_secs(3600)),
            Duration::from_secs(3600)
        );
        assert_eq!(clamp_ttl(Duration::from_secs(999_999)), MAX_PRESIGN_TTL);
    }

    #[test]
    fn content_type_guessed_from_extension() {
        assert_eq!(guess_content_type("episodes/x/audio_v1.mp3"), "audio/mpeg");
        assert_eq!(guess_content_type("episodes/x/avatar_video_v1.mp4"), "video/mp4");
        assert_eq!(guess_content_type("episodes/x/plan_v1.json"), "application/json");
        assert_eq!(guess_content_type("episodes/x/unknown.zzz"), "application/octet-stream");
    }

    #[test]
    fn zero_byte_checksum_is_well_defined() {
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn bad_arguments_are_misuse_not_storage_errors() {
        assert_eq!(check_args("", "key").unwrap_err().kind(), "validation");
        assert_eq!(check_args("bucket", "").unwrap_err().kind(), "validation");
        assert_eq!(
            check_args("bucket", "/absolute").unwrap_err().kind(),
            "validation"
        );
        assert!(check_args("bucket", "episodes/x/a.mp3").is_ok());
    }

    #[test]
    fn presign_get_clamps_and_signs() {
        let gw = gateway();
        let url = gw
            .presign_get("assets", "episodes/x/audio_v1.mp3", Duration::from_secs(5))
            .unwrap();
        assert!(url.contains("X-Amz-Expires=60"), "TTL should clamp up to 60: {url}");
        assert!(url.contains("X-Amz-Signature="));
        assert!(url.starts_with("http://127.0.0.1:9000/assets/episodes/x/audio_v1.mp3?"));
    }

    #[test]
    fn presign_post_carries_policy_fields() {
        let gw = gateway();
        let post = gw
            .presign_post(
                "assets",
                "episodes/x/script_v1.md",
                "text/markdown",
                Duration::from_secs(48 * 3600),
            )
            .unwrap();
        assert_eq!(post.url, "http://127.0.0.1:9000/assets");
        assert_eq!(post.fields["key"], "episodes/x/script_v1.md");
        assert_eq!(post.fields["Content-Type"], "text/markdown");
        assert!(post.fields.contains_key("policy"));
        assert!(post.fields.contains_key("x-amz-signature"));
        assert!(post.fields["x-amz-credential"].ends_with("/s3/aws4_request"));
    }

    #[test]
    fn xml_tag_extraction_handles_multiple_and_truncation_fields() {
        let body = "<ListBucketResult><IsTruncated>true</IsTruncated>\
                    <Contents><Key>episodes/a/audio_v1.mp3</Key></Contents>\
                    <Contents><Key>episodes/a/plan_v1.json</Key></Contents>\
                    <NextContinuationToken>token-1</NextContinuationToken></ListBucketResult>";
        assert_eq!(
            extract_xml_tags(body, "Key"),
            vec!["episodes/a/audio_v1.mp3", "episodes/a/plan_v1.json"]
        );
        assert_eq!(extract_xml_tags(body, "IsTruncated"), vec!["true"]);
        assert_eq!(extract_xml_tags(body, "NextContinuationToken"), vec!["token-1"]);
        assert!(extract_xml_tags(body, "Missing").is_empty());
    }

    #[test]
    fn xml_escape_covers_reserved_chars() {
        assert_eq!(xml_escape("a&b<c>d"), "a&amp;b&lt;c&gt;d");
    }
}
