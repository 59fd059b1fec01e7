//! S3-compatible object storage adapter.
//!
//! Talks to the bucket with the S3 REST API and AWS Signature V4 built from
//! pure-Rust primitives (`hmac`, `sha2`) — no SDK or C dependencies. Supports
//! header-signed server-side calls (HEAD, GET, PUT, DELETE, server-side copy)
//! and query-string presigning for untrusted clients.
//!
//! Two endpoints may be configured: the internal endpoint used by the
//! backend, and a public endpoint baked into presigned URLs so they resolve
//! from the client's network. Addressing is path-style
//! (`{scheme}://{endpoint}/{bucket}/{key}`), which is what MinIO and other
//! S3-compatibles expect.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::config::ObjectStoreConfig;

type HmacSha256 = Hmac<Sha256>;

const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// Server-reported object metadata.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub size: u64,
    pub etag: String,
    pub content_type: Option<String>,
    pub last_modified: Option<String>,
}

/// Thread-safe S3 client; cheap to share behind an `Arc`.
pub struct ObjectStore {
    bucket: String,
    region: String,
    access_key: String,
    secret_key: String,
    internal_host: String,
    public_host: String,
    scheme: &'static str,
    client: reqwest::Client,
}

impl ObjectStore {
    pub fn new(config: &ObjectStoreConfig) -> Result<Self> {
        if config.access_key.is_empty() || config.secret_key.is_empty() {
            bail!("Object store credentials are not configured (MINIO_ROOT_USER / MINIO_ROOT_PASSWORD)");
        }
        Ok(Self {
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            access_key: config.access_key.clone(),
            secret_key: config.secret_key.clone(),
            internal_host: strip_scheme(&config.endpoint),
            public_host: strip_scheme(&config.public_endpoint),
            scheme: if config.secure { "https" } else { "http" },
            client: reqwest::Client::new(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Create the bucket if it does not exist. Run once at startup.
    pub async fn ensure_bucket(&self) -> Result<()> {
        let uri = format!("/{}", self.bucket);
        let resp = self.send_signed("HEAD", &uri, &[], &[], &[]).await?;
        match resp.status().as_u16() {
            200 => Ok(()),
            404 => {
                let resp = self.send_signed("PUT", &uri, &[], &[], &[]).await?;
                if !resp.status().is_success() {
                    bail!(
                        "Failed to create bucket '{}' (HTTP {})",
                        self.bucket,
                        resp.status()
                    );
                }
                tracing::info!(bucket = %self.bucket, "created object-store bucket");
                Ok(())
            }
            other => bail!("Bucket probe for '{}' failed (HTTP {})", self.bucket, other),
        }
    }

    pub async fn object_exists(&self, key: &str) -> Result<bool> {
        Ok(self.head_object(key).await?.is_some())
    }

    /// HEAD an object; `None` when it does not exist.
    pub async fn head_object(&self, key: &str) -> Result<Option<ObjectMeta>> {
        let uri = object_uri(&self.bucket, key);
        let resp = self.send_signed("HEAD", &uri, &[], &[], &[]).await?;
        match resp.status().as_u16() {
            200 => Ok(Some(meta_from_headers(resp.headers()))),
            404 => Ok(None),
            other => bail!("HEAD failed for key '{}' (HTTP {})", key, other),
        }
    }

    /// Download an object to `dest_path`, creating parent directories.
    /// Returns the server-reported metadata.
    pub async fn get_file(&self, key: &str, dest_path: &Path) -> Result<(PathBuf, ObjectMeta)> {
        if let Some(parent) = dest_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let uri = object_uri(&self.bucket, key);
        let resp = self.send_signed("GET", &uri, &[], &[], &[]).await?;
        if resp.status().as_u16() == 404 {
            bail!("Object not found: s3://{}/{}", self.bucket, key);
        }
        if !resp.status().is_success() {
            bail!(
                "Download failed for key '{}' (HTTP {})",
                key,
                resp.status()
            );
        }

        let meta = meta_from_headers(resp.headers());
        let bytes = resp
            .bytes()
            .await
            .with_context(|| format!("Failed to read body for key '{}'", key))?;
        tokio::fs::write(dest_path, &bytes)
            .await
            .with_context(|| format!("Failed to write {}", dest_path.display()))?;

        Ok((dest_path.to_path_buf(), meta))
    }

    /// Upload raw bytes under `key`. Returns the `s3://` URI.
    pub async fn put_bytes(&self, key: &str, data: &[u8], content_type: Option<&str>) -> Result<String> {
        let uri = object_uri(&self.bucket, key);
        let payload_hash = hex_sha256(data);
        let extra = [(
            "content-type".to_string(),
            content_type.unwrap_or("application/octet-stream").to_string(),
        )];
        let resp = self
            .send_signed_with_body("PUT", &uri, &[], &extra, &payload_hash, data.to_vec())
            .await?;
        if !resp.status().is_success() {
            bail!("Upload failed for key '{}' (HTTP {})", key, resp.status());
        }
        Ok(format!("s3://{}/{}", self.bucket, key))
    }

    /// Server-side copy. Used with [`ObjectStore::remove`] to promote objects
    /// between prefixes without moving bytes through the backend.
    pub async fn copy(&self, src_key: &str, dst_key: &str) -> Result<()> {
        let uri = object_uri(&self.bucket, dst_key);
        let copy_source = format!("/{}/{}", self.bucket, encode_key(src_key));
        let extra = [("x-amz-copy-source".to_string(), copy_source)];
        let resp = self.send_signed("PUT", &uri, &[], &extra, &[]).await?;
        if !resp.status().is_success() {
            bail!(
                "Copy '{}' -> '{}' failed (HTTP {})",
                src_key,
                dst_key,
                resp.status()
            );
        }
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        let uri = object_uri(&self.bucket, key);
        let resp = self.send_signed("DELETE", &uri, &[], &[], &[]).await?;
        // S3 DELETE returns 204 whether or not the object existed.
        if !resp.status().is_success() {
            bail!("Delete failed for key '{}' (HTTP {})", key, resp.status());
        }
        Ok(())
    }

    /// Presigned PUT URL against the public endpoint.
    pub fn presigned_put_url(&self, key: &str, expires_seconds: u64) -> String {
        self.presign("PUT", key, expires_seconds)
    }

    /// Presigned GET URL against the public endpoint.
    pub fn presigned_get_url(&self, key: &str, expires_seconds: u64) -> String {
        self.presign("GET", key, expires_seconds)
    }

    // ============ Request signing ============

    async fn send_signed(
        &self,
        method: &str,
        canonical_uri: &str,
        query: &[(String, String)],
        extra_headers: &[(String, String)],
        body: &[u8],
    ) -> Result<reqwest::Response> {
        let payload_hash = hex_sha256(body);
        self.send_signed_with_body(method, canonical_uri, query, extra_headers, &payload_hash, body.to_vec())
            .await
    }

    async fn send_signed_with_body(
        &self,
        method: &str,
        canonical_uri: &str,
        query: &[(String, String)],
        extra_headers: &[(String, String)],
        payload_hash: &str,
        body: Vec<u8>,
    ) -> Result<reqwest::Response> {
        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        // Signed headers: host + amz headers + any extra, sorted by name.
        let mut headers: Vec<(String, String)> = vec![
            ("host".to_string(), self.internal_host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.to_string()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        headers.extend(extra_headers.iter().cloned());
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let mut sorted_query = query.to_vec();
        sorted_query.sort_by(|a, b| a.0.cmp(&b.0));
        let canonical_querystring: String = sorted_query
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, canonical_uri, canonical_querystring, canonical_headers, signed_headers, payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key = derive_signing_key(&self.secret_key, &date_stamp, &self.region, "s3");
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.access_key, credential_scope, signed_headers, signature
        );

        let mut url = format!("{}://{}{}", self.scheme, self.internal_host, canonical_uri);
        if !canonical_querystring.is_empty() {
            url.push('?');
            url.push_str(&canonical_querystring);
        }

        let mut req = self
            .client
            .request(method.parse().context("invalid HTTP method")?, &url)
            .header("Authorization", &authorization);
        for (k, v) in &headers {
            if k != "host" {
                req = req.header(k.as_str(), v.as_str());
            }
        }
        if !body.is_empty() {
            req = req.body(body);
        }

        req.send()
            .await
            .with_context(|| format!("Object store request {} {} failed", method, canonical_uri))
    }

    /// Build a SigV4 query-presigned URL (host-only signed headers,
    /// unsigned payload) against the public endpoint.
    fn presign(&self, method: &str, key: &str, expires_seconds: u64) -> String {
        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let canonical_uri = object_uri(&self.bucket, key);
        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let credential = format!("{}/{}", self.access_key, credential_scope);

        let mut params: Vec<(String, String)> = vec![
            ("X-Amz-Algorithm".to_string(), "AWS4-HMAC-SHA256".to_string()),
            ("X-Amz-Credential".to_string(), credential),
            ("X-Amz-Date".to_string(), amz_date.clone()),
            ("X-Amz-Expires".to_string(), expires_seconds.to_string()),
            ("X-Amz-SignedHeaders".to_string(), "host".to_string()),
        ];
        params.sort_by(|a, b| a.0.cmp(&b.0));

        let canonical_querystring: String = params
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let canonical_request = format!(
            "{}\n{}\n{}\nhost:{}\n\nhost\n{}",
            method, canonical_uri, canonical_querystring, self.public_host, UNSIGNED_PAYLOAD
        );

        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key = derive_signing_key(&self.secret_key, &date_stamp, &self.region, "s3");
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        format!(
            "{}://{}{}?{}&X-Amz-Signature={}",
            self.scheme, self.public_host, canonical_uri, canonical_querystring, signature
        )
    }
}

// ============ SigV4 helpers ============

fn strip_scheme(endpoint: &str) -> String {
    endpoint
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/')
        .to_string()
}

/// Path-style canonical URI for an object.
fn object_uri(bucket: &str, key: &str) -> String {
    format!("/{}/{}", bucket, encode_key(key))
}

/// URI-encode each key segment, preserving `/` separators.
fn encode_key(key: &str) -> String {
    key.split('/').map(uri_encode).collect::<Vec<_>>().join("/")
}

/// Compute the hex-encoded SHA-256 hash of data.
fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute HMAC-SHA256 of data with the given key.
fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Compute hex-encoded HMAC-SHA256.
fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

/// Derive the AWS SigV4 signing key for a given date, region, and service.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// URI-encode a string per RFC 3986 (used in SigV4 canonical requests).
///
/// Encodes all characters except unreserved characters:
/// `A-Z a-z 0-9 - _ . ~`
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

fn meta_from_headers(headers: &reqwest::header::HeaderMap) -> ObjectMeta {
    let get = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    };
    ObjectMeta {
        size: get("content-length")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
        etag: get("etag")
            .map(|e| e.trim_matches('"').to_string())
            .unwrap_or_default(),
        content_type: get("content-type"),
        last_modified: get("last-modified"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> ObjectStore {
        ObjectStore::new(&ObjectStoreConfig {
            endpoint: "minio:9000".into(),
            public_endpoint: "localhost:9000".into(),
            access_key: "minioadmin".into(),
            secret_key: "minioadmin".into(),
            bucket: "knowhub".into(),
            region: "us-east-1".into(),
            secure: false,
        })
        .unwrap()
    }

    #[test]
    fn uri_encode_leaves_unreserved() {
        assert_eq!(uri_encode("abc-123_.~"), "abc-123_.~");
        assert_eq!(uri_encode("a b/c"), "a%20b%2Fc");
        assert_eq!(uri_encode("é"), "%C3%A9");
    }

    #[test]
    fn key_encoding_preserves_separators() {
        assert_eq!(
            encode_key("uploads/doc id/a b.pdf"),
            "uploads/doc%20id/a%20b.pdf"
        );
    }

    #[test]
    fn signing_key_matches_aws_reference_vector() {
        // Key-derivation example from the AWS SigV4 documentation.
        let key = derive_signing_key(
            "wJalrXUtnFEMI/K7MDENG/bPxRfiCYEXAMPLEKEY",
            "20150830",
            "us-east-1",
            "iam",
        );
        assert_eq!(
            hex::encode(key),
            "c4afb1cc5771d871763a393e44b703571b55cc28424d1a5e86da6ed3c154a4b9"
        );
    }

    #[test]
    fn presigned_url_shape() {
        let store = test_store();
        let url = store.presigned_put_url("uploads/abc/report.pdf", 600);

        assert!(url.starts_with("http://localhost:9000/knowhub/uploads/abc/report.pdf?"));
        assert!(url.contains("X-Amz-Algorithm=AWS4-HMAC-SHA256"));
        assert!(url.contains("X-Amz-Expires=600"));
        assert!(url.contains("X-Amz-SignedHeaders=host"));
        assert!(url.contains("X-Amz-Signature="));
    }

    #[test]
    fn presigned_url_uses_public_endpoint() {
        let store = test_store();
        let url = store.presigned_get_url("processed/abc/report.pdf", 300);
        assert!(url.contains("localhost:9000"));
        assert!(!url.contains("minio:9000"));
    }
}
