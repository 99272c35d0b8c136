//! Cross-bucket server-side copy.
//!
//! `object_store` only copies inside the bucket a store was built for. Copies
//! between two buckets of one provider go through the provider's own copy call
//! (S3 `CopyObject`, GCS `rewriteTo`), authenticated with the destination
//! store's credentials. No object bytes pass through this process.

use futures::future::BoxFuture;
use ingest_core::location::ObjectUri;
use object_store::Error as ObjectStoreError;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC};
use reqwest::StatusCode;

#[cfg(feature = "s3")]
pub use s3::S3CopyObject;

#[cfg(feature = "gcs")]
pub use gcs::GcsRewrite;

/// RFC 3986 unreserved characters stay literal; everything else is escaped.
const UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Copy `src` into `dst_bucket/dst_key` without downloading it.
pub trait ServerSideCopy: Send + Sync {
    fn copy<'a>(
        &'a self,
        src: &'a ObjectUri,
        dst_bucket: &'a str,
        dst_key: &'a str,
    ) -> BoxFuture<'a, object_store::Result<()>>;
}

fn generic(store: &'static str, message: impl Into<String>) -> ObjectStoreError {
    ObjectStoreError::Generic {
        store,
        source: message.into().into(),
    }
}

fn status_error(store: &'static str, status: StatusCode, path: String, body: String) -> ObjectStoreError {
    match status {
        StatusCode::NOT_FOUND => ObjectStoreError::NotFound {
            path,
            source: body.into(),
        },
        StatusCode::FORBIDDEN => ObjectStoreError::PermissionDenied {
            path,
            source: body.into(),
        },
        StatusCode::UNAUTHORIZED => ObjectStoreError::Unauthenticated {
            path,
            source: body.into(),
        },
        _ => generic(store, format!("copy into {path} failed with {status}: {body}")),
    }
}

#[cfg(feature = "s3")]
mod s3 {
    use std::collections::BTreeMap;

    use chrono::{DateTime, Utc};
    use futures::future::BoxFuture;
    use hmac::{Hmac, Mac};
    use ingest_core::location::ObjectUri;
    use object_store::aws::{AwsCredential, AwsCredentialProvider};
    use object_store::CredentialProvider;
    use percent_encoding::utf8_percent_encode;
    use reqwest::header::CONTENT_LENGTH;
    use sha2::{Digest, Sha256};

    use super::{generic, status_error, ServerSideCopy, UNRESERVED};

    const STORE: &str = "S3";
    const AMZ_DATE: &str = "%Y%m%dT%H%M%SZ";
    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    type HmacSha256 = Hmac<Sha256>;

    /// S3 `CopyObject` signed with SigV4.
    pub struct S3CopyObject {
        http: reqwest::Client,
        credentials: AwsCredentialProvider,
        region: String,
        endpoint: Option<String>,
    }

    impl S3CopyObject {
        /// `endpoint` switches to path-style addressing (S3-compatible stores).
        pub fn new(
            credentials: AwsCredentialProvider,
            region: String,
            endpoint: Option<String>,
        ) -> reqwest::Result<Self> {
            Ok(Self {
                http: reqwest::Client::builder().build()?,
                credentials,
                region,
                endpoint,
            })
        }

        /// `(url, host, canonical path)` of an object.
        pub(crate) fn target(&self, bucket: &str, key: &str) -> object_store::Result<(String, String, String)> {
            match &self.endpoint {
                Some(endpoint) => {
                    let base = endpoint.trim_end_matches('/');
                    let parsed = url::Url::parse(base)
                        .map_err(|e| generic(STORE, format!("invalid endpoint '{base}': {e}")))?;
                    let host = parsed
                        .host_str()
                        .ok_or_else(|| generic(STORE, format!("endpoint '{base}' has no host")))?;
                    let host = match parsed.port() {
                        Some(port) => format!("{host}:{port}"),
                        None => host.to_string(),
                    };
                    let path = format!("/{bucket}/{}", encode_key(key));
                    Ok((format!("{base}{path}"), host, path))
                }
                None => {
                    let host = format!("{bucket}.s3.{}.amazonaws.com", self.region);
                    let path = format!("/{}", encode_key(key));
                    Ok((format!("https://{host}{path}"), host, path))
                }
            }
        }

        async fn copy_object(&self, src: &ObjectUri, dst_bucket: &str, dst_key: &str) -> object_store::Result<()> {
            let credential = self.credentials.get_credential().await?;
            let (url, host, path) = self.target(dst_bucket, dst_key)?;
            let now = Utc::now();

            let mut headers = BTreeMap::new();
            headers.insert("host".to_string(), host);
            headers.insert("x-amz-content-sha256".to_string(), EMPTY_SHA256.to_string());
            headers.insert(
                "x-amz-copy-source".to_string(),
                format!("/{}/{}", src.bucket, encode_key(&src.key)),
            );
            headers.insert("x-amz-date".to_string(), now.format(AMZ_DATE).to_string());
            if let Some(token) = &credential.token {
                headers.insert("x-amz-security-token".to_string(), token.clone());
            }
            let authorization = sign_v4(&credential, &self.region, "PUT", &path, &headers, EMPTY_SHA256, now)
                .map_err(|e| generic(STORE, format!("signing failed: {e}")))?;

            let mut request = self
                .http
                .put(&url)
                .header("authorization", authorization)
                .header(CONTENT_LENGTH, 0);
            for (name, value) in headers.iter().filter(|(name, _)| name.as_str() != "host") {
                request = request.header(name.as_str(), value.as_str());
            }
            let response = request
                .send()
                .await
                .map_err(|e| generic(STORE, e.to_string()))?;
            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| generic(STORE, e.to_string()))?;
            // CopyObject may report a failure in the body of a 200 response.
            if !status.is_success() || body.contains("<Error>") {
                return Err(status_error(STORE, status, format!("{dst_bucket}/{dst_key}"), body));
            }
            Ok(())
        }
    }

    impl ServerSideCopy for S3CopyObject {
        fn copy<'a>(
            &'a self,
            src: &'a ObjectUri,
            dst_bucket: &'a str,
            dst_key: &'a str,
        ) -> BoxFuture<'a, object_store::Result<()>> {
            Box::pin(self.copy_object(src, dst_bucket, dst_key))
        }
    }

    /// Percent-encode a key, keeping `/` separators.
    pub(crate) fn encode_key(key: &str) -> String {
        key.split('/')
            .map(|segment| utf8_percent_encode(segment, UNRESERVED).to_string())
            .collect::<Vec<_>>()
            .join("/")
    }

    fn hmac_sha256(key: &[u8], data: &str) -> Result<Vec<u8>, hmac::digest::InvalidLength> {
        let mut mac = HmacSha256::new_from_slice(key)?;
        mac.update(data.as_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// `Authorization` header value for a request without a query string.
    /// `headers` are lowercase and include `host`; all of them are signed.
    pub(crate) fn sign_v4(
        credential: &AwsCredential,
        region: &str,
        method: &str,
        path: &str,
        headers: &BTreeMap<String, String>,
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<String, hmac::digest::InvalidLength> {
        let amz_date = now.format(AMZ_DATE).to_string();
        let date = now.format("%Y%m%d").to_string();

        let canonical_headers: String = headers
            .iter()
            .map(|(name, value)| format!("{name}:{}\n", value.trim()))
            .collect();
        let signed_headers = headers.keys().cloned().collect::<Vec<_>>().join(";");
        let canonical_request =
            format!("{method}\n{path}\n\n{canonical_headers}\n{signed_headers}\n{payload_hash}");

        let scope = format!("{date}/{region}/s3/aws4_request");
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let k_date = hmac_sha256(format!("AWS4{}", credential.secret_key).as_bytes(), &date)?;
        let k_region = hmac_sha256(&k_date, region)?;
        let k_service = hmac_sha256(&k_region, "s3")?;
        let k_signing = hmac_sha256(&k_service, "aws4_request")?;
        let signature = hex::encode(hmac_sha256(&k_signing, &string_to_sign)?);

        Ok(format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            credential.key_id
        ))
    }

}

#[cfg(feature = "gcs")]
mod gcs {
    use futures::future::BoxFuture;
    use ingest_core::location::ObjectUri;
    use object_store::gcp::GcpCredentialProvider;
    use object_store::CredentialProvider;
    use percent_encoding::utf8_percent_encode;
    use reqwest::header::CONTENT_LENGTH;
    use serde::Deserialize;

    use super::{generic, status_error, ServerSideCopy, UNRESERVED};

    const STORE: &str = "GCS";
    const JSON_API: &str = "https://storage.googleapis.com/storage/v1";

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct RewriteResponse {
        done: bool,
        rewrite_token: Option<String>,
    }

    /// GCS `objects.rewrite`, repeated until the service reports completion.
    pub struct GcsRewrite {
        http: reqwest::Client,
        credentials: GcpCredentialProvider,
        base_url: String,
    }

    impl GcsRewrite {
        pub fn new(credentials: GcpCredentialProvider) -> reqwest::Result<Self> {
            Ok(Self {
                http: reqwest::Client::builder().build()?,
                credentials,
                base_url: JSON_API.to_string(),
            })
        }

        pub(crate) fn rewrite_url(&self, src: &ObjectUri, dst_bucket: &str, dst_key: &str) -> String {
            let enc = |s: &str| utf8_percent_encode(s, UNRESERVED).to_string();
            format!(
                "{}/b/{}/o/{}/rewriteTo/b/{}/o/{}",
                self.base_url,
                enc(&src.bucket),
                enc(&src.key),
                enc(dst_bucket),
                enc(dst_key)
            )
        }

        async fn rewrite(&self, src: &ObjectUri, dst_bucket: &str, dst_key: &str) -> object_store::Result<()> {
            let url = self.rewrite_url(src, dst_bucket, dst_key);
            let mut token: Option<String> = None;
            loop {
                let credential = self.credentials.get_credential().await?;
                let mut request = self
                    .http
                    .post(&url)
                    .bearer_auth(&credential.bearer)
                    .header(CONTENT_LENGTH, 0);
                if let Some(token) = &token {
                    request = request.query(&[("rewriteToken", token.as_str())]);
                }
                let response = request
                    .send()
                    .await
                    .map_err(|e| generic(STORE, e.to_string()))?;
                let status = response.status();
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| generic(STORE, e.to_string()))?;
                if !status.is_success() {
                    let body = String::from_utf8_lossy(&body).into_owned();
                    return Err(status_error(STORE, status, format!("{dst_bucket}/{dst_key}"), body));
                }
                let parsed: RewriteResponse = serde_json::from_slice(&body)
                    .map_err(|e| generic(STORE, format!("unexpected rewrite response: {e}")))?;
                if parsed.done {
                    return Ok(());
                }
                token = match parsed.rewrite_token {
                    Some(next) => Some(next),
                    None => return Err(generic(STORE, "rewrite not done and no rewrite token returned")),
                };
            }
        }
    }

    impl ServerSideCopy for GcsRewrite {
        fn copy<'a>(
            &'a self,
            src: &'a ObjectUri,
            dst_bucket: &'a str,
            dst_key: &'a str,
        ) -> BoxFuture<'a, object_store::Result<()>> {
            Box::pin(self.rewrite(src, dst_bucket, dst_key))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::sync::Arc;

        use ingest_core::location::Provider;
        use object_store::gcp::GcpCredential;

        #[test]
        fn rewrite_url_escapes_whole_object_names() {
            let credentials: GcpCredentialProvider = Arc::new(object_store::StaticCredentialProvider::new(
                GcpCredential {
                    bearer: "token".into(),
                },
            ));
            let rewrite = GcsRewrite::new(credentials).unwrap();
            let src = ObjectUri::new(Provider::Gcs, "src-bucket", "raw/a b.txt");
            assert_eq!(
                rewrite.rewrite_url(&src, "phs001--c1", "123/seg/a b.txt"),
                "https://storage.googleapis.com/storage/v1/b/src-bucket/o/raw%2Fa%20b.txt/rewriteTo/b/phs001--c1/o/123%2Fseg%2Fa%20b.txt"
            );
        }

        #[test]
        fn partial_rewrite_response_carries_token() {
            let parsed: RewriteResponse =
                serde_json::from_str(r#"{"kind":"storage#rewriteResponse","done":false,"rewriteToken":"t1"}"#)
                    .unwrap();
            assert!(!parsed.done);
            assert_eq!(parsed.rewrite_token.as_deref(), Some("t1"));
        }
    }
}
