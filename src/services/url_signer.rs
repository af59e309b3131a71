//! Pre-signed URLs for the local provider's data plane.
//!
//! A URL authorizes exactly one kind of PUT (a part slot of one session, or a
//! whole object with one content type) until its expiry. The signature is an
//! HMAC-SHA256 over a canonical string, base64url without padding.

use crate::services::object_storage::ProviderError;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use reqwest::Url;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Route prefix the data plane is mounted under.
pub const STORAGE_PREFIX: &str = "storage";

/// What a signed URL authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignedTarget<'a> {
    Part { upload_id: &'a str, part_number: u32 },
    Object { content_type: &'a str },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signed url has expired")]
    Expired,
    #[error("signature does not match")]
    Invalid,
}

#[derive(Clone)]
pub struct UrlSigner {
    secret: Vec<u8>,
    base_url: String,
}

impl std::fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlSigner")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl UrlSigner {
    pub fn new(secret: impl AsRef<[u8]>, base_url: impl Into<String>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Unsigned URL of an object on the data plane.
    pub fn object_url(&self, key: &str) -> Result<Url, ProviderError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|err| ProviderError::Signing(format!("invalid base url: {}", err)))?;
        url.path_segments_mut()
            .map_err(|_| ProviderError::Signing("base url cannot carry a path".into()))?
            .pop_if_empty()
            .push(STORAGE_PREFIX)
            .extend(key.split('/'));
        Ok(url)
    }

    /// Build a URL valid until `expires_at` (unix seconds).
    pub fn sign(
        &self,
        key: &str,
        target: SignedTarget<'_>,
        expires_at: i64,
    ) -> Result<String, ProviderError> {
        let signature = self.signature(key, target, expires_at)?;
        let mut url = self.object_url(key)?;
        {
            let mut query = url.query_pairs_mut();
            match target {
                SignedTarget::Part {
                    upload_id,
                    part_number,
                } => {
                    query
                        .append_pair("uploadId", upload_id)
                        .append_pair("partNumber", &part_number.to_string());
                }
                SignedTarget::Object { content_type } => {
                    query.append_pair("contentType", content_type);
                }
            }
            query
                .append_pair("expires", &expires_at.to_string())
                .append_pair("signature", &signature);
        }
        Ok(url.into())
    }

    /// Check a presented signature at `now` (unix seconds).
    pub fn verify(
        &self,
        key: &str,
        target: SignedTarget<'_>,
        expires_at: i64,
        signature: &str,
        now: i64,
    ) -> Result<(), SignatureError> {
        if now > expires_at {
            return Err(SignatureError::Expired);
        }
        let presented = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| SignatureError::Invalid)?;
        let mut mac = self.mac().map_err(|_| SignatureError::Invalid)?;
        mac.update(canonical(key, target, expires_at).as_bytes());
        mac.verify_slice(&presented)
            .map_err(|_| SignatureError::Invalid)
    }

    fn signature(
        &self,
        key: &str,
        target: SignedTarget<'_>,
        expires_at: i64,
    ) -> Result<String, ProviderError> {
        let mut mac = self.mac()?;
        mac.update(canonical(key, target, expires_at).as_bytes());
        Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
    }

    fn mac(&self) -> Result<HmacSha256, ProviderError> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|err| ProviderError::Signing(err.to_string()))
    }
}

fn canonical(key: &str, target: SignedTarget<'_>, expires_at: i64) -> String {
    match target {
        SignedTarget::Part {
            upload_id,
            part_number,
        } => format!("PUT\n{}\npart\n{}\n{}\n{}", key, upload_id, part_number, expires_at),
        SignedTarget::Object { content_type } => {
            format!("PUT\n{}\nobject\n{}\n{}", key, content_type, expires_at)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "events/evt1/media/abc_1700000000000.jpg";

    fn signer() -> UrlSigner {
        UrlSigner::new("test-secret", "http://localhost:3000/")
    }

    fn query_value(url: &str, name: &str) -> String {
        Url::parse(url)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
            .unwrap()
    }

    #[test]
    fn part_url_verifies_for_its_own_slot_only() {
        let target = SignedTarget::Part {
            upload_id: "u1",
            part_number: 3,
        };
        let url = signer().sign(KEY, target, 2_000).unwrap();
        assert!(url.starts_with("http://localhost:3000/storage/events/evt1/media/"));
        let sig = query_value(&url, "signature");

        assert_eq!(signer().verify(KEY, target, 2_000, &sig, 1_000), Ok(()));
        let other_slot = SignedTarget::Part {
            upload_id: "u1",
            part_number: 4,
        };
        assert_eq!(
            signer().verify(KEY, other_slot, 2_000, &sig, 1_000),
            Err(SignatureError::Invalid)
        );
        assert_eq!(
            signer().verify(KEY, target, 2_001, &sig, 1_000),
            Err(SignatureError::Invalid)
        );
    }

    #[test]
    fn expired_urls_are_rejected() {
        let target = SignedTarget::Object {
            content_type: "image/jpeg",
        };
        let url = signer().sign(KEY, target, 1_000).unwrap();
        assert_eq!(query_value(&url, "contentType"), "image/jpeg");
        let sig = query_value(&url, "signature");
        assert_eq!(
            signer().verify(KEY, target, 1_000, &sig, 1_001),
            Err(SignatureError::Expired)
        );
    }

    #[test]
    fn different_secret_fails() {
        let target = SignedTarget::Object {
            content_type: "video/mp4",
        };
        let url = signer().sign(KEY, target, 5_000).unwrap();
        let sig = query_value(&url, "signature");
        let other = UrlSigner::new("other", "http://localhost:3000");
        assert_eq!(
            other.verify(KEY, target, 5_000, &sig, 0),
            Err(SignatureError::Invalid)
        );
    }

    #[test]
    fn signing_twice_yields_independent_valid_urls() {
        let target = SignedTarget::Part {
            upload_id: "u1",
            part_number: 1,
        };
        let first = signer().sign(KEY, target, 3_000).unwrap();
        let second = signer().sign(KEY, target, 3_600).unwrap();
        assert_ne!(first, second);
        for (url, exp) in [(first, 3_000), (second, 3_600)] {
            let sig = query_value(&url, "signature");
            assert_eq!(signer().verify(KEY, target, exp, &sig, 100), Ok(()));
        }
    }
}
