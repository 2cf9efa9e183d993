//! Download URL generation.
//!
//! URLs are deterministic: `<base>/clips/<job_id>/download?filename=<name>`.
//! With a signing secret configured, an HMAC-SHA256 over `job_id/filename`
//! is appended as `&sig=<base64url>` so the serving side can reject forged
//! links.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{StorageError, StorageResult};

type HmacSha256 = Hmac<Sha256>;

/// Default base URL for download links.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Delivery configuration.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Public base URL, without trailing slash
    pub base_url: String,
    /// Secret key for HMAC signing; unsigned URLs when `None`
    pub signing_secret: Option<String>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            signing_secret: None,
        }
    }
}

/// Builds (and checks) download URLs for stored clips.
#[derive(Debug, Clone, Default)]
pub struct DownloadUrlGenerator {
    config: DeliveryConfig,
}

impl DownloadUrlGenerator {
    pub fn new(config: DeliveryConfig) -> Self {
        Self { config }
    }

    pub fn download_url(&self, job_id: &str, filename: &str) -> StorageResult<String> {
        let mut url = format!(
            "{}/clips/{}/download?filename={}",
            self.config.base_url.trim_end_matches('/'),
            urlencoding::encode(job_id),
            urlencoding::encode(filename)
        );

        if let Some(secret) = &self.config.signing_secret {
            url.push_str("&sig=");
            url.push_str(&sign(secret, job_id, filename)?);
        }

        Ok(url)
    }

    /// Whether `signature` was produced for this job and filename.
    ///
    /// Always `true` when signing is disabled.
    pub fn verify_signature(&self, job_id: &str, filename: &str, signature: &str) -> bool {
        let Some(secret) = &self.config.signing_secret else {
            return true;
        };
        let Ok(sig_bytes) = URL_SAFE_NO_PAD.decode(signature) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(signing_payload(job_id, filename).as_bytes());
        mac.verify_slice(&sig_bytes).is_ok()
    }
}

fn signing_payload(job_id: &str, filename: &str) -> String {
    format!("{}/{}", job_id, filename)
}

fn sign(secret: &str, job_id: &str, filename: &str) -> StorageResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| StorageError::config_error(format!("Invalid HMAC key: {}", e)))?;
    mac.update(signing_payload(job_id, filename).as_bytes());
    Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
}
