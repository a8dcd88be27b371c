//! Remote package fetch with origin allowlist.
//!
//! Security model:
//! - Only URLs matching allowed origins can be fetched
//! - Redirects only followed if they stay within the same origin
//! - A `#sha256=<hex>` fragment pins the exact bytes of the module

use anyhow::{anyhow, Result};
use reqwest::Client;
use sha2::{Digest, Sha256};
use url::Url;

/// Maximum number of same-origin redirects followed for one package
const MAX_REDIRECTS: usize = 5;

/// Configuration for fetch allowlist
#[derive(Debug, Clone, Default)]
pub struct FetchConfig {
    /// Allowed origins (e.g., "https://cdn.example.com")
    /// An origin is scheme + host + port
    pub allowed_origins: Vec<String>,
}

impl FetchConfig {
    pub fn is_origin_allowed(&self, url: &Url) -> bool {
        if self.allowed_origins.is_empty() {
            return false;
        }
        let origin = url.origin().ascii_serialization();
        let origin = origin.trim_end_matches('/');
        self.allowed_origins
            .iter()
            .any(|allowed| origin == allowed.trim_end_matches('/'))
    }
}

/// Integrity pin carried in a locator fragment
fn expected_digest(url: &Url) -> Option<String> {
    url.fragment()
        .and_then(|f| f.strip_prefix("sha256="))
        .map(|hex| hex.to_ascii_lowercase())
}

fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Check `body` against the locator's `#sha256=` pin, if any
pub fn verify_integrity(url: &Url, body: &[u8]) -> Result<()> {
    let Some(expected) = expected_digest(url) else {
        return Ok(());
    };
    let actual = sha256_hex(body);
    if actual != expected {
        return Err(anyhow!(
            "Integrity check failed for '{}': expected sha256={}, got sha256={}",
            url,
            expected,
            actual
        ));
    }
    Ok(())
}

/// Fetch the source text of a remote module
pub async fn fetch_module_source(url: Url, config: FetchConfig) -> Result<String> {
    let client = Client::builder()
        // Don't follow redirects automatically - we'll handle them manually
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

    let mut target = url.clone();
    target.set_fragment(None);

    for _ in 0..=MAX_REDIRECTS {
        if !config.is_origin_allowed(&target) {
            return Err(anyhow!(
                "Fetch blocked: origin '{}' is not in the allowlist. Allowed: {:?}",
                target.origin().ascii_serialization(),
                config.allowed_origins
            ));
        }

        tracing::debug!(url = %target, "fetching package module");
        let response = client
            .get(target.clone())
            .send()
            .await
            .map_err(|e| anyhow!("Fetch failed: {}", e))?;

        let status = response.status();

        // Handle redirects manually - only allow same-origin
        if status.is_redirection() {
            let location = response
                .headers()
                .get("location")
                .ok_or_else(|| anyhow!("Redirect from '{}' without location", target))?;
            let location_str = location
                .to_str()
                .map_err(|_| anyhow!("Invalid redirect location"))?;
            let redirect_url = target
                .join(location_str)
                .map_err(|e| anyhow!("Invalid redirect URL: {}", e))?;

            if redirect_url.origin() != target.origin() {
                return Err(anyhow!(
                    "Fetch blocked: redirect to different origin '{}' (original: '{}')",
                    redirect_url.origin().ascii_serialization(),
                    target.origin().ascii_serialization()
                ));
            }

            target = redirect_url;
            continue;
        }

        if !status.is_success() {
            return Err(anyhow!(
                "Fetch of '{}' failed with status {}",
                target,
                status.as_u16()
            ));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| anyhow!("Failed to read response body: {}", e))?;

        verify_integrity(&url, &body)?;

        return String::from_utf8(body.to_vec())
            .map_err(|e| anyhow!("Module '{}' is not valid UTF-8: {}", url, e));
    }

    Err(anyhow!("Too many redirects fetching '{}'", url))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_matching() {
        let config = FetchConfig {
            allowed_origins: vec![
                "https://cdn.example.com".to_string(),
                "http://localhost:3000/".to_string(),
            ],
        };

        // Allowed
        assert!(config.is_origin_allowed(&Url::parse("https://cdn.example.com/leaflet.js").unwrap()));
        assert!(config.is_origin_allowed(&Url::parse("http://localhost:3000/pkg.mjs").unwrap()));

        // Not allowed
        assert!(!config.is_origin_allowed(&Url::parse("https://evil.com/pkg.js").unwrap()));
        assert!(!config.is_origin_allowed(&Url::parse("http://cdn.example.com/pkg.js").unwrap())); // http vs https
        assert!(!config.is_origin_allowed(&Url::parse("https://cdn.example.com:8080/").unwrap())); // different port
    }

    #[test]
    fn test_empty_allowlist() {
        let config = FetchConfig::default();
        assert!(!config.is_origin_allowed(&Url::parse("https://anything.com").unwrap()));
    }

    #[test]
    fn test_integrity_pin() {
        // sha256("abc")
        let pinned = Url::parse(
            "https://cdn.example.com/a.js#sha256=BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD",
        )
        .unwrap();
        assert!(verify_integrity(&pinned, b"abc").is_ok());

        let err = verify_integrity(&pinned, b"abd").unwrap_err();
        assert!(err.to_string().contains("Integrity check failed"));

        let unpinned = Url::parse("https://cdn.example.com/a.js").unwrap();
        assert!(verify_integrity(&unpinned, b"anything").is_ok());
    }

    #[tokio::test]
    async fn test_fetch_blocked_before_network() {
        let err = fetch_module_source(
            Url::parse("https://evil.com/pkg.js").unwrap(),
            FetchConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("not in the allowlist"));
    }
}
