//! URL and input validation utilities

use url::Url;

use crate::core::error_handling::ProbeError;

/// Parse a download URL. Only http and https are accepted.
pub fn validate_url(url: &str) -> Result<Url, ProbeError> {
    let parsed = Url::parse(url).map_err(|e| ProbeError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(ProbeError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme '{}'", scheme),
        }),
    }
}

pub fn is_valid_download_url(url: &str) -> bool {
    validate_url(url).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_http_and_https() {
        assert!(validate_url("http://example.com/a.bin").is_ok());
        assert!(validate_url("https://example.com/a.bin").is_ok());
    }

    #[test]
    fn test_rejects_other_schemes() {
        assert!(!is_valid_download_url("ftp://example.com/a.bin"));
        assert!(!is_valid_download_url("file:///etc/passwd"));
        assert!(!is_valid_download_url("not a url"));
    }
}
