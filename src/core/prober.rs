//! Resource metadata probe

use reqwest::header::{HeaderMap, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE};
use reqwest::{Client, StatusCode};
use tracing::{debug, info};

use crate::core::error_handling::ProbeError;
use crate::core::models::ProbeResult;
use crate::utils::validation::validate_url;

/// Asks the server for size, content type and range support without
/// downloading the body.
#[derive(Clone)]
pub struct ResourceProber {
    client: Client,
}

impl ResourceProber {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn probe(&self, url: &str) -> Result<ProbeResult, ProbeError> {
        validate_url(url)?;

        info!("🔍 Probing resource: {}", url);

        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(ProbeError::Unreachable)?;

        let status = response.status();

        // 部分服务器不支持 HEAD，改用 0-0 区间请求
        if status == StatusCode::METHOD_NOT_ALLOWED || status == StatusCode::NOT_IMPLEMENTED {
            debug!("HEAD refused with {}, falling back to range probe", status);
            return self.probe_with_range(url).await;
        }

        if !status.is_success() {
            return Err(ProbeError::Status(status.as_u16()));
        }

        let headers = response.headers();
        let total_size = parse_content_length(headers)?;
        let content_type = header_string(headers, CONTENT_TYPE);
        let accept_ranges = header_string(headers, ACCEPT_RANGES).map(|v| v.to_lowercase());

        let result = match (total_size, accept_ranges.as_deref()) {
            (Some(total), Some(ranges)) if total > 0 => ProbeResult {
                total_size: total,
                content_type,
                supports_ranges: ranges.contains("bytes"),
            },
            // 显式声明不支持区间
            (Some(total), Some(_)) => ProbeResult {
                total_size: total,
                content_type,
                supports_ranges: false,
            },
            // 长度缺失或未声明 Accept-Ranges 时再确认一次
            (fallback_size, _) => {
                let mut ranged = self.probe_with_range(url).await?;
                if ranged.total_size == 0 {
                    ranged.total_size = fallback_size.unwrap_or(0);
                }
                if ranged.content_type.is_none() {
                    ranged.content_type = content_type;
                }
                ranged
            }
        };

        info!(
            "✅ Probe finished: {} bytes, ranges: {}",
            result.total_size, result.supports_ranges
        );
        Ok(result)
    }

    async fn probe_with_range(&self, url: &str) -> Result<ProbeResult, ProbeError> {
        let response = self
            .client
            .get(url)
            .header(RANGE, "bytes=0-0")
            .send()
            .await
            .map_err(ProbeError::Unreachable)?;

        let status = response.status();
        let headers = response.headers();
        let content_type = header_string(headers, CONTENT_TYPE);

        if status == StatusCode::PARTIAL_CONTENT {
            let value = header_string(headers, CONTENT_RANGE).unwrap_or_default();
            let total_size = match parse_content_range_total(&value) {
                Some(total) => total,
                // 总长度未知：按 0 处理，走单连接流式下载
                None if has_unknown_total(&value) => 0,
                None => return Err(ProbeError::InvalidLength(value)),
            };

            return Ok(ProbeResult {
                total_size,
                content_type,
                supports_ranges: true,
            });
        }

        if status.is_success() {
            // 服务器忽略了 Range，返回完整响应
            return Ok(ProbeResult {
                total_size: parse_content_length(headers)?.unwrap_or(0),
                content_type,
                supports_ranges: false,
            });
        }

        Err(ProbeError::Status(status.as_u16()))
    }
}

fn header_string(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
}

/// `Content-Length` read from the header itself. Absent is `None`,
/// unparseable is an error.
fn parse_content_length(headers: &HeaderMap) -> Result<Option<u64>, ProbeError> {
    match header_string(headers, CONTENT_LENGTH) {
        None => Ok(None),
        Some(value) => value
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ProbeError::InvalidLength(value)),
    }
}

/// Total size from `bytes 0-0/1234`. An unknown total (`*`) is `None`.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let (unit, rest) = value.trim().split_once(' ')?;
    if !unit.eq_ignore_ascii_case("bytes") {
        return None;
    }

    let (_, total) = rest.split_once('/')?;
    total.trim().parse::<u64>().ok()
}

/// `bytes 0-0/*`
fn has_unknown_total(value: &str) -> bool {
    value
        .trim()
        .rsplit_once('/')
        .is_some_and(|(_, total)| total.trim() == "*")
}
