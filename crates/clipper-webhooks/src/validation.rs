//! Subscription input validation.
//!
//! Validates webhook URLs against:
//! - Protocol requirements (http or https, with a host)
//! - SSRF protections (private/internal IP ranges, cloud metadata endpoints)
//! - Event type validity

use std::net::IpAddr;

use crate::error::WebhookError;
use crate::models::WebhookEventType;

/// Longest accepted subscription URL.
pub const MAX_URL_LENGTH: usize = 2048;

/// Longest accepted description.
pub const MAX_DESCRIPTION_LENGTH: usize = 1000;

/// Validate a webhook delivery URL.
pub fn validate_webhook_url(url: &str) -> Result<(), WebhookError> {
    if url.len() > MAX_URL_LENGTH {
        return Err(WebhookError::InvalidUrl(format!(
            "URL exceeds {MAX_URL_LENGTH} characters"
        )));
    }

    let parsed = url::Url::parse(url)
        .map_err(|e| WebhookError::InvalidUrl(format!("Invalid URL format: {e}")))?;

    match parsed.scheme() {
        "https" | "http" => {}
        scheme => {
            return Err(WebhookError::InvalidUrl(format!(
                "Unsupported URL scheme: {scheme}"
            )));
        }
    }

    let host = parsed
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| WebhookError::InvalidUrl("URL must have a host".to_string()))?;

    validate_host_not_internal(host)?;

    Ok(())
}

/// Validate that a host is not a private/internal address.
///
/// Blocks:
/// - Loopback addresses (127.0.0.0/8, ::1)
/// - Private networks (10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16, fc00::/7)
/// - Link-local (169.254.0.0/16 and fe80::/10, cloud metadata endpoints)
/// - CGNAT (100.64.0.0/10)
/// - Unspecified and broadcast addresses
/// - Internal hostnames (localhost, *.internal, *.local)
pub fn validate_host_not_internal(host: &str) -> Result<(), WebhookError> {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        if is_internal_ip(&ip) {
            return Err(WebhookError::SsrfDetected(format!(
                "Destination host {host} is a private/internal address"
            )));
        }
    }

    let lower = bare.trim_end_matches('.').to_ascii_lowercase();
    if lower == "localhost"
        || lower.ends_with(".localhost")
        || lower == "metadata.google.internal"
        || lower.ends_with(".internal")
        || lower.ends_with(".local")
    {
        return Err(WebhookError::SsrfDetected(format!(
            "Destination host {host} is a restricted internal hostname"
        )));
    }

    Ok(())
}

/// Check if an IP address belongs to a private/internal range.
fn is_internal_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64) // 100.64.0.0/10 (CGNAT)
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_internal_ip(&IpAddr::V4(mapped));
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00 // fc00::/7 (unique local)
                || (first & 0xffc0) == 0xfe80 // fe80::/10 (link-local)
        }
    }
}

/// Validate that the list is non-empty and every entry is a known event type.
pub fn validate_event_types(event_types: &[String]) -> Result<(), WebhookError> {
    if event_types.is_empty() {
        return Err(WebhookError::Validation(
            "At least one event type is required".to_string(),
        ));
    }
    for et in event_types {
        if WebhookEventType::parse(et).is_none() {
            return Err(WebhookError::Validation(format!("Unknown event type: {et}")));
        }
    }
    Ok(())
}

/// Validate an optional description.
pub fn validate_description(description: Option<&str>) -> Result<(), WebhookError> {
    match description {
        Some(d) if d.chars().count() > MAX_DESCRIPTION_LENGTH => Err(WebhookError::Validation(
            format!("Description exceeds {MAX_DESCRIPTION_LENGTH} characters"),
        )),
        _ => Ok(()),
    }
}

/// Sort and drop duplicate event types.
#[must_use]
pub fn normalize_event_types(mut event_types: Vec<String>) -> Vec<String> {
    event_types.sort();
    event_types.dedup();
    event_types
}
