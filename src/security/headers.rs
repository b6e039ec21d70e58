//! Header manipulation for both legs of a proxied exchange.
//!
//! # Responsibilities
//! - Strip hop-by-hop headers
//! - Fold the caller's address into X-Forwarded-For
//! - Copy backend response headers without losing repeated values
//!
//! # Design Decisions
//! - `HeaderMap` is the only header store; names are case-insensitive there,
//!   so no function here normalizes case by hand
//! - Pure functions, no I/O

use axum::http::header::{HeaderMap, HeaderName, HeaderValue};

/// Name of the forwarded-for chain header.
pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Hop-by-hop headers. These are removed on both legs of the exchange.
pub const HOP_HEADERS: [HeaderName; 8] = [
    HeaderName::from_static("connection"),
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-authenticate"),
    HeaderName::from_static("proxy-authorization"),
    HeaderName::from_static("te"),
    HeaderName::from_static("trailers"),
    HeaderName::from_static("transfer-encoding"),
    HeaderName::from_static("upgrade"),
];

/// Check if a header is one of the hop-by-hop names.
pub fn is_hop_header(name: &HeaderName) -> bool {
    HOP_HEADERS.contains(name)
}

/// Remove every hop-by-hop header, keeping the remaining headers in order.
pub fn strip_hop_headers(headers: &mut HeaderMap) {
    if !headers.keys().any(is_hop_header) {
        return;
    }

    // HeaderMap::remove swaps entries around, so rebuild instead.
    let original = std::mem::take(headers);
    let mut current: Option<HeaderName> = None;
    for (name, value) in original {
        if let Some(name) = name {
            current = Some(name);
        }
        if let Some(name) = current.as_ref() {
            if !is_hop_header(name) {
                headers.append(name.clone(), value);
            }
        }
    }
}

/// Append `client_ip` to the X-Forwarded-For chain.
///
/// Prior values, including repeated header instances, are joined with `", "`
/// and folded into a single header whose last element is `client_ip`.
pub fn fold_forwarded_for(headers: &mut HeaderMap, client_ip: &str) {
    let mut chain: Vec<String> = headers
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .collect();
    chain.push(client_ip.to_string());

    match HeaderValue::from_str(&chain.join(", ")) {
        Ok(value) => {
            headers.insert(X_FORWARDED_FOR, value);
        }
        Err(e) => {
            tracing::warn!(client_ip = %client_ip, error = %e, "Skipping unrepresentable X-Forwarded-For");
        }
    }
}

/// Append every value of every header in `src` onto `dst`.
pub fn copy_all(dst: &mut HeaderMap, src: &HeaderMap) {
    for (name, value) in src {
        dst.append(name.clone(), value.clone());
    }
}

/// Split the host out of a `host:port` remote address.
///
/// Accepts `1.2.3.4:80` and `[::1]:80`. Returns `None` for anything without a
/// port, an unbracketed IPv6 literal, or an empty host.
pub fn client_ip(remote_addr: &str) -> Option<String> {
    let host = if let Some(rest) = remote_addr.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = after.strip_prefix(':')?;
        if host.contains('[') || port.contains(':') {
            return None;
        }
        host
    } else {
        let (host, port) = remote_addr.rsplit_once(':')?;
        if host.contains(':') || host.contains('[') || port.contains(']') {
            return None;
        }
        host
    };

    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}
