//! Origin address derived from a proxied request.

use crate::error::ServiceError;
use crate::http::request::RequestHead;

const DEFAULT_PORT: u16 = 80;

/// Where a GET is forwarded and what request line it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    host: String,
    port: u16,
    request_target: String,
}

impl ProxyTarget {
    /// Build from a parsed request head.
    ///
    /// Absolute-form targets must use `http`. The host comes from the
    /// absolute-form authority when present, else from the `Host` header.
    pub fn from_head(head: &RequestHead) -> Result<Self, ServiceError> {
        let target = head.target();
        if let Some(scheme) = target.scheme() {
            if scheme != "http" {
                return Err(ServiceError::invalid_path(
                    format!("scheme {} cannot be proxied", scheme),
                    target.as_str(),
                ));
            }
        } else if !target.is_origin_form() {
            return Err(ServiceError::invalid_path("unsupported request target form", target.as_str()));
        }

        let raw_host = head
            .host()
            .ok_or_else(|| ServiceError::validation("request names no host"))?;
        let (host, port) = split_host(raw_host)?;

        Ok(Self {
            host,
            port,
            request_target: target.as_str().to_string(),
        })
    }

    /// `host:port`, used both to connect and as the forwarded `Host` value.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The target exactly as the client sent it.
    pub fn request_target(&self) -> &str {
        &self.request_target
    }
}

/// Split a `Host` value into host and port, defaulting the port to 80.
fn split_host(raw: &str) -> Result<(String, u16), ServiceError> {
    let invalid = |reason: &str| ServiceError::invalid_path(reason.to_string(), raw);
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ServiceError::validation("request names no host"));
    }
    if raw.contains(['@', '/', '?', '#']) {
        return Err(invalid("invalid host"));
    }

    let (host, port) = if let Some(rest) = raw.strip_prefix('[') {
        let close = rest.find(']').ok_or_else(|| invalid("unterminated IPv6 literal"))?;
        let literal = &rest[..close];
        if literal.is_empty() || !literal.contains(':') {
            return Err(invalid("invalid IPv6 literal"));
        }
        let after = &rest[close + 1..];
        let port = match after {
            "" => None,
            _ => Some(after.strip_prefix(':').ok_or_else(|| invalid("invalid host"))?),
        };
        (format!("[{}]", literal), port)
    } else if raw.matches(':').count() > 1 {
        // Bare IPv6 literal without a port.
        (format!("[{}]", raw), None)
    } else {
        match raw.split_once(':') {
            Some((host, port)) => (host.to_string(), Some(port)),
            None => (raw.to_string(), None),
        }
    };

    if host.is_empty() {
        return Err(invalid("invalid host"));
    }
    let port = match port {
        None | Some("") => DEFAULT_PORT,
        Some(port) => match port.parse::<u16>() {
            Ok(0) | Err(_) => return Err(invalid("invalid port")),
            Ok(port) => port,
        },
    };
    Ok((host.to_ascii_lowercase(), port))
}
