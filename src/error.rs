use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Longest detail fragment carried after a reason tag.
const DETAIL_MAX: usize = 100;

/// Stable, machine-parsable classification attached to every disconnect and
/// error event. Rendered as `tag` or `tag:<detail>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    AuthFailed,
    ConnectionRefused,
    DnsError(String),
    SocketTimeout,
    KeepaliveTimeout,
    RemoteClosed,
    PortBusy,
    NoKey,
    SshError(String),
    NetworkChange,
    UserDisconnect,
    ApiDisconnect,
    ApiDisconnectAll,
    Unknown(String),
}

impl DisconnectReason {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::AuthFailed => "auth_failed",
            Self::ConnectionRefused => "connection_refused",
            Self::DnsError(_) => "dns_error",
            Self::SocketTimeout => "socket_timeout",
            Self::KeepaliveTimeout => "keepalive_timeout",
            Self::RemoteClosed => "remote_closed",
            Self::PortBusy => "port_busy",
            Self::NoKey => "no_key",
            Self::SshError(_) => "ssh_error",
            Self::NetworkChange => "network_change",
            Self::UserDisconnect => "user_disconnect",
            Self::ApiDisconnect => "api_disconnect",
            Self::ApiDisconnectAll => "api_disconnect_all",
            Self::Unknown(_) => "unknown",
        }
    }

    /// True when the disconnect was commanded rather than suffered; these
    /// never trigger the reconnect scheduler.
    pub fn is_deliberate(&self) -> bool {
        matches!(
            self,
            Self::UserDisconnect | Self::ApiDisconnect | Self::ApiDisconnectAll
        )
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let detail = match self {
            Self::DnsError(d) | Self::SshError(d) | Self::Unknown(d) => Some(d),
            _ => None,
        };
        match detail {
            Some(d) => write!(f, "{}:{}", self.tag(), truncate(d, DETAIL_MAX)),
            None => f.write_str(self.tag()),
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Classify an error from the connect/auth/forward path into a reason tag.
///
/// Typed russh errors are matched first; the keyword scan over the rendered
/// text is only the fallback for errors that reach us as strings.
pub fn classify_error(err: &anyhow::Error, host: &str) -> DisconnectReason {
    if let Some(ssh) = err.downcast_ref::<russh::Error>() {
        return classify_ssh_error(ssh);
    }
    if let Some(io) = err.downcast_ref::<std::io::Error>() {
        if let Some(reason) = classify_io_error(io, host) {
            return reason;
        }
    }
    if err.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
        return DisconnectReason::SocketTimeout;
    }

    classify_text(&format!("{err:#}"), host)
}

fn classify_ssh_error(err: &russh::Error) -> DisconnectReason {
    match err {
        russh::Error::NoAuthMethod | russh::Error::NotAuthenticated => {
            DisconnectReason::AuthFailed
        }
        russh::Error::Disconnect | russh::Error::HUP => DisconnectReason::RemoteClosed,
        russh::Error::KeepaliveTimeout | russh::Error::InactivityTimeout => {
            DisconnectReason::KeepaliveTimeout
        }
        russh::Error::IO(io) => {
            classify_io_error(io, "").unwrap_or_else(|| ssh_detail(&io.to_string()))
        }
        other => ssh_detail(&other.to_string()),
    }
}

fn ssh_detail(text: &str) -> DisconnectReason {
    DisconnectReason::SshError(truncate(text, DETAIL_MAX).to_string())
}

fn classify_io_error(err: &std::io::Error, host: &str) -> Option<DisconnectReason> {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::ConnectionRefused => Some(DisconnectReason::ConnectionRefused),
        ErrorKind::TimedOut => Some(DisconnectReason::SocketTimeout),
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
            Some(DisconnectReason::RemoteClosed)
        }
        ErrorKind::AddrInUse => Some(DisconnectReason::PortBusy),
        ErrorKind::NotFound => Some(DisconnectReason::DnsError(host.to_string())),
        _ => None,
    }
}

/// Case-insensitive keyword scan, the last line of defense.
fn classify_text(text: &str, host: &str) -> DisconnectReason {
    let lower = text.to_lowercase();

    if lower.contains("auth") && (lower.contains("fail") || lower.contains("denied"))
        || lower.contains("permission denied")
    {
        DisconnectReason::AuthFailed
    } else if lower.contains("refused") {
        DisconnectReason::ConnectionRefused
    } else if lower.contains("dns")
        || lower.contains("resolve")
        || lower.contains("name or service not known")
    {
        DisconnectReason::DnsError(host.to_string())
    } else if lower.contains("keepalive") {
        DisconnectReason::KeepaliveTimeout
    } else if lower.contains("timed out") || lower.contains("timeout") {
        DisconnectReason::SocketTimeout
    } else if lower.contains("reset") || lower.contains("broken pipe") || lower.contains("eof") {
        DisconnectReason::RemoteClosed
    } else if lower.contains("address in use") || lower.contains("address already in use") {
        DisconnectReason::PortBusy
    } else if lower.contains("ssh") {
        ssh_detail(text)
    } else {
        DisconnectReason::Unknown(truncate(text, DETAIL_MAX).to_string())
    }
}

// =============================================================================
// Control API errors
// =============================================================================

/// Error surface of the Control API, rendered as `{"error": ...}` JSON with
/// the matching status code.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.to_string() }));
        (self.status(), body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn display_renders_tag_and_detail() {
        assert_eq!(DisconnectReason::RemoteClosed.to_string(), "remote_closed");
        assert_eq!(
            DisconnectReason::DnsError("example.org".into()).to_string(),
            "dns_error:example.org"
        );
    }

    #[test]
    fn detail_is_truncated_to_100_chars() {
        let long = "x".repeat(300);
        let rendered = DisconnectReason::Unknown(long).to_string();
        assert_eq!(rendered.len(), "unknown:".len() + 100);
    }

    #[test]
    fn keyword_fallback_classifies_common_failures() {
        let cases = [
            ("Authentication failed for user", "auth_failed"),
            ("connection refused by peer", "connection_refused"),
            ("failed to resolve hostname", "dns_error"),
            ("operation timed out", "socket_timeout"),
            ("connection reset by peer", "remote_closed"),
            ("keepalive probe lost", "keepalive_timeout"),
            ("something inexplicable", "unknown"),
        ];
        for (text, tag) in cases {
            let reason = classify_error(&anyhow!("{text}"), "h");
            assert_eq!(reason.tag(), tag, "for {text:?}");
        }
    }

    #[test]
    fn io_errors_classify_by_kind() {
        let err = anyhow::Error::from(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert_eq!(classify_error(&err, "h").tag(), "connection_refused");

        let err = anyhow::Error::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert_eq!(classify_error(&err, "h").tag(), "remote_closed");
    }

    #[test]
    fn deliberate_reasons_suppress_reconnect() {
        assert!(DisconnectReason::UserDisconnect.is_deliberate());
        assert!(DisconnectReason::ApiDisconnectAll.is_deliberate());
        assert!(!DisconnectReason::RemoteClosed.is_deliberate());
    }
}
