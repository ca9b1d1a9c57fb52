//! Canned responses the proxy produces itself.

use std::io::Write;

use time::macros::format_description;
use time::OffsetDateTime;

/// Value of the `Server` header on generated responses.
pub const SERVER_NAME: &str = concat!("event-proxy/", env!("CARGO_PKG_VERSION"));

/// Error responses generated by the proxy instead of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAnswer {
    BadRequest,
    HeaderTooLarge,
    BadGateway,
    ServiceUnavailable,
    GatewayTimeout,
    VersionNotSupported,
}

impl DefaultAnswer {
    pub fn status(&self) -> u16 {
        match self {
            DefaultAnswer::BadRequest => 400,
            DefaultAnswer::HeaderTooLarge => 431,
            DefaultAnswer::BadGateway => 502,
            DefaultAnswer::ServiceUnavailable => 503,
            DefaultAnswer::GatewayTimeout => 504,
            DefaultAnswer::VersionNotSupported => 505,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            DefaultAnswer::BadRequest => "Bad Request",
            DefaultAnswer::HeaderTooLarge => "Request Header Fields Too Large",
            DefaultAnswer::BadGateway => "Bad Gateway",
            DefaultAnswer::ServiceUnavailable => "Service Unavailable",
            DefaultAnswer::GatewayTimeout => "Gateway Timeout",
            DefaultAnswer::VersionNotSupported => "HTTP Version Not Supported",
        }
    }

    /// Client errors leave the connection in an unknown state; only gateway
    /// failures may keep it open.
    pub fn allows_keep_alive(&self) -> bool {
        matches!(
            self,
            DefaultAnswer::BadGateway | DefaultAnswer::ServiceUnavailable | DefaultAnswer::GatewayTimeout
        )
    }

    /// Serialize the full response.
    pub fn render(&self, keep_alive: bool) -> Vec<u8> {
        self.render_at(OffsetDateTime::now_utc(), keep_alive)
    }

    fn render_at(&self, now: OffsetDateTime, keep_alive: bool) -> Vec<u8> {
        let body = format!("{} {}\n", self.status(), self.reason());
        let keep_alive = keep_alive && self.allows_keep_alive();

        let mut out = Vec::with_capacity(256);
        let _ = write!(
            out,
            "HTTP/1.1 {} {}\r\n\
             Server: {}\r\n\
             Date: {}\r\n\
             Content-Type: text/plain\r\n\
             Content-Length: {}\r\n\
             Connection: {}\r\n\r\n{}",
            self.status(),
            self.reason(),
            SERVER_NAME,
            http_date(now),
            body.len(),
            if keep_alive { "keep-alive" } else { "close" },
            body,
        );
        out
    }
}

/// IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn http_date(now: OffsetDateTime) -> String {
    let format = format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );
    now.to_offset(time::UtcOffset::UTC).format(format).unwrap_or_default()
}
