//! Minimal cookie codec
//!
//! Parses `Cookie` request headers into a name/value map and renders
//! `Set-Cookie` directives. Only the attributes the gateway needs are modeled.

use chrono::{DateTime, Utc};
use hyper::header::{HeaderMap, COOKIE};
use std::collections::HashMap;
use std::fmt::Write;

/// Parse a `Cookie` header value into a name -> decoded value map.
///
/// Pairs without `=`, with an empty name, or with a value that does not
/// URL-decode are skipped. When a name repeats, the last value wins.
pub fn parse_cookies(header: Option<&str>) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    let Some(header) = header else {
        return cookies;
    };

    for pair in header.split(';') {
        let Some((name, value)) = pair.split_once('=') else {
            continue;
        };

        // A name never contains whitespace; keep only the last token before '='
        let name = name.trim().rsplit(char::is_whitespace).next().unwrap_or("");
        if name.is_empty() {
            continue;
        }

        match urlencoding::decode(value.trim()) {
            Ok(decoded) => {
                cookies.insert(name.to_string(), decoded.into_owned());
            }
            Err(_) => continue,
        }
    }

    cookies
}

/// The request's `Cookie` header as one string.
///
/// HTTP/2 clients may split cookies over several header fields; those are
/// joined with `"; "`. Values that are not visible ASCII are dropped.
pub fn cookie_header(headers: &HeaderMap) -> Option<String> {
    let values: Vec<&str> = headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.join("; "))
    }
}

/// The `SameSite` cookie attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl SameSite {
    fn as_str(&self) -> &'static str {
        match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        }
    }
}

/// A single `Set-Cookie` directive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetCookie {
    pub name: String,
    pub value: String,
    pub expires: Option<DateTime<Utc>>,
    pub max_age: Option<i64>,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<SameSite>,
}

impl SetCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn with_max_age(mut self, seconds: i64) -> Self {
        self.max_age = Some(seconds);
        self
    }

    pub fn with_expires(mut self, expires: DateTime<Utc>) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn secure(mut self) -> Self {
        self.secure = true;
        self
    }

    pub fn http_only(mut self) -> Self {
        self.http_only = true;
        self
    }

    pub fn with_same_site(mut self, same_site: SameSite) -> Self {
        self.same_site = Some(same_site);
        self
    }

    /// Render as a `Set-Cookie` header value
    pub fn to_header_value(&self) -> String {
        let mut out = format!("{}={}", self.name, urlencoding::encode(&self.value));

        if let Some(expires) = self.expires {
            let _ = write!(out, "; Expires={}", expires.format("%a, %d %b %Y %H:%M:%S GMT"));
        }
        if let Some(max_age) = self.max_age {
            let _ = write!(out, "; Max-Age={}", max_age);
        }
        if let Some(ref domain) = self.domain {
            let _ = write!(out, "; Domain={}", domain);
        }
        if let Some(ref path) = self.path {
            let _ = write!(out, "; Path={}", path);
        }
        if self.secure {
            out.push_str("; Secure");
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        if let Some(same_site) = self.same_site {
            let _ = write!(out, "; SameSite={}", same_site.as_str());
        }

        out
    }
}

/// Join several directives into one string separated by `; `.
///
/// Legacy single-header form. Responses should carry one `Set-Cookie`
/// header per entry instead.
pub fn serialize_cookies(cookies: &[SetCookie]) -> String {
    cookies
        .iter()
        .map(SetCookie::to_header_value)
        .collect::<Vec<_>>()
        .join("; ")
}
