//! Path templates and raw HTTP request parsing for endpoint capabilities.
//!
//! Templates use `:name` segments, e.g. `/api/:version/users/:id`. Each
//! parameter captures exactly one non-`/` segment and the whole path must match.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("duplicate path parameter '{0}'")]
    DuplicateParam(String),
    #[error("invalid path template: {0}")]
    Pattern(#[from] regex::Error),
}

/// A compiled path template.
#[derive(Debug, Clone)]
pub struct PathPattern {
    template: String,
    regex: Regex,
    params: Vec<String>,
}

impl PathPattern {
    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn regex(&self) -> &Regex {
        &self.regex
    }

    /// Parameter names in the order they appear in the template.
    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// Match a whole path, returning the captured parameters.
    pub fn captures(&self, path: &str) -> Option<HashMap<String, String>> {
        let caps = self.regex.captures(path)?;
        Some(
            self.params
                .iter()
                .enumerate()
                .map(|(i, name)| {
                    let value = caps.get(i + 1).map_or("", |m| m.as_str());
                    (name.clone(), value.to_string())
                })
                .collect(),
        )
    }
}

fn is_param_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Compile `template` into an anchored regex with one capture group per
/// `:name` segment.
pub fn path_to_regexp(template: &str) -> Result<PathPattern, EndpointError> {
    let mut pattern = String::from("^");
    let mut params: Vec<String> = Vec::new();
    let mut literal = String::new();
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c == ':' && chars.peek().is_some_and(|n| is_param_char(*n)) {
            pattern.push_str(&regex::escape(&literal));
            literal.clear();

            let mut name = String::new();
            while let Some(n) = chars.next_if(|n| is_param_char(*n)) {
                name.push(n);
            }
            if params.contains(&name) {
                return Err(EndpointError::DuplicateParam(name));
            }
            params.push(name);
            pattern.push_str("([^/]+)");
        } else {
            literal.push(c);
        }
    }
    pattern.push_str(&regex::escape(&literal));
    pattern.push('$');

    Ok(PathPattern {
        template: template.to_string(),
        regex: Regex::new(&pattern)?,
        params,
    })
}

/// Match `path` against `template`. `None` when the path does not match.
pub fn match_path(
    path: &str,
    template: &str,
) -> Result<Option<HashMap<String, String>>, EndpointError> {
    Ok(path_to_regexp(template)?.captures(path))
}

/// Request line and headers of a raw HTTP request. The body is not parsed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    /// Request target exactly as sent, query string included.
    pub path: String,
    /// Header names and values split on the first `": "`, both kept verbatim.
    pub headers: Vec<(String, String)>,
    pub query: HashMap<String, String>,
}

impl HttpRequest {
    /// Path without the query string.
    pub fn route_path(&self) -> &str {
        self.path.split('?').next().unwrap_or("")
    }

    /// Case-insensitive header lookup; the value is returned trimmed.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.trim().eq_ignore_ascii_case(name))
            .map(|(_, v)| v.trim())
    }
}

pub fn parse_raw_http_request(raw: &str) -> HttpRequest {
    let mut lines = raw.split("\r\n");
    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.split(' ');
    let method = parts
        .next()
        .filter(|m| !m.is_empty())
        .unwrap_or("GET")
        .to_string();
    let path = parts
        .next()
        .filter(|p| !p.is_empty())
        .unwrap_or("/")
        .to_string();

    // Blank lines are skipped. A line without ": " is not a header.
    let headers = lines
        .filter(|line| !line.is_empty())
        .filter_map(|line| line.split_once(": "))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    let query = path
        .split_once('?')
        .map(|(_, q)| parse_query(q))
        .unwrap_or_default();

    HttpRequest {
        method,
        path,
        headers,
        query,
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (percent_decode(k), percent_decode(v))
        })
        .collect()
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => match (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                (Some(hi), Some(lo)) => {
                    out.push(hi << 4 | lo);
                    i += 2;
                }
                _ => out.push(b'%'),
            },
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}

struct Route<T> {
    method: String,
    pattern: PathPattern,
    target: T,
}

/// Method + path router over registered endpoint templates.
///
/// Candidates are tried with fewer parameters first, then longer templates
/// first, so `/user/me` wins over `/user/:id`.
pub struct EndpointRouter<T> {
    routes: Vec<Route<T>>,
}

/// A successful dispatch.
#[derive(Debug)]
pub struct EndpointMatch<'a, T> {
    pub target: &'a T,
    pub template: &'a str,
    pub params: HashMap<String, String>,
}

impl<T> Default for EndpointRouter<T> {
    fn default() -> Self {
        Self { routes: Vec::new() }
    }
}

impl<T> EndpointRouter<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, method: &str, template: &str, target: T) -> Result<(), EndpointError> {
        let pattern = path_to_regexp(template)?;
        self.routes.push(Route {
            method: method.to_string(),
            pattern,
            target,
        });
        self.routes.sort_by(|a, b| {
            a.pattern
                .params
                .len()
                .cmp(&b.pattern.params.len())
                .then_with(|| b.pattern.template.len().cmp(&a.pattern.template.len()))
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn dispatch(&self, method: &str, path: &str) -> Option<EndpointMatch<'_, T>> {
        let path = path.split('?').next().unwrap_or("");
        self.routes
            .iter()
            .filter(|r| r.method.eq_ignore_ascii_case(method))
            .find_map(|r| {
                r.pattern.captures(path).map(|params| EndpointMatch {
                    target: &r.target,
                    template: &r.pattern.template,
                    params,
                })
            })
    }
}
