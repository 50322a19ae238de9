//! Transport-independent HTTP responses and request helpers.
//!
//! JSON bodies follow two shapes:
//! `{"status":"ok","message":...}` on success and
//! `{"status":"nokN","error":...}` on failure, where `N` identifies which
//! step of the handler failed.

use serde::Serialize;

pub const APPLICATION_JSON: &str = "application/json";
pub const TEXT_PLAIN: &str = "text/plain";
pub const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status_code: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl ApiResponse {
    pub fn json<T: Serialize>(status_code: u16, value: &T) -> Self {
        match serde_json::to_string(value) {
            Ok(body) => Self {
                status_code,
                content_type: APPLICATION_JSON,
                body,
            },
            Err(e) => {
                log::error!("Failed to serialize response: {}", e);
                Self::text(500, "Internal Server Error")
            }
        }
    }

    pub fn ok(message: impl Into<String>) -> Self {
        Self::json(
            200,
            &serde_json::json!({ "status": "ok", "message": message.into() }),
        )
    }

    /// `tag` is the `nokN` marker of the failing step.
    pub fn error(status_code: u16, tag: &str, message: impl Into<String>) -> Self {
        Self::json(
            status_code,
            &serde_json::json!({ "status": tag, "error": message.into() }),
        )
    }

    pub fn text(status_code: u16, body: impl Into<String>) -> Self {
        Self {
            status_code,
            content_type: TEXT_PLAIN,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Reason phrase for the status line.
    pub fn reason(&self) -> &'static str {
        match self.status_code {
            200 => "OK",
            400 => "Bad Request",
            404 => "Not Found",
            409 => "Conflict",
            413 => "Payload Too Large",
            500 => "Internal Server Error",
            _ => "",
        }
    }
}

/// Largest JSON body accepted by the config and directory endpoints.
pub const MAX_JSON_BODY: usize = 8 * 1024;

/// Request body collected chunk by chunk up to a fixed limit.
#[derive(Debug)]
pub struct BodyBuffer {
    limit: usize,
    body: Vec<u8>,
}

impl BodyBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            body: Vec::new(),
        }
    }

    /// Reject up front a body whose announced length is over the limit.
    pub fn check_declared(&self, declared: u64) -> Result<(), ApiResponse> {
        if declared > self.limit as u64 {
            return Err(self.too_large());
        }
        Ok(())
    }

    /// Append a chunk. Past the limit the body is rejected as a whole with
    /// the response to send back; it is never cut short.
    pub fn push(&mut self, chunk: &[u8]) -> Result<(), ApiResponse> {
        if self.body.len() + chunk.len() > self.limit {
            return Err(self.too_large());
        }
        self.body.extend_from_slice(chunk);
        Ok(())
    }

    fn too_large(&self) -> ApiResponse {
        log::warn!("Request body larger than {} bytes rejected", self.limit);
        ApiResponse::error(413, "nok1", format!("Request body exceeds {} bytes", self.limit))
    }

    /// The collected body, `None` when nothing was sent.
    pub fn finish(self) -> Option<Vec<u8>> {
        (!self.body.is_empty()).then_some(self.body)
    }
}

/// Value of query parameter `key` in `uri`, percent-decoded.
pub fn query_param(uri: &str, key: &str) -> Option<String> {
    let (_, query) = uri.split_once('?')?;
    query
        .split('&')
        .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| percent_decode(v))
}

/// Path part of a request URI, without the query string.
pub fn uri_path(uri: &str) -> &str {
    uri.split_once('?').map_or(uri, |(path, _)| path)
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                (Some(hi), Some(lo)) => {
                    out.push(hi << 4 | lo);
                    i += 3;
                    continue;
                }
                _ => out.push(b'%'),
            },
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// MIME type served for a static asset, by extension.
pub fn content_type_for(path: &str) -> &'static str {
    let ext = path.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
    match ext.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => APPLICATION_JSON,
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "txt" | "log" => TEXT_PLAIN,
        "gz" => "application/x-gzip",
        "bin" => OCTET_STREAM,
        _ => TEXT_PLAIN,
    }
}
