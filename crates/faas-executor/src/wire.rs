//! HTTP/1.0-over-TCP wire format spoken to the in-VM runtime (§6).

use tokio::io::{AsyncRead, AsyncReadExt};

/// Builds the `/init` request body: `{"value": {"main":"main","code":"<code>"}}`
/// with newlines stripped from `code`, matching the source's flattening.
pub fn init_body(code: &str) -> String {
    let flattened = code.replace('\n', "");
    format!(
        r#"{{"value": {{"main":"main", "code":{}}}}}"#,
        serde_json::to_string(&flattened).unwrap_or_else(|_| "\"\"".to_string())
    )
}

/// Builds the `/run` request body: `{"value": <args>}`. `args` is passed
/// through verbatim since it is already a JSON value as a string.
pub fn run_body(args: &str) -> String {
    format!(r#"{{"value": {args}}}"#)
}

/// Formats one POST request per §6.
pub fn http_request(path: &str, body: &str, keep_alive: bool) -> String {
    let mut out = format!("POST {path} HTTP/1.0\r\nContent-Type: application/json\r\n");
    if keep_alive {
        out.push_str("Connection: keep-alive\r\n");
    }
    out.push_str(&format!("content-length: {}\r\n\r\n{}", body.len(), body));
    out
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub ok: bool,
    pub body: String,
}

/// Reads one HTTP response off `stream`. Only understands the shape the
/// in-VM runtime actually produces: a status line, headers terminated by a
/// blank line, then exactly `content-length` bytes of body (or, for the
/// reference stub, the remainder of the connection).
pub async fn read_http_response<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> std::io::Result<HttpResponse> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_header_end(&buf) {
            break Some(pos);
        }
    };

    let header_end = match header_end {
        Some(pos) => pos,
        None => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before headers completed",
            ))
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let ok = status_line == "HTTP/1.1 200 OK";

    let content_length: Option<usize> = lines.find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    });

    let body_start = header_end + 4;
    let mut body = buf[body_start..].to_vec();
    if let Some(len) = content_length {
        while body.len() < len {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }
        body.truncate(len);
    }

    Ok(HttpResponse {
        ok,
        body: String::from_utf8_lossy(&body).to_string(),
    })
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub path: String,
    pub keep_alive: bool,
    pub body: String,
}

/// Reads one POST request off `stream`, the mirror image of
/// [`read_http_response`]. Used only by the reference Instance Manager's
/// in-VM HTTP stub.
pub async fn read_http_request<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> std::io::Result<Option<HttpRequest>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let path = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or_default()
        .to_string();

    let mut keep_alive = false;
    let mut content_length = 0usize;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim().to_ascii_lowercase();
            let value = value.trim();
            if name == "connection" && value.eq_ignore_ascii_case("keep-alive") {
                keep_alive = true;
            } else if name == "content-length" {
                content_length = value.parse().unwrap_or(0);
            }
        }
    }

    let body_start = header_end + 4;
    let mut body = buf[body_start..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Ok(Some(HttpRequest {
        path,
        keep_alive,
        body: String::from_utf8_lossy(&body).to_string(),
    }))
}

/// Formats a success response: `HTTP/1.1 200 OK` plus `body`.
pub fn http_ok(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\ncontent-length: {}\r\n\r\n{}",
        body.len(),
        body
    )
}

/// Formats a failure response carrying `body` as the error payload.
pub fn http_error(body: &str) -> String {
    format!(
        "HTTP/1.1 500 Internal Server Error\r\nContent-Type: application/json\r\ncontent-length: {}\r\n\r\n{}",
        body.len(),
        body
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_body_strips_newlines_and_escapes() {
        let body = init_body("function main(a){\nreturn a;\n}");
        assert!(!body.contains('\n'));
        assert!(body.contains("function main(a){return a;}"));
    }

    #[test]
    fn run_body_wraps_args_verbatim() {
        assert_eq!(run_body(r#"{"k":"v"}"#), r#"{"value": {"k":"v"}}"#);
    }

    #[test]
    fn http_request_omits_keep_alive_when_false() {
        let req = http_request("/run", "{}", false);
        assert!(!req.contains("Connection: keep-alive"));
        assert!(req.starts_with("POST /run HTTP/1.0\r\n"));
    }

    #[tokio::test]
    async fn reads_response_with_content_length() {
        let raw = b"HTTP/1.1 200 OK\r\ncontent-length: 11\r\n\r\n{\"OK\":true}";
        let mut cursor = std::io::Cursor::new(raw.to_vec());
        let resp = read_http_response(&mut cursor).await.unwrap();
        assert!(resp.ok);
        assert_eq!(resp.body, r#"{"OK":true}"#);
    }

    #[tokio::test]
    async fn rejects_non_200_status() {
        let raw = b"HTTP/1.1 500 Internal Server Error\r\ncontent-length: 14\r\n\r\n{\"err\":\"boom\"}";
        let mut cursor = std::io::Cursor::new(raw.to_vec());
        let resp = read_http_response(&mut cursor).await.unwrap();
        assert!(!resp.ok);
        assert_eq!(resp.body, r#"{"err":"boom"}"#);
    }
}
