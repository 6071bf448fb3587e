//! HTTP/1.x framing of inner requests and responses

use erp_core::{ErpError, ErpResult};
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH};
use http::{HeaderMap, Method, Request, Response, StatusCode, Version};

const CRLF: &[u8] = b"\r\n";
const HEAD_END: &[u8] = b"\r\n\r\n";

fn malformed(msg: impl Into<String>) -> ErpError {
    ErpError::MalformedInput(msg.into())
}

fn parse_version(token: &str) -> ErpResult<Version> {
    match token {
        "HTTP/1.1" => Ok(Version::HTTP_11),
        "HTTP/1.0" => Ok(Version::HTTP_10),
        other => Err(malformed(format!("unsupported HTTP version {other:?}"))),
    }
}

fn version_str(version: Version) -> &'static str {
    if version == Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    }
}

/// Split into start line, header lines and body; the body length must match
/// `Content-Length` when present.
fn split_message(bytes: &[u8]) -> ErpResult<(&str, HeaderMap, Vec<u8>)> {
    let end = bytes
        .windows(HEAD_END.len())
        .position(|w| w == HEAD_END)
        .ok_or_else(|| malformed("HTTP message has no end of header"))?;
    let head = std::str::from_utf8(&bytes[..end])
        .map_err(|_| malformed("HTTP header is not UTF-8"))?;
    let body = &bytes[end + HEAD_END.len()..];

    let mut lines = head.split("\r\n");
    let start = lines.next().unwrap_or_default();
    let mut headers = HeaderMap::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| malformed(format!("header line without colon: {line:?}")))?;
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| malformed(format!("invalid header name {name:?}")))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| malformed(format!("invalid value for header {name}")))?;
        headers.append(name, value);
    }

    if let Some(length) = headers.get(CONTENT_LENGTH) {
        let length: usize = length
            .to_str()
            .ok()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| malformed("invalid Content-Length"))?;
        if length != body.len() {
            return Err(malformed(format!(
                "Content-Length {length} but body has {} bytes",
                body.len()
            )));
        }
    }
    Ok((start, headers, body.to_vec()))
}

fn write_head(out: &mut Vec<u8>, start: &str, headers: &HeaderMap, body_len: usize) {
    out.extend_from_slice(start.as_bytes());
    out.extend_from_slice(CRLF);
    for (name, value) in headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(CRLF);
    }
    if body_len > 0 && !headers.contains_key(CONTENT_LENGTH) {
        out.extend_from_slice(format!("content-length: {body_len}").as_bytes());
        out.extend_from_slice(CRLF);
    }
    out.extend_from_slice(CRLF);
}

pub fn parse_request(bytes: &[u8]) -> ErpResult<Request<Vec<u8>>> {
    let (start, headers, body) = split_message(bytes)?;
    let mut parts = start.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(malformed(format!("bad request line {start:?}")));
    };
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| malformed(format!("bad method {method:?}")))?;
    let mut request = Request::builder()
        .method(method)
        .uri(target)
        .version(parse_version(version)?)
        .body(body)
        .map_err(|e| malformed(format!("bad request target: {e}")))?;
    *request.headers_mut() = headers;
    Ok(request)
}

pub fn serialize_request(request: &Request<Vec<u8>>) -> Vec<u8> {
    let target = request
        .uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str());
    let start = format!(
        "{} {} {}",
        request.method(),
        target,
        version_str(request.version())
    );
    let mut out = Vec::with_capacity(start.len() + request.body().len() + 64);
    write_head(&mut out, &start, request.headers(), request.body().len());
    out.extend_from_slice(request.body());
    out
}

pub fn parse_response(bytes: &[u8]) -> ErpResult<Response<Vec<u8>>> {
    let (start, headers, body) = split_message(bytes)?;
    let mut parts = start.splitn(3, ' ');
    let (Some(version), Some(status)) = (parts.next(), parts.next()) else {
        return Err(malformed(format!("bad status line {start:?}")));
    };
    let status = StatusCode::from_bytes(status.as_bytes())
        .map_err(|_| malformed(format!("bad status {status:?}")))?;
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.version_mut() = parse_version(version)?;
    *response.headers_mut() = headers;
    Ok(response)
}

pub fn serialize_response(response: &Response<Vec<u8>>) -> Vec<u8> {
    let status = response.status();
    let start = format!(
        "{} {} {}",
        version_str(response.version()),
        status.as_str(),
        status.canonical_reason().unwrap_or("")
    );
    let mut out = Vec::with_capacity(start.len() + response.body().len() + 64);
    write_head(&mut out, &start, response.headers(), response.body().len());
    out.extend_from_slice(response.body());
    out
}
