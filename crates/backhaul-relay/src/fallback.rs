//! The 502 page served when a domain has no usable backend

use bytes::Bytes;
use http::{header, HeaderValue, Response, StatusCode};
use http_body_util::Full;

const TEMPLATE: &str = "<html><head><title>no backends connected</title></head><body>\
<h1>no backends connected</h1>\
<p>Please ensure a backend is running for ${HOST}. This is request ID ${REQ_ID}.</p>\
</body></html>";

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Render the page body for `host` and `request_id`
pub fn render(host: &str, request_id: &str) -> String {
    TEMPLATE
        .replace("${HOST}", &escape_html(host))
        .replace("${REQ_ID}", &escape_html(request_id))
}

/// Build the 502 response
pub fn response(host: &str, request_id: &str) -> Response<Full<Bytes>> {
    let body = render(host, request_id);
    let mut response = Response::new(Full::new(Bytes::from(body.clone())));
    *response.status_mut() = StatusCode::BAD_GATEWAY;

    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    response
}
