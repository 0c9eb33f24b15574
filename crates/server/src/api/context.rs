// RequestContext extraction from inbound HTTP requests

use axum::http::{header, HeaderMap, Method, Uri};
use serde_json::Value;
use toolgate_core::RequestContext;
use url::form_urlencoded;

pub fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| {
            ct.split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .eq_ignore_ascii_case("application/x-www-form-urlencoded")
        })
        .unwrap_or(false)
}

/// Snapshot of the inbound request for header forwarding. Only the first
/// value of a repeated header, query key or form field is kept.
pub fn request_context(method: &Method, uri: &Uri, headers: &HeaderMap, body: &[u8]) -> RequestContext {
    let mut builder = RequestContext::builder()
        .headers(
            headers
                .iter()
                .filter_map(|(name, value)| Some((name.as_str(), value.to_str().ok()?.to_string()))),
        )
        .query_pairs(
            uri.query()
                .map(|q| form_urlencoded::parse(q.as_bytes()).into_owned().collect::<Vec<_>>())
                .unwrap_or_default(),
        )
        .method(method.as_str())
        .path(uri.path());

    if is_form(headers) {
        builder = builder.form_pairs(form_urlencoded::parse(body).into_owned());
    } else if let Ok(value) = serde_json::from_slice::<Value>(body) {
        builder = builder.body(value);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use serde_json::json;

    #[test]
    fn test_headers_query_and_json_body() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Provider-Data", HeaderValue::from_static(r#"{"apikey":"sk-999"}"#));
        headers.append("x-multi", HeaderValue::from_static("first"));
        headers.append("x-multi", HeaderValue::from_static("second"));
        let uri: Uri = "/mcp?tenant=acme&tenant=other&q=a%20b".parse().unwrap();

        let ctx = request_context(&Method::POST, &uri, &headers, br#"{"method":"ping"}"#);
        assert_eq!(ctx.header("x-provider-data"), Some(r#"{"apikey":"sk-999"}"#));
        assert_eq!(ctx.header("X-Multi"), Some("first"));
        assert_eq!(ctx.query("tenant"), Some("acme"));
        assert_eq!(ctx.query("q"), Some("a b"));
        assert_eq!(ctx.body(), Some(&json!({"method": "ping"})));
        assert_eq!(ctx.method(), "POST");
        assert_eq!(ctx.path(), "/mcp");
    }

    #[test]
    fn test_form_body() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded; charset=utf-8"),
        );
        let uri: Uri = "/mcp".parse().unwrap();
        let ctx = request_context(&Method::POST, &uri, &headers, b"user=ada+l&token=t%3D1");
        assert_eq!(ctx.form("user"), Some("ada l"));
        assert_eq!(ctx.form("token"), Some("t=1"));
        assert!(ctx.body().is_none());
    }
}
