/* src/transform.rs */

use crate::routing::CompiledRoute;
use axum::http::HeaderMap;
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};

/// Applies the route's header set/remove rules in place.
pub fn apply_headers(route: &CompiledRoute, headers: &mut HeaderMap) {
    for (name, value) in &route.headers_set {
        headers.insert(name.clone(), value.clone());
    }
    for name in &route.headers_remove {
        headers.remove(name);
    }
}

/// Characters escaped in injected query keys and values.
const QUERY_COMPONENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'&')
    .add(b'+')
    .add(b'<')
    .add(b'=')
    .add(b'>')
    .add(b'%');

/// Returns `query` with every injected parameter set, replacing any
/// existing occurrences of the same key. Untouched pairs keep their
/// original encoding.
pub fn inject_query(query: Option<&str>, inject: &[(String, String)]) -> Option<String> {
    if inject.is_empty() {
        return query.map(str::to_owned);
    }

    let mut pairs: Vec<String> = query
        .unwrap_or_default()
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter(|pair| {
            let raw_key = pair.split_once('=').map_or(*pair, |(k, _)| k);
            let key = percent_decode_str(&raw_key.replace('+', " "))
                .decode_utf8_lossy()
                .into_owned();
            !inject.iter().any(|(k, _)| *k == key)
        })
        .map(str::to_owned)
        .collect();

    for (key, value) in inject {
        pairs.push(format!(
            "{}={}",
            utf8_percent_encode(key, QUERY_COMPONENT),
            utf8_percent_encode(value, QUERY_COMPONENT)
        ));
    }
    Some(pairs.join("&"))
}

/// Strips `prefix` from `path` when it applies and keeps the result rooted.
pub fn rewrite_path(path: &str, prefix: Option<&str>) -> String {
    let Some(prefix) = prefix.filter(|p| !p.is_empty()) else {
        return path.to_owned();
    };
    match path.strip_prefix(prefix) {
        Some(rest) if rest.starts_with('/') => rest.to_owned(),
        Some(rest) => format!("/{rest}"),
        None => path.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RouteSpec;
    use axum::http::HeaderValue;
    use std::collections::HashMap;

    #[test]
    fn rewrite_strips_prefix() {
        assert_eq!(rewrite_path("/api/w/items/5", Some("/api/w")), "/items/5");
        assert_eq!(rewrite_path("/api/w", Some("/api/w")), "/");
        assert_eq!(rewrite_path("/api/wx", Some("/api/w")), "/x");
        assert_eq!(rewrite_path("/other", Some("/api/w")), "/other");
        assert_eq!(rewrite_path("/keep", None), "/keep");
    }

    #[test]
    fn query_injection_overwrites() {
        let inject = vec![("tenant".to_owned(), "acme".to_owned())];
        assert_eq!(inject_query(None, &inject).as_deref(), Some("tenant=acme"));
        assert_eq!(
            inject_query(Some("a=1&tenant=evil&tenant=x"), &inject).as_deref(),
            Some("a=1&tenant=acme")
        );
        assert_eq!(inject_query(Some("a=1"), &[]).as_deref(), Some("a=1"));
        assert_eq!(inject_query(None, &[]), None);
        assert_eq!(
            inject_query(Some("q=a%20b&te%6Eant=x"), &inject).as_deref(),
            Some("q=a%20b&tenant=acme")
        );
    }

    #[test]
    fn headers_set_then_remove() {
        let spec = RouteSpec {
            name: "a".into(),
            headers_set: HashMap::from([("X-Env".to_owned(), "prod".to_owned())]),
            headers_remove: vec!["Cookie".into()],
            ..Default::default()
        };
        let route = CompiledRoute::compile(0, &spec).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("x-env", HeaderValue::from_static("dev"));
        headers.insert("cookie", HeaderValue::from_static("session=1"));
        apply_headers(&route, &mut headers);

        assert_eq!(headers.get("x-env").unwrap(), "prod");
        assert!(headers.get("cookie").is_none());
    }
}
