//! Picks the rule that answers a request.
//!
//! Rules are tried in the order the server lists them and the first one that
//! fully matches wins. There is no scoring: a broad rule listed before a
//! narrow one shadows it.

use crate::model::{BodyMatcher, RequestRule};
use crate::request::IncomingRequest;
use std::sync::Arc;

/// First rule matching `request` on `path`, or `None` for the default response.
///
/// `path` is the request path with the server's base path already removed.
pub fn match_request<'a>(
    request: &IncomingRequest,
    path: &str,
    rules: &'a [Arc<RequestRule>],
) -> Option<&'a RequestRule> {
    rules
        .iter()
        .map(Arc::as_ref)
        .find(|rule| matches_rule(rule, request, path))
}

fn matches_rule(rule: &RequestRule, request: &IncomingRequest, path: &str) -> bool {
    if !rule
        .method
        .as_str()
        .eq_ignore_ascii_case(request.method.as_str())
    {
        return false;
    }

    if rule.mapping != path {
        return false;
    }

    // Extra request parameters are ignored.
    let query_ok = rule
        .query
        .iter()
        .all(|(key, expected)| request.query_values(key).any(|value| value == expected));
    if !query_ok {
        return false;
    }

    matches_body(&rule.body, &request.body)
}

fn matches_body(matcher: &BodyMatcher, body: &[u8]) -> bool {
    match matcher {
        BodyMatcher::Any => true,
        BodyMatcher::Bytes(expected) => expected.as_ref() == body,
        BodyMatcher::Text { text, encoding } => encoding
            .decode_without_bom_handling_and_without_replacement(body)
            .is_some_and(|decoded| decoded == text.as_str()),
    }
}
