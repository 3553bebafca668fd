use rand::Rng;
use rand::distr::Alphanumeric;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use url::Url;

use crate::config::CookieOptions;

pub(crate) const MAX_RETURN_TO_LEN: usize = 2048;
pub(crate) const MAX_COOKIE_BYTES: usize = 4000;

pub(crate) fn cookie_value<'a>(cookie_header: Option<&'a str>, cookie_name: &str) -> Option<&'a str> {
    cookie_header.and_then(|cookie_header| {
        cookie_header.split(';').find_map(|part| {
            let (name, value) = part.trim().split_once('=')?;
            if name == cookie_name && !value.is_empty() {
                Some(value)
            } else {
                None
            }
        })
    })
}

pub(crate) fn query_param(url_or_path: &str, key: &str) -> Option<String> {
    let parsed = parse_url_or_path(url_or_path)?;
    parsed
        .query_pairs()
        .find_map(|(k, v)| if k == key { Some(v.to_string()) } else { None })
}

/// Path component of an absolute URL or an origin-form request target.
pub(crate) fn request_path(url_or_path: &str) -> String {
    parse_url_or_path(url_or_path)
        .map(|url| url.path().to_string())
        .unwrap_or_else(|| "/".to_string())
}

fn parse_url_or_path(url_or_path: &str) -> Option<Url> {
    if let Ok(url) = Url::parse(url_or_path) {
        return Some(url);
    }

    let normalized = if url_or_path.starts_with('/') {
        format!("http://localhost{url_or_path}")
    } else {
        format!("http://localhost/{url_or_path}")
    };

    Url::parse(&normalized).ok()
}

pub(crate) fn derive_return_to(current_request_url: &str) -> String {
    let without_fragment = current_request_url
        .split_once('#')
        .map(|(head, _)| head)
        .unwrap_or(current_request_url);

    let candidate = if let Ok(url) = Url::parse(without_fragment) {
        let mut value = url.path().to_string();
        if let Some(query) = url.query() {
            value.push('?');
            value.push_str(query);
        }
        value
    } else {
        without_fragment.to_string()
    };

    validate_return_to(&candidate)
}

pub(crate) fn validate_return_to(input: &str) -> String {
    let no_fragment = input
        .split_once('#')
        .map(|(head, _)| head)
        .unwrap_or(input)
        .trim();

    if no_fragment.is_empty() {
        return "/".to_string();
    }

    if !no_fragment.starts_with('/') || no_fragment.starts_with("//") || no_fragment.contains('\\') {
        return "/".to_string();
    }

    if no_fragment.contains("://") || no_fragment.len() > MAX_RETURN_TO_LEN {
        return "/".to_string();
    }

    no_fragment.to_string()
}

pub(crate) fn random_token(len: usize) -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub(crate) fn build_set_cookie(
    name: &str,
    value: &str,
    max_age_secs: u64,
    options: &CookieOptions,
) -> String {
    let mut out = format!("{name}={value}; Path={}", options.path);
    if let Some(domain) = options.domain.as_deref() {
        out.push_str("; Domain=");
        out.push_str(domain);
    }
    if options.http_only {
        out.push_str("; HttpOnly");
    }
    out.push_str("; SameSite=");
    out.push_str(options.same_site.as_str());
    out.push_str(&format!("; Max-Age={max_age_secs}"));
    if options.secure {
        out.push_str("; Secure");
    }
    out
}

/// Expires `name` with the same scope attributes it was issued with.
pub(crate) fn build_delete_cookie(name: &str, options: &CookieOptions) -> String {
    build_set_cookie(name, "", 0, options)
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}
