//! Caller supplied overrides for the HTTP prober.
//!
//! Recognized query parameters:
//!
//! * `http_valid_status_codes`: comma separated status codes replacing the configured
//!   ones. A class shorthand like `2xx` expands to the range 200-299. Repeated
//!   parameters are combined.
//! * `http_expect_regexp`: the probe fails unless the body matches this pattern.
//! * `http_fail_on_regexp`: the probe fails if the body matches this pattern.
//! * `http_basic_auth_username` / `http_basic_auth_password`: credentials sent with the
//!   probe request.
//!
//! Only one pattern of each kind is supported; the last value wins and an empty value
//! clears the pattern. Patterns are compiled by the prober, so an invalid one fails the
//! probe rather than the request. Any other parameter is ignored.

use thiserror::Error;

use crate::config::{BasicAuth, HttpProbe};

pub const VALID_STATUS_CODES: &str = "http_valid_status_codes";
pub const EXPECT_REGEXP: &str = "http_expect_regexp";
pub const FAIL_ON_REGEXP: &str = "http_fail_on_regexp";
pub const BASIC_AUTH_USERNAME: &str = "http_basic_auth_username";
pub const BASIC_AUTH_PASSWORD: &str = "http_basic_auth_password";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OverrideError {
    #[error("Can not convert status code \"{0}\" to a number")]
    InvalidStatusCode(String),
}

/// Applies every recognized override in `params` to `conf`.
///
/// `params` holds the raw query pairs in request order; keys may repeat.
pub fn apply_http_overrides(
    params: &[(String, String)],
    conf: &mut HttpProbe,
) -> Result<(), OverrideError> {
    let mut status_codes: Option<Vec<u16>> = None;

    for (name, value) in params {
        match name.as_str() {
            VALID_STATUS_CODES => {
                let codes = parse_status_codes(value)?;
                status_codes.get_or_insert_with(Vec::new).extend(codes);
            }
            EXPECT_REGEXP => {
                conf.fail_if_body_not_matches_regexp = single_pattern(value);
            }
            FAIL_ON_REGEXP => {
                conf.fail_if_body_matches_regexp = single_pattern(value);
            }
            BASIC_AUTH_USERNAME => {
                conf.basic_auth
                    .get_or_insert_with(BasicAuth::default)
                    .username = value.clone();
            }
            BASIC_AUTH_PASSWORD => {
                conf.basic_auth
                    .get_or_insert_with(BasicAuth::default)
                    .password = value.clone();
            }
            _ => {}
        }
    }

    if let Some(codes) = status_codes {
        conf.valid_status_codes = codes;
    }
    Ok(())
}

fn single_pattern(value: &str) -> Vec<String> {
    if value.is_empty() {
        Vec::new()
    } else {
        vec![value.to_string()]
    }
}

/// Parses comma separated status codes.
/// Elements are trimmed; blank elements are skipped so an empty value yields an empty list.
pub fn parse_status_codes(codes: &str) -> Result<Vec<u16>, OverrideError> {
    let mut result = Vec::new();
    for code in codes.split(',').map(str::trim).filter(|c| !c.is_empty()) {
        if let Some(class) = status_class(code) {
            result.extend(class);
            continue;
        }
        let parsed = code
            .parse::<u16>()
            .map_err(|_| OverrideError::InvalidStatusCode(code.to_string()))?;
        result.push(parsed);
    }
    Ok(result)
}

/// Expands the `<digit>xx` shorthand, e.g. `4xx` to 400..=499.
fn status_class(code: &str) -> Option<std::ops::RangeInclusive<u16>> {
    match code.as_bytes() {
        [digit @ b'0'..=b'9', b'x', b'x'] => {
            let base = u16::from(digit - b'0') * 100;
            Some(base..=base + 99)
        }
        _ => None,
    }
}
