use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

/// The probe module file.
/// Maps a module name (the `module` query parameter) to its probe configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub modules: HashMap<String, Module>,
}

/// A named probe configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Module {
    /// The capability tag: `http`, `tcp`, `dns` or `icmp`.
    /// Unknown tags are accepted here and rejected when the probe is dispatched.
    pub prober: String,

    /// Upper bound for the probe itself. The invocation deadline still applies.
    #[serde(default, deserialize_with = "deserialize_timeout")]
    pub timeout: Option<Duration>,

    #[serde(default)]
    pub http: HttpProbe,

    #[serde(default)]
    pub tcp: TcpProbe,

    #[serde(default)]
    pub dns: DnsProbe,

    #[serde(default)]
    pub icmp: IcmpProbe,
}

/// Options for the HTTP prober.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpProbe {
    /// The accepted HTTP status codes.
    /// Empty means any 2xx status is accepted.
    #[serde(default)]
    pub valid_status_codes: Vec<u16>,

    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// The probe fails if the body matches any of these patterns.
    #[serde(default)]
    pub fail_if_body_matches_regexp: Vec<String>,

    /// The probe fails if the body does not match every one of these patterns.
    #[serde(default)]
    pub fail_if_body_not_matches_regexp: Vec<String>,

    #[serde(default)]
    pub basic_auth: Option<BasicAuth>,

    #[serde(default)]
    pub fail_if_ssl: bool,

    #[serde(default)]
    pub fail_if_not_ssl: bool,
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self {
            valid_status_codes: Vec::new(),
            method: default_method(),
            headers: HashMap::new(),
            fail_if_body_matches_regexp: Vec::new(),
            fail_if_body_not_matches_regexp: Vec::new(),
            basic_auth: None,
            fail_if_ssl: false,
            fail_if_not_ssl: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BasicAuth {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TcpProbe {}

/// Options for the DNS prober.
#[derive(Debug, Clone, Deserialize)]
pub struct DnsProbe {
    /// Name to resolve. Falls back to the probe target when empty.
    #[serde(default)]
    pub query_name: String,

    #[serde(default = "default_query_type")]
    pub query_type: String,

    #[serde(default = "default_rcodes")]
    pub valid_rcodes: Vec<String>,
}

impl Default for DnsProbe {
    fn default() -> Self {
        Self {
            query_name: String::new(),
            query_type: default_query_type(),
            valid_rcodes: default_rcodes(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IcmpProbe {}

fn default_method() -> String {
    "GET".to_string()
}

fn default_query_type() -> String {
    "A".to_string()
}

fn default_rcodes() -> Vec<String> {
    vec!["NOERROR".to_string()]
}

fn deserialize_timeout<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(s) => parse_duration(&s).map(Some).map_err(serde::de::Error::custom),
    }
}

/// Parses durations like `500ms`, `5s`, `1m` or `1.5s`.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    let split = input
        .find(|c: char| c.is_ascii_alphabetic())
        .ok_or_else(|| format!("missing unit in duration \"{input}\""))?;
    let (value, unit) = input.split_at(split);
    let value: f64 = value
        .parse()
        .map_err(|_| format!("invalid duration \"{input}\""))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("invalid duration \"{input}\""));
    }
    let seconds = match unit {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        _ => return Err(format!("unknown unit \"{unit}\" in duration \"{input}\"")),
    };
    Duration::try_from_secs_f64(seconds).map_err(|_| format!("duration \"{input}\" is out of range"))
}
