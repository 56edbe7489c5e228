//! Request validation.
//!
//! An [`ExecutionRequest`] is whatever the caller sent. The only way into the
//! pipeline is [`NormalizedConfiguration::from_request`], which rejects bad
//! commands, shell metacharacters in options and missing code, and clamps the
//! timeout into the supported range.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Config;

/// Timeout used when the request does not specify one.
pub const DEFAULT_TIMEOUT_SECONDS: i64 = 60;
/// Lower bound of the effective timeout.
pub const MIN_TIMEOUT_SECONDS: u64 = 30;
/// Upper bound of the effective timeout.
pub const MAX_TIMEOUT_SECONDS: u64 = 600;

/// Substrings rejected in compiler options.
const FORBIDDEN_OPTION_TOKENS: [&str; 8] = [";", "&", "&&", "||", "`", "(", ")", "#"];

/// Raw execution request as submitted by a client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// `swift` (default) or `swiftc`.
    #[serde(default)]
    pub command: Option<String>,
    /// Extra compiler options.
    #[serde(default)]
    pub options: Option<String>,
    /// Source code to run.
    #[serde(default)]
    pub code: Option<String>,
    /// Requested timeout in seconds.
    #[serde(default)]
    pub timeout: Option<i64>,
    /// Whether the toolchain should colorize diagnostics.
    #[serde(default, rename = "_color")]
    pub color: Option<bool>,
    /// Correlation token for log streaming.
    #[serde(default, rename = "_nonce")]
    pub nonce: Option<String>,
}

/// Validation failures. All of these are client errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("unsupported command '{0}', expected 'swift' or 'swiftc'")]
    UnsupportedCommand(String),
    #[error("options contain forbidden sequence '{0}'")]
    ForbiddenOption(&'static str),
    #[error("missing 'code'")]
    MissingCode,
}

/// Toolchain driver to invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Swift,
    Swiftc,
}

impl Command {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Swift => "swift",
            Self::Swiftc => "swiftc",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Command {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "swift" => Ok(Self::Swift),
            "swiftc" => Ok(Self::Swiftc),
            other => Err(RequestError::UnsupportedCommand(other.to_string())),
        }
    }
}

/// Validated job configuration.
#[derive(Debug, Clone)]
pub struct NormalizedConfiguration {
    pub command: Command,
    pub options: String,
    /// Effective timeout in seconds, within `[30, 600]`.
    pub timeout: u64,
    /// Process environment for the launcher, including `_COLOR`.
    pub environment: HashMap<String, String>,
    pub image: String,
    pub code: String,
    /// Correlation token; empty when the caller did not send one.
    pub nonce: String,
}

impl NormalizedConfiguration {
    /// Validate `request` against a toolchain `version`.
    pub fn from_request(
        version: &str,
        request: ExecutionRequest,
        config: &Config,
    ) -> Result<Self, RequestError> {
        let command = request
            .command
            .as_deref()
            .unwrap_or("swift")
            .parse::<Command>()?;

        let options = request
            .options
            .unwrap_or_else(|| default_options(version, config));
        if let Some(token) = FORBIDDEN_OPTION_TOKENS
            .iter()
            .find(|token| options.contains(*token))
        {
            return Err(RequestError::ForbiddenOption(*token));
        }

        let code = request.code.ok_or(RequestError::MissingCode)?;

        let mut environment: HashMap<String, String> = std::env::vars().collect();
        environment.insert(
            "_COLOR".to_string(),
            request.color.unwrap_or(false).to_string(),
        );

        Ok(Self {
            command,
            options,
            timeout: clamp_timeout(request.timeout.unwrap_or(DEFAULT_TIMEOUT_SECONDS)),
            environment,
            image: config.image_for(version),
            code,
            nonce: request.nonce.unwrap_or_default(),
        })
    }

    /// `command options` as passed to the in-container run script.
    pub fn command_line(&self) -> String {
        [self.command.as_str(), self.options.as_str()].join(" ")
    }
}

/// Clamp a requested timeout into `[MIN_TIMEOUT_SECONDS, MAX_TIMEOUT_SECONDS]`.
pub fn clamp_timeout(requested: i64) -> u64 {
    u64::try_from(requested)
        .unwrap_or(0)
        .clamp(MIN_TIMEOUT_SECONDS, MAX_TIMEOUT_SECONDS)
}

fn default_options(version: &str, config: &Config) -> String {
    if compare_versions(version, &config.packages.min_version) == Ordering::Less {
        String::new()
    } else {
        config.packages.options.clone()
    }
}

/// Compare version strings, treating digit runs as numbers.
///
/// `5.10` sorts after `5.9`; non-digit segments compare character-wise, so
/// `nightly-main` sorts after any numeric release.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut a = a.chars().peekable();
    let mut b = b.chars().peekable();

    loop {
        match (a.peek().copied(), b.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let left = take_number(&mut a);
                let right = take_number(&mut b);
                let ordering = left
                    .trim_start_matches('0')
                    .len()
                    .cmp(&right.trim_start_matches('0').len())
                    .then_with(|| {
                        left.trim_start_matches('0')
                            .cmp(right.trim_start_matches('0'))
                    });
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(&y);
                }
                a.next();
                b.next();
            }
        }
    }
}

fn take_number(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut digits = String::new();
    while let Some(c) = chars.next_if(char::is_ascii_digit) {
        digits.push(c);
    }
    digits
}
