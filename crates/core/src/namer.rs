//! DNS-1123 label generation for resources derived from user-provided names.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use xxhash_rust::xxh64::xxh64;

/// Maximum length of a DNS-1123 label.
pub const DNS1123_LABEL_MAX_LENGTH: usize = 63;

/// Length of the `-xxxxxxxx` suffix appended by [`ResourceNamer::unique_label`].
const HASH_SUFFIX_LEN: usize = 9;

static INVALID_DNS1123_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new("[^-a-z0-9]+").expect("static regex"));
static DNS1123_LABEL: Lazy<Regex> = Lazy::new(|| Regex::new("^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static regex"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid DNS-1123 label {label:?}: {}", violations.join(", "))]
pub struct NameError {
    pub label: String,
    pub violations: Vec<String>,
}

/// Check `s` against the DNS-1123 label grammar, reporting every violation.
pub fn is_dns1123_label(s: &str) -> Result<(), NameError> {
    let mut violations = Vec::new();
    if s.len() > DNS1123_LABEL_MAX_LENGTH {
        violations.push(format!("must be no more than {} characters", DNS1123_LABEL_MAX_LENGTH));
    }
    if !DNS1123_LABEL.is_match(s) {
        violations.push(
            "a lowercase RFC 1123 label must consist of lower case alphanumeric characters or '-', \
             and must start and end with an alphanumeric character"
                .to_string(),
        );
    }
    if violations.is_empty() {
        Ok(())
    } else {
        Err(NameError { label: s.to_string(), violations })
    }
}

/// Generates valid names for Kubernetes resources, optionally under a fixed prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceNamer {
    prefix: Option<String>,
}

impl ResourceNamer {
    pub fn new() -> Self { Self::default() }

    /// Every generated name starts with `prefix` followed by a hyphen.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self { prefix: if prefix.is_empty() { None } else { Some(prefix) } }
    }

    pub fn prefix(&self) -> Option<&str> { self.prefix.as_deref() }

    /// Lowercase, collapse invalid runs into `-`, trim hyphens at both ends.
    /// The result is not truncated and may be empty.
    pub fn sanitize(&self, name: &str) -> String {
        let prefixed = match &self.prefix {
            Some(p) => format!("{}-{}", p.trim_end_matches('-'), name),
            None => name.to_string(),
        };
        let lowered = prefixed.to_lowercase();
        INVALID_DNS1123_CHARS.replace_all(&lowered, "-").trim_matches('-').to_string()
    }

    /// Sanitized name hard-truncated to 63 characters.
    pub fn label(&self, name: &str) -> Result<String, NameError> {
        let mut out = self.sanitize(name);
        out.truncate(DNS1123_LABEL_MAX_LENGTH);
        is_dns1123_label(&out)?;
        Ok(out)
    }

    /// Like [`label`](Self::label) but always suffixed with a hash of the raw
    /// input, so names that only differ past the truncation point stay distinct.
    ///
    /// The suffix is the hyphen plus the 8 leading hex digits of the xxHash64
    /// of `name` (prefix excluded), e.g. `long-name-4cfd3574`.
    pub fn unique_label(&self, name: &str) -> Result<String, NameError> {
        let mut suffix = format!("-{:x}", xxh64(name.as_bytes(), 0));
        suffix.truncate(HASH_SUFFIX_LEN);

        let mut out = self.sanitize(name);
        out.truncate(DNS1123_LABEL_MAX_LENGTH - HASH_SUFFIX_LEN);
        out.push_str(&suffix);
        is_dns1123_label(&out)?;
        Ok(out)
    }
}
