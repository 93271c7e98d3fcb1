//! Admission policy for file parts
//!
//! Decides, per part, whether it is relayed to the sink, and enforces the
//! request-level byte ceiling.

use crate::error::{RelayError, SizeOrigin};
use crate::http::Part;
use crate::keygen::{IdentityKey, KeyGenerator};

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use mime::Mime;

/// Default request-level byte ceiling (128 MiB)
pub const DEFAULT_MAX_TOTAL_BYTES: u64 = 128 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Admit,
    Reject(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The part has an empty file name
    NotAFile,
    /// The declared content type does not match the allow-list
    ContentType,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAFile => f.write_str("empty file name"),
            Self::ContentType => f.write_str("content type not allowed"),
        }
    }
}

/// One `type/subtype` range, either side may be `*`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimeRange {
    type_: String,
    subtype: Option<String>,
}

impl MimeRange {
    fn matches(&self, mime: &Mime) -> bool {
        if self.type_ != "*" && !mime.type_().as_str().eq_ignore_ascii_case(&self.type_) {
            return false;
        }
        match &self.subtype {
            None => true,
            Some(subtype) => mime.subtype().as_str().eq_ignore_ascii_case(subtype),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    #[error("PatternError: InvalidRange: {0:?} is not a `type/subtype` range")]
    InvalidRange(String),
    #[error("PatternError: Regex: {0}")]
    Regex(#[from] regex::Error),
}

/// Allow-list of declared part content types
#[derive(Debug, Clone, Default)]
pub enum ContentTypePattern {
    #[default]
    Any,
    /// Comma-separated MIME ranges such as `image/*, application/pdf`
    Ranges(Vec<MimeRange>),
    /// Regular expression searched in the raw declared value
    Regex(regex::Regex),
}

impl ContentTypePattern {
    /// Builds a pattern matching the raw content type against `pattern`
    ///
    /// # Errors
    /// Returns an error if `pattern` is not a valid regular expression
    pub fn regex(pattern: &str) -> Result<Self, PatternError> {
        Ok(Self::Regex(regex::Regex::new(pattern)?))
    }

    #[must_use]
    pub fn matches(&self, content_type: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Regex(re) => re.is_match(content_type),
            Self::Ranges(ranges) => {
                let Ok(mime) = content_type.parse::<Mime>() else {
                    return false;
                };
                ranges.iter().any(|r| r.matches(&mime))
            }
        }
    }
}

impl FromStr for ContentTypePattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut ranges = Vec::new();
        for item in s.split(',').map(str::trim).filter(|x| !x.is_empty()) {
            if item == "*" || item == "*/*" {
                return Ok(Self::Any);
            }
            let Some((type_, subtype)) = item.split_once('/') else {
                return Err(PatternError::InvalidRange(item.to_owned()));
            };
            let (type_, subtype) = (type_.trim(), subtype.trim());
            if type_.is_empty() || subtype.is_empty() || subtype.contains('/') {
                return Err(PatternError::InvalidRange(item.to_owned()));
            }
            ranges.push(MimeRange {
                type_: type_.to_ascii_lowercase(),
                subtype: (subtype != "*").then(|| subtype.to_ascii_lowercase()),
            });
        }
        if ranges.is_empty() {
            return Ok(Self::Any);
        }
        Ok(Self::Ranges(ranges))
    }
}

/// Per-relay admission settings, fixed at construction
#[derive(Clone)]
pub struct AdmissionPolicy {
    allowed: ContentTypePattern,
    max_total_bytes: Option<u64>,
    key_generator: Arc<dyn KeyGenerator>,
}

impl fmt::Debug for AdmissionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionPolicy")
            .field("allowed", &self.allowed)
            .field("max_total_bytes", &self.max_total_bytes)
            .finish_non_exhaustive()
    }
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            allowed: ContentTypePattern::Any,
            max_total_bytes: Some(DEFAULT_MAX_TOTAL_BYTES),
            key_generator: Arc::new(IdentityKey),
        }
    }
}

impl AdmissionPolicy {
    #[must_use]
    pub fn with_allowed(mut self, allowed: ContentTypePattern) -> Self {
        self.allowed = allowed;
        self
    }

    /// Sets the request-level byte ceiling. `None` disables it.
    #[must_use]
    pub fn with_max_total_bytes(mut self, max_total_bytes: Option<u64>) -> Self {
        self.max_total_bytes = max_total_bytes;
        self
    }

    #[must_use]
    pub fn with_key_generator(mut self, key_generator: impl KeyGenerator) -> Self {
        self.key_generator = Arc::new(key_generator);
        self
    }

    #[must_use]
    pub fn allowed(&self) -> &ContentTypePattern {
        &self.allowed
    }

    #[must_use]
    pub fn max_total_bytes(&self) -> Option<u64> {
        self.max_total_bytes
    }

    #[must_use]
    pub fn key_generator(&self) -> &dyn KeyGenerator {
        &*self.key_generator
    }

    #[must_use]
    pub fn decide(&self, part: &Part) -> Decision {
        self.decide_declared(&part.file_name, &part.content_type)
    }

    fn decide_declared(&self, file_name: &str, content_type: &str) -> Decision {
        if file_name.is_empty() {
            return Decision::Reject(RejectReason::NotAFile);
        }
        if !self.allowed.matches(content_type) {
            return Decision::Reject(RejectReason::ContentType);
        }
        Decision::Admit
    }

    /// Checks the running and declared request size against the ceiling.
    ///
    /// # Errors
    /// Returns [`RelayError::LimitExceeded`] if either exceeds `max_total_bytes`.
    /// The running total is reported when both do.
    pub fn check_size(&self, bytes_received: u64, bytes_expected: Option<u64>) -> Result<(), RelayError> {
        let Some(limit) = self.max_total_bytes else {
            return Ok(());
        };
        if bytes_received > limit {
            return Err(RelayError::LimitExceeded {
                size: bytes_received,
                limit,
                origin: SizeOrigin::Received,
            });
        }
        if let Some(expected) = bytes_expected
            && expected > limit
        {
            return Err(RelayError::LimitExceeded {
                size: expected,
                limit,
                origin: SizeOrigin::Declared,
            });
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("ByteSizeError: invalid byte size {0:?}")]
pub struct ByteSizeError(String);

/// Parses a human byte size such as `128mb`, `10 MB`, `1.5gb` or `4096`.
///
/// Units are 1024-based. A missing unit means bytes.
///
/// # Errors
/// Returns an error if the input is not a number with an optional known unit
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn parse_byte_size(input: &str) -> Result<u64, ByteSizeError> {
    use nom::Parser;
    use nom::branch::alt;
    use nom::bytes::complete::tag_no_case;
    use nom::character::complete::space0;
    use nom::combinator::{all_consuming, opt, value};
    use nom::number::complete::double;
    use nom::sequence::delimited;

    let unit = alt((
        value(1_u64 << 50, tag_no_case("pb")),
        value(1_u64 << 40, tag_no_case("tb")),
        value(1_u64 << 30, tag_no_case("gb")),
        value(1_u64 << 20, tag_no_case("mb")),
        value(1_u64 << 10, tag_no_case("kb")),
        value(1_u64, tag_no_case("b")),
    ));

    let mut parse = all_consuming(delimited(space0, (double, space0, opt(unit)), space0));

    let err = || ByteSizeError(input.to_owned());
    let (_, (number, _, unit)) = parse.parse(input).map_err(|_: nom::Err<nom::error::Error<&str>>| err())?;

    if !number.is_finite() || number < 0.0 {
        return Err(err());
    }

    let bytes = (number * unit.unwrap_or(1) as f64).floor();
    if bytes > u64::MAX as f64 {
        return Err(err());
    }

    Ok(bytes as u64)
}
