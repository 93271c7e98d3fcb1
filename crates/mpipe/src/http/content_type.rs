//! Content-Type handling for inbound requests

use hyper::HeaderMap;
use hyper::header::CONTENT_TYPE;
use mime::Mime;

/// Longest boundary allowed by RFC 2046
const MAX_BOUNDARY_LEN: usize = 70;

/// Error type for Content-Type parsing failures
#[derive(Debug, thiserror::Error)]
pub enum ContentTypeError {
    /// The Content-Type header value is not valid UTF-8
    #[error("Content-Type header contains invalid UTF-8 characters")]
    InvalidUtf8,

    /// The Content-Type header value has an invalid format
    #[error("Content-Type header has invalid format: {reason}")]
    InvalidFormat { reason: String },

    /// The Content-Type header value is missing required components
    #[error("Content-Type header is missing {component}")]
    MissingComponent { component: String },

    /// The request is not `multipart/form-data`
    #[error("Content-Type {found:?} is not multipart/form-data")]
    NotMultipart { found: String },
}

/// Extracts the multipart boundary from request headers.
///
/// # Errors
/// Returns an error if the Content-Type header is missing, malformed, not
/// `multipart/form-data`, or carries no usable `boundary` parameter.
pub fn extract_boundary(headers: &HeaderMap) -> Result<String, ContentTypeError> {
    let Some(value) = headers.get(CONTENT_TYPE) else {
        return Err(ContentTypeError::MissingComponent {
            component: "the header itself".to_owned(),
        });
    };
    let value = value.to_str().map_err(|_| ContentTypeError::InvalidUtf8)?;

    let mime = value.parse::<Mime>().map_err(|err| ContentTypeError::InvalidFormat {
        reason: format!("{err}. {}", get_detailed_error_message(value)),
    })?;

    if !is_multipart_form_data(&mime) {
        return Err(ContentTypeError::NotMultipart { found: value.to_owned() });
    }

    let Some(boundary) = mime.get_param(mime::BOUNDARY) else {
        return Err(ContentTypeError::MissingComponent {
            component: "the boundary parameter".to_owned(),
        });
    };
    let boundary = boundary.as_str();
    if boundary.is_empty() || boundary.len() > MAX_BOUNDARY_LEN {
        return Err(ContentTypeError::InvalidFormat {
            reason: format!("boundary length {} is outside 1..={MAX_BOUNDARY_LEN}", boundary.len()),
        });
    }
    Ok(boundary.to_owned())
}

/// Get a detailed error message explaining what might be wrong with the Content-Type
fn get_detailed_error_message(content_type_str: &str) -> String {
    let mut hints = Vec::new();

    if content_type_str.contains(' ') && !content_type_str.contains(';') {
        hints.push("contains spaces without semicolon separator");
    }

    if content_type_str.starts_with('/') || content_type_str.ends_with('/') {
        hints.push("missing type or subtype");
    }

    let essence = content_type_str.split(';').next().unwrap_or_default();
    if essence.split('/').count() != 2 {
        hints.push("should be in format 'type/subtype' (e.g., 'multipart/form-data')");
    }

    if content_type_str.contains(";;") {
        hints.push("contains double semicolons");
    }

    if content_type_str.contains("=;") || content_type_str.contains(";=") {
        hints.push("has malformed parameter syntax");
    }

    match hints.as_slice() {
        [] => "Content-Type must be 'multipart/form-data; boundary=...'".to_owned(),
        [hint] => format!("Content-Type {hint}"),
        _ => format!("Content-Type issues: {}", hints.join("; ")),
    }
}

/// Check if a MIME type is multipart/form-data
#[inline]
fn is_multipart_form_data(mime: &Mime) -> bool {
    mime.type_() == mime::MULTIPART && mime.subtype() == mime::FORM_DATA
}
