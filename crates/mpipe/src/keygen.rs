//! Destination key generation
//!
//! A [`KeyGenerator`] maps an admitted part to the key it is stored under.
//! The relay calls it at most once per distinct original file name in a
//! request.

use hyper::{HeaderMap, Uri};

/// Request details available to a [`KeyGenerator`]
#[derive(Debug, Clone, Copy)]
pub struct KeyContext<'a> {
    /// Form field name of the part
    pub field_name: &'a str,
    pub uri: &'a Uri,
    pub headers: &'a HeaderMap,
}

pub trait KeyGenerator: Send + Sync + 'static {
    fn generate(&self, original_name: &str, content_type: &str, cx: &KeyContext<'_>) -> String;
}

impl<F> KeyGenerator for F
where
    F: Fn(&str, &str, &KeyContext<'_>) -> String + Send + Sync + 'static,
{
    fn generate(&self, original_name: &str, content_type: &str, cx: &KeyContext<'_>) -> String {
        (self)(original_name, content_type, cx)
    }
}

/// Uses the original file name unmodified
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityKey;

impl KeyGenerator for IdentityKey {
    fn generate(&self, original_name: &str, _: &str, _: &KeyContext<'_>) -> String {
        original_name.to_owned()
    }
}

/// A random UUID, keeping the original extension when it looks like one
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomKey;

/// Longest extension carried over to a random key
const MAX_EXTENSION_LEN: usize = 16;

impl KeyGenerator for RandomKey {
    fn generate(&self, original_name: &str, _: &str, _: &KeyContext<'_>) -> String {
        let id = uuid::Uuid::new_v4();
        match extension(original_name) {
            Some(ext) => format!("{id}.{ext}"),
            None => id.to_string(),
        }
    }
}

fn extension(name: &str) -> Option<&str> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.len() > MAX_EXTENSION_LEN {
        return None;
    }
    ext.bytes().all(|b| b.is_ascii_alphanumeric()).then_some(ext)
}

/// Prepends a fixed prefix to the key of another generator
#[derive(Debug, Clone)]
pub struct PrefixKey<G> {
    prefix: String,
    inner: G,
}

impl<G: KeyGenerator> PrefixKey<G> {
    #[must_use]
    pub fn new(prefix: impl Into<String>, inner: G) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }
}

impl<G: KeyGenerator> KeyGenerator for PrefixKey<G> {
    fn generate(&self, original_name: &str, content_type: &str, cx: &KeyContext<'_>) -> String {
        let key = self.inner.generate(original_name, content_type, cx);
        format!("{}{key}", self.prefix)
    }
}
