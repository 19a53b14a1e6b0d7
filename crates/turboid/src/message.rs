//! OpenID messages
//!
//! A [`ParameterSet`] is one protocol message. Keys are stored without the
//! `openid.` prefix (`mode`, `assoc_handle`, `sreg.email`, ...); the prefix is
//! added when the message is put on the wire as a query string or form body,
//! and is absent in key-value form, which providers use for direct responses.

use std::collections::BTreeMap;
use std::fmt;

use url::Url;

use crate::error::{OpenIdError, Result, TransportError};

/// Prefix of every OpenID field in indirect (query/form) encoding.
pub const OPENID_PREFIX: &str = "openid.";

/// Fields whose values are key material and must never be printed.
const SENSITIVE_FIELDS: &[&str] = &["mac_key", "enc_mac_key", "sig"];

/// One OpenID message.
///
/// Iteration order is the sorted key order, which keeps encoded output stable.
/// Signing never depends on it: signed fields are enumerated explicitly by
/// `openid.signed`.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ParameterSet {
    fields: BTreeMap<String, String>,
}

impl ParameterSet {
    /// Create an empty message.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a field by its unprefixed name.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Look up a field that must be present and non-empty.
    ///
    /// # Errors
    ///
    /// Returns [`OpenIdError::MissingParameter`] naming the wire key.
    pub fn require(&self, key: &str) -> Result<&str> {
        match self.get(key) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(OpenIdError::MissingParameter(format!(
                "{OPENID_PREFIX}{key}"
            ))),
        }
    }

    /// Set a field, returning the previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.fields.insert(key.into(), value.into())
    }

    /// Builder-style [`ParameterSet::set`].
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Remove a field.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.fields.remove(key)
    }

    /// Whether a field is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the message has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate over `(key, value)` pairs with unprefixed keys.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Build a message from wire pairs, keeping only `openid.`-prefixed keys.
    ///
    /// Anything else (the host application's own query parameters) is dropped.
    pub fn from_wire_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let fields = pairs
            .into_iter()
            .filter_map(|(key, value)| {
                key.as_ref()
                    .strip_prefix(OPENID_PREFIX)
                    .map(|k| (k.to_string(), value.into()))
            })
            .collect();
        Self { fields }
    }

    /// Parse an `application/x-www-form-urlencoded` query string.
    #[must_use]
    pub fn from_query(query: &str) -> Self {
        let query = query.strip_prefix('?').unwrap_or(query);
        Self::from_wire_pairs(url::form_urlencoded::parse(query.as_bytes()).into_owned())
    }

    /// Wire pairs with the `openid.` prefix restored.
    #[must_use]
    pub fn to_wire_pairs(&self) -> Vec<(String, String)> {
        self.fields
            .iter()
            .map(|(k, v)| (format!("{OPENID_PREFIX}{k}"), v.clone()))
            .collect()
    }

    /// Encode as a form body / query string.
    #[must_use]
    pub fn to_form_urlencoded(&self) -> String {
        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.to_wire_pairs())
            .finish()
    }

    /// Append the message to `base` as query parameters.
    ///
    /// Query parameters already present on `base` are kept, which OpenID
    /// requires for provider endpoints that carry their own query.
    ///
    /// # Errors
    ///
    /// Returns [`OpenIdError::MissingParameter`] if `base` is not an absolute URL.
    pub fn append_to_url(&self, base: &str) -> Result<String> {
        let mut url = Url::parse(base)
            .map_err(|e| OpenIdError::MissingParameter(format!("endpoint URL {base}: {e}")))?;
        url.query_pairs_mut().extend_pairs(self.to_wire_pairs());
        Ok(url.into())
    }

    /// Encode in key-value form (`key:value\n`, no prefix).
    #[must_use]
    pub fn to_kv_form(&self) -> String {
        self.fields
            .iter()
            .fold(String::new(), |mut out, (k, v)| {
                out.push_str(k);
                out.push(':');
                out.push_str(v);
                out.push('\n');
                out
            })
    }

    /// Decode a key-value form body.
    ///
    /// Blank lines are ignored; a trailing `\r` is tolerated.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::MalformedResponse`] for a line without `:`.
    pub fn from_kv_form(body: &str) -> std::result::Result<Self, TransportError> {
        let mut fields = BTreeMap::new();
        for (lineno, line) in body.lines().enumerate() {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.trim().is_empty() {
                continue;
            }
            let (key, value) = line.split_once(':').ok_or_else(|| {
                TransportError::MalformedResponse(format!(
                    "key-value form line {} has no ':' separator",
                    lineno + 1
                ))
            })?;
            fields.insert(key.trim().to_string(), value.trim().to_string());
        }
        Ok(Self { fields })
    }

    /// Split `openid.signed` into field names.
    #[must_use]
    pub fn signed_fields(&self) -> Vec<&str> {
        self.get("signed")
            .map(|list| list.split(',').map(str::trim).filter(|f| !f.is_empty()).collect())
            .unwrap_or_default()
    }
}

// Manual Debug impl to keep key material out of logs
impl fmt::Debug for ParameterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (k, v) in &self.fields {
            if SENSITIVE_FIELDS.contains(&k.as_str()) {
                map.entry(k, &"[REDACTED]");
            } else {
                map.entry(k, v);
            }
        }
        map.finish()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ParameterSet {
    /// Collect unprefixed pairs.
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            fields: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}
