//! Origin-scoped cookie jar.
//!
//! Deliberately minimal: a `name -> value` map per origin, updated from
//! every `Set-Cookie` a response carries and consulted when a request is
//! composed. Attributes (`Path`, `Expires`, `Domain`, ...) are parsed off
//! and ignored; a cookie set by `https://a.example:443` is only ever sent
//! back to `https://a.example:443`.

use std::collections::{BTreeMap, HashMap};

use tracing::trace;

use crate::http::url::Origin;

/// Cookie store keyed by origin.
///
/// # Examples
///
/// ```
/// use maker_client::{CookieJar, Url};
///
/// let origin = Url::parse("http://example.com/").unwrap().origin();
/// let mut jar = CookieJar::new();
/// jar.set(origin.clone(), "session", "abc123");
///
/// assert_eq!(jar.get(&origin, "session"), Some("abc123"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct CookieJar {
    store: HashMap<Origin, BTreeMap<String, String>>,
}

impl CookieJar {
    /// Creates an empty jar.
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of cookie `name` scoped to `origin`.
    pub fn get(&self, origin: &Origin, name: &str) -> Option<&str> {
        self.store
            .get(origin)?
            .get(name)
            .map(String::as_str)
    }

    /// Sets a cookie for `origin`, replacing any previous value.
    pub fn set(&mut self, origin: Origin, name: impl Into<String>, value: impl Into<String>) {
        self.store
            .entry(origin)
            .or_default()
            .insert(name.into(), value.into());
    }

    /// Removes one cookie; returns its value if it existed.
    pub fn remove(&mut self, origin: &Origin, name: &str) -> Option<String> {
        self.store.get_mut(origin)?.remove(name)
    }

    /// Drops every cookie in the jar.
    pub fn clear(&mut self) {
        self.store.clear();
    }

    /// All cookies for one origin, name-sorted.
    pub fn cookies_for(&self, origin: &Origin) -> Vec<(String, String)> {
        self.store
            .get(origin)
            .map(|cookies| {
                cookies
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Serializes the `Cookie` header value for a request to `origin`:
    /// `name=value; name2=value2`. `None` when no cookie applies.
    pub(crate) fn cookie_header(&self, origin: &Origin) -> Option<String> {
        let cookies = self.store.get(origin)?;
        if cookies.is_empty() {
            return None;
        }

        let mut header = String::new();
        for (name, value) in cookies {
            if !header.is_empty() {
                header.push_str("; ");
            }
            header.push_str(name);
            header.push('=');
            header.push_str(value);
        }
        Some(header)
    }

    /// Applies every `Set-Cookie` value of a response, scoped to the
    /// response's origin. Attributes after the first `;` are ignored;
    /// unparseable values are skipped.
    pub(crate) fn apply_set_cookie<'a>(
        &mut self,
        origin: &Origin,
        values: impl Iterator<Item = &'a str>,
    ) {
        for raw in values {
            let pair = raw.split(';').next().unwrap_or("");
            let Some((name, value)) = pair.split_once('=') else {
                continue;
            };
            let name = name.trim();
            if name.is_empty() {
                continue;
            }

            trace!(%origin, cookie = name, "cookie stored");
            self.set(origin.clone(), name, value.trim());
        }
    }
}
