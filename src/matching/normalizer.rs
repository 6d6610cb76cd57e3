//! Lookup-key generation for channel identifiers and display names
//!
//! Playlist providers and EPG providers rarely agree on how a channel is
//! spelled. Instead of computing string distances at lookup time, every EPG
//! channel is registered under a fixed set of deterministic variants and every
//! provider channel is looked up with the same variants, in order.

use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

fn whitespace() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("valid whitespace pattern"))
}

fn non_word() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\w]").expect("valid non-word pattern"))
}

fn hd_suffix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)[\s_.\-]*hd$").expect("valid HD suffix pattern"))
}

/// Lowercase, whitespace runs to `_`, then drop anything that is not a word character
pub fn underscore_form(value: &str) -> String {
    let lowered = value.to_lowercase();
    let underscored = whitespace().replace_all(lowered.trim(), "_");
    non_word().replace_all(&underscored, "").into_owned()
}

/// Lowercase with all whitespace removed
pub fn compact_form(value: &str) -> String {
    whitespace().replace_all(&value.to_lowercase(), "").into_owned()
}

/// The value without a trailing "HD" marker (and the separator before it).
///
/// Returns `None` when there is no such suffix or nothing would remain.
pub fn strip_hd_suffix(value: &str) -> Option<&str> {
    let found = hd_suffix().find(value)?;
    let stripped = value[..found.start()].trim_end();
    (!stripped.is_empty()).then_some(stripped)
}

/// Ordered, de-duplicated key list
#[derive(Debug, Default)]
struct KeyList {
    keys: Vec<String>,
    seen: HashSet<String>,
}

impl KeyList {
    fn push(&mut self, key: impl Into<String>) {
        let key = key.into();
        if key.is_empty() || self.seen.contains(&key) {
            return;
        }
        self.seen.insert(key.clone());
        self.keys.push(key);
    }

    fn into_vec(self) -> Vec<String> {
        self.keys
    }
}

fn push_identifier_keys(list: &mut KeyList, identifier: &str) {
    list.push(identifier);
    list.push(identifier.to_lowercase());
    list.push(underscore_form(identifier));

    if let Some(stripped) = strip_hd_suffix(identifier) {
        list.push(stripped);
        list.push(stripped.to_lowercase());
        list.push(underscore_form(stripped));
    }
}

fn push_display_name_keys(list: &mut KeyList, name: &str) {
    list.push(name);
    list.push(name.to_lowercase());
    list.push(underscore_form(name));
    list.push(compact_form(name));

    if let Some(stripped) = strip_hd_suffix(name) {
        list.push(stripped.to_lowercase());
    }
}

/// Keys derived from a channel identifier: verbatim, lowercase, underscore
/// form, then the same three without an HD suffix.
pub fn normalize(identifier: &str) -> Vec<String> {
    let mut list = KeyList::default();
    push_identifier_keys(&mut list, identifier);
    list.into_vec()
}

/// Keys derived from a display-name alias: verbatim, lowercase, underscore
/// form, whitespace-free form and the lowercase name without an HD suffix.
pub fn display_name_keys(name: &str) -> Vec<String> {
    let mut list = KeyList::default();
    push_display_name_keys(&mut list, name);
    list.into_vec()
}

/// Full lookup order for a channel: every identifier's keys first, then every
/// display name's keys.
pub fn lookup_keys<'a, I, N>(identifiers: I, names: N) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
    N: IntoIterator<Item = &'a str>,
{
    let mut list = KeyList::default();
    for identifier in identifiers {
        push_identifier_keys(&mut list, identifier);
    }
    for name in names {
        push_display_name_keys(&mut list, name);
    }
    list.into_vec()
}
