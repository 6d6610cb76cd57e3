use std::collections::HashMap;

use super::normalizer::{display_name_keys, lookup_keys, normalize};
use crate::models::{Channel, ChannelRecord, EpgChannel};

/// Where a registered key came from. Identifier keys outrank display-name keys
/// when two definitions produce the same variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum KeyOrigin {
    DisplayName,
    Identifier,
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    position: usize,
    origin: KeyOrigin,
}

/// Anything that can be matched against the EPG index
pub trait ChannelIdentity {
    /// Identifiers to try, most specific first
    fn identifiers(&self) -> Vec<&str>;
    fn display_name(&self) -> &str;
}

impl ChannelIdentity for ChannelRecord {
    fn identifiers(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.epg_hint.iter().map(String::as_str).collect();
        if !ids.contains(&self.channel_id.as_str()) {
            ids.push(&self.channel_id);
        }
        ids
    }

    fn display_name(&self) -> &str {
        &self.name
    }
}

impl ChannelIdentity for Channel {
    fn identifiers(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.epg_hint.iter().map(String::as_str).collect();
        if !ids.contains(&self.channel_id.as_str()) {
            ids.push(&self.channel_id);
        }
        ids
    }

    fn display_name(&self) -> &str {
        &self.name
    }
}

/// Normalized key -> EPG channel definition
#[derive(Debug, Clone, Default)]
pub struct MatchingIndex {
    definitions: Vec<EpgChannel>,
    keys: HashMap<String, IndexEntry>,
}

impl MatchingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(channels: usize) -> Self {
        Self {
            definitions: Vec::with_capacity(channels),
            // each definition registers a handful of variants
            keys: HashMap::with_capacity(channels * 4),
        }
    }

    pub fn from_channels(channels: impl IntoIterator<Item = EpgChannel>) -> Self {
        let mut index = Self::new();
        for channel in channels {
            index.insert(channel);
        }
        index
    }

    /// Register a definition under all of its key variants.
    ///
    /// Definitions without an id are ignored. Returns whether the definition
    /// was registered.
    pub fn insert(&mut self, channel: EpgChannel) -> bool {
        if channel.id.trim().is_empty() {
            return false;
        }

        let position = self.definitions.len();
        for key in normalize(&channel.id) {
            self.register(key, position, KeyOrigin::Identifier);
        }
        for alias in &channel.display_names {
            for key in display_name_keys(alias) {
                self.register(key, position, KeyOrigin::DisplayName);
            }
        }
        self.definitions.push(channel);
        true
    }

    fn register(&mut self, key: String, position: usize, origin: KeyOrigin) {
        match self.keys.get(&key) {
            // first registration wins within the same origin tier
            Some(existing) if existing.origin >= origin => {}
            _ => {
                self.keys.insert(key, IndexEntry { position, origin });
            }
        }
    }

    /// Exact lookup of a single, already-normalized key
    pub fn get(&self, key: &str) -> Option<&EpgChannel> {
        self.keys
            .get(key)
            .map(|entry| &self.definitions[entry.position])
    }

    /// Try the channel's identifier keys, then its display-name keys, and
    /// return the first definition hit. `None` is a normal "unmatched" result.
    pub fn lookup<C: ChannelIdentity + ?Sized>(&self, channel: &C) -> Option<&EpgChannel> {
        let keys = lookup_keys(channel.identifiers(), [channel.display_name()]);
        keys.iter().find_map(|key| self.get(key))
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epg(id: &str, names: &[&str]) -> EpgChannel {
        EpgChannel {
            id: id.to_string(),
            display_names: names.iter().map(|n| n.to_string()).collect(),
            ..Default::default()
        }
    }

    fn record(id: &str, hint: Option<&str>, name: &str) -> ChannelRecord {
        ChannelRecord {
            channel_id: id.to_string(),
            name: name.to_string(),
            logo: None,
            group: "Sports".to_string(),
            stream_url: format!("http://provider.example/live/{id}"),
            epg_hint: hint.map(str::to_string),
            epg_channel_id: None,
            categories: vec![],
        }
    }

    #[test]
    fn test_hd_identifier_resolves_all_variants() {
        let index = MatchingIndex::from_channels([epg("ESPN_HD", &[])]);

        for key in ["ESPN_HD", "espn_hd", "espn"] {
            let found = index.get(key).unwrap_or_else(|| panic!("no match for {key}"));
            assert_eq!(found.id, "ESPN_HD");
        }
    }

    #[test]
    fn test_display_name_aliases_are_registered() {
        let index = MatchingIndex::from_channels([epg("bbc1.uk", &["BBC One HD", "BBC 1"])]);

        for key in ["BBC One HD", "bbc one hd", "bbc_one_hd", "bbconehd", "bbc one", "bbc1"] {
            assert_eq!(index.get(key).map(|c| c.id.as_str()), Some("bbc1.uk"), "{key}");
        }
    }

    #[test]
    fn test_identifier_keys_outrank_alias_keys() {
        // "cnn" is an alias variant of the first definition and the id of the second
        let index = MatchingIndex::from_channels([
            epg("cnn.international", &["CNN"]),
            epg("cnn", &["CNN USA"]),
        ]);
        assert_eq!(index.get("cnn").map(|c| c.id.as_str()), Some("cnn"));
        assert_eq!(index.get("CNN").map(|c| c.id.as_str()), Some("cnn.international"));
    }

    #[test]
    fn test_first_definition_keeps_shared_alias() {
        let index = MatchingIndex::from_channels([
            epg("news.one", &["News"]),
            epg("news.two", &["News"]),
        ]);
        assert_eq!(index.get("news").map(|c| c.id.as_str()), Some("news.one"));
    }

    #[test]
    fn test_lookup_prefers_identifier_over_name_collision() {
        let index = MatchingIndex::from_channels([
            epg("discovery.us", &["Sky News"]),
            epg("skynews.uk", &["Sky News UK"]),
        ]);

        // tvg-id points at skynews while the display name collides with discovery's alias
        let channel = record("1001", Some("skynews.uk"), "Sky News");
        assert_eq!(index.lookup(&channel).map(|c| c.id.as_str()), Some("skynews.uk"));

        let channel = record("1002", None, "Sky News");
        assert_eq!(index.lookup(&channel).map(|c| c.id.as_str()), Some("discovery.us"));
    }

    #[test]
    fn test_lookup_matches_hd_variant_of_playlist_name() {
        let index = MatchingIndex::from_channels([epg("espn.us", &["ESPN"])]);
        let channel = record("77", None, "ESPN HD");
        assert_eq!(index.lookup(&channel).map(|c| c.id.as_str()), Some("espn.us"));
    }

    #[test]
    fn test_unmatched_channel_is_none() {
        let index = MatchingIndex::from_channels([epg("espn.us", &["ESPN"])]);
        assert!(index.lookup(&record("5", None, "Cartoon Network")).is_none());
    }

    #[test]
    fn test_definitions_without_id_are_skipped() {
        let mut index = MatchingIndex::new();
        assert!(!index.insert(epg("  ", &["Orphan"])));
        assert!(index.is_empty());
        assert!(index.get("orphan").is_none());
    }
}
