use std::collections::HashMap;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::errors::{SourceError, SourceResult};
use crate::models::{ChannelRecord, DEFAULT_CHANNEL_NAME, DEFAULT_GROUP};

const EXTINF: &str = "#EXTINF:";
const EXTGRP: &str = "#EXTGRP:";

/// Metadata collected from an `#EXTINF` line until its stream URL shows up
#[derive(Debug, Default)]
struct PendingEntry {
    title: Option<String>,
    attributes: HashMap<String, String>,
    extgrp: Option<String>,
    line_number: usize,
}

/// Parses extended M3U playlists into channel records
#[derive(Debug, Default, Clone, Copy)]
pub struct M3uParser;

impl M3uParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse playlist text into channel records, in playlist order.
    ///
    /// A playlist without any `#EXTINF` entry, or one that yields no channel,
    /// is an error: providers never legitimately serve zero channels.
    pub fn parse(&self, content: &str) -> SourceResult<Vec<ChannelRecord>> {
        if !content.contains(EXTINF) {
            return Err(SourceError::parse_error(
                "m3u",
                "playlist contains no #EXTINF entries",
            ));
        }

        let mut channels = Vec::new();
        let mut pending: Option<PendingEntry> = None;

        for (index, raw_line) in content.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(extinf) = line.strip_prefix(EXTINF) {
                if let Some(previous) = pending.take() {
                    warn!(
                        "EXTINF entry at line {} has no stream URL, skipping",
                        previous.line_number
                    );
                }
                pending = Some(self.parse_extinf(extinf, index + 1));
            } else if let Some(group) = line.strip_prefix(EXTGRP) {
                if let Some(entry) = pending.as_mut() {
                    entry.extgrp = Some(group.trim().to_string()).filter(|g| !g.is_empty());
                }
            } else if line.starts_with('#') {
                // other directives (#EXTM3U, #EXTVLCOPT, ...) carry nothing we keep
                continue;
            } else if let Some(entry) = pending.take() {
                channels.push(self.complete_entry(entry, line));
            } else {
                debug!("Stream URL without EXTINF metadata at line {}, skipping", index + 1);
            }
        }

        if channels.is_empty() {
            return Err(SourceError::parse_error(
                "m3u",
                "playlist yielded zero channels",
            ));
        }

        info!("Parsed {} channels from playlist", channels.len());
        Ok(channels)
    }

    fn parse_extinf(&self, extinf: &str, line_number: usize) -> PendingEntry {
        let (attributes_part, title) = split_extinf(extinf);
        PendingEntry {
            title: title
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
            attributes: parse_attributes(attributes_part),
            extgrp: None,
            line_number,
        }
    }

    fn complete_entry(&self, mut entry: PendingEntry, url: &str) -> ChannelRecord {
        let tvg_id = take_non_empty(&mut entry.attributes, "tvg-id");
        let tvg_name = take_non_empty(&mut entry.attributes, "tvg-name");
        let logo = take_non_empty(&mut entry.attributes, "tvg-logo");
        let group_title = take_non_empty(&mut entry.attributes, "group-title").or(entry.extgrp);

        let channel_id = tvg_id
            .clone()
            .or_else(|| id_from_stream_url(url))
            .unwrap_or_else(fallback_channel_id);

        let name = entry
            .title
            .or(tvg_name)
            .unwrap_or_else(|| DEFAULT_CHANNEL_NAME.to_string());

        let categories = split_categories(group_title.as_deref());
        let group = categories
            .first()
            .cloned()
            .unwrap_or_else(|| DEFAULT_GROUP.to_string());

        ChannelRecord {
            channel_id,
            name,
            logo,
            group: group.clone(),
            stream_url: url.to_string(),
            epg_hint: tvg_id,
            epg_channel_id: None,
            categories: if categories.is_empty() {
                vec![group]
            } else {
                categories
            },
        }
    }
}

fn take_non_empty(attributes: &mut HashMap<String, String>, key: &str) -> Option<String> {
    attributes
        .remove(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Split `-1 tvg-id="a,b" group-title="x",Title` at the first comma outside quotes
fn split_extinf(extinf: &str) -> (&str, Option<&str>) {
    let mut in_quotes = false;
    for (pos, ch) in extinf.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => return (&extinf[..pos], Some(&extinf[pos + 1..])),
            _ => {}
        }
    }
    (extinf, None)
}

/// Parse `key="value"` pairs; the leading duration token has no `=` and is dropped
fn parse_attributes(attributes: &str) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    let mut current_key = String::new();
    let mut current_value = String::new();
    let mut in_quotes = false;
    let mut in_value = false;

    let mut flush = |key: &mut String, value: &mut String| {
        let k = key.trim().to_ascii_lowercase();
        if !k.is_empty() {
            attrs.insert(k, value.clone());
        }
        key.clear();
        value.clear();
    };

    for ch in attributes.chars() {
        match ch {
            '"' if in_value => {
                in_quotes = !in_quotes;
                if !in_quotes {
                    flush(&mut current_key, &mut current_value);
                    in_value = false;
                }
            }
            '=' if !in_quotes && !in_value => in_value = true,
            ' ' | '\t' if !in_quotes => {
                if in_value && !current_value.is_empty() {
                    flush(&mut current_key, &mut current_value);
                    in_value = false;
                } else if !in_value {
                    current_key.clear();
                }
            }
            _ if in_value => current_value.push(ch),
            _ => current_key.push(ch),
        }
    }

    if in_value && !current_value.is_empty() {
        flush(&mut current_key, &mut current_value);
    }

    attrs
}

/// Last non-empty path segment of the stream URL, without query or fragment.
/// A URL with no path yields `None`.
fn id_from_stream_url(stream_url: &str) -> Option<String> {
    match Url::parse(stream_url) {
        Ok(parsed) => last_segment(parsed.path_segments()?),
        // relative entries have no host to confuse with a path
        Err(_) => {
            let path = stream_url.split(['?', '#']).next().unwrap_or(stream_url);
            last_segment(path.split('/'))
        }
    }
}

fn last_segment<'a>(segments: impl DoubleEndedIterator<Item = &'a str>) -> Option<String> {
    segments
        .map(str::trim)
        .rfind(|segment| !segment.is_empty())
        .map(str::to_string)
}

fn fallback_channel_id() -> String {
    format!("ch_{}", &Uuid::new_v4().simple().to_string()[..12])
}

/// `group-title` may list several labels separated by `;`
fn split_categories(group_title: Option<&str>) -> Vec<String> {
    group_title
        .map(|g| {
            g.split(';')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAYLIST: &str = r#"#EXTM3U
#EXTINF:-1 tvg-id="espn.us" tvg-name="ESPN" tvg-logo="http://logos.example/espn.png" group-title="Sports",ESPN HD
http://provider.example/live/u/p/1001.ts
#EXTINF:-1 tvg-logo="http://logos.example/x.png",Channel X
http://provider.example/streams/42
#EXTINF:-1 tvg-id="news.one" group-title="News;Local",News One
http://provider.example/live/u/p/1003.ts
"#;

    #[test]
    fn test_parses_entries_in_order() {
        let channels = M3uParser::new().parse(PLAYLIST).unwrap();
        assert_eq!(channels.len(), 3);

        let espn = &channels[0];
        assert_eq!(espn.channel_id, "espn.us");
        assert_eq!(espn.name, "ESPN HD");
        assert_eq!(espn.group, "Sports");
        assert_eq!(espn.logo.as_deref(), Some("http://logos.example/espn.png"));
        assert_eq!(espn.epg_hint.as_deref(), Some("espn.us"));
        assert_eq!(espn.stream_url, "http://provider.example/live/u/p/1001.ts");
    }

    #[test]
    fn test_missing_id_falls_back_to_url_segment_and_default_group() {
        let channels = M3uParser::new().parse(PLAYLIST).unwrap();
        let x = &channels[1];
        assert_eq!(x.channel_id, "42");
        assert_eq!(x.name, "Channel X");
        assert_eq!(x.group, "Uncategorized");
        assert_eq!(x.categories, vec!["Uncategorized"]);
        assert!(x.epg_hint.is_none());
    }

    #[test]
    fn test_multi_label_group_title() {
        let channels = M3uParser::new().parse(PLAYLIST).unwrap();
        assert_eq!(channels[2].group, "News");
        assert_eq!(channels[2].categories, vec!["News", "Local"]);
    }

    #[test]
    fn test_name_falls_back_to_tvg_name_then_placeholder() {
        let content = "#EXTM3U\n#EXTINF:-1 tvg-name=\"Tag Name\",\nhttp://h/a/1\n#EXTINF:-1,\nhttp://h/a/2\n";
        let channels = M3uParser::new().parse(content).unwrap();
        assert_eq!(channels[0].name, "Tag Name");
        assert_eq!(channels[1].name, DEFAULT_CHANNEL_NAME);
    }

    #[test]
    fn test_generated_id_when_url_has_no_segment() {
        let content = "#EXTM3U\n#EXTINF:-1,Bare\nudp://@239.0.0.1:1234\n";
        let channels = M3uParser::new().parse(content).unwrap();
        assert!(channels[0].channel_id.starts_with("ch_"));
        assert_eq!(channels[0].channel_id.len(), 15);
    }

    #[test]
    fn test_host_only_urls_get_distinct_generated_ids() {
        let content = "#EXTM3U\n#EXTINF:-1,One\nhttp://provider.example\n#EXTINF:-1,Two\nhttp://provider.example/\n";
        let channels = M3uParser::new().parse(content).unwrap();
        assert!(channels.iter().all(|c| c.channel_id.starts_with("ch_")));
        assert_ne!(channels[0].channel_id, channels[1].channel_id);
    }

    #[test]
    fn test_url_segment_ignores_query_and_trailing_slash() {
        assert_eq!(id_from_stream_url("http://h/live/77/?token=abc").as_deref(), Some("77"));
        assert_eq!(id_from_stream_url("streams/42#frag").as_deref(), Some("42"));
    }

    #[test]
    fn test_extgrp_supplies_group() {
        let content = "#EXTM3U\n#EXTINF:-1,Film One\n#EXTGRP:Movies\nhttp://h/vod/9\n";
        let channels = M3uParser::new().parse(content).unwrap();
        assert_eq!(channels[0].group, "Movies");
    }

    #[test]
    fn test_comma_inside_quoted_attribute() {
        let content = "#EXTM3U\n#EXTINF:-1 group-title=\"Kids, Family\" tvg-id=\"k1\",Kids TV\nhttp://h/k\n";
        let channels = M3uParser::new().parse(content).unwrap();
        assert_eq!(channels[0].name, "Kids TV");
        assert_eq!(channels[0].group, "Kids, Family");
        assert_eq!(channels[0].channel_id, "k1");
    }

    #[test]
    fn test_rejects_text_without_entries() {
        let err = M3uParser::new().parse("#EXTM3U\n").unwrap_err();
        assert!(matches!(err, SourceError::Parse { .. }));

        let err = M3uParser::new().parse("#EXTM3U\n#EXTINF:-1,Dangling\n").unwrap_err();
        assert!(matches!(err, SourceError::Parse { .. }));
    }
}
