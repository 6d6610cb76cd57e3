//! XMLTV channel definitions and programmes as extracted by the EPG parser

use serde::{Deserialize, Serialize};

/// A `<channel>` node: canonical id plus display-name aliases
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EpgChannel {
    pub id: String,
    pub display_names: Vec<String>,
    pub icon: Option<String>,
    pub url: Option<String>,
}

/// A `<programme>` node
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EpgProgramme {
    /// `{channel}_{start}_{stop}`
    pub id: String,
    pub channel: String,
    pub start: String,
    pub stop: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub categories: Vec<String>,
    pub icon: Option<String>,
}

impl EpgProgramme {
    pub fn derive_id(channel: &str, start: &str, stop: Option<&str>) -> String {
        format!("{}_{}_{}", channel, start, stop.unwrap_or_default())
    }
}

/// Counts carried by the final message of a parse run
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EpgParseSummary {
    pub channel_count: usize,
    pub programme_count: usize,
    pub key_count: usize,
    pub programme_channel_count: usize,
    /// Programmes whose channel attribute names no `<channel>` definition
    pub orphan_programme_count: usize,
}
