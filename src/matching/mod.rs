//! Identity normalization and the EPG matching index
//!
//! [`normalizer`] turns identifiers and display names into ordered key
//! variants; [`MatchingIndex`] maps those keys to EPG channel definitions and
//! resolves provider channels against them.

pub mod index;
pub mod normalizer;

pub use index::{ChannelIdentity, MatchingIndex};
pub use normalizer::{display_name_keys, lookup_keys, normalize};
