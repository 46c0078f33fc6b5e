#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Chat channel login, normalized to lowercase without a leading `#`.
///
/// Two names that differ only in case (or in a leading `#`) compare equal,
/// so a list of `ChannelName`s can be deduplicated with plain equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelName(String);

impl ChannelName {
	/// Normalize and validate a channel name.
	pub fn new(name: impl AsRef<str>) -> Result<Self, ParseIdError> {
		let name = name.as_ref().trim();
		let name = name.strip_prefix('#').unwrap_or(name).trim();
		if name.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if name.chars().any(|c| c.is_whitespace() || c == ',') {
			return Err(ParseIdError::InvalidFormat(format!("channel name contains a separator: {name}")));
		}
		Ok(Self(name.to_ascii_lowercase()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}

	/// IRC form of the channel (`#name`).
	pub fn irc(&self) -> String {
		format!("#{}", self.0)
	}
}

impl fmt::Display for ChannelName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ChannelName {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ChannelName::new(s)
	}
}

impl TryFrom<String> for ChannelName {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		ChannelName::new(value)
	}
}

impl From<ChannelName> for String {
	fn from(value: ChannelName) -> Self {
		value.0
	}
}

impl AsRef<str> for ChannelName {
	fn as_ref(&self) -> &str {
		&self.0
	}
}

/// Append `name` unless an equal channel is already present.
///
/// Returns `true` when the list changed.
pub fn push_unique_channel(channels: &mut Vec<ChannelName>, name: ChannelName) -> bool {
	if channels.contains(&name) {
		return false;
	}
	channels.push(name);
	true
}

/// Collapse duplicates while keeping first-seen order.
pub fn dedup_channels(channels: impl IntoIterator<Item = ChannelName>) -> Vec<ChannelName> {
	let mut out = Vec::new();
	for c in channels {
		push_unique_channel(&mut out, c);
	}
	out
}

/// Platform-native chat message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlatformMessageId(String);

impl PlatformMessageId {
	/// Create a non-empty platform message id.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for PlatformMessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	#[test]
	fn channel_name_normalizes_case_and_hash() {
		let a = ChannelName::new("#SomeStreamer").unwrap();
		let b = ChannelName::new("  somestreamer ").unwrap();
		assert_eq!(a, b);
		assert_eq!(a.as_str(), "somestreamer");
		assert_eq!(a.irc(), "#somestreamer");
	}

	#[test]
	fn rejects_empty_and_separators() {
		assert_eq!(ChannelName::new(""), Err(ParseIdError::Empty));
		assert_eq!(ChannelName::new("#"), Err(ParseIdError::Empty));
		assert!(ChannelName::new("two words").is_err());
		assert!(PlatformMessageId::new("   ").is_err());
	}

	#[test]
	fn push_unique_ignores_case_duplicates() {
		let mut list = vec![ChannelName::new("alpha").unwrap()];
		assert!(!push_unique_channel(&mut list, ChannelName::new("ALPHA").unwrap()));
		assert!(push_unique_channel(&mut list, ChannelName::new("beta").unwrap()));
		assert_eq!(list.len(), 2);
	}

	#[test]
	fn serde_uses_plain_string() {
		let name: ChannelName = serde_json::from_str("\"#Mixed\"").unwrap();
		assert_eq!(name.as_str(), "mixed");
		assert_eq!(serde_json::to_string(&name).unwrap(), "\"mixed\"");
		assert!(serde_json::from_str::<ChannelName>("\"\"").is_err());
	}

	proptest! {
		#[test]
		fn normalization_is_idempotent(raw in "[A-Za-z0-9_]{1,25}") {
			let once = ChannelName::new(&raw).unwrap();
			let twice = ChannelName::new(once.as_str()).unwrap();
			prop_assert_eq!(&once, &twice);
			prop_assert_eq!(once.as_str(), raw.to_ascii_lowercase());
		}

		#[test]
		fn dedup_never_keeps_case_variants(names in proptest::collection::vec("[a-c]{1,2}", 0..20)) {
			let upper = names.iter().map(|n| ChannelName::new(n.to_ascii_uppercase()).unwrap());
			let lower = names.iter().map(|n| ChannelName::new(n).unwrap());
			let merged = dedup_channels(lower.chain(upper));
			let mut sorted = merged.clone();
			sorted.sort();
			sorted.dedup();
			prop_assert_eq!(sorted.len(), merged.len());
		}
	}
}
