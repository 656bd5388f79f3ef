//! Core records: search identities, listings, subscriber configuration.
//!
//! Subscriber-owned records refer to shared records by id (`search_spec_id`,
//! `subscriber_id`) and are resolved through the catalog/stores, never through
//! in-memory back-pointers.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Content-derived identity of a [`SearchSpec`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchSpecId(String);

impl SearchSpecId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SearchSpecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One query against one source plugin.
///
/// Parameters are stored in canonical form (object keys sorted at every depth),
/// so two specs built from the same parameters compare and hash equal no matter
/// how the parameter maps were assembled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSpec {
    pub id: SearchSpecId,
    pub plugin_path: String,
    pub params: Value,
}

impl SearchSpec {
    pub fn new(plugin_path: impl Into<String>, params: &Value) -> Self {
        let plugin_path = plugin_path.into();
        let params = canonicalize(params);
        let id = spec_id(&plugin_path, &params);
        Self {
            id,
            plugin_path,
            params,
        }
    }

    /// Canonical JSON text of the parameters.
    pub fn params_json(&self) -> String {
        self.params.to_string()
    }
}

impl PartialEq for SearchSpec {
    fn eq(&self, other: &Self) -> bool {
        self.plugin_path == other.plugin_path && self.params == other.params
    }
}

impl Eq for SearchSpec {}

impl Hash for SearchSpec {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for SearchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} [{}]", self.plugin_path, self.params, self.id)
    }
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

fn spec_id(plugin_path: &str, canonical_params: &Value) -> SearchSpecId {
    use sha2::{Digest, Sha256};
    use std::fmt::Write as _;

    let mut hasher = Sha256::new();
    hasher.update(plugin_path.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical_params.to_string().as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(16);
    for b in digest.iter().take(8) {
        let _ = write!(&mut out, "{:02x}", b);
    }
    SearchSpecId(out)
}

/// A listing as returned by a source plugin, before it is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewListing {
    pub fields: Map<String, Value>,
    pub creation_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
}

impl NewListing {
    pub fn new(creation_time: DateTime<Utc>, fields: Map<String, Value>) -> Self {
        Self {
            fields,
            creation_time,
            updated_time: creation_time,
        }
    }

    pub fn with_updated_time(mut self, updated_time: DateTime<Utc>) -> Self {
        self.updated_time = updated_time;
        self
    }

    /// The source saw a modification of a listing it had already published.
    pub fn is_update(&self) -> bool {
        self.updated_time > self.creation_time
    }
}

/// Immutable stored listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub search_spec_id: SearchSpecId,
    pub fields: Map<String, Value>,
    pub creation_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
    pub stored_at: DateTime<Utc>,
}

impl ListingRecord {
    pub fn from_new(search_spec_id: SearchSpecId, listing: NewListing, stored_at: DateTime<Utc>) -> Self {
        Self {
            search_spec_id,
            fields: listing.fields,
            creation_time: listing.creation_time,
            updated_time: listing.updated_time,
            stored_at,
        }
    }

    /// Field value, treating JSON `null` as absent.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).filter(|v| !v.is_null())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(String);

impl SubscriberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchId(Uuid);

impl SearchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SearchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SearchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A subscriber watching one search spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifierSearch {
    pub id: SearchId,
    pub subscriber_id: SubscriberId,
    pub name: String,
    pub search_spec_id: SearchSpecId,
    /// Creation-time boundary before which listings were already considered.
    pub last_notified: DateTime<Utc>,
}

impl NotifierSearch {
    /// Move the watermark forward; never backward. Returns whether it moved.
    pub fn advance_watermark(&mut self, to: DateTime<Utc>) -> bool {
        if to > self.last_notified {
            self.last_notified = to;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleType {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterId(Uuid);

impl FilterId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FilterId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Per-field inclusion rule owned by a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub id: FilterId,
    pub field: String,
    pub rule_type: RuleType,
    pub rule_expr: String,
    /// Substrings stripped from string fields before the rule runs.
    #[serde(default)]
    pub preremove: Vec<String>,
    /// Any of these present (after preremoval) fails the field outright.
    #[serde(default)]
    pub disallowed: Vec<String>,
}

impl Filter {
    pub fn new(field: impl Into<String>, rule_type: RuleType, rule_expr: impl Into<String>) -> Self {
        Self {
            id: FilterId::new(),
            field: field.into(),
            rule_type,
            rule_expr: rule_expr.into(),
            preremove: Vec::new(),
            disallowed: Vec::new(),
        }
    }

    pub fn with_preremove<I, S>(mut self, words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.preremove.extend(words.into_iter().map(Into::into));
        self
    }

    pub fn with_disallowed<I, S>(mut self, words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.disallowed.extend(words.into_iter().map(Into::into));
        self
    }
}

/// Where a subscriber's listings are delivered.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelConfig {
    #[default]
    Log,
    Discord {
        webhook_url: String,
    },
    Slack {
        webhook_url: String,
    },
    Email {
        to: String,
    },
}

/// Unit of persistence and of pause/resume control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriberConfig {
    pub id: SubscriberId,
    pub notification_frequency_seconds: u64,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub active_searches: Vec<NotifierSearch>,
    #[serde(default)]
    pub filters: Vec<Filter>,
}

impl SubscriberConfig {
    pub fn new(id: SubscriberId, notification_frequency_seconds: u64) -> Self {
        Self {
            id,
            notification_frequency_seconds,
            paused: false,
            channel: ChannelConfig::default(),
            active_searches: Vec::new(),
            filters: Vec::new(),
        }
    }

    pub fn search_named(&self, name: &str) -> Option<&NotifierSearch> {
        self.active_searches.iter().find(|s| s.name == name)
    }

    /// The search already bound to `spec`, if any.
    pub fn search_watching(&self, spec: &SearchSpecId) -> Option<&NotifierSearch> {
        self.active_searches.iter().find(|s| &s.search_spec_id == spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn spec_equal_regardless_of_insertion_order() {
        let mut a = Map::new();
        a.insert("query".into(), json!("ktm exc"));
        a.insert("max_price".into(), json!(5000));
        a.insert("site".into(), json!({"region": "sfbay", "area": "eby"}));

        let mut b = Map::new();
        b.insert("site".into(), json!({"area": "eby", "region": "sfbay"}));
        b.insert("max_price".into(), json!(5000));
        b.insert("query".into(), json!("ktm exc"));

        let sa = SearchSpec::new("plugins.craigslist", &Value::Object(a));
        let sb = SearchSpec::new("plugins.craigslist", &Value::Object(b));
        assert_eq!(sa, sb);
        assert_eq!(sa.id, sb.id);
        assert_eq!(sa.params_json(), sb.params_json());
    }

    #[test]
    fn spec_differs_by_plugin_path() {
        let params = json!({"query": "tw 200"});
        let a = SearchSpec::new("plugins.craigslist", &params);
        let b = SearchSpec::new("plugins.marketplace", &params);
        assert_ne!(a, b);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn watermark_never_moves_backward() {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut search = NotifierSearch {
            id: SearchId::new(),
            subscriber_id: SubscriberId::new("chan-1"),
            name: "bikes".into(),
            search_spec_id: SearchSpec::new("p", &json!({})).id,
            last_notified: t0,
        };
        assert!(!search.advance_watermark(t0 - chrono::Duration::hours(1)));
        assert_eq!(search.last_notified, t0);
        assert!(search.advance_watermark(t0 + chrono::Duration::seconds(1)));
        assert!(!search.advance_watermark(t0 + chrono::Duration::seconds(1)));
    }

    #[test]
    fn config_defaults_fill_missing_fields() {
        let cfg: SubscriberConfig =
            serde_json::from_str(r#"{"id":"chan-9","notification_frequency_seconds":30}"#).unwrap();
        assert!(!cfg.paused);
        assert_eq!(cfg.channel, ChannelConfig::Log);
        assert!(cfg.active_searches.is_empty());
    }
}
