//! Cache of heart-rate sources seen by `scan` and `listen`, keyed by address.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{HrError, Result};
use crate::stream::now_secs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Discovery {
    #[serde(rename = "adv")]
    Advertisement,
    Connect,
    Listener,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub address: String,
    pub name: String,
    #[serde(default, alias = "ts")]
    pub last_seen: f64,
    #[serde(default)]
    pub preferred: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via: Option<Discovery>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceCache {
    records: BTreeMap<String, SourceRecord>,
}

impl SourceCache {
    pub fn load(path: &Path) -> Result<Self> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(SourceCache::default()),
            Err(e) => return Err(HrError::io(path, e)),
        };
        if text.trim().is_empty() {
            return Ok(SourceCache::default());
        }
        let value: Value = serde_json::from_str(&text).map_err(|e| HrError::json(path, e))?;
        Ok(Self::from_value(value))
    }

    /// Accepts the keyed object written by `save`, and the list shapes older
    /// scan output used (`[...]`, `{"sources": [...]}`, `{"devices": [...]}`).
    fn from_value(value: Value) -> Self {
        let mut cache = SourceCache::default();
        match value {
            Value::Array(items) => cache.extend_from_list(items),
            Value::Object(mut map) => {
                let list = ["sources", "devices"]
                    .iter()
                    .find_map(|key| match map.remove(*key) {
                        Some(Value::Array(items)) => Some(items),
                        _ => None,
                    });
                if let Some(items) = list {
                    cache.extend_from_list(items);
                } else {
                    for (address, item) in map {
                        if let Some(record) = record_from_item(item, Some(&address)) {
                            cache.records.insert(address, record);
                        }
                    }
                }
            }
            _ => {}
        }
        cache
    }

    fn extend_from_list(&mut self, items: Vec<Value>) {
        for item in items {
            if let Some(record) = record_from_item(item, None) {
                self.records.insert(record.address.clone(), record);
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| HrError::io(parent, e))?;
        }
        let text = serde_json::to_string_pretty(&self.records).map_err(|e| HrError::json(path, e))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, text).map_err(|e| HrError::io(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| HrError::io(path, e))
    }

    pub fn upsert(&mut self, address: &str, name: &str, via: Discovery, preferred: bool) {
        let now = now_secs();
        let record = self
            .records
            .entry(address.to_string())
            .or_insert_with(|| SourceRecord {
                address: address.to_string(),
                name: name.to_string(),
                last_seen: now,
                preferred,
                via: Some(via),
            });
        if !name.is_empty() {
            record.name = name.to_string();
        }
        record.last_seen = now;
        record.preferred |= preferred;
        record.via = Some(via);
    }

    pub fn get(&self, address: &str) -> Option<&SourceRecord> {
        self.records.get(address)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Labels to match preferred devices by, most recently seen first.
    pub fn preferred_labels(&self) -> Vec<String> {
        let mut preferred: Vec<&SourceRecord> =
            self.records.values().filter(|r| r.preferred).collect();
        preferred.sort_by(|a, b| b.last_seen.total_cmp(&a.last_seen));

        let mut labels = vec![];
        for record in preferred {
            for label in [&record.name, &record.address] {
                if !label.is_empty() && !labels.contains(label) {
                    labels.push(label.clone());
                }
            }
        }
        labels
    }
}

fn record_from_item(item: Value, key: Option<&str>) -> Option<SourceRecord> {
    match item {
        Value::String(label) if !label.is_empty() => Some(SourceRecord {
            address: key.unwrap_or(&label).to_string(),
            name: label,
            last_seen: 0.0,
            preferred: true,
            via: None,
        }),
        Value::Object(mut map) => {
            let text = |map: &serde_json::Map<String, Value>, k: &str| {
                map.get(k).and_then(Value::as_str).filter(|s| !s.is_empty()).map(str::to_string)
            };
            let name = text(&map, "name").or_else(|| text(&map, "source"));
            let address = text(&map, "address").or_else(|| key.map(str::to_string));
            let (address, name) = match (address, name) {
                (Some(a), Some(n)) => (a, n),
                (Some(a), None) => (a.clone(), a),
                (None, Some(n)) => (n.clone(), n),
                (None, None) => return None,
            };
            let last_seen = map
                .remove("last_seen")
                .or_else(|| map.remove("ts"))
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            // Entries from list-shaped files predate the flag and were all preferred.
            let preferred = map
                .get("preferred")
                .and_then(Value::as_bool)
                .unwrap_or(key.is_none());
            let via = map
                .remove("via")
                .and_then(|v| serde_json::from_value(v).ok());
            Some(SourceRecord {
                address,
                name,
                last_seen,
                preferred,
                via,
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SourceCache::load(&dir.path().join("nope.json")).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn save_and_load_keyed_by_address() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("hr_sources.json");

        let mut cache = SourceCache::default();
        cache.upsert("AA:BB", "Polar H10", Discovery::Advertisement, true);
        cache.upsert("CC:DD", "Band", Discovery::Connect, false);
        cache.save(&path).unwrap();

        let raw: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["AA:BB"]["name"], "Polar H10");
        assert_eq!(raw["AA:BB"]["via"], "adv");

        let loaded = SourceCache::load(&path).unwrap();
        assert_eq!(loaded, cache);
        assert_eq!(loaded.preferred_labels(), vec!["Polar H10", "AA:BB"]);
    }

    #[test]
    fn upsert_keeps_preferred_and_refreshes() {
        let mut cache = SourceCache::default();
        cache.upsert("AA", "Old", Discovery::Advertisement, true);
        cache.upsert("AA", "New", Discovery::Listener, false);
        let record = cache.get("AA").unwrap();
        assert_eq!(record.name, "New");
        assert!(record.preferred);
        assert_eq!(record.via, Some(Discovery::Listener));

        cache.upsert("AA", "", Discovery::Listener, false);
        assert_eq!(cache.get("AA").unwrap().name, "New");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn legacy_list_shapes() {
        let list = serde_json::json!([
            {"name": "Polar", "address": "AA", "ts": 5.0, "via": "connect"},
            "Apple Watch",
            {"source": "Garmin"},
            42
        ]);
        let cache = SourceCache::from_value(list);
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get("AA").unwrap().last_seen, 5.0);
        assert_eq!(cache.get("AA").unwrap().via, Some(Discovery::Connect));
        assert!(cache.get("Apple Watch").unwrap().preferred);
        assert_eq!(cache.get("Garmin").unwrap().name, "Garmin");

        let wrapped = serde_json::json!({"devices": ["Wahoo"]});
        assert_eq!(SourceCache::from_value(wrapped).preferred_labels(), vec!["Wahoo"]);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(SourceCache::load(&path), Err(HrError::Json { .. })));
    }
}
