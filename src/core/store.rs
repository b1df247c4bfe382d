use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Deserializer, Serialize};

use crate::core::error::StoreError;

pub const DEFAULT_STORE_DIR: &str = "config";
pub const CARDS_FILE: &str = "rfid_cards.json";
pub const ASSOCIATIONS_FILE: &str = "rfid_associations.json";

/// A card seen by the reader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardRecord {
    /// Filled from the map key on load
    #[serde(default)]
    pub uuid: String,
    pub data: String,
    #[serde(deserialize_with = "deserialize_last_seen")]
    pub last_seen: DateTime<Utc>,
    pub read_count: u64,
}

/// Persistent cards and uuid→text associations, one JSON file each
#[derive(Debug)]
pub struct CardStore {
    cards_path: PathBuf,
    associations_path: PathBuf,
    cards: BTreeMap<String, CardRecord>,
    associations: BTreeMap<String, String>,
}

impl CardStore {
    /// Load the store kept in `dir`, creating the directory if needed
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let cards_path = dir.join(CARDS_FILE);
        let associations_path = dir.join(ASSOCIATIONS_FILE);

        let mut cards: BTreeMap<String, CardRecord> = load_json(&cards_path)?;
        for (uuid, record) in cards.iter_mut() {
            record.uuid = uuid.clone();
        }
        let associations: BTreeMap<String, String> = load_json(&associations_path)?;

        log::debug!(
            "Loaded {} cards and {} associations from {}",
            cards.len(),
            associations.len(),
            dir.display()
        );

        Ok(Self {
            cards_path,
            associations_path,
            cards,
            associations,
        })
    }

    /// Record one read of `uuid` and persist the cards file
    pub fn record_read(
        &mut self,
        uuid: &str,
        data: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<CardRecord, StoreError> {
        let record = self
            .cards
            .entry(uuid.to_string())
            .and_modify(|record| {
                record.data = data.to_string();
                record.last_seen = seen_at;
                record.read_count += 1;
            })
            .or_insert_with(|| CardRecord {
                uuid: uuid.to_string(),
                data: data.to_string(),
                last_seen: seen_at,
                read_count: 1,
            })
            .clone();

        self.save_cards()?;
        Ok(record)
    }

    pub fn card(&self, uuid: &str) -> Option<&CardRecord> {
        self.cards.get(uuid)
    }

    /// All cards, ordered by uuid
    pub fn cards(&self) -> impl Iterator<Item = &CardRecord> {
        self.cards.values()
    }

    pub fn association(&self, uuid: &str) -> Option<&str> {
        self.associations.get(uuid).map(String::as_str)
    }

    /// All associations, ordered by uuid
    pub fn associations(&self) -> impl Iterator<Item = (&str, &str)> {
        self.associations
            .iter()
            .map(|(uuid, text)| (uuid.as_str(), text.as_str()))
    }

    /// Associate `uuid` with `text`, replacing any previous text
    pub fn associate(&mut self, uuid: &str, text: &str) -> Result<(), StoreError> {
        self.associations.insert(uuid.to_string(), text.to_string());
        self.save_associations()
    }

    /// Returns false when no card with that uuid was stored
    pub fn delete_card(&mut self, uuid: &str) -> Result<bool, StoreError> {
        if self.cards.remove(uuid).is_none() {
            return Ok(false);
        }
        self.save_cards()?;
        Ok(true)
    }

    /// Returns false when no association existed for that uuid
    pub fn delete_association(&mut self, uuid: &str) -> Result<bool, StoreError> {
        if self.associations.remove(uuid).is_none() {
            return Ok(false);
        }
        self.save_associations()?;
        Ok(true)
    }

    pub fn cards_path(&self) -> &Path {
        &self.cards_path
    }

    pub fn associations_path(&self) -> &Path {
        &self.associations_path
    }

    fn save_cards(&self) -> Result<(), StoreError> {
        save_json(&self.cards_path, &self.cards)
    }

    fn save_associations(&self) -> Result<(), StoreError> {
        save_json(&self.associations_path, &self.associations)
    }
}

/// Accepts RFC 3339 as well as offset-less ISO 8601 timestamps, which are
/// taken as local time (older stores wrote them that way)
fn deserialize_last_seen<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    parse_last_seen(&text)
        .ok_or_else(|| de::Error::custom(format!("invalid last_seen timestamp: {text}")))
}

fn parse_last_seen(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(stamp) = text.parse::<DateTime<Utc>>() {
        return Some(stamp);
    }
    let naive = text.parse::<NaiveDateTime>().ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}

fn load_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StoreError> {
    if !path.exists() {
        return Ok(T::default());
    }
    let text = fs::read_to_string(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if text.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(&text).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Write to a sibling temp file, then rename over the target
fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp_path = path.with_extension("json.tmp");
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    fs::write(&tmp_path, json).map_err(io_err)?;
    fs::rename(&tmp_path, path).map_err(io_err)
}
