//! PDV payload schema.
//!
//! A submission's `Data` is a versioned envelope holding a list of typed
//! items. Items are decoded as an internally tagged union on `"type"`.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const CURRENT_VERSION: &str = "v1";

/// Upper bound on items per submission.
const MAX_ITEMS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectType {
    Cookie,
    LoginCookie,
    Profile,
    Location,
    SearchHistory,
    AdvertiserId,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Cookie => "cookie",
            ObjectType::LoginCookie => "login-cookie",
            ObjectType::Profile => "profile",
            ObjectType::Location => "location",
            ObjectType::SearchHistory => "search-history",
            ObjectType::AdvertiserId => "advertiser-id",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PdvData {
    pub version: String,
    pub pdv: Vec<PdvObject>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PdvObject {
    Cookie(Cookie),
    LoginCookie(Cookie),
    Profile(ProfileObject),
    Location(Location),
    SearchHistory(SearchHistory),
    AdvertiserId(AdvertiserId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub expires: Option<i64>,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileObject {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub gender: String,
    #[serde(default)]
    pub birthday: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHistory {
    pub domain: String,
    pub query: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvertiserId {
    pub advertiser_id: String,
    /// e.g. "idfa" or "gaid"
    pub kind: String,
}

impl PdvObject {
    pub fn object_type(&self) -> ObjectType {
        match self {
            PdvObject::Cookie(_) => ObjectType::Cookie,
            PdvObject::LoginCookie(_) => ObjectType::LoginCookie,
            PdvObject::Profile(_) => ObjectType::Profile,
            PdvObject::Location(_) => ObjectType::Location,
            PdvObject::SearchHistory(_) => ObjectType::SearchHistory,
            PdvObject::AdvertiserId(_) => ObjectType::AdvertiserId,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            PdvObject::Cookie(c) | PdvObject::LoginCookie(c) => {
                if c.name.is_empty() {
                    return Err(Error::invalid("cookie without name"));
                }
                if c.domain.is_empty() {
                    return Err(Error::invalid(format!("cookie {} without domain", c.name)));
                }
            }
            PdvObject::Profile(p) => {
                if p.first_name.is_empty() && p.last_name.is_empty() && p.email.is_empty() {
                    return Err(Error::invalid("empty profile"));
                }
            }
            PdvObject::Location(l) => {
                if !(-90.0..=90.0).contains(&l.latitude) || !(-180.0..=180.0).contains(&l.longitude) {
                    return Err(Error::invalid(format!(
                        "location ({}, {}) out of range",
                        l.latitude, l.longitude
                    )));
                }
            }
            PdvObject::SearchHistory(s) => {
                if s.query.is_empty() {
                    return Err(Error::invalid("empty search query"));
                }
            }
            PdvObject::AdvertiserId(a) => {
                if a.advertiser_id.is_empty() {
                    return Err(Error::invalid("empty advertiser id"));
                }
            }
        }
        Ok(())
    }
}

impl PdvData {
    /// Decode and validate a raw payload.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let data: PdvData = serde_json::from_slice(bytes)
            .map_err(|e| Error::invalid(format!("pdv data: {}", e)))?;
        data.validate()?;
        Ok(data)
    }

    pub fn validate(&self) -> Result<()> {
        if self.version != CURRENT_VERSION {
            return Err(Error::invalid(format!("unsupported pdv version {:?}", self.version)));
        }
        if self.pdv.is_empty() {
            return Err(Error::invalid("pdv without items"));
        }
        if self.pdv.len() > MAX_ITEMS {
            return Err(Error::invalid(format!("more than {} pdv items", MAX_ITEMS)));
        }
        self.pdv.iter().try_for_each(PdvObject::validate)
    }

    /// Item counts keyed by the wire name of each type.
    pub fn object_types(&self) -> BTreeMap<String, u16> {
        let mut counts: BTreeMap<String, u16> = BTreeMap::new();
        for object in &self.pdv {
            let count = counts.entry(object.object_type().as_str().to_string()).or_default();
            *count = count.saturating_add(1);
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "version": "v1",
        "pdv": [
            {"type": "cookie", "name": "sid", "value": "1", "domain": "example.com"},
            {"type": "cookie", "name": "lang", "value": "en", "domain": "example.com"},
            {"type": "location", "latitude": 52.5, "longitude": 13.4, "timestamp": 1700000000},
            {"type": "advertiser-id", "advertiser_id": "a1b2", "kind": "idfa"}
        ]
    }"#;

    #[test]
    fn test_parse_counts_object_types() {
        let data = PdvData::parse(SAMPLE.as_bytes()).unwrap();
        let counts = data.object_types();

        assert_eq!(counts.len(), 3);
        assert_eq!(counts["cookie"], 2);
        assert_eq!(counts["location"], 1);
        assert_eq!(counts["advertiser-id"], 1);
    }

    #[test]
    fn test_unknown_variant_rejected() {
        let raw = r#"{"version":"v1","pdv":[{"type":"fingerprint","hash":"x"}]}"#;
        assert!(PdvData::parse(raw.as_bytes()).is_err());
    }

    #[test]
    fn test_wrong_version_rejected() {
        let raw = r#"{"version":"v0","pdv":[{"type":"search-history","domain":"d","query":"q","timestamp":1}]}"#;
        assert!(PdvData::parse(raw.as_bytes()).is_err());
    }

    #[test]
    fn test_location_out_of_range() {
        let raw = r#"{"version":"v1","pdv":[{"type":"location","latitude":120.0,"longitude":0.0,"timestamp":1}]}"#;
        assert!(matches!(PdvData::parse(raw.as_bytes()), Err(Error::Invalid(_))));
    }

    #[test]
    fn test_login_cookie_is_distinct_type() {
        let raw = r#"{"version":"v1","pdv":[{"type":"login-cookie","name":"auth","value":"x","domain":"d"}]}"#;
        let data = PdvData::parse(raw.as_bytes()).unwrap();
        assert_eq!(data.pdv[0].object_type(), ObjectType::LoginCookie);
        assert_eq!(data.object_types()["login-cookie"], 1);
    }
}
