use super::CertRow;
use chrono::{DateTime, Utc};
use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize, Serializer};
use sqlx::FromRow;

/// Outcome of the most recent probe of a state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, sqlx::Type)]
#[repr(i32)]
pub enum Validity {
    #[default]
    Unknown = -1,
    Invalid = 0,
    Valid = 1,
}

impl Validity {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            -1 => Some(Self::Unknown),
            0 => Some(Self::Invalid),
            1 => Some(Self::Valid),
            _ => None,
        }
    }
}

impl Serialize for Validity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(*self as i32)
    }
}

impl<'de> Deserialize<'de> for Validity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = i64::deserialize(deserializer)?;
        Self::from_code(code).ok_or_else(|| D::Error::custom(format!("invalid validity {code}")))
    }
}

/// Origin of a state row: operator-added rows are permanent, discovered rows
/// expire when the zone stops asserting them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, sqlx::Type)]
#[repr(i32)]
pub enum StateKind {
    #[default]
    Custom = 0,
    Discovered = 1,
}

impl StateKind {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Custom),
            1 => Some(Self::Discovered),
            _ => None,
        }
    }
}

impl Serialize for StateKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(*self as i32)
    }
}

impl<'de> Deserialize<'de> for StateKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = i64::deserialize(deserializer)?;
        Self::from_code(code).ok_or_else(|| D::Error::custom(format!("invalid state kind {code}")))
    }
}

/// One monitored endpoint, as stored in the `states` table. The certificate
/// list is a projection reconstructed from `state_certs` on read; the tables
/// remain the source of truth.
#[derive(Clone, Debug, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct StateRow {
    #[serde(default)]
    pub id: i64,
    pub host: String,
    #[serde(default)]
    pub sni: String,
    #[serde(default)]
    pub kind: StateKind,
    #[sqlx(rename = "valid")]
    #[serde(default, rename = "valid")]
    pub validity: Validity,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_discovery: Option<DateTime<Utc>>,
    #[sqlx(skip)]
    #[serde(default)]
    pub certificates: Vec<CertRow>,
}

impl StateRow {
    /// An empty SNI derives the server name from the dial target.
    pub fn new(host: impl Into<String>, sni: impl Into<String>) -> Self {
        let host = host.into();
        let mut sni: String = sni.into();
        if sni.is_empty() {
            sni = host
                .rsplit_once(':')
                .map(|(name, _port)| name)
                .unwrap_or(host.as_str())
                .to_owned();
        }

        Self {
            id: 0,
            host,
            sni,
            kind: StateKind::Custom,
            validity: Validity::Unknown,
            description: String::new(),
            ts: None,
            last_discovery: None,
            certificates: Vec::new(),
        }
    }

    pub fn discovered(host: impl Into<String>, sni: impl Into<String>) -> Self {
        let mut state = Self::new(host, sni);
        state.kind = StateKind::Discovered;
        state
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sni_is_derived_from_host() {
        let state = StateRow::new("www.example.test:8443", "");
        assert_eq!(state.sni, "www.example.test");

        let state = StateRow::new("www.example.test:443", "sni.example.test");
        assert_eq!(state.sni, "sni.example.test");
    }

    #[test]
    fn validity_codes_round_trip() {
        for validity in [Validity::Unknown, Validity::Invalid, Validity::Valid] {
            assert_eq!(Validity::from_code(validity as i64), Some(validity));
        }
        assert_eq!(Validity::from_code(7), None);
    }

    #[test]
    fn rows_serialize_with_numeric_enums() {
        let mut state = StateRow::discovered("a.example:443", "");
        state.validity = Validity::Valid;

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["kind"], 1);
        assert_eq!(json["valid"], 1);
        assert_eq!(json["host"], "a.example:443");
        assert!(json["ts"].is_null());
    }
}
