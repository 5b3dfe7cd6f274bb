//! Core RAW record model, canonical JSON and content fingerprints for foodraw.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::value::RawValue;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;

mod canonical;

pub use canonical::{
    canonicalize, canonicalize_str, format_float, require_object, CanonicalizationError,
};

pub const CRATE_NAME: &str = "foodraw-core";

/// Source identifier used when a deployment does not configure one.
pub const DEFAULT_SOURCE: &str = "openfoodfacts";

/// SHA-256 digest of a payload's canonical form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawHash([u8; 32]);

#[derive(Debug, Error)]
pub enum RawHashParseError {
    #[error("raw hash must be 64 hex characters, got {0}")]
    Length(usize),
    #[error("raw hash is not valid hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

impl RawHash {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Two-character prefix used for directory fan-out.
    pub fn shard(&self) -> String {
        hex::encode(&self.0[..1])
    }
}

impl fmt::Display for RawHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for RawHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawHash({})", self.to_hex())
    }
}

impl FromStr for RawHash {
    type Err = RawHashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(RawHashParseError::Length(s.len()));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl Serialize for RawHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for RawHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

pub fn fingerprint(canonical: &[u8]) -> RawHash {
    let mut hasher = Sha256::new();
    hasher.update(canonical);
    RawHash(hasher.finalize().into())
}

/// Canonicalize a JSON document and fingerprint the result.
pub fn fingerprint_json(text: &str) -> Result<(Vec<u8>, RawHash), CanonicalizationError> {
    let canonical = canonicalize_str(text)?;
    let hash = fingerprint(&canonical);
    Ok((canonical, hash))
}

/// One upstream product as received, plus ingestion metadata.
///
/// The hash is computed by the constructor from the payload, and none of the
/// fields can be changed afterwards.
#[derive(Clone, Serialize)]
pub struct RawRecord {
    source: String,
    fetched_at: DateTime<Utc>,
    raw_hash: RawHash,
    payload: Box<RawValue>,
}

impl RawRecord {
    /// Build a record from a verbatim product payload.
    ///
    /// The payload must be a JSON object with a canonical form.
    pub fn from_payload(
        source: impl Into<String>,
        fetched_at: DateTime<Utc>,
        payload: Box<RawValue>,
    ) -> Result<Self, CanonicalizationError> {
        let value: JsonValue = serde_json::from_str(payload.get())?;
        require_object(&value)?;
        let raw_hash = fingerprint(&canonicalize(&value)?);
        Ok(Self {
            source: source.into(),
            fetched_at,
            raw_hash,
            payload,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    pub fn raw_hash(&self) -> RawHash {
        self.raw_hash
    }

    pub fn payload(&self) -> &RawValue {
        &self.payload
    }

    /// Payload text exactly as it was received.
    pub fn payload_json(&self) -> &str {
        self.payload.get()
    }
}

impl fmt::Debug for RawRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawRecord")
            .field("source", &self.source)
            .field("fetched_at", &self.fetched_at)
            .field("raw_hash", &self.raw_hash)
            .field("payload_bytes", &self.payload.get().len())
            .finish()
    }
}

impl PartialEq for RawRecord {
    fn eq(&self, other: &Self) -> bool {
        self.raw_hash == other.raw_hash
            && self.source == other.source
            && self.fetched_at == other.fetched_at
            && self.payload.get() == other.payload.get()
    }
}

impl Eq for RawRecord {}

/// Serialized shape of a stored record; reloading recomputes the hash.
#[derive(Debug, Deserialize)]
pub struct StoredRawRecord {
    pub source: String,
    pub fetched_at: DateTime<Utc>,
    pub raw_hash: RawHash,
    pub payload: Box<RawValue>,
}

#[derive(Debug, Error)]
pub enum StoredRecordError {
    #[error(transparent)]
    Canonicalization(#[from] CanonicalizationError),
    #[error("stored raw_hash {stored} does not match payload hash {computed}")]
    HashMismatch { stored: RawHash, computed: RawHash },
}

impl TryFrom<StoredRawRecord> for RawRecord {
    type Error = StoredRecordError;

    fn try_from(stored: StoredRawRecord) -> Result<Self, Self::Error> {
        let record = RawRecord::from_payload(stored.source, stored.fetched_at, stored.payload)?;
        if record.raw_hash != stored.raw_hash {
            return Err(StoredRecordError::HashMismatch {
                stored: stored.raw_hash,
                computed: record.raw_hash,
            });
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).single().unwrap()
    }

    fn raw(text: &str) -> Box<RawValue> {
        RawValue::from_string(text.to_string()).unwrap()
    }

    #[test]
    fn fingerprint_is_sha256_of_canonical_bytes() {
        let (canonical, hash) = fingerprint_json("{}").unwrap();
        assert_eq!(canonical, b"{}");
        assert_eq!(
            hash.to_hex(),
            "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
    }

    #[test]
    fn structurally_equal_payloads_share_a_fingerprint() {
        let a = RawRecord::from_payload(
            DEFAULT_SOURCE,
            ts(),
            raw(r#"{"code":"3017620422003","nutriments":{"fat_100g":30.9,"salt_100g":0.107},"rev":12}"#),
        )
        .unwrap();
        let b = RawRecord::from_payload(
            DEFAULT_SOURCE,
            ts(),
            raw("{\n  \"rev\": 12.0,\n  \"nutriments\": {\"salt_100g\": 0.107, \"fat_100g\": 30.90},\n  \"code\": \"3017620422003\"\n}"),
        )
        .unwrap();
        assert_eq!(a.raw_hash(), b.raw_hash());
        assert_ne!(a.payload_json(), b.payload_json());
    }

    #[test]
    fn any_value_change_changes_the_fingerprint() {
        let base = fingerprint_json(r#"{"code":"1","product_name":"Nutella"}"#).unwrap().1;
        let renamed = fingerprint_json(r#"{"code":"1","product_name":"nutella"}"#).unwrap().1;
        let recoded = fingerprint_json(r#"{"code":"2","product_name":"Nutella"}"#).unwrap().1;
        let retyped = fingerprint_json(r#"{"code":1,"product_name":"Nutella"}"#).unwrap().1;
        assert_ne!(base, renamed);
        assert_ne!(base, recoded);
        assert_ne!(base, retyped);
    }

    #[test]
    fn payload_is_kept_verbatim() {
        let text = r#"{ "code" : "42",  "b":[ 1.50 ] }"#;
        let record = RawRecord::from_payload("off", ts(), raw(text)).unwrap();
        assert_eq!(record.payload_json(), text);
        assert_eq!(record.source(), "off");
        assert_eq!(record.fetched_at(), ts());
    }

    #[test]
    fn non_object_payloads_are_rejected() {
        let err = RawRecord::from_payload("off", ts(), raw(r#""just a string""#)).unwrap_err();
        assert!(matches!(err, CanonicalizationError::NotAnObject { found: "string" }));
    }

    #[test]
    fn raw_hash_round_trips_through_hex() {
        let hash = fingerprint(b"payload");
        let parsed: RawHash = hash.to_string().parse().unwrap();
        assert_eq!(parsed, hash);
        assert_eq!(hash.shard(), &hash.to_hex()[..2]);
        assert!(matches!("abc".parse::<RawHash>(), Err(RawHashParseError::Length(3))));
        assert!("zz".repeat(32).parse::<RawHash>().is_err());
    }

    #[test]
    fn stored_records_are_verified_on_reload() {
        let record = RawRecord::from_payload("off", ts(), raw(r#"{"code":"7"}"#)).unwrap();
        let text = serde_json::to_string(&record).unwrap();
        let stored: StoredRawRecord = serde_json::from_str(&text).unwrap();
        let reloaded = RawRecord::try_from(stored).unwrap();
        assert_eq!(reloaded, record);

        let tampered = text.replace(r#""code":"7""#, r#""code":"8""#);
        let stored: StoredRawRecord = serde_json::from_str(&tampered).unwrap();
        assert!(matches!(
            RawRecord::try_from(stored),
            Err(StoredRecordError::HashMismatch { .. })
        ));
    }
}
