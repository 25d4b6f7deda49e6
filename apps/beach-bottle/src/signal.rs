//! Signed, short-lived envelopes for rendezvous documents.
//!
//! The envelope carries its role and timestamps in the clear so a reader can
//! skip stale documents cheaply, while the HS256 token in `payload` binds
//! those fields to the transport signal.

use std::time::Duration;

use bottle_storage::{PeerAddress, StoragePath};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;

use crate::transport::Role;

pub const DEFAULT_SIGNAL_SECRET: &str = "chat-signal";
pub const DEFAULT_SIGNAL_TTL: Duration = Duration::from_secs(10);
pub const SIGNAL_DOCUMENT: &str = "signal.json";

/// Where `address` publishes its current signal.
pub fn signal_path(address: &PeerAddress) -> StoragePath {
    StoragePath::new(address.clone(), [SIGNAL_DOCUMENT])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    pub role: Role,
    pub payload: String,
    pub issued_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct SignalClaims {
    role: Role,
    signal: Value,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("signal expired at {expires_at}")]
    Expired { expires_at: i64 },
    #[error("signal rejected: {0}")]
    Invalid(String),
    #[error("failed to sign signal: {0}")]
    Encode(#[source] jsonwebtoken::errors::Error),
}

#[derive(Clone)]
pub struct SignalCodec {
    enc: EncodingKey,
    dec: DecodingKey,
    ttl: Duration,
}

impl std::fmt::Debug for SignalCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalCodec")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl Default for SignalCodec {
    fn default() -> Self {
        Self::new(DEFAULT_SIGNAL_SECRET, DEFAULT_SIGNAL_TTL)
    }
}

impl SignalCodec {
    pub fn new(secret: &str, ttl: Duration) -> Self {
        Self {
            enc: EncodingKey::from_secret(secret.as_bytes()),
            dec: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn encode(&self, role: Role, signal: &Value) -> Result<SignalEnvelope, SignalError> {
        self.encode_at(role, signal, OffsetDateTime::now_utc())
    }

    pub fn encode_at(
        &self,
        role: Role,
        signal: &Value,
        now: OffsetDateTime,
    ) -> Result<SignalEnvelope, SignalError> {
        let issued_at = now.unix_timestamp();
        let expires_at = issued_at.saturating_add(self.ttl.as_secs() as i64);
        let claims = SignalClaims {
            role,
            signal: signal.clone(),
            iat: issued_at,
            exp: expires_at,
        };
        let header = Header::new(Algorithm::HS256);
        let payload = jsonwebtoken::encode(&header, &claims, &self.enc).map_err(SignalError::Encode)?;
        Ok(SignalEnvelope {
            role,
            payload,
            issued_at,
            expires_at,
        })
    }

    pub fn decode(&self, envelope: &SignalEnvelope) -> Result<Value, SignalError> {
        self.decode_at(envelope, OffsetDateTime::now_utc())
    }

    /// Verifies `envelope` as of `now` and returns the carried signal.
    pub fn decode_at(
        &self,
        envelope: &SignalEnvelope,
        now: OffsetDateTime,
    ) -> Result<Value, SignalError> {
        let mut validation = Validation::new(Algorithm::HS256);
        // expiry is enforced against `now` below
        validation.validate_exp = false;
        let data = jsonwebtoken::decode::<SignalClaims>(&envelope.payload, &self.dec, &validation)
            .map_err(|err| SignalError::Invalid(err.to_string()))?;
        let claims = data.claims;
        if claims.role != envelope.role
            || claims.iat != envelope.issued_at
            || claims.exp != envelope.expires_at
        {
            return Err(SignalError::Invalid(
                "envelope fields do not match signed claims".into(),
            ));
        }
        if claims.exp < claims.iat {
            return Err(SignalError::Invalid("expiry precedes issue time".into()));
        }
        if now.unix_timestamp() > claims.exp {
            return Err(SignalError::Expired {
                expires_at: claims.exp,
            });
        }
        Ok(claims.signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at(secs: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(secs).unwrap()
    }

    #[test]
    fn round_trip_returns_signal() {
        let codec = SignalCodec::default();
        let signal = json!({"type": "offer", "sdp": "v=0"});
        let envelope = codec.encode_at(Role::Initiator, &signal, at(1_000)).unwrap();
        assert_eq!(envelope.issued_at, 1_000);
        assert_eq!(envelope.expires_at, 1_010);
        assert_eq!(codec.decode_at(&envelope, at(1_005)).unwrap(), signal);
        assert_eq!(codec.decode_at(&envelope, at(1_010)).unwrap(), signal);
    }

    #[test]
    fn expired_after_ttl() {
        let codec = SignalCodec::default();
        let envelope = codec
            .encode_at(Role::Responder, &json!({"type": "answer"}), at(2_000))
            .unwrap();
        let err = codec.decode_at(&envelope, at(2_011)).unwrap_err();
        assert!(matches!(err, SignalError::Expired { expires_at: 2_010 }));
    }

    #[test]
    fn tampered_fields_are_invalid() {
        let codec = SignalCodec::default();
        let envelope = codec
            .encode_at(Role::Initiator, &json!("offer"), at(3_000))
            .unwrap();

        let mut extended = envelope.clone();
        extended.expires_at += 60;
        assert!(matches!(
            codec.decode_at(&extended, at(3_001)),
            Err(SignalError::Invalid(_))
        ));

        let mut flipped = envelope.clone();
        flipped.role = Role::Responder;
        assert!(matches!(
            codec.decode_at(&flipped, at(3_001)),
            Err(SignalError::Invalid(_))
        ));

        let mut garbled = envelope;
        garbled.payload.push('x');
        assert!(matches!(
            codec.decode_at(&garbled, at(3_001)),
            Err(SignalError::Invalid(_))
        ));
    }

    #[test]
    fn foreign_secret_is_invalid() {
        let ours = SignalCodec::default();
        let theirs = SignalCodec::new("another-label", DEFAULT_SIGNAL_TTL);
        let envelope = theirs
            .encode_at(Role::Initiator, &json!({"type": "offer"}), at(4_000))
            .unwrap();
        assert!(matches!(
            ours.decode_at(&envelope, at(4_001)),
            Err(SignalError::Invalid(_))
        ));
    }

    #[test]
    fn envelope_uses_camel_case_fields() {
        let codec = SignalCodec::default();
        let envelope = codec
            .encode_at(Role::Initiator, &json!({}), at(5_000))
            .unwrap();
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["role"], "initiator");
        assert_eq!(value["issuedAt"], 5_000);
        assert_eq!(value["expiresAt"], 5_010);
        assert!(value["payload"].is_string());
    }
}
