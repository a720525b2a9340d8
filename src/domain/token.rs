//! Status list token claims.
//!
//! A published token is a compact JWS whose payload carries the list URI
//! (`sub`), issuer, validity and the compressed list in `status_list.lst`.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

use super::status_list::StatusList;
use crate::error::ServiceError;

/// `typ` header value of status list JWTs.
pub const TOKEN_TYPE: &str = "statuslist+jwt";

/// The `status_list` claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusListClaim {
    /// Bits per entry.
    pub bits: u8,
    /// Base64url (no padding) of the zlib compressed list bytes.
    pub lst: String,
    /// URI listing all lists of the same aggregation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation_uri: Option<String>,
}

/// Payload of a status list token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusListClaims {
    /// Public URI of the list.
    pub sub: String,
    /// Issuer of the list.
    pub iss: String,
    /// Issued at, seconds since the epoch.
    pub iat: i64,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
    /// Seconds a verifier may cache the token.
    pub ttl: u64,
    /// The list itself.
    pub status_list: StatusListClaim,
}

impl StatusListClaims {
    /// Decodes the embedded status list.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::InvalidRequest`] if `lst` is not valid
    /// base64url zlib data for `bits`.
    pub fn decode_list(&self) -> Result<StatusList, ServiceError> {
        StatusList::from_encoded(self.status_list.bits, &self.status_list.lst)
    }

    /// Decodes the embedded status list, which must hold exactly `size`
    /// entries.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::InvalidRequest`] if `lst` is malformed or
    /// inflates to any other length.
    pub fn decode_list_sized(&self, size: u64) -> Result<StatusList, ServiceError> {
        StatusList::from_encoded_sized(size, self.status_list.bits, &self.status_list.lst)
    }

    /// Reads the claims out of a compact JWS without verifying it.
    ///
    /// Only used on tokens this service wrote itself.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Internal`] if the token is not a three part
    /// compact JWS with a JSON payload.
    pub fn from_compact(token: &str) -> Result<Self, ServiceError> {
        let mut parts = token.split('.');
        let (Some(_header), Some(payload), Some(_signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ServiceError::Internal("malformed compact token".to_string()));
        };
        let payload = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|e| ServiceError::Internal(format!("token payload: {e}")))?;
        serde_json::from_slice(&payload)
            .map_err(|e| ServiceError::Internal(format!("token claims: {e}")))
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    fn claims() -> StatusListClaims {
        StatusListClaims {
            sub: "https://status.example.com/1".to_string(),
            iss: "https://issuer.example.com".to_string(),
            iat: 1_700_000_000,
            exp: 1_700_086_400,
            ttl: 60,
            status_list: StatusListClaim {
                bits: 1,
                lst: "eNrbuRgAAhcBXQ".to_string(),
                aggregation_uri: None,
            },
        }
    }

    #[test]
    fn absent_aggregation_uri_is_omitted() {
        let json = serde_json::to_string(&claims()).unwrap_or_default();
        assert!(!json.contains("aggregation_uri"));
        assert!(json.contains("\"status_list\":{\"bits\":1,\"lst\":\"eNrbuRgAAhcBXQ\"}"));
    }

    #[test]
    fn decodes_embedded_list() {
        let Ok(list) = claims().decode_list() else {
            panic!("lst should decode");
        };
        assert_eq!(list.get(0).ok(), Some(1));
        assert_eq!(list.get(1).ok(), Some(0));
    }

    #[test]
    fn reads_claims_from_compact_token() {
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims()).unwrap_or_default());
        let token = format!("e30.{payload}.c2ln");
        let Ok(parsed) = StatusListClaims::from_compact(&token) else {
            panic!("token should parse");
        };
        assert_eq!(parsed, claims());
    }

    #[test]
    fn rejects_tokens_without_three_parts() {
        assert!(StatusListClaims::from_compact("a.b").is_err());
        assert!(StatusListClaims::from_compact("a.b.c.d").is_err());
    }
}
