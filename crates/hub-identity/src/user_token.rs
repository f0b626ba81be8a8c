//! HMAC-signed bearer tokens issued to users on login.
//!
//! The token is `"<user_id>.<is_admin>.<expires_unix>.<signature>"` —
//! deliberately not a JWT, since the Hub only ever needs to verify its
//! own signature over a handful of fields, not interop with a third
//! party. Stateless: no session table to look up on every request.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use hub_domain::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

pub struct Claims {
    pub user_id: String,
    pub is_admin: bool,
}

fn payload(user_id: &str, is_admin: bool, expires_unix: i64) -> String {
    format!("{user_id}.{}.{expires_unix}", is_admin as u8)
}

fn sign(secret: &[u8], payload: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| Error::Internal(format!("invalid hmac key: {e}")))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Issue a token for `user_id` valid for `ttl_secs` seconds from now.
pub fn issue(secret: &[u8], user_id: &str, is_admin: bool, ttl_secs: i64) -> Result<String> {
    let expires_unix = chrono::Utc::now().timestamp() + ttl_secs;
    let body = payload(user_id, is_admin, expires_unix);
    let sig = sign(secret, &body)?;
    Ok(format!("{body}.{sig}"))
}

/// Verify a token's signature and expiry, returning its claims.
pub fn verify(secret: &[u8], token: &str) -> Result<Claims> {
    let mut parts = token.rsplitn(2, '.');
    let sig = parts.next().ok_or(Error::TokenExpired)?;
    let body = parts.next().ok_or(Error::TokenExpired)?;

    let expected_sig = sign(secret, body)?;
    if !bool::from(sig.as_bytes().ct_eq(expected_sig.as_bytes())) {
        return Err(Error::TokenExpired);
    }

    let mut fields = body.splitn(3, '.');
    let user_id = fields.next().ok_or(Error::TokenExpired)?.to_string();
    let is_admin = fields.next().ok_or(Error::TokenExpired)? == "1";
    let expires_unix: i64 = fields
        .next()
        .ok_or(Error::TokenExpired)?
        .parse()
        .map_err(|_| Error::TokenExpired)?;

    if chrono::Utc::now().timestamp() > expires_unix {
        return Err(Error::TokenExpired);
    }

    Ok(Claims { user_id, is_admin })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let secret = b"test-secret";
        let token = issue(secret, "u1", true, 3600).unwrap();
        let claims = verify(secret, &token).unwrap();
        assert_eq!(claims.user_id, "u1");
        assert!(claims.is_admin);
    }

    #[test]
    fn expired_token_is_rejected() {
        let secret = b"test-secret";
        let token = issue(secret, "u1", false, -1).unwrap();
        assert!(verify(secret, &token).is_err());
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let secret = b"test-secret";
        let mut token = issue(secret, "u1", false, 3600).unwrap();
        token.push('f');
        assert!(verify(secret, &token).is_err());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = issue(b"secret-a", "u1", false, 3600).unwrap();
        assert!(verify(b"secret-b", &token).is_err());
    }
}
