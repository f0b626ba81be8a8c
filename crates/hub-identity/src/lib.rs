//! User accounts, device enrollment, and bearer-token authentication.
//!
//! A [`Identity`] owns the HMAC signing secret and wraps [`hub_store`]'s
//! user/device tables with the actual crypto: Argon2 for passwords,
//! HMAC-SHA256 for issued user tokens, SHA-256 for device tokens.

pub mod device_token;
pub mod passwords;
pub mod user_token;

use std::sync::Arc;

use hub_domain::error::{Error, Result};
use hub_domain::principal::Principal;
use hub_store::models::{Device, User};
use hub_store::Db;

pub struct Identity {
    db: Arc<Db>,
    hmac_secret: Vec<u8>,
    user_token_ttl_secs: i64,
}

impl Identity {
    pub fn new(db: Arc<Db>, hmac_secret: Vec<u8>, user_token_ttl_secs: i64) -> Self {
        Self {
            db,
            hmac_secret,
            user_token_ttl_secs,
        }
    }

    pub fn needs_setup(&self) -> Result<bool> {
        let conn = self.db.lock();
        Ok(hub_store::users::count_users(&conn)? == 0)
    }

    /// First-run bootstrap: create the initial admin account. Refuses
    /// once any user exists — re-running setup is not how you add users.
    pub fn setup(&self, username: &str, password: &str) -> Result<(User, String)> {
        let conn = self.db.lock();
        if hub_store::users::count_users(&conn)? > 0 {
            return Err(Error::SetupAlreadyDone);
        }
        let hash = passwords::hash_password(password)?;
        let user = hub_store::users::create_user(
            &conn,
            &uuid::Uuid::new_v4().to_string(),
            username,
            &hash,
            true,
        )?;
        drop(conn);
        let token = self.issue_user_token(&user)?;
        Ok((user, token))
    }

    pub fn create_user(&self, username: &str, password: &str, is_admin: bool) -> Result<User> {
        let conn = self.db.lock();
        if hub_store::users::get_user_by_username(&conn, username)?.is_some() {
            return Err(Error::ValidationFailed(format!(
                "username {username} already taken"
            )));
        }
        let hash = passwords::hash_password(password)?;
        hub_store::users::create_user(&conn, &uuid::Uuid::new_v4().to_string(), username, &hash, is_admin)
    }

    pub fn login(&self, username: &str, password: &str) -> Result<(User, String)> {
        let conn = self.db.lock();
        let user = hub_store::users::get_user_by_username(&conn, username)?
            .ok_or(Error::InvalidCredentials)?;
        if !passwords::verify_password(password, &user.password_hash)? {
            return Err(Error::InvalidCredentials);
        }
        hub_store::users::record_login(&conn, &user.id)?;
        drop(conn);
        let token = self.issue_user_token(&user)?;
        Ok((user, token))
    }

    fn issue_user_token(&self, user: &User) -> Result<String> {
        user_token::issue(&self.hmac_secret, &user.id, user.is_admin, self.user_token_ttl_secs)
    }

    /// Enroll a device under a user, returning its plaintext token. The
    /// plaintext is never stored or retrievable again — only its digest
    /// lives in `hub_store`.
    pub fn register_device(&self, user_id: &str, requested_display_name: &str) -> Result<(Device, String)> {
        let conn = self.db.lock();
        let display_name =
            hub_store::devices::disambiguate_display_name(&conn, user_id, requested_display_name)?;
        let plain_token = device_token::generate_token();
        let hashed = device_token::hash_token(&plain_token);
        let device = hub_store::devices::create_device(
            &conn,
            &uuid::Uuid::new_v4().to_string(),
            user_id,
            &display_name,
            &hashed,
        )?;
        Ok((device, plain_token))
    }

    /// Resolve a bearer token to a [`Principal`]. Tries the device-token
    /// table first (one indexed lookup) before falling back to
    /// verifying it as a signed user token.
    pub fn authenticate(&self, bearer: &str) -> Result<Principal> {
        let hashed = device_token::hash_token(bearer);
        let device = {
            let conn = self.db.lock();
            hub_store::devices::get_by_hashed_token(&conn, &hashed)?
        };
        if let Some(device) = device {
            return Ok(Principal::Device {
                device_id: device.id,
                user_id: device.user_id,
            });
        }

        let claims = user_token::verify(&self.hmac_secret, bearer)?;
        Ok(Principal::User {
            user_id: claims.user_id,
            is_admin: claims.is_admin,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Identity {
        let db = Arc::new(Db::open_in_memory().unwrap());
        Identity::new(db, b"test-secret".to_vec(), 3600)
    }

    #[test]
    fn setup_then_login_round_trips() {
        let id = identity();
        assert!(id.needs_setup().unwrap());

        let (user, _token) = id.setup("admin", "hunter2").unwrap();
        assert!(user.is_admin);
        assert!(!id.needs_setup().unwrap());

        let (logged_in, token) = id.login("admin", "hunter2").unwrap();
        assert_eq!(logged_in.id, user.id);

        let principal = id.authenticate(&token).unwrap();
        match principal {
            Principal::User { user_id, is_admin } => {
                assert_eq!(user_id, user.id);
                assert!(is_admin);
            }
            Principal::Device { .. } => panic!("expected a user principal"),
        }
    }

    #[test]
    fn setup_refuses_once_a_user_exists() {
        let id = identity();
        id.setup("admin", "hunter2").unwrap();
        assert!(id.setup("someone-else", "whatever").is_err());
    }

    #[test]
    fn wrong_password_is_rejected() {
        let id = identity();
        id.setup("admin", "hunter2").unwrap();
        assert!(id.login("admin", "wrong").is_err());
    }

    #[test]
    fn device_registration_and_authentication() {
        let id = identity();
        let (user, _) = id.setup("admin", "hunter2").unwrap();
        let (device, token) = id.register_device(&user.id, "Kitchen").unwrap();

        let principal = id.authenticate(&token).unwrap();
        match principal {
            Principal::Device { device_id, user_id } => {
                assert_eq!(device_id, device.id);
                assert_eq!(user_id, user.id);
            }
            Principal::User { .. } => panic!("expected a device principal"),
        }
    }

    #[test]
    fn unrecognized_bearer_is_rejected() {
        let id = identity();
        assert!(id.authenticate("not-a-real-token").is_err());
    }
}
