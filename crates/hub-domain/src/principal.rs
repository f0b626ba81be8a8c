//! The authenticated caller of a request: either an end user or a device
//! presenting its long-lived device token. Kept here (rather than in
//! `hub-identity`) because both the API layer and the agent loop need to
//! name it without depending on the token-verification machinery.

#[derive(Debug, Clone)]
pub enum Principal {
    User { user_id: String, is_admin: bool },
    Device { device_id: String, user_id: String },
}

impl Principal {
    pub fn user_id(&self) -> &str {
        match self {
            Principal::User { user_id, .. } => user_id,
            Principal::Device { user_id, .. } => user_id,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Principal::User { is_admin: true, .. })
    }

    pub fn device_id(&self) -> Option<&str> {
        match self {
            Principal::Device { device_id, .. } => Some(device_id),
            Principal::User { .. } => None,
        }
    }
}
