//! The signed-in user.

use serde::{Deserialize, Serialize};

/// Profile of the signed-in user, persisted under the `userProfile` key.
///
/// Built once at login from the id token claims plus the server role lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub role: String,
    pub contact_number: String,
}

impl UserProfile {
    pub fn full_name(&self) -> String {
        match (self.first_name.is_empty(), self.last_name.is_empty()) {
            (false, false) => format!("{} {}", self.first_name, self.last_name),
            (false, true) => self.first_name.clone(),
            (true, false) => self.last_name.clone(),
            (true, true) => self.email.clone(),
        }
    }
}

/// Body returned by `GET /user/role`.
#[derive(Debug, Deserialize)]
pub struct RoleResponse {
    pub role: String,
}
