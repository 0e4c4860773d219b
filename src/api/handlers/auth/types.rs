use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

/// Fields posted by the login form.
#[derive(ToSchema, Deserialize, Default)]
pub struct LoginForm {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

impl fmt::Debug for LoginForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginForm")
            .field("email", &self.email)
            .field("password", &"***")
            .finish()
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct DepartmentResponse {
    pub success: bool,
    pub department: String,
    pub user_type: String,
    pub user_id: i64,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct DepartmentErrorResponse {
    pub success: bool,
    pub message: String,
}
