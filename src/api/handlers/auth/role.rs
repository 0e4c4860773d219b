//! User roles and their fixed destinations.

use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

/// The four disjoint identity kinds. Each one lives in its own table.
#[derive(ToSchema, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Registrar,
    #[serde(rename = "Department Admin")]
    DepartmentAdmin,
    Teacher,
    Student,
}

impl Role {
    /// Lookup order used by the authenticator; the first verified match wins.
    pub const PRIORITY: [Self; 4] = [
        Self::Registrar,
        Self::DepartmentAdmin,
        Self::Teacher,
        Self::Student,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Registrar => "Registrar",
            Self::DepartmentAdmin => "Department Admin",
            Self::Teacher => "Teacher",
            Self::Student => "Student",
        }
    }

    /// Lower-cased role name stored alongside the session for coarse checks.
    #[must_use]
    pub fn user_type(self) -> String {
        self.as_str().to_lowercase()
    }

    /// Page the browser lands on after a successful login.
    #[must_use]
    pub const fn landing_path(self) -> &'static str {
        match self {
            Self::Registrar => "/registrar/registrar.php",
            Self::DepartmentAdmin => "/department-admin/dept-admin.php",
            Self::Teacher | Self::Student => "/users/users_browse_room.php",
        }
    }

    #[must_use]
    pub const fn table(self) -> &'static str {
        match self {
            Self::Registrar => "registrar",
            Self::DepartmentAdmin => "dept_admin",
            Self::Teacher => "teacher",
            Self::Student => "student",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::Role;
    use anyhow::Result;

    #[test]
    fn priority_order_is_fixed() {
        assert_eq!(
            Role::PRIORITY,
            [
                Role::Registrar,
                Role::DepartmentAdmin,
                Role::Teacher,
                Role::Student
            ]
        );
    }

    #[test]
    fn user_type_is_lowercase_role_name() {
        assert_eq!(Role::Registrar.user_type(), "registrar");
        assert_eq!(Role::DepartmentAdmin.user_type(), "department admin");
        assert_eq!(Role::Teacher.user_type(), "teacher");
        assert_eq!(Role::Student.user_type(), "student");
    }

    #[test]
    fn landing_paths_are_deterministic() {
        assert_eq!(Role::Registrar.landing_path(), "/registrar/registrar.php");
        assert_eq!(
            Role::DepartmentAdmin.landing_path(),
            "/department-admin/dept-admin.php"
        );
        assert_eq!(
            Role::Teacher.landing_path(),
            Role::Student.landing_path()
        );
    }

    #[test]
    fn serializes_with_display_name() -> Result<()> {
        let value = serde_json::to_value(Role::DepartmentAdmin)?;
        assert_eq!(value, serde_json::json!("Department Admin"));
        let role: Role = serde_json::from_value(serde_json::json!("Student"))?;
        assert_eq!(role, Role::Student);
        Ok(())
    }
}
