//! Department lookup for the signed-in student or teacher.

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use std::sync::Arc;
use tracing::error;

use super::{
    role::Role,
    session::require_role,
    state::AuthState,
    types::{DepartmentErrorResponse, DepartmentResponse},
};

#[utoipa::path(
    get,
    path = "/users/api/department",
    responses(
        (status = 200, description = "Department of the current user", body = DepartmentResponse),
        (status = 401, description = "No active session"),
        (status = 403, description = "Role is not allowed"),
        (status = 500, description = "Department could not be read", body = DepartmentErrorResponse)
    ),
    tag = "auth"
)]
pub async fn department(
    headers: HeaderMap,
    auth_state: Extension<Arc<AuthState>>,
) -> impl IntoResponse {
    let session = match require_role(&auth_state, &headers, &[Role::Student, Role::Teacher]).await
    {
        Ok(session) => session,
        Err(status) => return status.into_response(),
    };

    match auth_state
        .credentials()
        .department(session.role, session.user_id)
        .await
    {
        Ok(department) => {
            // Fall back to the value captured at login if the row has none.
            let department = department
                .or(session.department)
                .unwrap_or_default();
            let response = DepartmentResponse {
                success: true,
                department,
                user_type: session.user_type,
                user_id: session.user_id,
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(err) => {
            error!("Failed to read department: {err}");
            let response = DepartmentErrorResponse {
                success: false,
                message: format!("Error retrieving user department: {err}"),
            };
            (StatusCode::INTERNAL_SERVER_ERROR, Json(response)).into_response()
        }
    }
}
