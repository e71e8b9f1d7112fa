//! Request identity. Authentication happens upstream; the gateway forwards
//! the resolved session as `x-user-id` and `x-user-role` headers.

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{HeaderMap, StatusCode, request::Parts},
    response::Json,
};
use serde::{Deserialize, Serialize};

use crate::api::ApiResponse;
use crate::errors::{ApiError, ErrorContext};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Admin,
    Superadmin,
}

impl Role {
    /// Unknown or missing roles are treated as `student`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "admin" => Role::Admin,
            "superadmin" => Role::Superadmin,
            _ => Role::Student,
        }
    }

    pub fn is_admin(self) -> bool {
        matches!(self, Role::Admin | Role::Superadmin)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser {
    pub user_id: String,
    pub role: Role,
}

impl CurrentUser {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, ApiError> {
        let user_id = headers
            .get(USER_ID_HEADER)
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ApiError::Unauthorized("missing user identity".to_string()))?;

        let role = headers
            .get(USER_ROLE_HEADER)
            .and_then(|h| h.to_str().ok())
            .map(Role::parse)
            .unwrap_or(Role::Student);

        Ok(Self {
            user_id: user_id.to_string(),
            role,
        })
    }

    pub fn can_view_attempt_of(&self, owner_id: &str) -> bool {
        self.role.is_admin() || self.user_id == owner_id
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<ApiResponse<()>>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        CurrentUser::from_headers(&parts.headers).map_err(|e| {
            e.to_response_with_context(ErrorContext::new("authenticate", "session"))
        })
    }
}

/// A caller with the `admin` or `superadmin` role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminUser(pub CurrentUser);

#[async_trait]
impl<S> FromRequestParts<S> for AdminUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<ApiResponse<()>>);

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let user = CurrentUser::from_request_parts(parts, state).await?;
        if !user.role.is_admin() {
            let context = ErrorContext::new("authorize_admin", "session").with_id(&user.user_id);
            return Err(ApiError::Forbidden("admin role required".to_string())
                .to_response_with_context(context));
        }
        Ok(AdminUser(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(user: Option<&str>, role: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(user) = user {
            headers.insert(USER_ID_HEADER, HeaderValue::from_str(user).unwrap());
        }
        if let Some(role) = role {
            headers.insert(USER_ROLE_HEADER, HeaderValue::from_str(role).unwrap());
        }
        headers
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!(Role::parse("ADMIN"), Role::Admin);
        assert_eq!(Role::parse("superadmin"), Role::Superadmin);
        assert_eq!(Role::parse("student"), Role::Student);
        assert_eq!(Role::parse("teacher"), Role::Student);
        assert!(Role::Superadmin.is_admin());
        assert!(!Role::Student.is_admin());
    }

    #[test]
    fn test_identity_from_headers() {
        let user = CurrentUser::from_headers(&headers(Some("u-1"), None)).unwrap();
        assert_eq!(user.user_id, "u-1");
        assert_eq!(user.role, Role::Student);

        let admin = CurrentUser::from_headers(&headers(Some("u-2"), Some("admin"))).unwrap();
        assert!(admin.role.is_admin());

        assert!(matches!(
            CurrentUser::from_headers(&headers(None, Some("admin"))),
            Err(ApiError::Unauthorized(_))
        ));
        assert!(matches!(
            CurrentUser::from_headers(&headers(Some("   "), None)),
            Err(ApiError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_attempt_visibility() {
        let student = CurrentUser {
            user_id: "u-1".to_string(),
            role: Role::Student,
        };
        assert!(student.can_view_attempt_of("u-1"));
        assert!(!student.can_view_attempt_of("u-2"));

        let admin = CurrentUser {
            user_id: "a-1".to_string(),
            role: Role::Admin,
        };
        assert!(admin.can_view_attempt_of("u-2"));
    }
}
