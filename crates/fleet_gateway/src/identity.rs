//! Caller identity, as asserted by the authenticating proxy in front of the
//! gateway.

use crate::error::ApiError;
use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use fleet_core::{Caller, Role};
use uuid::Uuid;

pub const USER_HEADER: &str = "x-fleet-user";
pub const ROLE_HEADER: &str = "x-fleet-role";

/// Extractor for the request's [`Caller`]. Rejects with 401 when either
/// header is missing or unreadable.
#[derive(Debug, Clone, Copy)]
pub struct Identity(pub Caller);

fn header<'a>(parts: &'a Parts, name: &str) -> Result<&'a str, ApiError> {
    parts
        .headers
        .get(name)
        .ok_or_else(|| ApiError::Unauthenticated(format!("missing {} header", name)))?
        .to_str()
        .map(str::trim)
        .map_err(|_| ApiError::Unauthenticated(format!("unreadable {} header", name)))
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Identity {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id: Uuid = header(parts, USER_HEADER)?
            .parse()
            .map_err(|_| ApiError::Unauthenticated(format!("{} is not a UUID", USER_HEADER)))?;
        let role: Role = header(parts, ROLE_HEADER)?
            .parse()
            .map_err(|_| ApiError::Unauthenticated(format!("unknown role in {}", ROLE_HEADER)))?;
        Ok(Identity(Caller::new(user_id, role)))
    }
}
