//! Authentication for both API surfaces.
//!
//! Ingest requests present `X-Api-Key: proj_<hex>`; only the SHA-256 of the
//! key is ever compared or stored, and lookups go through a short-TTL
//! process-local cache that key rotation invalidates. Dashboard requests
//! present a short-lived bearer JWT whose subject is the user id, plus an
//! `X-Project-Id` header; a project outside the user's memberships answers
//! 404 so tenants cannot be probed apart from missing resources.

use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use chrono::Utc;
use dashmap::DashMap;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use vg_core::keys;
use vg_core::types::{Project, Role, User};
use vg_store::Store;

use crate::api_error::ApiError;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const PROJECT_HEADER: &str = "x-project-id";

// ---------------------------------------------------------------------------
// Project cache (key-hash -> project)
// ---------------------------------------------------------------------------

/// Process-local cache for the hot ingest-auth lookup.
pub struct ProjectCache {
    entries: DashMap<String, (Project, Instant)>,
    ttl: Duration,
}

impl ProjectCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, key_hash: &str) -> Option<Project> {
        let entry = self.entries.get(key_hash)?;
        let (project, cached_at) = entry.value();
        if cached_at.elapsed() > self.ttl {
            drop(entry);
            self.entries.remove(key_hash);
            return None;
        }
        Some(project.clone())
    }

    pub fn put(&self, key_hash: String, project: Project) {
        self.entries.insert(key_hash, (project, Instant::now()));
    }

    /// Called on rotation and project deletion so a revoked key stops
    /// authenticating before the TTL runs out.
    pub fn invalidate(&self, key_hash: &str) {
        self.entries.remove(key_hash);
    }
}

/// Resolve an ingest API key to its active project.
///
/// Failures log the key preview only, never the key itself.
pub async fn authenticate_api_key(
    store: &Store,
    cache: &ProjectCache,
    headers: &HeaderMap,
) -> Result<Project, ApiError> {
    let presented = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or(ApiError::Unauthorized)?;

    let key_hash = keys::hash_api_key(presented);
    if let Some(project) = cache.get(&key_hash) {
        return Ok(project);
    }

    match store.get_project_by_key_hash(&key_hash).await? {
        Some(project) => {
            cache.put(key_hash, project.clone());
            Ok(project)
        }
        None => {
            warn!(key_preview = %keys::preview_of(presented), "unknown or inactive api key");
            Err(ApiError::Unauthorized)
        }
    }
}

// ---------------------------------------------------------------------------
// Bearer tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
    iat: i64,
}

/// Issue a short-lived bearer token for a user. Token creation itself
/// belongs to the external identity service; this exists for it, for
/// operational tooling, and for tests.
pub fn issue_token(user_id: Uuid, secret: &str, ttl_minutes: i64) -> Result<String, ApiError> {
    let now = Utc::now();
    let claims = Claims {
        sub: user_id.to_string(),
        iat: now.timestamp(),
        exp: (now + chrono::Duration::minutes(ttl_minutes)).timestamp(),
    };
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| ApiError::Internal(format!("token encode: {e}")))
}

fn decode_token(token: &str, secret: &str) -> Result<Uuid, ApiError> {
    let data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map_err(|_| ApiError::Unauthorized)?;
    data.claims.sub.parse().map_err(|_| ApiError::Unauthorized)
}

// ---------------------------------------------------------------------------
// Dashboard auth context
// ---------------------------------------------------------------------------

/// Established identity of a dashboard request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user: User,
    pub project_id: Uuid,
    pub role: Role,
}

impl AuthContext {
    /// Role gate. Insufficient role is 403; tenant mismatch never reaches
    /// this point (it is already 404).
    pub fn require(&self, required: Role) -> Result<(), ApiError> {
        if self.role.allows(required) {
            Ok(())
        } else {
            Err(ApiError::Forbidden)
        }
    }
}

/// Token-only authentication: decode the bearer JWT and load the user.
/// Project-less endpoints (project creation, metrics) stop here.
pub async fn authenticate_user(
    store: &Store,
    jwt_secret: &str,
    headers: &HeaderMap,
) -> Result<User, ApiError> {
    if jwt_secret.is_empty() {
        return Err(ApiError::Unauthorized);
    }
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    let user_id = decode_token(token, jwt_secret)?;
    store.get_user(user_id).await?.ok_or(ApiError::Unauthorized)
}

/// Authenticate a dashboard request: bearer token plus `X-Project-Id`.
pub async fn authenticate_bearer(
    store: &Store,
    jwt_secret: &str,
    headers: &HeaderMap,
) -> Result<AuthContext, ApiError> {
    let user = authenticate_user(store, jwt_secret, headers).await?;

    let project_id: Uuid = headers
        .get(PROJECT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or(ApiError::Unauthorized)?;

    // Cross-tenant access is indistinguishable from a missing resource.
    let role = user.role_in(project_id).ok_or(ApiError::NotFound)?;

    Ok(AuthContext {
        user,
        project_id,
        role,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use vg_core::types::Membership;

    async fn store_with_project_and_user() -> (Store, Project, User, String) {
        let store = Store::open_in_memory().await.unwrap();
        let generated = keys::generate_api_key();
        let project = Project::new("api", generated.hash.clone(), generated.preview.clone());
        store.upsert_project(&project).await.unwrap();

        let user = User {
            id: Uuid::new_v4(),
            email: "dev@example.com".into(),
            credential_hash: "h".into(),
            memberships: vec![Membership {
                project_id: project.id,
                role: Role::Developer,
            }],
            created_at: Utc::now(),
        };
        store.upsert_user(&user).await.unwrap();
        (store, project, user, generated.plaintext)
    }

    fn api_key_headers(key: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_str(key).unwrap());
        headers
    }

    #[tokio::test]
    async fn valid_api_key_resolves_project_and_caches() {
        let (store, project, _, plaintext) = store_with_project_and_user().await;
        let cache = ProjectCache::new(Duration::from_secs(30));

        let resolved = authenticate_api_key(&store, &cache, &api_key_headers(&plaintext))
            .await
            .unwrap();
        assert_eq!(resolved.id, project.id);
        assert!(cache.get(&keys::hash_api_key(&plaintext)).is_some());
    }

    #[tokio::test]
    async fn wrong_api_key_is_unauthorized() {
        let (store, _, _, _) = store_with_project_and_user().await;
        let cache = ProjectCache::new(Duration::from_secs(30));
        let err = authenticate_api_key(&store, &cache, &api_key_headers("proj_wrong"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized));
    }

    #[tokio::test]
    async fn rotation_invalidates_cache_entry() {
        let (store, project, _, plaintext) = store_with_project_and_user().await;
        let cache = ProjectCache::new(Duration::from_secs(30));
        authenticate_api_key(&store, &cache, &api_key_headers(&plaintext))
            .await
            .unwrap();

        let old_hash = keys::hash_api_key(&plaintext);
        let rotated = keys::generate_api_key();
        store
            .rotate_project_key(project.id, &rotated.hash, &rotated.preview)
            .await
            .unwrap();
        cache.invalidate(&old_hash);

        let err = authenticate_api_key(&store, &cache, &api_key_headers(&plaintext))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized));
    }

    fn bearer_headers(token: &str, project_id: Uuid) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers.insert(
            PROJECT_HEADER,
            HeaderValue::from_str(&project_id.to_string()).unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn bearer_round_trip_yields_role() {
        let (store, project, user, _) = store_with_project_and_user().await;
        let token = issue_token(user.id, "secret", 60).unwrap();
        let ctx = authenticate_bearer(&store, "secret", &bearer_headers(&token, project.id))
            .await
            .unwrap();
        assert_eq!(ctx.role, Role::Developer);
        assert!(ctx.require(Role::Viewer).is_ok());
        assert!(matches!(
            ctx.require(Role::Admin).unwrap_err(),
            ApiError::Forbidden
        ));
    }

    #[tokio::test]
    async fn foreign_project_is_not_found() {
        let (store, _, user, _) = store_with_project_and_user().await;
        let token = issue_token(user.id, "secret", 60).unwrap();
        let err = authenticate_bearer(&store, "secret", &bearer_headers(&token, Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound));
    }

    #[tokio::test]
    async fn bad_or_foreign_signature_is_unauthorized() {
        let (store, project, user, _) = store_with_project_and_user().await;
        let token = issue_token(user.id, "other-secret", 60).unwrap();
        let err = authenticate_bearer(&store, "secret", &bearer_headers(&token, project.id))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized));
    }

    #[tokio::test]
    async fn expired_token_is_unauthorized() {
        let (store, project, user, _) = store_with_project_and_user().await;
        let token = issue_token(user.id, "secret", -5).unwrap();
        let err = authenticate_bearer(&store, "secret", &bearer_headers(&token, project.id))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized));
    }
}
