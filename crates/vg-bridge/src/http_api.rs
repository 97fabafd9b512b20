//! Router assembly: every route of the ingestion and dashboard APIs, with
//! the quota, metrics, and request-id layers applied.

use std::sync::Arc;

use axum::http::HeaderValue;
use axum::{
    middleware as axum_middleware,
    routing::{delete, get, patch, post},
    Router,
};
use tower_http::cors::{AllowOrigin, CorsLayer};

use vg_telemetry::middleware::{metrics_middleware, request_id_middleware};

use crate::quota_middleware::quota_middleware;
use crate::state::ApiState;
use crate::{
    analytics_api, deployments_api, errors_api, health_api, ingest_api, projects_api,
    reports_api, rules_api, team_api,
};

/// Build the full API router.
pub fn api_router(state: Arc<ApiState>) -> Router {
    let cors = if state.config.server.cors_origins.is_empty() {
        CorsLayer::very_permissive()
    } else {
        let origins: Vec<HeaderValue> = state
            .config
            .server
            .cors_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::very_permissive().allow_origin(AllowOrigin::list(origins))
    };

    Router::new()
        // Ingestion
        .route("/api/errors", post(ingest_api::ingest_error))
        // Error groups
        .route("/api/errors", get(errors_api::list_errors))
        .route("/api/errors/{id}", get(errors_api::get_error))
        .route("/api/errors/{id}", patch(errors_api::update_error_status))
        .route(
            "/api/errors/{id}/assignment",
            patch(errors_api::update_error_assignment),
        )
        .route("/api/errors/{id}", delete(errors_api::delete_error))
        // Analytics
        .route("/api/analytics/overview", get(analytics_api::overview))
        .route("/api/analytics/trends", get(analytics_api::trends))
        .route("/api/analytics/top-errors", get(analytics_api::top_errors))
        .route("/api/analytics/patterns", get(analytics_api::patterns))
        .route(
            "/api/analytics/related-errors",
            get(analytics_api::related_errors),
        )
        .route("/api/analytics/user-impact", get(analytics_api::user_impact))
        .route("/api/analytics/resolution", get(analytics_api::resolution))
        // Alert rules
        .route("/api/alert-rules", get(rules_api::list_rules))
        .route("/api/alert-rules", post(rules_api::create_rule))
        .route("/api/alert-rules/{id}", get(rules_api::get_rule))
        .route("/api/alert-rules/{id}", patch(rules_api::update_rule))
        .route("/api/alert-rules/{id}", delete(rules_api::delete_rule))
        .route("/api/alert-rules/{id}/test", post(rules_api::test_rule))
        // Team
        .route("/api/team/members", get(team_api::list_members))
        .route("/api/team/members", post(team_api::create_member))
        .route("/api/team/members/{id}", patch(team_api::update_member))
        .route("/api/team/members/{id}", delete(team_api::delete_member))
        .route("/api/team/performance", get(team_api::team_performance))
        // Reports
        .route("/api/reports/generate", post(reports_api::generate_report))
        .route("/api/reports/runs", get(reports_api::list_runs))
        .route("/api/reports/runs/{id}", get(reports_api::get_run))
        .route(
            "/api/reports/runs/{id}/download",
            get(reports_api::download_run),
        )
        .route("/api/reports/runs/{id}/share", post(reports_api::share_run))
        .route("/api/reports/share/{token}", get(reports_api::shared_run))
        .route("/api/reports/schedules", get(reports_api::list_schedules))
        .route("/api/reports/schedules", post(reports_api::create_schedule))
        .route(
            "/api/reports/schedules/{id}",
            patch(reports_api::update_schedule),
        )
        .route(
            "/api/reports/schedules/{id}",
            delete(reports_api::delete_schedule),
        )
        .route(
            "/api/reports/schedules/{id}/run",
            post(reports_api::run_schedule_now),
        )
        // Deployments
        .route(
            "/api/deployments",
            get(deployments_api::list_deployments),
        )
        .route(
            "/api/deployments",
            post(deployments_api::create_deployment),
        )
        // Projects
        .route("/api/projects", get(projects_api::list_projects))
        .route("/api/projects", post(projects_api::create_project))
        .route("/api/projects/{id}", patch(projects_api::update_project))
        .route(
            "/api/projects/{id}/rotate-key",
            post(projects_api::rotate_project_key),
        )
        .route("/api/projects/{id}", delete(projects_api::delete_project))
        // Health & metrics
        .route("/health", get(health_api::health))
        .route("/health/db", get(health_api::health_db))
        .route("/health/cache", get(health_api::health_cache))
        .route("/api/metrics", get(health_api::metrics))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            quota_middleware,
        ))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            crate::quota_middleware::timeout_middleware,
        ))
        .layer(axum_middleware::from_fn(metrics_middleware))
        .layer(axum_middleware::from_fn(request_id_middleware))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use serde_json::json;
    use tower::ServiceExt;
    use uuid::Uuid;

    use vg_core::config::Config;
    use vg_core::keys;
    use vg_core::types::{Membership, Project, Role, ScrubPolicy, User};
    use vg_store::Store;

    use crate::auth::issue_token;

    struct Harness {
        app: Router,
        store: Arc<Store>,
        project: Project,
        api_key: String,
        viewer_token: String,
        developer_token: String,
        admin_token: String,
    }

    async fn harness() -> Harness {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let generated = keys::generate_api_key();
        let mut project = Project::new("api", generated.hash.clone(), generated.preview.clone());
        project.scrub_policy = ScrubPolicy {
            remove_emails: true,
            ..ScrubPolicy::default()
        };
        store.upsert_project(&project).await.unwrap();

        let mut tokens = Vec::new();
        let mut config = Config::default();
        config.auth.jwt_secret = "test-secret".into();
        for role in [Role::Viewer, Role::Developer, Role::Admin] {
            let user = User {
                id: Uuid::new_v4(),
                email: format!("{role:?}@example.com").to_lowercase(),
                credential_hash: "h".into(),
                memberships: vec![Membership {
                    project_id: project.id,
                    role,
                }],
                created_at: Utc::now(),
            };
            store.upsert_user(&user).await.unwrap();
            tokens.push(issue_token(user.id, "test-secret", 60).unwrap());
        }

        let state = ApiState::new(store.clone(), config);
        Harness {
            app: api_router(state),
            store,
            project,
            api_key: generated.plaintext,
            viewer_token: tokens.remove(0),
            developer_token: tokens.remove(0),
            admin_token: tokens.remove(0),
        }
    }

    fn ingest_request(api_key: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/errors")
            .header("content-type", "application/json")
            .header("x-api-key", api_key)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn dashboard_request(
        method: &str,
        uri: &str,
        token: &str,
        project_id: Uuid,
        body: Option<serde_json::Value>,
    ) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {token}"))
            .header("x-project-id", project_id.to_string())
            .header("content-type", "application/json");
        match body {
            Some(body) => builder.body(Body::from(body.to_string())).unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn sample_event() -> serde_json::Value {
        json!({
            "message": "TypeError: x of undefined",
            "stackTrace": [{ "file": "a.js", "line": 10, "function": "f" }],
            "environment": "production"
        })
    }

    #[tokio::test]
    async fn ingest_creates_group_and_returns_201() {
        let h = harness().await;
        let resp = h
            .app
            .clone()
            .oneshot(ingest_request(&h.api_key, sample_event()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body = json_body(resp).await;
        assert_eq!(body["count"], 1);
        assert!(body["errorId"].is_string());
        assert_eq!(body["fingerprint"].as_str().unwrap().len(), 32);
    }

    #[tokio::test]
    async fn repeated_ingest_deduplicates_to_one_group() {
        let h = harness().await;
        let mut last = serde_json::Value::Null;
        for expected in 1..=10 {
            let resp = h
                .app
                .clone()
                .oneshot(ingest_request(&h.api_key, sample_event()))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::CREATED);
            let body = json_body(resp).await;
            assert_eq!(body["count"], expected);
            if expected > 1 {
                assert_eq!(body["errorId"], last["errorId"]);
            }
            last = body;
        }

        let error_id: Uuid = last["errorId"].as_str().unwrap().parse().unwrap();
        let group = h
            .store
            .get_group(h.project.id, error_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(group.count, 10);
        assert_eq!(
            h.store.count_occurrences_for_group(error_id).await.unwrap(),
            10
        );
    }

    #[tokio::test]
    async fn ingest_scrubs_emails_before_storage() {
        let h = harness().await;
        let resp = h
            .app
            .clone()
            .oneshot(ingest_request(
                &h.api_key,
                json!({
                    "message": "failure for alice@example.com",
                    "environment": "production"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body = json_body(resp).await;
        let error_id: Uuid = body["errorId"].as_str().unwrap().parse().unwrap();

        let group = h
            .store
            .get_group(h.project.id, error_id)
            .await
            .unwrap()
            .unwrap();
        assert!(group.message.contains("[REDACTED:EMAIL]"));
        assert!(!group.message.contains("alice@example.com"));

        // A different scrubbed email lands in the same group.
        let resp = h
            .app
            .clone()
            .oneshot(ingest_request(
                &h.api_key,
                json!({
                    "message": "failure for bob@other.org",
                    "environment": "production"
                }),
            ))
            .await
            .unwrap();
        let body = json_body(resp).await;
        assert_eq!(body["errorId"].as_str().unwrap(), error_id.to_string());
    }

    #[tokio::test]
    async fn ingest_without_key_is_401_and_bad_payload_is_422() {
        let h = harness().await;
        let resp = h
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/errors")
                    .header("content-type", "application/json")
                    .body(Body::from(sample_event().to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = h
            .app
            .clone()
            .oneshot(ingest_request(&h.api_key, json!({ "environment": "production" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = json_body(resp).await;
        assert_eq!(body["error"]["details"][0]["field"], "message");
    }

    #[tokio::test]
    async fn dashboard_list_and_detail() {
        let h = harness().await;
        h.app
            .clone()
            .oneshot(ingest_request(&h.api_key, sample_event()))
            .await
            .unwrap();

        let resp = h
            .app
            .clone()
            .oneshot(dashboard_request(
                "GET",
                "/api/errors?page=1&limit=10",
                &h.viewer_token,
                h.project.id,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["total"], 1);
        let id = body["items"][0]["id"].as_str().unwrap().to_string();

        let resp = h
            .app
            .clone()
            .oneshot(dashboard_request(
                "GET",
                &format!("/api/errors/{id}"),
                &h.viewer_token,
                h.project.id,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["occurrencesTotal"], 1);
        assert_eq!(body["occurrences"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn role_gating_on_mutations() {
        let h = harness().await;
        let resp = h
            .app
            .clone()
            .oneshot(ingest_request(&h.api_key, sample_event()))
            .await
            .unwrap();
        let body = json_body(resp).await;
        let id = body["errorId"].as_str().unwrap().to_string();

        // Viewer cannot mutate status.
        let resp = h
            .app
            .clone()
            .oneshot(dashboard_request(
                "PATCH",
                &format!("/api/errors/{id}"),
                &h.viewer_token,
                h.project.id,
                Some(json!({ "status": "open" })),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        // Developer can.
        let resp = h
            .app
            .clone()
            .oneshot(dashboard_request(
                "PATCH",
                &format!("/api/errors/{id}"),
                &h.developer_token,
                h.project.id,
                Some(json!({ "status": "open" })),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        // Developer cannot delete; admin can.
        let resp = h
            .app
            .clone()
            .oneshot(dashboard_request(
                "DELETE",
                &format!("/api/errors/{id}"),
                &h.developer_token,
                h.project.id,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = h
            .app
            .clone()
            .oneshot(dashboard_request(
                "DELETE",
                &format!("/api/errors/{id}"),
                &h.admin_token,
                h.project.id,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn illegal_status_transition_is_422() {
        let h = harness().await;
        let resp = h
            .app
            .clone()
            .oneshot(ingest_request(&h.api_key, sample_event()))
            .await
            .unwrap();
        let body = json_body(resp).await;
        let id = body["errorId"].as_str().unwrap().to_string();

        // new -> resolved skips the chain.
        let resp = h
            .app
            .clone()
            .oneshot(dashboard_request(
                "PATCH",
                &format!("/api/errors/{id}"),
                &h.developer_token,
                h.project.id,
                Some(json!({ "status": "resolved" })),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn cross_tenant_access_is_404() {
        let h = harness().await;
        let resp = h
            .app
            .clone()
            .oneshot(ingest_request(&h.api_key, sample_event()))
            .await
            .unwrap();
        let body = json_body(resp).await;
        let id = body["errorId"].as_str().unwrap().to_string();

        // A token whose memberships do not include this project sees 404,
        // not 403, for both listing and detail.
        let resp = h
            .app
            .clone()
            .oneshot(dashboard_request(
                "GET",
                &format!("/api/errors/{id}"),
                &h.viewer_token,
                Uuid::new_v4(),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn alert_rule_crud_and_test_preview() {
        let h = harness().await;
        h.app
            .clone()
            .oneshot(ingest_request(&h.api_key, sample_event()))
            .await
            .unwrap();

        let resp = h
            .app
            .clone()
            .oneshot(dashboard_request(
                "POST",
                "/api/alert-rules",
                &h.admin_token,
                h.project.id,
                Some(json!({
                    "name": "prod threshold",
                    "type": "threshold",
                    "threshold": 1,
                    "windowMinutes": 5,
                    "environments": ["production"],
                    "channels": [
                        { "type": "slack", "target": "https://hooks.slack.example/T0" }
                    ]
                })),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let rule = json_body(resp).await;
        let rule_id = rule["id"].as_str().unwrap().to_string();

        // Developer is not enough for rule CRUD.
        let resp = h
            .app
            .clone()
            .oneshot(dashboard_request(
                "GET",
                "/api/alert-rules",
                &h.developer_token,
                h.project.id,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        // Dry-run returns previews without sending.
        let resp = h
            .app
            .clone()
            .oneshot(dashboard_request(
                "POST",
                &format!("/api/alert-rules/{rule_id}/test"),
                &h.admin_token,
                h.project.id,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["triggered"], true);
        assert_eq!(body["channels"][0]["type"], "slack");
        assert!(body["channels"][0]["preview"]["text"].is_string());
    }

    #[tokio::test]
    async fn report_generate_share_and_public_fetch() {
        let h = harness().await;
        h.app
            .clone()
            .oneshot(ingest_request(&h.api_key, sample_event()))
            .await
            .unwrap();

        let resp = h
            .app
            .clone()
            .oneshot(dashboard_request(
                "POST",
                "/api/reports/generate",
                &h.developer_token,
                h.project.id,
                Some(json!({ "windowDays": 7 })),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let run = json_body(resp).await;
        assert_eq!(run["status"], "success");
        let run_id = run["id"].as_str().unwrap().to_string();

        let resp = h
            .app
            .clone()
            .oneshot(dashboard_request(
                "POST",
                &format!("/api/reports/runs/{run_id}/share"),
                &h.developer_token,
                h.project.id,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let share = json_body(resp).await;
        let token = share["shareToken"].as_str().unwrap().to_string();

        // Public fetch needs no auth at all.
        let resp = h
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/reports/share/{token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["windowDays"], 7);
    }

    #[tokio::test]
    async fn key_rotation_revokes_old_key() {
        let h = harness().await;
        let resp = h
            .app
            .clone()
            .oneshot(dashboard_request(
                "POST",
                &format!("/api/projects/{}/rotate-key", h.project.id),
                &h.admin_token,
                h.project.id,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        let new_key = body["apiKey"].as_str().unwrap().to_string();

        let resp = h
            .app
            .clone()
            .oneshot(ingest_request(&h.api_key, sample_event()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = h
            .app
            .clone()
            .oneshot(ingest_request(&new_key, sample_event()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn health_endpoints() {
        let h = harness().await;
        for path in ["/health", "/health/db", "/health/cache"] {
            let resp = h
                .app
                .clone()
                .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK, "{path}");
        }
    }

    #[tokio::test]
    async fn responses_carry_request_id() {
        let h = harness().await;
        let resp = h
            .app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(resp.headers().contains_key("x-request-id"));
    }
}
