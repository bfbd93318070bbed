/*
 * Copyright 2025 Michael Krolikowski
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::{sync::Arc, time::Duration};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{State, rejection::BytesRejection},
    http::StatusCode,
    routing::post,
};
use axum_extra::extract::Query;
use log::info;
use serde::{Deserialize, Serialize};

use super::{API_VERSION, ApiError, BearerHeader, authorize, timestamp};
use crate::{
    report::{Report, Summary},
    settings::HttpSettings,
    update::Supervisor,
};

#[derive(Debug, Default, Deserialize)]
struct UpdateQuery {
    #[serde(default)]
    image: Vec<String>,
}

impl UpdateQuery {
    fn images(&self) -> Vec<String> {
        self.image
            .iter()
            .flat_map(|images| images.split(','))
            .map(str::trim)
            .filter(|image| !image.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Serialize)]
struct Timing {
    duration_ms: u128,
    duration: String,
}

#[derive(Serialize)]
struct UpdateResponse {
    summary: Summary,
    timing: Timing,
    timestamp: String,
    api_version: &'static str,
}

impl TryFrom<Report> for UpdateResponse {
    type Error = ApiError;

    fn try_from(report: Report) -> Result<Self, Self::Error> {
        if let Some(failure) = report.failure() {
            return Err(ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, failure));
        }
        Ok(UpdateResponse {
            summary: report.summary(),
            timing: Timing {
                duration_ms: report.duration().as_millis(),
                duration: format!("{:?}", report.duration()),
            },
            timestamp: timestamp(report.timestamp()),
            api_version: API_VERSION,
        })
    }
}

pub struct ServeUpdate {
    supervisor: Arc<Supervisor>,
    token: Option<String>,
    queue_timeout: Option<Duration>,
}

impl ServeUpdate {
    pub fn new(supervisor: Arc<Supervisor>, http: &HttpSettings) -> ServeUpdate {
        ServeUpdate {
            supervisor,
            token: http.token.clone(),
            queue_timeout: http.queue_timeout,
        }
    }

    async fn update(
        &self,
        auth: BearerHeader,
        query: UpdateQuery,
        body: Result<Bytes, BytesRejection>,
    ) -> Result<Json<UpdateResponse>, ApiError> {
        authorize(self.token.as_deref(), auth)?;
        body.map_err(|e| {
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to read request body: {e}"),
            )
        })?;
        let images = query.images();
        let report = if images.is_empty() {
            info!("Update requested via HTTP API");
            self.supervisor
                .try_update()
                .await
                .map_err(ApiError::busy)?
        } else {
            info!("Update of {} requested via HTTP API", images.join(", "));
            self.supervisor
                .update_images(images, self.queue_timeout)
                .await
                .map_err(|e| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, e))?
        };
        Ok(Json(report.try_into()?))
    }
}

impl<S> From<ServeUpdate> for Router<S> {
    fn from(serve_update: ServeUpdate) -> Self {
        Router::new()
            .route(
                "/",
                post(
                    async |State(serve_update): State<Arc<ServeUpdate>>,
                           auth: BearerHeader,
                           Query(query): Query<UpdateQuery>,
                           body: Result<Bytes, BytesRejection>| {
                        serve_update.update(auth, query, body).await
                    },
                ),
            )
            .with_state(Arc::new(serve_update))
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use axum::{
        body::Body,
        http::{Request, StatusCode, header::RETRY_AFTER},
    };
    use serde_json::Value;
    use tower::ServiceExt;

    use super::UpdateQuery;
    use crate::{
        container::tests::container,
        serve::tests::{body, router},
        settings::HttpSettings,
        update::testing::FakeEngine,
    };

    fn http() -> HttpSettings {
        HttpSettings {
            update: true,
            token: Some("secret".to_string()),
            ..Default::default()
        }
    }

    fn request(uri: &str) -> Request<Body> {
        Request::post(uri)
            .header("Authorization", "Bearer secret")
            .body(Body::empty())
            .unwrap()
    }

    fn stale_engine() -> Arc<FakeEngine> {
        let engine = Arc::new(FakeEngine::default());
        engine.add(container("web", "nginx", "sha256:web"));
        engine.publish("nginx", "sha256:web-next");
        engine.add(container("app", "app", "sha256:app"));
        engine.publish("app", "sha256:app-next");
        engine
    }

    #[test]
    fn images_from_query() {
        let query = UpdateQuery {
            image: vec!["a:1,b:2".to_string(), " c ".to_string(), String::new()],
        };
        assert_eq!(query.images(), vec!["a:1", "b:2", "c"]);
    }

    #[tokio::test]
    async fn rejects_missing_or_wrong_token() {
        let (router, _) = router(http(), Arc::default());
        let missing = Request::post("/v1/update").body(Body::empty()).unwrap();
        let wrong = Request::post("/v1/update")
            .header("Authorization", "Bearer nope")
            .body(Body::empty())
            .unwrap();
        for request in [missing, wrong] {
            let response = router.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
    }

    #[tokio::test]
    async fn full_update_reports_summary() {
        let (router, _) = router(http(), stale_engine());
        let response = router.oneshot(request("/v1/update")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: Value = serde_json::from_str(&body(response).await).unwrap();
        assert_eq!(json["summary"]["scanned"], 2);
        assert_eq!(json["summary"]["updated"], 2);
        assert_eq!(json["summary"]["failed"], 0);
        assert_eq!(json["api_version"], "v1");
        assert!(json["timing"]["duration_ms"].is_u64());
        assert!(json["timestamp"].is_string());
    }

    #[tokio::test]
    async fn concurrent_full_update_is_rejected() {
        let engine = stale_engine();
        engine.pull_delay(Duration::from_millis(300));
        let (router, _) = router(http(), engine);

        let first = tokio::spawn(router.clone().oneshot(request("/v1/update")));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = router.oneshot(request("/v1/update")).await.unwrap();

        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(second.headers()[RETRY_AFTER], "30");
        let json: Value = serde_json::from_str(&body(second).await).unwrap();
        assert_eq!(json["error"], "another update is already running");
        assert_eq!(json["api_version"], "v1");
        assert!(json["timestamp"].is_string());

        let first = first.await.unwrap().unwrap();
        assert_eq!(first.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn targeted_update_waits_for_running_session() {
        let engine = stale_engine();
        engine.pull_delay(Duration::from_millis(250));
        let (router, supervisor) = router(http(), engine);

        let scheduled = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.try_update().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let targeted = tokio::spawn(router.oneshot(request("/v1/update?image=app:latest")));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(supervisor.try_update().await.is_err());

        let response = targeted.await.unwrap().unwrap();
        assert!(scheduled.is_finished());
        assert_eq!(response.status(), StatusCode::OK);
        let json: Value = serde_json::from_str(&body(response).await).unwrap();
        assert_eq!(json["summary"]["scanned"], 1);
        assert!(scheduled.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn queue_timeout_answers_unavailable() {
        let http = HttpSettings {
            queue_timeout: Some(Duration::from_millis(20)),
            ..http()
        };
        let (router, supervisor) = router(http, Arc::default());
        let guard = supervisor.lock().try_acquire().unwrap();

        let response = router
            .oneshot(request("/v1/update?image=app"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        drop(guard);
    }
}
