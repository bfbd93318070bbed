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

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use axum_extra::{TypedHeader, headers::ContentType};

use super::{ApiError, BearerHeader, authorize};
use crate::{settings::HttpSettings, update::Supervisor};

pub struct ServeMetrics {
    supervisor: Arc<Supervisor>,
    token: Option<String>,
}

impl ServeMetrics {
    pub fn new(supervisor: Arc<Supervisor>, http: &HttpSettings) -> Self {
        ServeMetrics {
            supervisor,
            token: http.token.clone(),
        }
    }

    fn metrics(&self, auth: BearerHeader) -> Result<Response, ApiError> {
        authorize(self.token.as_deref(), auth)?;
        let buffer = self
            .supervisor
            .metrics()
            .encode()
            .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e))?;
        Ok((TypedHeader(ContentType::text_utf8()), buffer).into_response())
    }
}

impl<S> From<ServeMetrics> for Router<S> {
    fn from(serve_metrics: ServeMetrics) -> Self {
        Router::new()
            .route(
                "/",
                get(
                    async |State(serve_metrics): State<Arc<ServeMetrics>>, auth: BearerHeader| {
                        serve_metrics.metrics(auth)
                    },
                ),
            )
            .with_state(Arc::new(serve_metrics))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    use crate::{
        serve::tests::{body, router},
        settings::HttpSettings,
    };

    #[tokio::test]
    async fn exposes_session_counters() {
        let http = HttpSettings {
            metrics: true,
            token: Some("secret".to_string()),
            ..Default::default()
        };
        let (router, supervisor) = router(http, Arc::default());
        supervisor.try_update().await.unwrap();

        let unauthorized = router
            .clone()
            .oneshot(Request::get("/v1/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(unauthorized.status(), StatusCode::UNAUTHORIZED);

        let response = router
            .oneshot(
                Request::get("/v1/metrics")
                    .header("Authorization", "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = body(response).await;
        assert!(text.contains("watchtower_scans_total 1"));
        assert!(text.contains("watchtower_containers_scanned 0"));
    }
}
