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

mod metrics;
mod update;

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    Json, Router,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
    routing::get,
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
    typed_header::TypedHeaderRejection,
};
use log::info;
use serde::Serialize;
use subtle::ConstantTimeEq;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::{settings::HttpSettings, update::Supervisor};
use metrics::ServeMetrics;
use update::ServeUpdate;

const API_VERSION: &str = "v1";
const RETRY_AFTER_SECS: u64 = 30;

type BearerHeader = Result<TypedHeader<Authorization<Bearer>>, TypedHeaderRejection>;

/// HTTP control plane: health, update trigger and metrics.
pub struct Serve {
    supervisor: Arc<Supervisor>,
    http: HttpSettings,
    shutdown: CancellationToken,
}

fn timestamp(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_default()
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    api_version: &'static str,
    timestamp: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    retry_after: Option<Duration>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl ToString) -> ApiError {
        ApiError {
            status,
            message: message.to_string(),
            retry_after: None,
        }
    }

    fn busy(message: impl ToString) -> ApiError {
        ApiError {
            retry_after: Some(Duration::from_secs(RETRY_AFTER_SECS)),
            ..ApiError::new(StatusCode::TOO_MANY_REQUESTS, message)
        }
    }

    fn unauthorized() -> ApiError {
        ApiError::new(StatusCode::UNAUTHORIZED, "unauthorized")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.message,
            api_version: API_VERSION,
            timestamp: timestamp(OffsetDateTime::now_utc()),
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(retry_after) = self.retry_after {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(retry_after.as_secs()));
        }
        response
    }
}

fn token_matches(given: &str, expected: &str) -> bool {
    given.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Checks the bearer token when one is configured.
fn authorize(token: Option<&str>, header: BearerHeader) -> Result<(), ApiError> {
    let Some(token) = token else {
        return Ok(());
    };
    match header {
        Ok(TypedHeader(Authorization(bearer))) if token_matches(bearer.token(), token) => Ok(()),
        _ => Err(ApiError::unauthorized()),
    }
}

async fn health() -> &'static str {
    "OK"
}

impl Serve {
    pub fn new(supervisor: Arc<Supervisor>, shutdown: CancellationToken) -> Serve {
        let http = supervisor.settings().http.clone();
        Serve {
            supervisor,
            http,
            shutdown,
        }
    }

    pub fn router(&self) -> Router {
        let mut router = Router::new().route("/health", get(health));
        if self.http.update {
            let serve_update = ServeUpdate::new(self.supervisor.clone(), &self.http);
            router = router.nest("/v1/update", serve_update.into());
        }
        if self.http.metrics {
            let serve_metrics = ServeMetrics::new(self.supervisor.clone(), &self.http);
            router = router.nest("/v1/metrics", serve_metrics.into());
        }
        router
    }

    pub async fn serve(self) -> Result<()> {
        let listener = TcpListener::bind(&self.http.bind_address).await?;
        info!("HTTP API listening on {}", self.http.bind_address);
        let app = self.router();
        let shutdown = self.shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        Router,
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use super::{Serve, token_matches};
    use crate::{
        settings::{HttpSettings, Settings},
        update::{Supervisor, testing::FakeEngine},
    };

    pub fn router(http: HttpSettings, engine: Arc<FakeEngine>) -> (Router, Arc<Supervisor>) {
        let settings = Settings {
            http,
            ..Default::default()
        };
        let supervisor = Arc::new(Supervisor::for_tests(settings, engine));
        let router = Serve::new(supervisor.clone(), CancellationToken::new()).router();
        (router, supervisor)
    }

    pub async fn body(response: axum::response::Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn health_needs_no_token() {
        let http = HttpSettings {
            update: true,
            token: Some("secret".to_string()),
            ..Default::default()
        };
        let (router, _) = router(http, Arc::default());
        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(response).await, "OK");
    }

    #[tokio::test]
    async fn disabled_routes_are_absent() {
        let (router, _) = router(HttpSettings::default(), Arc::default());
        for uri in ["/v1/update", "/v1/metrics"] {
            let response = router
                .clone()
                .oneshot(Request::post(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }
    }

    #[test]
    fn token_comparison() {
        assert!(token_matches("secret", "secret"));
        assert!(!token_matches("secreT", "secret"));
        assert!(!token_matches("secret2", "secret"));
        assert!(!token_matches("", "secret"));
    }
}
