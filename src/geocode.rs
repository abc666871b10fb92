use std::{future::Future, time::Duration};

use reqwest::Client;
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_GEOCODER_URL: &str = "https://nominatim.openstreetmap.org/reverse";

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("reverse geocode request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("reverse geocode service answered with status {0}")]
    Status(u16),

    #[error("reverse geocode response has no `address` field")]
    MissingAddress,

    #[error("failed to serialize address: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub trait AddressResolver: Send + Sync {
    /// Returns the serialized address for the coordinates. Failures are propagated; callers
    /// pick their own fallback.
    fn resolve_address(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> impl Future<Output = Result<String, GeocodeError>> + Send;
}

#[derive(Clone)]
pub struct NominatimResolver {
    client: Client,
    endpoint: String,
}

impl NominatimResolver {
    pub fn new(
        endpoint: impl Into<String>,
        timeout: Duration,
        user_agent: &str,
    ) -> Result<Self, GeocodeError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

impl AddressResolver for NominatimResolver {
    async fn resolve_address(&self, latitude: f64, longitude: f64) -> Result<String, GeocodeError> {
        let res = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("lat", latitude.to_string()),
                ("lon", longitude.to_string()),
                ("format", "jsonv2".to_string()),
            ])
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            tracing::debug!(%status, body = %text, "reverse geocode error response");
            return Err(GeocodeError::Status(status.as_u16()));
        }

        let body: Value = res.json().await?;
        let address = body.get("address").ok_or(GeocodeError::MissingAddress)?;
        Ok(serde_json::to_string(address)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::HashMap, net::SocketAddr, sync::Arc};

    use axum::{extract::Query, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
    use serde_json::json;
    use tokio::sync::Mutex;

    type Seen = Arc<Mutex<Vec<HashMap<String, String>>>>;

    async fn spawn_mock(status: StatusCode, body: Value) -> (String, Seen) {
        let seen: Seen = Arc::default();
        let recorder = seen.clone();

        let app = Router::new().route(
            "/reverse",
            get(move |Query(params): Query<HashMap<String, String>>| {
                let recorder = recorder.clone();
                let body = body.clone();
                async move {
                    recorder.lock().await.push(params);
                    (status, Json(body)).into_response()
                }
            }),
        );

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        let server = axum::Server::from_tcp(listener).unwrap().serve(app.into_make_service());
        tokio::spawn(server);

        (format!("http://{addr}/reverse"), seen)
    }

    fn resolver(url: String) -> NominatimResolver {
        NominatimResolver::new(url, Duration::from_secs(10), "geotrack-test").unwrap()
    }

    #[tokio::test]
    async fn sends_lat_lon_and_format_query() {
        let (url, seen) = spawn_mock(
            StatusCode::OK,
            json!({ "display_name": "Null Island", "address": { "country": "nowhere" } }),
        )
        .await;

        let address = resolver(url).resolve_address(0.0, 0.0).await.unwrap();
        assert_eq!(address, "{\"country\":\"nowhere\"}");

        let seen = seen.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["lat"], "0");
        assert_eq!(seen[0]["lon"], "0");
        assert_eq!(seen[0]["format"], "jsonv2");
    }

    #[tokio::test]
    async fn server_error_is_propagated() {
        let (url, _) = spawn_mock(StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": "boom" })).await;

        let err = resolver(url).resolve_address(0.0, 0.0).await.unwrap_err();
        assert!(matches!(err, GeocodeError::Status(500)));
    }

    #[tokio::test]
    async fn missing_address_field_is_an_error() {
        let (url, _) = spawn_mock(StatusCode::OK, json!({ "error": "Unable to geocode" })).await;

        let err = resolver(url).resolve_address(89.9, 0.0).await.unwrap_err();
        assert!(matches!(err, GeocodeError::MissingAddress));
    }

    #[tokio::test]
    async fn unreachable_service_is_a_request_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = resolver(format!("http://{addr}/reverse"))
            .resolve_address(1.0, 2.0)
            .await
            .unwrap_err();
        assert!(matches!(err, GeocodeError::Request(_)));
    }
}
