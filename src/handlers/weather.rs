use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

#[derive(Debug, Deserialize)]
pub struct WeatherQuery {
    /// AMap adcode; the configured default city when absent
    pub city: Option<String>,
}

/// `GET /api/weather?city=<adcode>`
///
/// Upstream failures are reported in an `error` field with status 200, so the
/// front end can show them in place of the forecast.
pub async fn get_weather(state: web::Data<AppState>, query: web::Query<WeatherQuery>) -> HttpResponse {
    match state.weather.lookup(query.city.as_deref()).await {
        Ok(summary) => HttpResponse::Ok().json(summary),
        Err(err) => {
            warn!(city = ?query.city, error = %err, "Weather lookup failed");
            HttpResponse::Ok().json(json!({ "error": err.to_string() }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::pipeline::testing::{spawn_http_server, FakeBackends};
    use crate::state::tests::test_state;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_weather_endpoint_passes_city_and_reports_errors() {
        let base = spawn_http_server(|cfg| {
            cfg.route(
                "/weatherInfo",
                web::get().to(|query: web::Query<WeatherQuery>| async move {
                    let city = query.into_inner().city.unwrap_or_default();
                    HttpResponse::Ok().json(json!({
                        "status": "1",
                        "lives": [{
                            "city": city, "weather": "阴", "temperature": "18",
                            "winddirection": "东", "windpower": "4", "humidity": "70"
                        }]
                    }))
                }),
            );
        });
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.weather.api_base = format!("{}/weatherInfo", base);
        config.weather.api_key = "k".to_string();
        let state = test_state(dir.path(), &FakeBackends::default(), config);

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/api/weather", web::get().to(get_weather)),
        )
        .await;

        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/api/weather?city=310000").to_request())
                .await;
        assert_eq!(body["city"], "310000");
        assert_eq!(body["temperature"], 18);

        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/api/weather").to_request()).await;
        assert_eq!(body["city"], "410100");
    }

    #[actix_web::test]
    async fn test_missing_key_is_an_error_payload() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), &FakeBackends::default(), AppConfig::default());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/api/weather", web::get().to(get_weather)),
        )
        .await;

        let response = test::call_service(&app, test::TestRequest::get().uri("/api/weather").to_request()).await;
        assert_eq!(response.status(), 200);
        let body: serde_json::Value = test::read_body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("API key"));
    }
}
