use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /api/v1/config`: the effective configuration, API keys masked.
pub async fn get_config(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": state.get_config().redacted(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::pipeline::testing::FakeBackends;
    use crate::state::tests::test_state;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_config_endpoint_masks_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.llm.api_key = "sk-secret".to_string();
        let state = test_state(dir.path(), &FakeBackends::default(), config);

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/api/v1/config", web::get().to(get_config)),
        )
        .await;
        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/api/v1/config").to_request()).await;

        assert_eq!(body["config"]["llm"]["api_key"], "***");
        assert_eq!(body["config"]["stt"]["api_key"], "");
        assert_eq!(body["config"]["session"]["default_persona"], "socrates");
        assert!(!body.to_string().contains("sk-secret"));
    }
}
