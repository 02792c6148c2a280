use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Every call the registry still knows about, oldest first.
pub async fn list_calls(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let calls = state.calls.snapshots();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "active": state.calls.active_count(),
        "max_concurrent_calls": state.calls.max_concurrent_calls(),
        "calls": calls
    })))
}

pub async fn get_call(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let call_id = path.into_inner();
    let snapshot = state
        .calls
        .snapshot(&call_id)
        .ok_or_else(|| AppError::NotFound(format!("Call {} not found", call_id)))?;

    Ok(HttpResponse::Ok().json(json!({
        "call": snapshot,
        "relay": {
            "bound": state.hub.is_bound(&call_id),
            "page_attached": state.hub.has_page(&call_id)
        }
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::runner::Contact;
    use crate::config::AppConfig;
    use actix_web::{test, App};
    use std::collections::HashMap;

    #[actix_web::test]
    async fn test_call_endpoints() {
        let state = web::Data::new(AppState::new(AppConfig::default()));
        let call_id = state
            .calls
            .register(
                Some("call-9".to_string()),
                &Contact {
                    id: "c-9".to_string(),
                    name: "Grace".to_string(),
                    phone_number: "+15550199".to_string(),
                    variables: HashMap::new(),
                },
            )
            .unwrap();

        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/calls", web::get().to(list_calls))
                .route("/calls/{call_id}", web::get().to(get_call)),
        )
        .await;

        let req = test::TestRequest::get().uri("/calls").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["active"], 1);
        assert_eq!(body["calls"][0]["call_id"], "call-9");

        let req = test::TestRequest::get()
            .uri(&format!("/calls/{}", call_id))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["call"]["state"], "idle");
        assert_eq!(body["relay"]["bound"], false);

        let req = test::TestRequest::get().uri("/calls/missing").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::NOT_FOUND);
    }
}
