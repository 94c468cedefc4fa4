use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// The effective configuration. The secret itself is never returned, only
/// whether one is configured.
pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.config();
    let credential = config.credential();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": {
            "server": config.server,
            "upstream": {
                "endpoint": config.upstream.endpoint,
                "path_marker": config.upstream.path_marker,
                "credential_kind": config.upstream.credential_kind,
                "credential_param": credential.as_ref().map(|c| c.param().to_string()),
                "credential_configured": credential.is_some()
            },
            "relay": config.relay
        }
    })))
}
