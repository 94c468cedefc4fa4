//! Health and metrics endpoints.

use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms(),
            "total_duration_ms": metric.total_duration_ms
        }));
    }

    let relay = &metrics.relay;
    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "http": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "endpoints": endpoint_stats
        },
        "relay": {
            "active_sessions": relay.active_sessions,
            "total_sessions": relay.total_sessions,
            "failed_sessions": relay.failed_sessions,
            "rejected_upgrades": relay.rejected_upgrades,
            "refused_missing_credential": relay.refused_missing_credential,
            "to_upstream": {
                "messages": relay.messages_to_upstream,
                "bytes": relay.bytes_to_upstream
            },
            "to_client": {
                "messages": relay.messages_to_client,
                "bytes": relay.bytes_to_client
            },
            "sessions_per_minute": if uptime_seconds > 0 {
                relay.total_sessions as f64 * 60.0 / uptime_seconds as f64
            } else {
                0.0
            }
        }
    }))
}
