use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();

    let memory_info = get_memory_info();
    let active_calls = state.calls.active_count();
    let system_status = get_system_status(&config, active_calls);

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": "voice-dialer",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "active_calls": active_calls,
            "active_relays": metrics.active_relays
        },
        "memory": memory_info,
        "conversation_service": {
            "url": config.session.url,
            "agent_configured": !config.session.agent_id.is_empty(),
            "credential_configured": !config.session.api_key.is_empty()
        },
        "system": system_status
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let config = state.get_config();

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

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "calls": {
            "active": state.calls.active_count(),
            "tracked": state.calls.len(),
            "max_concurrent": config.performance.max_concurrent_calls
        },
        "relay": {
            "active_connections": metrics.active_relays,
            "active_routes": state.hub.active_routes(),
            "frames_relayed": metrics.frames_relayed,
            "bytes_relayed": metrics.bytes_relayed,
            "capture_errors": metrics.capture_errors
        },
        "endpoints": endpoint_stats,
        "memory": get_memory_info()
    }))
}

/// Resident and virtual memory of this process, read from `/proc` on Linux.
fn get_memory_info() -> serde_json::Value {
    let status = std::fs::read_to_string(format!("/proc/{}/status", process::id()));
    let Ok(status) = status else {
        return json!({
            "resident_memory_bytes": 0,
            "virtual_memory_bytes": 0,
            "available": false,
            "note": "Memory info not available on this platform"
        });
    };

    let field_bytes = |name: &str| {
        status
            .lines()
            .find(|line| line.starts_with(name))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|kb| kb.parse::<u64>().ok())
            .map_or(0, |kb| kb * 1024)
    };

    json!({
        "resident_memory_bytes": field_bytes("VmRSS:"),
        "virtual_memory_bytes": field_bytes("VmSize:"),
        "available": true
    })
}

fn get_system_status(config: &crate::config::AppConfig, active_calls: usize) -> serde_json::Value {
    let max_calls = config.performance.max_concurrent_calls;
    let call_usage = if max_calls > 0 {
        active_calls as f64 / max_calls as f64
    } else {
        0.0
    };

    let status = if active_calls >= max_calls {
        "at_capacity"
    } else if call_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "call_usage_percent": (call_usage * 100.0).round(),
        "max_calls": max_calls,
        "current_calls": active_calls
    })
}
