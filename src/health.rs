use crate::state::{AppMetrics, AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();
    let snapshot = state.registry.snapshot();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port,
            "backend": state.pipeline.backend()
        },
        "sessions": {
            "active": snapshot.active_sessions,
            "max": snapshot.max_sessions,
            "by_platform": snapshot.sessions_by_platform,
            "distinct_meetings": snapshot.distinct_meetings,
            "oldest_admitted_at": snapshot.oldest_admitted_at.map(|t| t.to_rfc3339()),
            "pipeline_streams": state.pipeline.open_streams()
        },
        "discovery": {
            "enabled": state.discovery.is_some(),
            "address": state.discovery.as_ref().map(|d| d.address().to_string())
        },
        "memory": get_memory_info(),
        "system": get_system_status(snapshot.active_sessions, snapshot.max_sessions)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "http": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": ratio(metrics.error_count, metrics.request_count)
        },
        "admission": admission_json(&metrics),
        "audio": {
            "frames": metrics.audio_frames,
            "bytes": metrics.audio_bytes,
            "dropped_frames": metrics.dropped_frames,
            "control_messages": metrics.control_messages
        },
        "discovery": {
            "registrar_failures": metrics.registrar_failures
        },
        "memory": get_memory_info()
    }))
}

fn admission_json(metrics: &AppMetrics) -> serde_json::Value {
    json!({
        "connections_opened": metrics.connections_opened,
        "handshakes_accepted": metrics.handshakes_accepted,
        "rejections_total": metrics.total_rejections(),
        "rejections": metrics.rejections,
        "acceptance_rate": ratio(metrics.handshakes_accepted, metrics.connections_opened),
        "synthesized_uids": metrics.synthesized_uids,
        "placeholder_tokens": metrics.placeholder_tokens,
        "late_handshakes": metrics.late_handshakes,
        "active_sessions": metrics.active_sessions
    })
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole > 0 {
        part as f64 / whole as f64
    } else {
        0.0
    }
}

fn get_memory_info() -> serde_json::Value {
    let pid = process::id();

    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let mut vm_rss = 0;
            let mut vm_size = 0;

            for line in status.lines() {
                let kb = || {
                    line.split_whitespace()
                        .nth(1)
                        .and_then(|kb| kb.parse::<u64>().ok())
                        .unwrap_or(0)
                        * 1024
                };
                if line.starts_with("VmRSS:") {
                    vm_rss = kb();
                } else if line.starts_with("VmSize:") {
                    vm_size = kb();
                }
            }

            return json!({
                "resident_memory_bytes": vm_rss,
                "virtual_memory_bytes": vm_size,
                "available": true
            });
        }
    }

    let _ = pid;
    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": "Memory info not available on this platform"
    })
}

fn get_system_status(active: usize, max: usize) -> serde_json::Value {
    let session_usage = if max > 0 {
        active as f64 / max as f64
    } else {
        0.0
    };

    let status = if session_usage >= 1.0 {
        "at_capacity"
    } else if session_usage > 0.9 {
        "high_load"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "load_warnings": if session_usage > 0.8 {
            vec!["High session usage - consider increasing admission.max_concurrent_sessions"]
        } else {
            vec![]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::validate::descriptor_for_tests;
    use crate::config::AppConfig;
    use crate::state::tests::test_state;
    use actix_web::App;

    #[actix_web::test]
    async fn test_health_reports_sessions() {
        let state = test_state(AppConfig::default());
        let _lease = state.registry.claim(descriptor_for_tests("s1")).unwrap();

        let app = actix_web::test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = actix_web::test::TestRequest::get()
            .uri("/health")
            .to_request();
        let body: serde_json::Value = actix_web::test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["sessions"]["active"], 1);
        assert_eq!(body["sessions"]["by_platform"]["zoom"], 1);
        assert_eq!(body["sessions"]["distinct_meetings"], 1);
        assert!(body["sessions"]["oldest_admitted_at"].is_string());
        assert_eq!(body["sessions"]["pipeline_streams"], 0);
        assert_eq!(body["service"]["backend"], "tracing");
        assert_eq!(body["discovery"]["enabled"], false);
    }

    #[test]
    fn test_system_status_thresholds() {
        assert_eq!(get_system_status(0, 10)["status"], "normal");
        assert_eq!(get_system_status(8, 10)["status"], "moderate_load");
        assert_eq!(get_system_status(10, 10)["status"], "at_capacity");
    }

    #[test]
    fn test_ratio_handles_empty_denominator() {
        assert_eq!(ratio(0, 0), 0.0);
        assert_eq!(ratio(1, 4), 0.25);
    }
}
