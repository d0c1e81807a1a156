//! Prometheus metrics.
//!
//! A single recorder is installed per process, labeled with the pod and the member identity.
//! Component specific metrics are registered by their owning components, except for the
//! member metrics below which every instance reports. The recorder is
//! served by `crate::server`.

use axum::body::Body;
use axum::extract::Extension;
use axum::http::{header, Response, StatusCode};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use once_cell::sync::OnceCell;

use crate::config::Config;

/// The content type of the Prometheus text exposition format.
const CONTENT_TYPE_PROM_TEXT: &str = "text/plain; version=0.0.4";

pub const METRIC_CHECKINS: &str = "hadron_registry_checkins";
pub const METRIC_CHECKIN_ERRORS: &str = "hadron_registry_checkin_errors";
pub const METRIC_ASSIGNED_SLOT: &str = "hadron_registry_assigned_slot";

/// Register the metrics reported by every member.
pub fn register_member_metrics() {
    metrics::register_counter!(METRIC_CHECKINS, metrics::Unit::Count, "the number of successful checkins of this member");
    metrics::register_counter!(METRIC_CHECKIN_ERRORS, metrics::Unit::Count, "the number of failed checkins of this member");
    metrics::register_gauge!(METRIC_ASSIGNED_SLOT, metrics::Unit::Count, "the slot assigned to this member, 0 when unassigned");
}

/// Get a handle to the metrics recorder, initializing it as needed.
pub fn get_metrics_recorder(config: &Config) -> &'static PrometheusRecorder {
    static RECORDER: OnceCell<PrometheusRecorder> = OnceCell::new();
    RECORDER.get_or_init(|| {
        PrometheusBuilder::new()
            .add_global_label("pod", config.pod_name.clone())
            .add_global_label("member", config.member_uuid().to_string())
            .build()
    })
}

/// Render all recorded metrics.
pub(crate) async fn scrape(Extension(handle): Extension<PrometheusHandle>) -> Response<Body> {
    let mut res = Response::new(Body::from(handle.render()));
    *res.status_mut() = StatusCode::OK;
    res.headers_mut()
        .insert(header::CONTENT_TYPE, header::HeaderValue::from_static(CONTENT_TYPE_PROM_TEXT));
    res
}
