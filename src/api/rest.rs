// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// The query surface of the engine:
//
//   /data/<chart>[/<points>[/<group>[/<method>[/<after>[/<before>[/nonzero]]]]]]
//   /datasource/<chart>/...?tqx=version:V;reqId:R;sig:S;out:json
//   /graph/<chart>
//   /list
//   /all.json
//   /config
//   /mirror
//   /debug/<chart>
//
// Chart selectors resolve by display name first, then by full id; an
// unknown chart is a plain 404 (static files are someone else's job).
// CORS is configured permissively; framing, compression and chunking are
// owned by the HTTP stack.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Path, RawQuery, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::debug;

use crate::query::engine::{execute, QueryRequest};
use crate::query::format::{all_json, chart_json, data_json, datasource_json, list_text, TqxParams};
use crate::rrd::registry::ChartRegistry;
use crate::runtime_config::RuntimeConfig;
use crate::stats::EngineStats;
use crate::types::GroupMethod;

// =============================================================================
// Shared state & router construction
// =============================================================================

pub struct ApiState {
    pub registry: Arc<ChartRegistry>,
    pub config: Arc<RuntimeConfig>,
    pub stats: Arc<EngineStats>,
}

/// Build the full REST router with CORS middleware and shared state.
pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/data/:chart", get(data))
        .route("/data/:chart/*params", get(data_with_params))
        .route("/datasource/:chart", get(datasource))
        .route("/datasource/:chart/*params", get(datasource_with_params))
        .route("/graph/:chart", get(graph))
        .route("/list", get(list))
        .route("/all.json", get(all))
        .route("/config", get(config_dump))
        .route("/mirror", get(mirror))
        .route("/debug/:chart", get(debug_toggle))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Response helpers (byte counting lives here)
// =============================================================================

fn json_response(state: &ApiState, status: StatusCode, body: String) -> Response {
    state.stats.count_bytes_sent(body.len() as u64);
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

fn js_response(state: &ApiState, body: String) -> Response {
    state.stats.count_bytes_sent(body.len() as u64);
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/x-javascript")],
        body,
    )
        .into_response()
}

fn text_response(state: &ApiState, status: StatusCode, body: String) -> Response {
    state.stats.count_bytes_sent(body.len() as u64);
    (status, [(header::CONTENT_TYPE, "text/plain")], body).into_response()
}

fn not_found(state: &ApiState, selector: &str) -> Response {
    json_response(
        state,
        StatusCode::NOT_FOUND,
        json!({ "error": format!("chart '{selector}' is not found") }).to_string(),
    )
}

// =============================================================================
// URL parameter parsing
// =============================================================================

/// Parse the positional `/data` parameters:
/// `points/group/method/after/before/nonzero`.
fn parse_data_params(params: &str, default_points: usize) -> QueryRequest {
    let mut req = QueryRequest {
        points: default_points,
        ..Default::default()
    };

    let mut it = params.split('/').filter(|s| !s.is_empty());
    if let Some(points) = it.next().and_then(|s| s.parse::<i64>().ok()) {
        req.points = points.max(1) as usize;
    }
    if let Some(group) = it.next().and_then(|s| s.parse::<i64>().ok()) {
        req.group_count = group.max(1) as usize;
    }
    if let Some(method) = it.next() {
        req.group_method = GroupMethod::from_name(method);
    }
    if let Some(after) = it.next().and_then(|s| s.parse::<i64>().ok()) {
        req.after = after;
    }
    if let Some(before) = it.next().and_then(|s| s.parse::<i64>().ok()) {
        req.before = before;
    }
    if let Some(flag) = it.next() {
        req.nonzero = flag == "nonzero";
    }
    req
}

/// Minimal percent-decoding for query-string values.
fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = bytes.get(i + 1..i + 3).and_then(|h| {
                    std::str::from_utf8(h)
                        .ok()
                        .and_then(|s| u8::from_str_radix(s, 16).ok())
                });
                match hex {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Pull the `tqx` parameter out of a raw query string.
fn tqx_from_query(query: Option<&str>) -> TqxParams {
    let Some(query) = query else {
        return TqxParams::default();
    };
    for pair in query.split('&') {
        if let Some((key, value)) = pair.split_once('=') {
            if key == "tqx" {
                return TqxParams::parse(&percent_decode(value));
            }
        }
    }
    TqxParams::default()
}

// =============================================================================
// /data
// =============================================================================

async fn data(
    State(state): State<Arc<ApiState>>,
    Path(chart): Path<String>,
) -> Response {
    serve_data(&state, &chart, "")
}

async fn data_with_params(
    State(state): State<Arc<ApiState>>,
    Path((chart, params)): Path<(String, String)>,
) -> Response {
    serve_data(&state, &chart, &params)
}

fn serve_data(state: &ApiState, selector: &str, params: &str) -> Response {
    state.stats.count_request();
    let Some(chart) = state.registry.find(selector) else {
        return not_found(state, selector);
    };

    let req = parse_data_params(params, state.config.history);
    debug!(chart = %chart.id, points = req.points, group = req.group_count, "data query");

    let result = execute(&chart, &req);
    state.stats.count_points(result.rows.len() as u64);
    json_response(state, StatusCode::OK, data_json(&result).to_string())
}

// =============================================================================
// /datasource (Google Visualization wrapper)
// =============================================================================

async fn datasource(
    State(state): State<Arc<ApiState>>,
    Path(chart): Path<String>,
    RawQuery(query): RawQuery,
) -> Response {
    serve_datasource(&state, &chart, "", query.as_deref())
}

async fn datasource_with_params(
    State(state): State<Arc<ApiState>>,
    Path((chart, params)): Path<(String, String)>,
    RawQuery(query): RawQuery,
) -> Response {
    serve_datasource(&state, &chart, &params, query.as_deref())
}

fn serve_datasource(
    state: &ApiState,
    selector: &str,
    params: &str,
    query: Option<&str>,
) -> Response {
    state.stats.count_request();
    let Some(chart) = state.registry.find(selector) else {
        return not_found(state, selector);
    };

    let req = parse_data_params(params, state.config.history);
    let tqx = tqx_from_query(query);

    let result = execute(&chart, &req);
    state.stats.count_points(result.rows.len() as u64);
    js_response(state, datasource_json(&result, &tqx))
}

// =============================================================================
// /graph
// =============================================================================

async fn graph(State(state): State<Arc<ApiState>>, Path(chart): Path<String>) -> Response {
    state.stats.count_request();
    let Some(chart) = state.registry.find(&chart) else {
        return not_found(&state, &chart);
    };

    // Metadata plus a recent data payload, enough to draw the chart.
    let points = chart.entries.min(120);
    let result = execute(
        &chart,
        &QueryRequest {
            points,
            ..Default::default()
        },
    );

    let mut body = chart_json(&chart);
    body["data"] = data_json(&result);
    json_response(&state, StatusCode::OK, body.to_string())
}

// =============================================================================
// Listings & diagnostics
// =============================================================================

async fn list(State(state): State<Arc<ApiState>>) -> Response {
    state.stats.count_request();
    text_response(&state, StatusCode::OK, list_text(&state.registry))
}

async fn all(State(state): State<Arc<ApiState>>) -> Response {
    state.stats.count_request();
    let body = all_json(&state.registry, &state.config, &state.stats).to_string();
    json_response(&state, StatusCode::OK, body)
}

async fn config_dump(State(state): State<Arc<ApiState>>) -> Response {
    state.stats.count_request();
    let body = serde_json::to_string_pretty(state.config.as_ref())
        .unwrap_or_else(|_| "{}".to_string());
    text_response(&state, StatusCode::OK, body)
}

async fn mirror(
    State(state): State<Arc<ApiState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    state.stats.count_request();
    let mut body = format!("{method} {uri}\n");
    for (name, value) in &headers {
        body.push_str(&format!("{}: {}\n", name, value.to_str().unwrap_or("?")));
    }
    text_response(&state, StatusCode::OK, body)
}

async fn debug_toggle(State(state): State<Arc<ApiState>>, Path(chart): Path<String>) -> Response {
    state.stats.count_request();
    let Some(chart) = state.registry.find(&chart) else {
        return not_found(&state, &chart);
    };
    let enabled = chart.toggle_debug();
    text_response(
        &state,
        StatusCode::OK,
        format!(
            "Chart {} has now debug {}.\n",
            chart.name,
            if enabled { "enabled" } else { "disabled" }
        ),
    )
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_params_full_path() {
        let req = parse_data_params("600/10/sum/100/200/nonzero", 3600);
        assert_eq!(req.points, 600);
        assert_eq!(req.group_count, 10);
        assert_eq!(req.group_method, GroupMethod::Sum);
        assert_eq!(req.after, 100);
        assert_eq!(req.before, 200);
        assert!(req.nonzero);
    }

    #[test]
    fn data_params_defaults() {
        let req = parse_data_params("", 3600);
        assert_eq!(req.points, 3600);
        assert_eq!(req.group_count, 1);
        assert_eq!(req.group_method, GroupMethod::Average);
        assert_eq!(req.after, 0);
        assert_eq!(req.before, 0);
        assert!(!req.nonzero);
    }

    #[test]
    fn data_params_clamp_to_minimums() {
        let req = parse_data_params("0/0/average", 3600);
        assert_eq!(req.points, 1);
        assert_eq!(req.group_count, 1);
    }

    #[test]
    fn data_params_unknown_method_defaults_to_average() {
        let req = parse_data_params("10/1/median", 3600);
        assert_eq!(req.group_method, GroupMethod::Average);
    }

    #[test]
    fn tqx_extraction_from_query() {
        let tqx = tqx_from_query(Some("tqx=version%3A0.7%3BreqId%3A9%3Bsig%3A55&x=1"));
        assert_eq!(tqx.version, "0.7");
        assert_eq!(tqx.req_id, "9");
        assert_eq!(tqx.sig, "55");

        let tqx = tqx_from_query(Some("tqx=version:0.8;reqId:3"));
        assert_eq!(tqx.version, "0.8");
        assert_eq!(tqx.req_id, "3");

        let tqx = tqx_from_query(None);
        assert_eq!(tqx.version, "0.6");
    }

    #[test]
    fn percent_decoding() {
        assert_eq!(percent_decode("a%20b"), "a b");
        assert_eq!(percent_decode("a+b"), "a b");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("plain"), "plain");
    }
}
