// =============================================================================
// Result Formatting — JSON payload shaping for the HTTP surface
// =============================================================================
//
// Query results serialise to a `{ labels, data }` object: `labels` is the
// time column followed by the visible dimension names, `data` is one array
// per row with the timestamp first. The datasource endpoint wraps the same
// table in the Google Visualization handshake: if the client's `sig`
// already matches the chart's newest timestamp, a `not_modified` error
// payload is returned instead of the data.
// =============================================================================

use std::sync::Arc;

use serde_json::{json, Value};

use crate::query::engine::QueryResult;
use crate::rrd::chart::Chart;
use crate::rrd::registry::ChartRegistry;
use crate::runtime_config::RuntimeConfig;
use crate::stats::EngineStats;

// =============================================================================
// Plain data JSON
// =============================================================================

/// `{ labels: [...], data: [...] }` plus enough metadata for the caller to
/// know what it actually received.
pub fn data_json(result: &QueryResult) -> Value {
    let mut labels = Vec::with_capacity(result.dimensions.len() + 1);
    labels.push("time".to_string());
    labels.extend(result.dimensions.iter().cloned());

    let data: Vec<Value> = result
        .rows
        .iter()
        .map(|row| {
            let mut cells = Vec::with_capacity(row.cells.len() + 1);
            cells.push(json!(row.timestamp));
            for cell in &row.cells {
                cells.push(match cell.value {
                    Some(v) => json!(v),
                    None => Value::Null,
                });
            }
            Value::Array(cells)
        })
        .collect();

    // Reset annotations only appear when some row carries one.
    let resets: Vec<Value> = result
        .rows
        .iter()
        .filter(|row| row.cells.iter().any(|c| c.reset))
        .map(|row| json!(row.timestamp))
        .collect();

    let mut out = json!({
        "id": result.chart_id,
        "name": result.chart_name,
        "update_every": result.update_every,
        "points": result.rows.len(),
        "latest_timestamp": result.latest_timestamp,
        "labels": labels,
        "data": data,
    });
    if !resets.is_empty() {
        out["resets"] = Value::Array(resets);
    }
    out
}

// =============================================================================
// Google Visualization datasource wrapper
// =============================================================================

/// The `tqx` request parameter, e.g.
/// `version:0.6;reqId:1;sig:1700000000;out:json`.
#[derive(Debug, Clone)]
pub struct TqxParams {
    pub version: String,
    pub req_id: String,
    pub sig: String,
    pub out: String,
    pub response_handler: String,
}

impl Default for TqxParams {
    fn default() -> Self {
        Self {
            version: "0.6".into(),
            req_id: "0".into(),
            sig: "0".into(),
            out: "json".into(),
            response_handler: "google.visualization.Query.setResponse".into(),
        }
    }
}

impl TqxParams {
    pub fn parse(raw: &str) -> Self {
        let mut params = Self::default();
        for pair in raw.split(';') {
            let mut it = pair.splitn(2, ':');
            let (Some(key), Some(value)) = (it.next(), it.next()) else {
                continue;
            };
            if value.is_empty() {
                continue;
            }
            match key {
                "version" => params.version = value.to_string(),
                "reqId" => params.req_id = value.to_string(),
                "sig" => params.sig = value.to_string(),
                "out" => params.out = value.to_string(),
                "responseHandler" => params.response_handler = value.to_string(),
                _ => {}
            }
        }
        params
    }
}

/// Build the datasource response body.
pub fn datasource_json(result: &QueryResult, tqx: &TqxParams) -> String {
    if tqx.out != "json" {
        return format!(
            "{}({});",
            tqx.response_handler,
            json!({
                "version": tqx.version,
                "reqId": tqx.req_id,
                "status": "error",
                "errors": [{
                    "reason": "invalid_query",
                    "message": "output format is not supported",
                    "detailed_message": format!("the format {} requested is not supported", tqx.out),
                }],
            })
        );
    }

    // A client already holding the newest timestamp gets told so instead
    // of a full table.
    let client_sig: i64 = tqx.sig.parse().unwrap_or(0);
    if client_sig >= result.latest_timestamp || result.rows.is_empty() {
        return format!(
            "{}({});",
            tqx.response_handler,
            json!({
                "version": tqx.version,
                "reqId": tqx.req_id,
                "status": "error",
                "errors": [{
                    "reason": "not_modified",
                    "message": "Data not modified",
                }],
            })
        );
    }

    format!(
        "{}({});",
        tqx.response_handler,
        json!({
            "version": tqx.version,
            "reqId": tqx.req_id,
            "status": "ok",
            "sig": result.latest_timestamp.to_string(),
            "table": data_json(result),
        })
    )
}

// =============================================================================
// Chart metadata JSON
// =============================================================================

/// Metadata describing one chart, used by /graph and /all.json.
pub fn chart_json(chart: &Arc<Chart>) -> Value {
    let st = chart.read_state();
    let dimensions: Vec<Value> = st
        .dimensions
        .iter()
        .map(|d| {
            json!({
                "id": d.id,
                "name": d.name,
                "algorithm": d.algorithm.name(),
                "multiplier": d.multiplier,
                "divisor": d.divisor,
                "hidden": d.hidden,
            })
        })
        .collect();

    json!({
        "id": chart.id,
        "name": chart.name,
        "type": chart.type_name,
        "family": chart.family,
        "context": chart.context,
        "title": chart.title,
        "units": chart.units,
        "chart_type": chart.chart_type.name(),
        "priority": chart.priority,
        "enabled": st.enabled,
        "update_every": chart.update_every,
        "entries": chart.entries,
        "memory_mode": chart.memory_mode.name(),
        "first_entry": chart.first_entry_t(&st),
        "last_entry": chart.last_entry_t(&st),
        "collections": st.counter_done,
        "dimensions": dimensions,
    })
}

/// The /all.json payload: server metadata plus every chart.
pub fn all_json(registry: &ChartRegistry, config: &RuntimeConfig, stats: &EngineStats) -> Value {
    let charts: Vec<Value> = registry.charts().iter().map(chart_json).collect();
    json!({
        "hostname": config.hostname,
        "update_every": config.update_every,
        "history": config.history,
        "memory_mode": config.memory_mode.name(),
        "statistics": stats.snapshot(),
        "charts_count": charts.len(),
        "charts": charts,
    })
}

/// The /list payload: newline-separated chart names.
pub fn list_text(registry: &ChartRegistry) -> String {
    let mut out = String::new();
    for chart in registry.charts() {
        out.push_str(&chart.name);
        out.push('\n');
    }
    out
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::engine::{Cell, Row};

    fn sample_result() -> QueryResult {
        QueryResult {
            chart_id: "t.x".into(),
            chart_name: "t.x".into(),
            update_every: 1,
            dimensions: vec!["a".into(), "b".into()],
            rows: vec![
                Row {
                    timestamp: 100,
                    cells: vec![
                        Cell {
                            value: Some(1.5),
                            reset: false,
                        },
                        Cell {
                            value: None,
                            reset: false,
                        },
                    ],
                },
                Row {
                    timestamp: 101,
                    cells: vec![
                        Cell {
                            value: Some(2.5),
                            reset: true,
                        },
                        Cell {
                            value: Some(3.0),
                            reset: false,
                        },
                    ],
                },
            ],
            latest_timestamp: 101,
        }
    }

    #[test]
    fn data_json_shape() {
        let v = data_json(&sample_result());
        assert_eq!(v["labels"][0], "time");
        assert_eq!(v["labels"][1], "a");
        assert_eq!(v["labels"][2], "b");
        assert_eq!(v["points"], 2);
        assert_eq!(v["data"][0][0], 100);
        assert_eq!(v["data"][0][1], 1.5);
        assert!(v["data"][0][2].is_null());
        assert_eq!(v["data"][1][2], 3.0);
        // The second row carries a reset annotation.
        assert_eq!(v["resets"][0], 101);
    }

    #[test]
    fn tqx_parsing_with_defaults() {
        let tqx = TqxParams::parse("version:0.7;reqId:42;sig:1234;out:json");
        assert_eq!(tqx.version, "0.7");
        assert_eq!(tqx.req_id, "42");
        assert_eq!(tqx.sig, "1234");
        assert_eq!(tqx.out, "json");
        assert_eq!(
            tqx.response_handler,
            "google.visualization.Query.setResponse"
        );

        let tqx = TqxParams::parse("");
        assert_eq!(tqx.version, "0.6");
        assert_eq!(tqx.sig, "0");
    }

    #[test]
    fn datasource_ok_carries_sig_and_table() {
        let body = datasource_json(&sample_result(), &TqxParams::default());
        assert!(body.starts_with("google.visualization.Query.setResponse("));
        assert!(body.contains("\"status\":\"ok\""));
        assert!(body.contains("\"sig\":\"101\""));
        assert!(body.contains("\"labels\""));
    }

    #[test]
    fn datasource_not_modified_when_sig_matches() {
        let mut tqx = TqxParams::default();
        tqx.sig = "101".into();
        let body = datasource_json(&sample_result(), &tqx);
        assert!(body.contains("not_modified"));
        assert!(!body.contains("\"table\""));
    }

    #[test]
    fn datasource_rejects_non_json_output() {
        let mut tqx = TqxParams::default();
        tqx.out = "csv".into();
        let body = datasource_json(&sample_result(), &tqx);
        assert!(body.contains("invalid_query"));
    }
}
