//! JSON-RPC-over-stdio adapter.
//!
//! One request per line on stdin, one response per line on stdout —
//! stdout is reserved entirely for this; diagnostics go to stderr via
//! `tracing`. Adapted from the donor's MCP server loop, trimmed to the
//! methods the service actually exposes: `search`, `index`, `ann_config`,
//! `clear_cache`, `find_similar`.

use std::io::{BufRead, Write};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorEnvelope;
use crate::service::Service;

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
struct JsonRpcError {
    message: String,
    kind: String,
}

/// Serve requests read from `input`, one JSON object per line, writing
/// one JSON response per line to `output`. Returns once `input` reaches
/// EOF.
pub fn serve_stdio(service: &Service, input: impl BufRead, mut output: impl Write) -> std::io::Result<()> {
    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<JsonRpcRequest>(&line) {
            Ok(req) => dispatch(service, req),
            Err(e) => JsonRpcResponse {
                id: None,
                result: None,
                error: Some(JsonRpcError {
                    message: format!("invalid request: {e}"),
                    kind: "fatal".to_string(),
                }),
            },
        };
        writeln!(output, "{}", serde_json::to_string(&response)?)?;
        output.flush()?;
    }
    Ok(())
}

fn dispatch(service: &Service, req: JsonRpcRequest) -> JsonRpcResponse {
    let id = req.id.clone();
    let result = run_method(service, &req.method, &req.params);
    match result {
        Ok(value) => JsonRpcResponse {
            id,
            result: Some(value),
            error: None,
        },
        Err(e) => JsonRpcResponse {
            id,
            result: None,
            error: Some(JsonRpcError {
                message: ErrorEnvelope::from(&e).error,
                kind: e.kind().to_string(),
            }),
        },
    }
}

fn run_method(service: &Service, method: &str, params: &Value) -> crate::error::CoreResult<Value> {
    use crate::error::{CoreError, ErrorKind};

    match method {
        "search" => {
            let query = params
                .get("query")
                .and_then(Value::as_str)
                .ok_or_else(|| CoreError::new(ErrorKind::Fatal, "missing \"query\" param"))?;
            let max_results = params.get("max_results").and_then(Value::as_u64).map(|n| n as usize);
            let results = service.search(query, max_results)?;
            Ok(serde_json::to_value(results).unwrap_or(Value::Null))
        }
        "index" => {
            let stats = service.index()?;
            Ok(serde_json::to_value(stats).unwrap_or(Value::Null))
        }
        "ann_config" => {
            let action = params.get("action").and_then(Value::as_str).unwrap_or("show");
            match action {
                "show" => Ok(serde_json::to_value(service.ann_config()).unwrap_or(Value::Null)),
                "stats" => Ok(serde_json::to_value(service.ann_stats()).unwrap_or(Value::Null)),
                "set_ef_search" => {
                    let value = params
                        .get("value")
                        .and_then(Value::as_u64)
                        .ok_or_else(|| CoreError::new(ErrorKind::Fatal, "missing \"value\" param"))?
                        as usize;
                    service.set_ann_ef_search(value)?;
                    Ok(serde_json::to_value(service.ann_stats()).unwrap_or(Value::Null))
                }
                "rebuild" => Ok(serde_json::to_value(service.rebuild_ann()?).unwrap_or(Value::Null)),
                other => Err(CoreError::new(ErrorKind::Fatal, format!("unknown ann_config action: {other}"))),
            }
        }
        "clear_cache" => {
            service.clear_cache()?;
            Ok(Value::Bool(true))
        }
        "find_similar" => {
            let file = params
                .get("file")
                .and_then(Value::as_str)
                .ok_or_else(|| CoreError::new(ErrorKind::Fatal, "missing \"file\" param"))?;
            let max_results = params.get("max_results").and_then(Value::as_u64).map(|n| n as usize);
            let results = service.find_similar(file, max_results)?;
            Ok(serde_json::to_value(results).unwrap_or(Value::Null))
        }
        other => Err(CoreError::new(ErrorKind::Fatal, format!("unknown method: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn unknown_method_reports_fatal_error() {
        let dir = tempdir().unwrap();
        let service = Service::open(dir.path()).unwrap();
        let input = b"{\"id\":1,\"method\":\"nope\",\"params\":{}}\n".as_slice();
        let mut out = Vec::new();
        serve_stdio(&service, input, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let parsed: Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(parsed["error"]["kind"], "fatal");
    }

    #[test]
    fn ann_config_set_ef_search_then_stats_reflects_it() {
        let dir = tempdir().unwrap();
        let service = Service::open(dir.path()).unwrap();
        let input = b"{\"id\":1,\"method\":\"ann_config\",\"params\":{\"action\":\"set_ef_search\",\"value\":77}}\n\
                       {\"id\":2,\"method\":\"ann_config\",\"params\":{\"action\":\"stats\"}}\n"
            .as_slice();
        let mut out = Vec::new();
        serve_stdio(&service, input, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        let first: Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(first["result"]["ef_search"], 77);
        let second: Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(second["result"]["ef_search"], 77);
    }

    #[test]
    fn search_with_no_query_param_errors() {
        let dir = tempdir().unwrap();
        let service = Service::open(dir.path()).unwrap();
        let input = b"{\"id\":1,\"method\":\"search\",\"params\":{}}\n".as_slice();
        let mut out = Vec::new();
        serve_stdio(&service, input, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("\"error\""));
    }
}
