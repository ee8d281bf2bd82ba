// SPDX-License-Identifier: MIT

//! JSON-RPC 2.0 message types and the daemon's method parameter/result
//! shapes. Field names are camelCase on the wire; binary payloads are
//! base64 inside JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DaemonError;

pub const JSONRPC_VERSION: &str = "2.0";

pub const INVALID_REQUEST: i64 = -32600;
pub const PARSE_ERROR: i64 = -32700;

/// An incoming JSON-RPC message (request or notification).
#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub jsonrpc: String,
    /// Absent for notifications.
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

impl Request {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// Serialize a success response.
pub fn response(id: &Value, result: Value) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": result,
    }))
    .expect("response serialization cannot fail")
}

/// Serialize an error response.
pub fn error_response(id: &Value, code: i64, message: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": { "code": code, "message": message },
    }))
    .expect("response serialization cannot fail")
}

pub fn daemon_error_response(id: &Value, err: &DaemonError) -> Vec<u8> {
    error_response(id, err.rpc_code(), &err.to_string())
}

/// Serialize a server-initiated notification.
pub fn notification(method: &str, params: Value) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": method,
        "params": params,
    }))
    .expect("notification serialization cannot fail")
}

// ---------------------------------------------------------------------------
// Method parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathParams {
    pub path: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportParams {
    pub paths: Vec<String>,
    #[serde(default)]
    pub exclude_references: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealizeParams {
    pub drv_paths: Vec<String>,
    #[serde(default)]
    pub keep_failed: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildIdParams {
    #[serde(rename = "buildID")]
    pub build_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildResultParams {
    #[serde(rename = "buildID")]
    pub build_id: String,
    pub drv_path: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadLogParams {
    #[serde(rename = "buildID")]
    pub build_id: String,
    pub drv_path: String,
    #[serde(default)]
    pub range_start: u64,
    #[serde(default)]
    pub range_end: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpandParams {
    pub drv_path: String,
    pub temporary_directory: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentBuildsParams {
    #[serde(default = "default_recent_count")]
    pub count: usize,
}

fn default_recent_count() -> usize {
    20
}

// ---------------------------------------------------------------------------
// Method results
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectInfoJson {
    pub path: String,
    pub nar_hash: String,
    pub nar_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,
    pub references: Vec<String>,
    pub registration_time: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputJson {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub valid: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildResultJson {
    pub drv_path: String,
    pub status: String,
    pub log_size: u64,
    pub outputs: Vec<OutputJson>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildJson {
    #[serde(rename = "buildID")]
    pub build_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
    pub results: Vec<BuildResultJson>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_parses_with_and_without_id() {
        let req: Request = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"method":"exists","params":{"path":"/zb/store/x"}}"#,
        )
        .unwrap();
        assert!(!req.is_notification());
        assert_eq!("exists", req.method);

        let notif: Request =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"cancelBuild","params":{"buildID":"b1"}}"#)
                .unwrap();
        assert!(notif.is_notification());
    }

    #[test]
    fn wire_names_are_camel_case() {
        let params: RealizeParams = serde_json::from_str(
            r#"{"drvPaths":["/zb/store/a.drv"],"keepFailed":true}"#,
        )
        .unwrap();
        assert!(params.keep_failed);

        let build = BuildJson {
            build_id: "b1".into(),
            status: "active".into(),
            started_at: Some(5),
            finished_at: None,
            results: vec![],
        };
        let text = serde_json::to_string(&build).unwrap();
        assert!(text.contains("\"buildID\":\"b1\""));
        assert!(text.contains("\"startedAt\":5"));
        assert!(!text.contains("finishedAt"));
    }

    #[test]
    fn error_response_shape() {
        let body = error_response(&serde_json::json!(7), -32000, "not found");
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(7, v["id"]);
        assert_eq!(-32000, v["error"]["code"]);
    }
}
