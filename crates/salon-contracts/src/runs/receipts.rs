use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ReceiptInputs {
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub storage_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformRequest {
    pub instruction: String,
    #[serde(default)]
    pub inputs: ReceiptInputs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedTransform {
    pub provider: String,
    pub model: Option<String>,
    pub source_urls: Vec<String>,
    #[serde(default)]
    pub degraded_storage_ids: Vec<String>,
    pub output_shape: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformOutcome {
    pub result_url: String,
    pub storage_id: String,
    pub content_type: Option<String>,
    pub bytes: u64,
}

pub fn build_receipt(
    request: &TransformRequest,
    resolved: &ResolvedTransform,
    provider_request: &Map<String, Value>,
    provider_response: &Map<String, Value>,
    outcome: &TransformOutcome,
    receipt_path: &Path,
) -> Value {
    let mut root = Map::new();
    root.insert(
        "schema_version".to_string(),
        Value::Number(RECEIPT_SCHEMA_VERSION.into()),
    );
    root.insert(
        "request".to_string(),
        sanitize_payload(&serde_json::to_value(request).unwrap_or(Value::Null)),
    );
    root.insert(
        "resolved".to_string(),
        sanitize_payload(&serde_json::to_value(resolved).unwrap_or(Value::Null)),
    );
    root.insert(
        "provider_request".to_string(),
        sanitize_payload(&Value::Object(provider_request.clone())),
    );
    root.insert(
        "provider_response".to_string(),
        sanitize_payload(&Value::Object(provider_response.clone())),
    );
    root.insert(
        "outcome".to_string(),
        serde_json::to_value(outcome).unwrap_or(Value::Null),
    );
    root.insert(
        "receipt_path".to_string(),
        Value::String(receipt_path.to_string_lossy().to_string()),
    );
    Value::Object(root)
}

pub fn write_receipt(path: &Path, payload: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(payload)?)?;
    Ok(())
}

fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::String(text) if text.starts_with("data:") => {
            Value::String("<omitted data url>".to_string())
        }
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => value.clone(),
        Value::Array(rows) => Value::Array(rows.iter().map(sanitize_payload).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, row) in map {
                let lowered = key.to_ascii_lowercase();
                if matches!(lowered.as_str(), "image_bytes" | "b64_json" | "data") {
                    out.insert(key.clone(), Value::String("<omitted>".to_string()));
                    continue;
                }
                out.insert(key.clone(), sanitize_payload(row));
            }
            Value::Object(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::{
        build_receipt, write_receipt, ReceiptInputs, ResolvedTransform, TransformOutcome,
        TransformRequest, RECEIPT_SCHEMA_VERSION,
    };

    #[test]
    fn receipt_builder_writes_expected_shape() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let receipt_path = temp.path().join("receipt-img_2.json");

        let request = TransformRequest {
            instruction: "seat them".to_string(),
            inputs: ReceiptInputs {
                urls: Vec::new(),
                storage_ids: vec!["img_1".to_string(), "img_9".to_string()],
            },
        };
        let resolved = ResolvedTransform {
            provider: "dryrun".to_string(),
            model: Some("dryrun-image-1".to_string()),
            source_urls: vec!["https://store/img_1".to_string()],
            degraded_storage_ids: vec!["img_9".to_string()],
            output_shape: "url".to_string(),
        };
        let mut provider_request = Map::new();
        provider_request.insert(
            "payload".to_string(),
            json!({"input": {"image_input": ["data:image/png;base64,AAAA"]}}),
        );
        let mut provider_response = Map::new();
        provider_response.insert("status".to_string(), json!("succeeded"));
        let outcome = TransformOutcome {
            result_url: "https://provider/out1".to_string(),
            storage_id: "img_2".to_string(),
            content_type: Some("image/png".to_string()),
            bytes: 3,
        };

        let payload = build_receipt(
            &request,
            &resolved,
            &provider_request,
            &provider_response,
            &outcome,
            &receipt_path,
        );
        write_receipt(&receipt_path, &payload)?;

        let raw = std::fs::read_to_string(&receipt_path)?;
        let parsed: Value = serde_json::from_str(&raw)?;
        assert_eq!(parsed["schema_version"], json!(RECEIPT_SCHEMA_VERSION));
        assert_eq!(parsed["request"]["instruction"], json!("seat them"));
        assert_eq!(parsed["resolved"]["degraded_storage_ids"], json!(["img_9"]));
        assert_eq!(parsed["outcome"]["storage_id"], json!("img_2"));
        assert_eq!(
            parsed["provider_request"]["payload"]["input"]["image_input"][0],
            json!("<omitted data url>")
        );
        Ok(())
    }
}
