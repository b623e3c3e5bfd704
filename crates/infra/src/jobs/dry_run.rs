//! Synthetic results for dry-run jobs.

use serde_json::{Value as JsonValue, json};

use genflow_core::JobType;

/// Whether a payload asks for a dry run (`"dryRun": true`).
pub fn requested_in(payload: &JsonValue) -> bool {
    payload.get("dryRun").and_then(JsonValue::as_bool).unwrap_or(false)
}

/// Plausible result for `job_type`, echoing identifying payload fields.
pub fn mock_result(job_type: JobType, payload: &JsonValue) -> JsonValue {
    let prompt = payload.get("prompt").cloned().unwrap_or(JsonValue::Null);
    match job_type {
        JobType::ContentGeneration => json!({
            "dryRun": true,
            "text": "Dry run: generated content placeholder.",
            "prompt": prompt,
            "tokens": 0,
        }),
        JobType::ImageGeneration => {
            let count = payload
                .get("count")
                .and_then(JsonValue::as_u64)
                .unwrap_or(1)
                .clamp(1, 16);
            let images: Vec<JsonValue> = (0..count)
                .map(|i| json!({"url": format!("dry-run://images/{i}.png"), "width": 1024, "height": 1024}))
                .collect();
            json!({"dryRun": true, "images": images, "prompt": prompt})
        }
        JobType::LoraTraining => json!({
            "dryRun": true,
            "loraPath": "dry-run://loras/model.safetensors",
            "datasetId": payload.get("datasetId").cloned().unwrap_or(JsonValue::Null),
            "steps": 0,
        }),
        JobType::VideoGeneration => json!({
            "dryRun": true,
            "videoUrl": "dry-run://videos/0.mp4",
            "durationSeconds": payload.get("durationSeconds").cloned().unwrap_or(json!(0)),
            "prompt": prompt,
        }),
    }
}
