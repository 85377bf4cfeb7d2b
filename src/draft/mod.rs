//! Draft payload builder.
//!
//! Turns a validated [`JobRequest`] into the nested body the generation
//! endpoint accepts. A draft is a tree of component nodes; each node carries a
//! fresh UUID and a `type` discriminator. The tree itself travels as a JSON
//! *string* (`draft_content`) inside the outer body.
//!
//! Three shapes are built:
//!
//! - `generate`: text to image
//! - `blend`: image composition, one `byte_edit` ability per uploaded reference
//! - `gen_video`: text to video with optional first/last frame
//!
//! Builders are pure apart from UUIDs, the wall clock and the random seed.

pub mod models;

use rand::Rng;
use serde_json::{json, Value};

use crate::error::{JimengError, Result};
use crate::job::{AssetRole, JobKind, JobRequest};

pub use models::{
    all_models, image_model_key, is_video_model, video_model_key, DEFAULT_IMAGE_MODEL, DEFAULT_VIDEO_MODEL,
};

/// Draft version for text-to-image
pub const IMAGE_DRAFT_VERSION: &str = "3.0.2";

/// Draft version for blends
pub const BLEND_DRAFT_VERSION: &str = "3.2.9";

/// Draft version for video
pub const VIDEO_DRAFT_VERSION: &str = "3.2.8";

/// Minimum client version accepted for video drafts
const VIDEO_MIN_VERSION: &str = "3.0.5";

/// `web_version` query parameter for video submissions
const VIDEO_WEB_VERSION: &str = "6.6.0";

/// Lowest generated seed
pub const SEED_BASE: u64 = 2_500_000_000;

/// Width of the generated seed range
pub const SEED_SPAN: u64 = 100_000_000;

/// Blend output size
const BLEND_IMAGE_SIZE: u32 = 2048;

/// Strength of each `byte_edit` ability
const BLEND_STRENGTH: f64 = 0.5;

/// Video clip length
const VIDEO_DURATION_MS: u32 = 5000;

/// Video frame rate
const VIDEO_FPS: u32 = 24;

/// A submission ready to send.
#[derive(Debug, Clone)]
pub struct Draft {
    /// Extra query parameters for the submit call
    pub params: Vec<(String, String)>,
    /// JSON body
    pub body: Value,
    /// Client-side submission id
    pub submit_id: String,
    /// Internal model key the draft targets
    pub model_key: &'static str,
}

fn node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Random seed in `[SEED_BASE, SEED_BASE + SEED_SPAN)`.
pub fn random_seed() -> u64 {
    SEED_BASE + rand::thread_rng().gen_range(0..SEED_SPAN)
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// Reduce a size to its aspect ratio, e.g. 1920×1080 → `"16:9"`.
///
/// A zero side has no meaningful ratio; the square ratio is returned.
pub fn aspect_ratio(width: u32, height: u32) -> String {
    if width == 0 || height == 0 {
        return "1:1".to_string();
    }
    let divisor = gcd(width, height);
    format!("{}:{}", width / divisor, height / divisor)
}

/// Build the draft matching the request kind.
pub fn build(request: &JobRequest) -> Result<Draft> {
    match request.kind {
        JobKind::Image => Ok(text_to_image(request)),
        JobKind::Composition => blend(request),
        JobKind::Video => Ok(video(request)),
    }
}

fn image_params(model_key: &str) -> Vec<(String, String)> {
    let babi = json!({
        "scenario": "image_video_generation",
        "feature_key": "aigc_to_image",
        "feature_entrance": "to_image",
        "feature_entrance_detail": format!("to_image-{model_key}"),
    });
    vec![("babi_param".to_string(), babi.to_string())]
}

fn envelope(model_key: &str, submit_id: &str, metrics: &Value, extend: Value, content: &Value) -> Value {
    let mut extend = extend;
    extend["root_model"] = json!(model_key);
    json!({
        "extend": extend,
        "submit_id": submit_id,
        "metrics_extra": metrics.to_string(),
        "draft_content": content.to_string(),
    })
}

fn created_metadata() -> Value {
    json!({
        "type": "",
        "id": node_id(),
        "created_platform": 3,
        "created_platform_version": "",
        "created_time_in_ms": chrono::Utc::now().timestamp_millis().to_string(),
        "created_did": "",
    })
}

/// Text-to-image draft.
pub fn text_to_image(request: &JobRequest) -> Draft {
    let model_key = image_model_key(&request.model);
    let submit_id = node_id();
    let component_id = node_id();
    let seed = request.seed.unwrap_or_else(random_seed);

    let content = json!({
        "type": "draft",
        "id": node_id(),
        "min_version": IMAGE_DRAFT_VERSION,
        "is_from_tsn": true,
        "version": IMAGE_DRAFT_VERSION,
        "main_component_id": component_id,
        "component_list": [{
            "type": "image_base_component",
            "id": component_id,
            "min_version": IMAGE_DRAFT_VERSION,
            "generate_type": "generate",
            "aigc_mode": "workbench",
            "abilities": {
                "type": "",
                "id": node_id(),
                "generate": {
                    "type": "",
                    "id": node_id(),
                    "core_param": {
                        "type": "",
                        "id": node_id(),
                        "model": model_key,
                        "prompt": request.prompt,
                        "negative_prompt": request.negative_prompt,
                        "seed": seed,
                        "sample_strength": request.sample_strength,
                        "image_ratio": 1,
                        "large_image_info": {
                            "type": "",
                            "id": node_id(),
                            "height": request.height,
                            "width": request.width,
                        },
                    },
                    "history_option": { "type": "", "id": node_id() },
                },
            },
        }],
    });
    let metrics = json!({
        "templateId": "",
        "generateCount": 1,
        "promptSource": "custom",
        "templateSource": "",
        "lastRequestId": "",
        "originRequestId": "",
    });

    Draft {
        params: image_params(model_key),
        body: envelope(model_key, &submit_id, &metrics, json!({ "template_id": "" }), &content),
        submit_id,
        model_key,
    }
}

fn uploaded_uris(request: &JobRequest) -> Vec<&str> {
    request
        .references
        .iter()
        .filter_map(|r| r.uri.as_deref())
        .collect()
}

/// Blend draft over every uploaded reference.
///
/// Fails with [`JimengError::Validation`] when no reference was uploaded.
pub fn blend(request: &JobRequest) -> Result<Draft> {
    let uris = uploaded_uris(request);
    if uris.is_empty() {
        return Err(JimengError::Validation(
            "composition needs at least one uploaded image".to_string(),
        ));
    }

    let model_key = image_model_key(&request.model);
    let submit_id = node_id();
    let component_id = node_id();

    let abilities: Vec<Value> = uris
        .iter()
        .map(|uri| {
            json!({
                "type": "",
                "id": node_id(),
                "name": "byte_edit",
                "image_uri_list": [uri],
                "image_list": [image_node(uri, 0, 0)],
                "strength": BLEND_STRENGTH,
            })
        })
        .collect();
    let placeholders: Vec<Value> = (0..uris.len())
        .map(|index| json!({ "type": "", "id": node_id(), "ability_index": index }))
        .collect();

    let content = json!({
        "type": "draft",
        "id": node_id(),
        "min_version": BLEND_DRAFT_VERSION,
        "min_features": [],
        "is_from_tsn": true,
        "version": BLEND_DRAFT_VERSION,
        "main_component_id": component_id,
        "component_list": [{
            "type": "image_base_component",
            "id": component_id,
            "min_version": IMAGE_DRAFT_VERSION,
            "aigc_mode": "workbench",
            "metadata": created_metadata(),
            "generate_type": "blend",
            "abilities": {
                "type": "",
                "id": node_id(),
                "blend": {
                    "type": "",
                    "id": node_id(),
                    "min_version": BLEND_DRAFT_VERSION,
                    "min_features": [],
                    "core_param": {
                        "type": "",
                        "id": node_id(),
                        "model": model_key,
                        "prompt": format!("####{}", request.prompt),
                        "sample_strength": request.sample_strength,
                        "image_ratio": 1,
                        "large_image_info": {
                            "type": "",
                            "id": node_id(),
                            "height": BLEND_IMAGE_SIZE,
                            "width": BLEND_IMAGE_SIZE,
                            "resolution_type": "2k",
                        },
                        "intelligent_ratio": false,
                    },
                    "ability_list": abilities,
                    "prompt_placeholder_info_list": placeholders,
                    "postedit_param": { "type": "", "id": node_id(), "generate_type": 0 },
                },
            },
        }],
    });
    let metrics = json!({
        "promptSource": "custom",
        "generateCount": 1,
        "enterFrom": "click",
        "generateId": submit_id,
        "isRegenerate": false,
    });

    Ok(Draft {
        params: image_params(model_key),
        body: envelope(model_key, &submit_id, &metrics, json!({}), &content),
        submit_id,
        model_key,
    })
}

fn image_node(uri: &str, width: u32, height: u32) -> Value {
    json!({
        "type": "image",
        "id": node_id(),
        "source_from": "upload",
        "platform_type": 1,
        "name": "",
        "image_uri": uri,
        "width": width,
        "height": height,
        "format": "",
        "uri": uri,
    })
}

fn frame_uri(request: &JobRequest, role: AssetRole) -> Option<&str> {
    request
        .references
        .iter()
        .filter(|r| r.role == role)
        .find_map(|r| r.uri.as_deref())
}

fn commerce_info() -> Value {
    json!({
        "benefit_type": "basic_video_operation_vgfm_v_three",
        "resource_id": "generate_video",
        "resource_id_type": "str",
        "resource_sub_type": "aigc",
    })
}

/// Video draft. The primary reference becomes the first frame and the first
/// secondary reference the last frame.
pub fn video(request: &JobRequest) -> Draft {
    let requested_key = video_model_key(&request.model);
    let first_frame = frame_uri(request, AssetRole::Primary);
    let end_frame = frame_uri(request, AssetRole::Secondary);

    // End frames are only honoured by the default video model
    let root_key = if end_frame.is_some() {
        video_model_key(DEFAULT_VIDEO_MODEL)
    } else {
        requested_key
    };

    let submit_id = node_id();
    let component_id = node_id();
    let seed = request.seed.unwrap_or_else(random_seed);

    let mut gen_input = json!({
        "type": "",
        "id": node_id(),
        "min_version": VIDEO_MIN_VERSION,
        "prompt": request.prompt,
        "duration_ms": VIDEO_DURATION_MS,
        "fps": VIDEO_FPS,
        "resolution": request.resolution,
        "video_mode": 2,
    });
    if let Some(uri) = first_frame {
        gen_input["first_frame_image"] = image_node(uri, request.width, request.height);
    }
    if let Some(uri) = end_frame {
        gen_input["end_frame_image"] = image_node(uri, request.width, request.height);
    }

    let metrics = json!({
        "enterFrom": "click",
        "isDefaultSeed": 1,
        "promptSource": "custom",
        "isRegenerate": false,
        "originSubmitId": node_id(),
    });

    let content = json!({
        "type": "draft",
        "id": node_id(),
        "min_version": VIDEO_MIN_VERSION,
        "is_from_tsn": true,
        "version": VIDEO_DRAFT_VERSION,
        "main_component_id": component_id,
        "component_list": [{
            "type": "video_base_component",
            "id": component_id,
            "min_version": "1.0.0",
            "metadata": created_metadata(),
            "generate_type": "gen_video",
            "aigc_mode": "workbench",
            "abilities": {
                "type": "",
                "id": node_id(),
                "gen_video": {
                    "type": "",
                    "id": node_id(),
                    "text_to_video_params": {
                        "type": "",
                        "id": node_id(),
                        "model_req_key": requested_key,
                        "priority": 0,
                        "seed": seed,
                        "video_aspect_ratio": aspect_ratio(request.width, request.height),
                        "video_gen_inputs": [gen_input],
                    },
                    "video_task_extra": metrics.to_string(),
                },
            },
        }],
    });

    let extend = json!({
        "m_video_commerce_info": commerce_info(),
        "m_video_commerce_info_list": [commerce_info()],
    });

    Draft {
        params: vec![
            ("aigc_features".to_string(), "app_lip_sync".to_string()),
            ("web_version".to_string(), VIDEO_WEB_VERSION.to_string()),
            ("da_version".to_string(), VIDEO_DRAFT_VERSION.to_string()),
        ],
        body: envelope(root_key, &submit_id, &metrics, extend, &content),
        submit_id,
        model_key: root_key,
    }
}
