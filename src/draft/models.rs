//! Public model names and the internal keys the upstream expects.

use phf::phf_map;

/// Fallback image model
pub const DEFAULT_IMAGE_MODEL: &str = "jimeng-4.0";

/// Fallback video model. Also the only model that accepts an end frame.
pub const DEFAULT_VIDEO_MODEL: &str = "jimeng-video-3.0";

/// Image model name → internal key
pub static IMAGE_MODELS: phf::Map<&'static str, &'static str> = phf_map! {
    "jimeng-4.0" => "high_aes_general_v40",
    "jimeng-3.1" => "high_aes_general_v30l_art_fangzhou:general_v3.0_18b",
    "jimeng-3.0" => "high_aes_general_v30l:general_v3.0_18b",
    "jimeng-2.1" => "high_aes_general_v21_L:general_v2.1_L",
    "jimeng-2.0-pro" => "high_aes_general_v20_L:general_v2.0_L",
    "jimeng-2.0" => "high_aes_general_v20:general_v2.0",
    "jimeng-1.4" => "high_aes_general_v14:general_v1.4",
    "jimeng-xl-pro" => "text2img_xl_sft",
};

/// Video model name → internal key
pub static VIDEO_MODELS: phf::Map<&'static str, &'static str> = phf_map! {
    "jimeng-video-3.0-pro" => "dreamina_ic_generate_video_model_vgfm_3.0_pro",
    "jimeng-video-3.0" => "dreamina_ic_generate_video_model_vgfm_3.0",
    "jimeng-video-2.0" => "dreamina_ic_generate_video_model_vgfm_lite",
    "jimeng-video-2.0-pro" => "dreamina_ic_generate_video_model_vgfm1.0",
};

/// Internal key for an image model, falling back to [`DEFAULT_IMAGE_MODEL`].
pub fn image_model_key(name: &str) -> &'static str {
    IMAGE_MODELS
        .get(name)
        .or_else(|| IMAGE_MODELS.get(DEFAULT_IMAGE_MODEL))
        .copied()
        .unwrap_or("high_aes_general_v40")
}

/// Internal key for a video model, falling back to [`DEFAULT_VIDEO_MODEL`].
pub fn video_model_key(name: &str) -> &'static str {
    VIDEO_MODELS
        .get(name)
        .or_else(|| VIDEO_MODELS.get(DEFAULT_VIDEO_MODEL))
        .copied()
        .unwrap_or("dreamina_ic_generate_video_model_vgfm_3.0")
}

/// Whether a public model name selects video generation.
pub fn is_video_model(name: &str) -> bool {
    name.starts_with("jimeng-video")
}

/// Every public model name, images first, in a stable order.
pub fn all_models() -> Vec<&'static str> {
    let mut images: Vec<_> = IMAGE_MODELS.keys().copied().collect();
    images.sort_unstable();
    let mut videos: Vec<_> = VIDEO_MODELS.keys().copied().collect();
    videos.sort_unstable();
    images.into_iter().chain(videos).collect()
}
