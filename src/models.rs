use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Fixed number of variations produced by one generation run.
pub const VARIATION_COUNT: usize = 9;

/// An uploaded or canvas-produced image held in memory.
///
/// Invariant: `base64` is always the base64 encoding of `bytes`, and
/// `mime_type` matches that encoding. `id` doubles as the preview handle
/// served by `GET /api/preview/:id`; dropping the struct releases it.
#[derive(Debug, Clone)]
pub struct StoredImage {
    pub id: Uuid,
    pub bytes: Bytes,
    pub base64: String,
    pub mime_type: String,
}

impl StoredImage {
    pub fn new(bytes: Bytes, mime_type: String) -> Self {
        let base64 = base64::engine::general_purpose::STANDARD.encode(&bytes);
        Self {
            id: Uuid::new_v4(),
            bytes,
            base64,
            mime_type,
        }
    }

    pub fn info(&self) -> UploadInfo {
        UploadInfo {
            preview_id: self.id,
            mime_type: self.mime_type.clone(),
            size_bytes: self.bytes.len(),
        }
    }
}

/// What the API reports about an upload (never the payload itself).
#[derive(Debug, Serialize, Clone)]
pub struct UploadInfo {
    pub preview_id: Uuid,
    pub mime_type: String,
    pub size_bytes: usize,
}

/// Outfit and background description, produced by style analysis or
/// edited directly by the user.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct StyleDescription {
    pub outfit: String,
    pub background: String,
}

impl StyleDescription {
    /// Both fields must be non-empty before generation may proceed.
    pub fn is_complete(&self) -> bool {
        !self.outfit.trim().is_empty() && !self.background.trim().is_empty()
    }
}

/// Target width:height ratio for preprocessing and generation.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum AspectRatio {
    #[default]
    #[serde(rename = "1:1")]
    Square,
    #[serde(rename = "3:4")]
    Portrait,
    #[serde(rename = "16:9")]
    Wide,
    #[serde(rename = "9:16")]
    Tall,
}

impl AspectRatio {
    /// width / height as a float.
    pub fn ratio(self) -> f64 {
        match self {
            AspectRatio::Square => 1.0,
            AspectRatio::Portrait => 3.0 / 4.0,
            AspectRatio::Wide => 16.0 / 9.0,
            AspectRatio::Tall => 9.0 / 16.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AspectRatio::Square => "1:1",
            AspectRatio::Portrait => "3:4",
            AspectRatio::Wide => "16:9",
            AspectRatio::Tall => "9:16",
        }
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The nine default camera-angle/expression descriptors, one per variation.
pub fn default_variation_prompts() -> Vec<String> {
    [
        "chính diện, biểu cảm chuyên nghiệp, nhìn thẳng ống kính",
        "chính diện, mỉm cười nhẹ nhàng, thân thiện",
        "chính diện, biểu cảm tự tin, hơi ngẩng cao đầu",
        "góc nghiêng 3/4 từ bên trái, ánh mắt nhìn xa xăm",
        "góc nghiêng 3/4 từ bên phải, mỉm cười duyên dáng",
        "chụp từ góc thấp hướng lên, biểu cảm quyền lực",
        "chụp từ góc cao hướng xuống, biểu cảm suy tư",
        "hồ sơ bên (profile view) từ trái, đường nét sắc sảo",
        "góc nghiêng nhẹ, nhìn qua vai, biểu cảm bí ẩn",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

/// Orchestration state machine. `Generating` and `Failed` carry the
/// variation index the run was at.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "state", content = "index", rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Preprocessing,
    Generating(usize),
    Done,
    Failed(usize),
}

/// One end-to-end generation run. Created when generation starts, mutated
/// incrementally as variations complete, replaced wholesale by the next run.
#[derive(Debug, Serialize, Clone)]
pub struct GenerationSession {
    pub id: Uuid,
    pub aspect_ratio: AspectRatio,
    pub style: StyleDescription,
    pub prompts: Vec<String>,
    pub phase: Phase,
    /// Base64 payloads of completed variations, in prompt order.
    pub produced_images: Vec<String>,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GenerationSession {
    pub fn new(style: StyleDescription, aspect_ratio: AspectRatio, prompts: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            aspect_ratio,
            style,
            prompts,
            phase: Phase::Preprocessing,
            produced_images: Vec::new(),
            last_error: None,
            started_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetAspectRatioRequest {
    pub aspect_ratio: AspectRatio,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetPromptsRequest {
    pub prompts: Vec<String>,
}

/// Which image the viewer overlay should enlarge.
#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum ViewerTarget {
    Source,
    Generated { index: usize },
}
