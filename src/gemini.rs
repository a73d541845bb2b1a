use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use crate::error::AppError;
use crate::models::{AspectRatio, StoredImage, StyleDescription};

const ANALYSIS_MODEL: &str = "gemini-2.5-flash";
const IMAGE_MODEL: &str = "gemini-2.5-flash-image";

/// The two external AI operations the studio depends on. The orchestrator
/// and routes only ever see this trait, so tests run against deterministic
/// fakes instead of the vendor API.
#[async_trait]
pub trait StyleProvider: Send + Sync {
    /// Derive an outfit/background description from an inspiration photo.
    async fn analyze_style(&self, image: &StoredImage) -> Result<StyleDescription, AppError>;

    /// Produce one styled variation of the padded portrait. Returns the
    /// base64 payload of exactly one generated image.
    async fn generate_variation(
        &self,
        image: &StoredImage,
        style: &StyleDescription,
        aspect_ratio: AspectRatio,
        camera_angle: &str,
    ) -> Result<String, AppError>;
}

pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(api_key: String) -> Self {
        let base_url = std::env::var("GEMINI_API_BASE")
            .unwrap_or_else(|_| "https://generativelanguage.googleapis.com/v1beta".to_string());
        Self {
            client: Client::new(),
            api_key,
            base_url,
        }
    }

    async fn perform_api_call(
        &self,
        model: &str,
        request_body: serde_json::Value,
    ) -> Result<GeminiResponse, AppError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, model, self.api_key
        );
        info!("🔗 Making request to: {}", url.replace(&self.api_key, "***"));

        let response = self
            .client
            .post(&url)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| AppError::Unknown(format!("HTTP error: {e}")))?;

        let status = response.status();
        info!("📥 Response status: {}", status);

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            error!("❌ API error response: {}", error_body);
            return Err(AppError::Unknown(format!(
                "status={status} body={error_body}"
            )));
        }

        let response_text = response
            .text()
            .await
            .map_err(|e| AppError::Unknown(e.to_string()))?;

        // Truncate base64 image data for cleaner logging
        if let Ok(mut value) = serde_json::from_str::<serde_json::Value>(&response_text) {
            truncate_base64_in_json(&mut value);
            info!(
                "📥 Raw Gemini API response: {}",
                serde_json::to_string(&value).unwrap_or_default()
            );
        }

        serde_json::from_str(&response_text)
            .map_err(|e| AppError::Unknown(format!("parse error: {e}")))
    }
}

#[async_trait]
impl StyleProvider for GeminiClient {
    async fn analyze_style(&self, image: &StoredImage) -> Result<StyleDescription, AppError> {
        info!("🔍 Analyzing inspiration image with Gemini...");
        let request_body = json!({
            "contents": [{
                "parts": [
                    { "inlineData": { "data": image.base64, "mimeType": image.mime_type } },
                    { "text": ANALYSIS_INSTRUCTION }
                ]
            }],
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseSchema": {
                    "type": "OBJECT",
                    "properties": {
                        "outfit": {
                            "type": "STRING",
                            "description": "Mô tả chi tiết về trang phục trong ảnh."
                        },
                        "background": {
                            "type": "STRING",
                            "description": "Mô tả chi tiết về bối cảnh, môi trường xung quanh trong ảnh."
                        }
                    }
                }
            }
        });

        let response = self
            .perform_api_call(ANALYSIS_MODEL, request_body)
            .await
            .map_err(|e| AppError::Analysis(e.to_string()))?;

        let text = first_text(&response)
            .ok_or_else(|| AppError::Analysis("no text content in response".into()))?;
        let style = parse_style_payload(&text)?;
        info!(
            "✅ Style analysis complete ({} / {} chars)",
            style.outfit.len(),
            style.background.len()
        );
        Ok(style)
    }

    async fn generate_variation(
        &self,
        image: &StoredImage,
        style: &StyleDescription,
        aspect_ratio: AspectRatio,
        camera_angle: &str,
    ) -> Result<String, AppError> {
        let prompt = build_variation_prompt(style, aspect_ratio, camera_angle);
        info!(
            "🎨 Generating variation at {} for angle: {}",
            aspect_ratio, camera_angle
        );

        let request_body = json!({
            "contents": [{
                "parts": [
                    { "inlineData": { "data": image.base64, "mimeType": image.mime_type } },
                    { "text": prompt }
                ]
            }],
            "generationConfig": {
                "responseModalities": ["IMAGE", "TEXT"]
            }
        });

        let response = self
            .perform_api_call(IMAGE_MODEL, request_body)
            .await
            .map_err(|e| AppError::GenerationCall(e.to_string()))?;
        extract_variation_image(&response)
    }
}

// --- Prompt Composition ---

/// Fixed fashion-analysis instruction sent with the inspiration image.
const ANALYSIS_INSTRUCTION: &str = "Bạn là một chuyên gia phân tích thời trang và bối cảnh. \
Hãy phân tích hình ảnh được cung cấp một cách cực kỳ chi tiết. Đối với 'outfit', hãy mô tả \
từng món đồ, chất liệu vải (ví dụ: lụa, cotton, denim), kiểu dáng, hoa văn, màu sắc chủ đạo \
và các chi tiết nhỏ như cúc áo, đường may. Đối với 'background', hãy mô tả không gian, ánh \
sáng (ví dụ: ánh sáng tự nhiên, đèn studio), các vật thể xung quanh, tông màu chung và cảm \
giác mà nó mang lại (ví dụ: sang trọng, cổ điển, tự nhiên). Tuyệt đối không mô tả người. \
Trả về kết quả dưới dạng một đối tượng JSON với hai khóa: 'outfit' và 'background'.";

/// Compose the generation instruction embedding the outfit, background,
/// target ratio and camera angle, including the absolute requirement to
/// replace every chroma-green pixel.
pub fn build_variation_prompt(
    style: &StyleDescription,
    aspect_ratio: AspectRatio,
    camera_angle: &str,
) -> String {
    format!(
        "**Nhiệm vụ: Cấy ghép kỹ thuật số - Chỉ thay đổi trang phục và bối cảnh.**\n\n\
**QUY TẮC BẮT BUỘC:**\n\
1.  **GIỮ NGUYÊN 100% NGƯỜI GỐC:** Giữ lại chính xác người trong ảnh gốc: khuôn mặt, nét mặt, \
kiểu tóc, màu tóc, màu da, dáng người. KHÔNG ĐƯỢC THAY ĐỔI.\n\
2.  **XỬ LÝ NỀN XANH (YÊU CẦU TUYỆT ĐỐI):** Hình ảnh đầu vào có một nền màu xanh lá cây sáng \
(#00FF00) bao quanh. Nhiệm vụ của bạn là phải **XÓA SẠCH** và **THAY THẾ HOÀN TOÀN** 100% vùng \
màu xanh này bằng bối cảnh được mô tả. Đây là yêu cầu quan trọng nhất. **KHÔNG ĐƯỢC PHÉP** để \
lại bất kỳ pixel màu xanh nào trong ảnh kết quả. Toàn bộ khung hình phải được lấp đầy.\n\
3.  **THAY ĐỔI:** Chỉ thay đổi trang phục và bối cảnh dựa trên mô tả dưới đây.\n\
4.  **TỈ LỆ KHUNG HÌNH:** Tạo ra hình ảnh với tỉ lệ khung hình chính xác là {ratio}.\n\
5.  **GÓC CHỤP:** Chụp ảnh từ góc {angle}.\n\
6.  **CHẤT LƯỢNG:** Hình ảnh phải siêu thực, chất lượng 4K, chi tiết và sắc nét.\n\n\
**Mô tả chi tiết:**\n\
-   **Trang phục:** {outfit}\n\
-   **Bối cảnh:** {background}\n\n\
**ĐẦU RA:** Chỉ trả về duy nhất một tệp hình ảnh. Không trả về bất kỳ văn bản nào.",
        ratio = aspect_ratio,
        angle = camera_angle,
        outfit = style.outfit,
        background = style.background,
    )
}

// --- Response Parsing Helpers ---

#[derive(Debug, Deserialize)]
pub(crate) struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Content,
    #[serde(default, rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Part {
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
    Text {
        text: String,
    },
    Other(serde_json::Value),
}

#[derive(Debug, Deserialize)]
struct InlineData {
    data: String,
    #[serde(rename = "mimeType")]
    mime_type: String,
}

fn first_text(resp: &GeminiResponse) -> Option<String> {
    for c in &resp.candidates {
        for p in &c.content.parts {
            if let Part::Text { text } = p {
                return Some(text.trim().to_string());
            }
        }
    }
    None
}

/// The model sometimes wraps its JSON body in a markdown code fence.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```json") {
        return rest.strip_suffix("```").unwrap_or(rest).trim();
    }
    if let Some(rest) = trimmed.strip_prefix("```") {
        return rest.strip_suffix("```").unwrap_or(rest).trim();
    }
    trimmed
}

pub(crate) fn parse_style_payload(text: &str) -> Result<StyleDescription, AppError> {
    serde_json::from_str(strip_code_fence(text))
        .map_err(|e| AppError::Analysis(format!("unparseable analysis output: {e}")))
}

/// Exactly one image payload is expected per variation call. Text instead
/// of an image and non-STOP finish reasons are both call failures.
pub(crate) fn extract_variation_image(resp: &GeminiResponse) -> Result<String, AppError> {
    for c in &resp.candidates {
        for p in &c.content.parts {
            if let Part::Inline { inline_data } = p {
                if inline_data.mime_type.starts_with("image/") {
                    info!("🖼️ Found image data with mime type: {}", inline_data.mime_type);
                    return Ok(inline_data.data.clone());
                }
            }
        }
    }

    if let Some(text) = first_text(resp) {
        return Err(AppError::GenerationCall(format!(
            "model returned text instead of an image: \"{text}\""
        )));
    }

    if let Some(reason) = resp
        .candidates
        .first()
        .and_then(|c| c.finish_reason.as_deref())
    {
        if reason != "STOP" {
            return Err(AppError::GenerationCall(format!(
                "blocked for safety or another reason: {reason}"
            )));
        }
    }

    Err(AppError::GenerationCall("no image in response".into()))
}

// Helper function to truncate base64 data in JSON for cleaner logging
fn truncate_base64_in_json(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, val) in map.iter_mut() {
                if key == "data" {
                    if let serde_json::Value::String(s) = val {
                        if s.len() > 100
                            && s.chars()
                                .all(|c| c.is_alphanumeric() || c == '+' || c == '/' || c == '=')
                        {
                            *val = serde_json::Value::String(format!(
                                "{}...[truncated {} chars]",
                                &s[..50],
                                s.len() - 50
                            ));
                        }
                    }
                } else {
                    truncate_base64_in_json(val);
                }
            }
        }
        serde_json::Value::Array(arr) => {
            for val in arr.iter_mut() {
                truncate_base64_in_json(val);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn response(body: serde_json::Value) -> GeminiResponse {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn fenced_and_bare_analysis_payloads_parse_identically() {
        let bare = r#"{"outfit": "áo sơ mi lụa trắng", "background": "studio ánh sáng mềm"}"#;
        let fenced = format!("```json\n{bare}\n```");
        assert_eq!(
            parse_style_payload(bare).unwrap(),
            parse_style_payload(&fenced).unwrap()
        );
    }

    #[test]
    fn generic_fence_is_also_stripped() {
        let fenced = "```\n{\"outfit\": \"a\", \"background\": \"b\"}\n```";
        let style = parse_style_payload(fenced).unwrap();
        assert_eq!(style.outfit, "a");
        assert_eq!(style.background, "b");
    }

    #[test]
    fn garbage_analysis_payload_is_an_analysis_error() {
        assert!(matches!(
            parse_style_payload("not json at all"),
            Err(AppError::Analysis(_))
        ));
    }

    #[test]
    fn image_part_wins_over_text_part() {
        let resp = response(serde_json::json!({
            "candidates": [{
                "content": { "parts": [
                    { "text": "here you go" },
                    { "inlineData": { "data": "QUJD", "mimeType": "image/png" } }
                ]},
                "finishReason": "STOP"
            }]
        }));
        assert_eq!(extract_variation_image(&resp).unwrap(), "QUJD");
    }

    #[test]
    fn text_only_response_is_a_generation_error() {
        let resp = response(serde_json::json!({
            "candidates": [{
                "content": { "parts": [{ "text": "I cannot do that" }] },
                "finishReason": "STOP"
            }]
        }));
        let err = extract_variation_image(&resp).unwrap_err();
        assert!(err.to_string().contains("I cannot do that"));
    }

    #[test]
    fn non_stop_finish_reason_is_a_policy_failure() {
        let resp = response(serde_json::json!({
            "candidates": [{ "content": { "parts": [] }, "finishReason": "SAFETY" }]
        }));
        let err = extract_variation_image(&resp).unwrap_err();
        assert!(err.to_string().contains("SAFETY"));
    }

    #[test]
    fn non_image_inline_data_is_ignored() {
        let resp = response(serde_json::json!({
            "candidates": [{
                "content": { "parts": [
                    { "inlineData": { "data": "QUJD", "mimeType": "application/octet-stream" } }
                ]}
            }]
        }));
        assert!(extract_variation_image(&resp).is_err());
    }

    #[test]
    fn variation_prompt_embeds_all_inputs() {
        let style = StyleDescription {
            outfit: "vest xám than".into(),
            background: "văn phòng kính".into(),
        };
        let prompt = build_variation_prompt(&style, AspectRatio::Wide, "góc thấp hướng lên");
        assert!(prompt.contains("16:9"));
        assert!(prompt.contains("góc thấp hướng lên"));
        assert!(prompt.contains("vest xám than"));
        assert!(prompt.contains("văn phòng kính"));
        assert!(prompt.contains("#00FF00"));
    }
}
