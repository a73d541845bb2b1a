use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::AppError;
use crate::gemini::StyleProvider;
use crate::models::{
    AspectRatio, GenerationSession, Phase, StoredImage, StyleDescription, VARIATION_COUNT,
};
use crate::preprocess;

/// The single slot holding the current generation run. Starting a new run
/// replaces the slot; a superseded run's token no longer matches and its
/// late results are discarded instead of appended.
pub type SessionSlot = Arc<RwLock<Option<GenerationSession>>>;

/// Validate the preconditions that gate any network call and install a
/// fresh session, superseding whatever run was in the slot before.
///
/// Returns the session token the drive task must present on every write,
/// plus the source image it should work from. Variation prompts are NOT
/// validated here: each one is checked lazily when its index is reached.
pub fn install_session(
    slot: &SessionSlot,
    source: Option<&StoredImage>,
    style: &StyleDescription,
    aspect_ratio: AspectRatio,
    prompts: &[String],
) -> Result<(Uuid, StoredImage), AppError> {
    let source = source
        .ok_or_else(|| AppError::MissingField("upload a source portrait first".into()))?
        .clone();
    if !style.is_complete() {
        return Err(AppError::MissingField(
            "analyze an inspiration image or fill in the outfit and background descriptions".into(),
        ));
    }
    if prompts.len() != VARIATION_COUNT {
        return Err(AppError::InvalidInput(format!(
            "expected {VARIATION_COUNT} variation prompts, got {}",
            prompts.len()
        )));
    }

    let session = GenerationSession::new(style.clone(), aspect_ratio, prompts.to_vec());
    let token = session.id;
    info!("🚀 Starting generation session {} at {}", token, aspect_ratio);
    *slot.write() = Some(session);
    Ok((token, source))
}

/// Run one generation session to completion: decode, pad once, then nine
/// strictly sequential variation calls with per-call error isolation.
/// Already-produced images survive any mid-loop failure.
pub async fn drive_session(
    slot: SessionSlot,
    token: Uuid,
    source: StoredImage,
    provider: Arc<dyn StyleProvider>,
) {
    let Some((style, aspect_ratio, prompts)) = read_session(&slot, token, |s| {
        (s.style.clone(), s.aspect_ratio, s.prompts.clone())
    }) else {
        return;
    };

    let decoded = match image::load_from_memory(&source.bytes) {
        Ok(img) => img,
        Err(e) => {
            fail(&slot, token, 0, format!("could not decode the source image: {e}"));
            return;
        }
    };

    // One padded image, reused for all nine calls.
    let padded = match preprocess::pad_to_aspect(&decoded, aspect_ratio) {
        Ok(img) => img,
        Err(e) => {
            fail(&slot, token, 0, e.to_string());
            return;
        }
    };

    for (i, prompt) in prompts.iter().enumerate() {
        if prompt.trim().is_empty() {
            fail(
                &slot,
                token,
                i,
                format!("variation {} has no description; fill it in and retry", i + 1),
            );
            return;
        }

        if !mutate(&slot, token, |s| s.phase = Phase::Generating(i)) {
            info!("⏭️ Session {} superseded before variation {}", token, i + 1);
            return;
        }

        match provider
            .generate_variation(&padded, &style, aspect_ratio, prompt)
            .await
        {
            Ok(payload) => {
                let preview_len = payload.len();
                if !mutate(&slot, token, |s| s.produced_images.push(payload)) {
                    info!("⏭️ Session {} superseded, discarding variation {}", token, i + 1);
                    return;
                }
                info!("✅ Variation {}/{} complete ({} chars)", i + 1, VARIATION_COUNT, preview_len);
            }
            Err(e) => {
                fail(&slot, token, i, e.to_string());
                return;
            }
        }
    }

    mutate(&slot, token, |s| s.phase = Phase::Done);
    info!("🎉 Session {} complete with {} variations", token, VARIATION_COUNT);
}

/// Apply `f` to the session only while `token` still owns the slot.
fn mutate(slot: &SessionSlot, token: Uuid, f: impl FnOnce(&mut GenerationSession)) -> bool {
    let mut guard = slot.write();
    match guard.as_mut() {
        Some(session) if session.id == token => {
            f(session);
            session.updated_at = Utc::now();
            true
        }
        _ => false,
    }
}

fn read_session<T>(
    slot: &SessionSlot,
    token: Uuid,
    f: impl FnOnce(&GenerationSession) -> T,
) -> Option<T> {
    let guard = slot.read();
    match guard.as_ref() {
        Some(session) if session.id == token => Some(f(session)),
        _ => None,
    }
}

fn fail(slot: &SessionSlot, token: Uuid, index: usize, message: String) {
    error!("❌ Session {} failed at variation {}: {}", token, index + 1, message);
    mutate(slot, token, |s| {
        s.phase = Phase::Failed(index);
        s.last_error = Some(message);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use image::{Rgb, RgbImage};
    use pretty_assertions::assert_eq;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::models::default_variation_prompts;

    /// Deterministic provider: returns "img-<angle>" per call, optionally
    /// failing once a given call number is reached (1-based).
    struct FakeProvider {
        fail_on_call: Option<usize>,
        calls: AtomicUsize,
    }

    impl FakeProvider {
        fn ok() -> Self {
            Self { fail_on_call: None, calls: AtomicUsize::new(0) }
        }

        fn failing_on(call: usize) -> Self {
            Self { fail_on_call: Some(call), calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl StyleProvider for FakeProvider {
        async fn analyze_style(&self, _image: &StoredImage) -> Result<StyleDescription, AppError> {
            Ok(StyleDescription {
                outfit: "áo vest".into(),
                background: "studio".into(),
            })
        }

        async fn generate_variation(
            &self,
            _image: &StoredImage,
            _style: &StyleDescription,
            _aspect_ratio: AspectRatio,
            camera_angle: &str,
        ) -> Result<String, AppError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on_call == Some(call) {
                return Err(AppError::GenerationCall("quota exhausted".into()));
            }
            Ok(format!("img-{camera_angle}"))
        }
    }

    fn source_image() -> StoredImage {
        let img = RgbImage::from_pixel(8, 8, Rgb([120, 80, 40]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        StoredImage::new(Bytes::from(buf.into_inner()), "image/png".into())
    }

    fn complete_style() -> StyleDescription {
        StyleDescription {
            outfit: "áo dài đỏ".into(),
            background: "phố cổ Hà Nội".into(),
        }
    }

    fn slot() -> SessionSlot {
        Arc::new(RwLock::new(None))
    }

    async fn run(
        slot: &SessionSlot,
        prompts: Vec<String>,
        provider: Arc<dyn StyleProvider>,
    ) -> GenerationSession {
        let (token, source) = install_session(
            slot,
            Some(&source_image()),
            &complete_style(),
            AspectRatio::Portrait,
            &prompts,
        )
        .unwrap();
        drive_session(slot.clone(), token, source, provider).await;
        slot.read().clone().unwrap()
    }

    #[tokio::test]
    async fn successful_run_produces_nine_images_in_prompt_order() {
        let slot = slot();
        let prompts = default_variation_prompts();
        let session = run(&slot, prompts.clone(), Arc::new(FakeProvider::ok())).await;

        assert_eq!(session.phase, Phase::Done);
        assert_eq!(session.produced_images.len(), VARIATION_COUNT);
        for (img, prompt) in session.produced_images.iter().zip(prompts.iter()) {
            assert_eq!(img, &format!("img-{prompt}"));
        }
        assert_eq!(session.last_error, None);
    }

    #[tokio::test]
    async fn failure_on_fifth_call_keeps_first_four_images() {
        let slot = slot();
        let session = run(
            &slot,
            default_variation_prompts(),
            Arc::new(FakeProvider::failing_on(5)),
        )
        .await;

        assert_eq!(session.phase, Phase::Failed(4));
        assert_eq!(session.produced_images.len(), 4);
        assert!(session.last_error.unwrap().contains("quota exhausted"));
    }

    #[tokio::test]
    async fn empty_prompt_at_index_three_halts_with_three_images() {
        let slot = slot();
        let mut prompts = default_variation_prompts();
        prompts[3] = "   ".into();
        let session = run(&slot, prompts, Arc::new(FakeProvider::ok())).await;

        assert_eq!(session.phase, Phase::Failed(3));
        assert_eq!(session.produced_images.len(), 3);
        assert!(session.last_error.unwrap().contains("variation 4"));
    }

    #[tokio::test]
    async fn missing_source_is_a_missing_field_error() {
        let err = install_session(
            &slot(),
            None,
            &complete_style(),
            AspectRatio::Square,
            &default_variation_prompts(),
        )
        .unwrap_err();
        assert!(matches!(err, AppError::MissingField(_)));
    }

    #[tokio::test]
    async fn incomplete_style_is_rejected_before_any_call() {
        let style = StyleDescription {
            outfit: "áo vest".into(),
            background: String::new(),
        };
        let err = install_session(
            &slot(),
            Some(&source_image()),
            &style,
            AspectRatio::Square,
            &default_variation_prompts(),
        )
        .unwrap_err();
        assert!(matches!(err, AppError::MissingField(_)));
    }

    #[tokio::test]
    async fn superseded_run_does_not_write_into_newer_session() {
        let slot = slot();
        let (stale_token, stale_source) = install_session(
            &slot,
            Some(&source_image()),
            &complete_style(),
            AspectRatio::Square,
            &default_variation_prompts(),
        )
        .unwrap();

        // A newer run takes over the slot before the stale one executes.
        let (fresh_token, _) = install_session(
            &slot,
            Some(&source_image()),
            &complete_style(),
            AspectRatio::Wide,
            &default_variation_prompts(),
        )
        .unwrap();

        drive_session(slot.clone(), stale_token, stale_source, Arc::new(FakeProvider::ok())).await;

        let session = slot.read().clone().unwrap();
        assert_eq!(session.id, fresh_token);
        assert_eq!(session.phase, Phase::Preprocessing);
        assert!(session.produced_images.is_empty());
    }

    #[tokio::test]
    async fn undecodable_source_fails_before_any_call() {
        let slot = slot();
        let bogus = StoredImage::new(Bytes::from_static(b"not an image"), "image/png".into());
        let (token, source) = install_session(
            &slot,
            Some(&bogus),
            &complete_style(),
            AspectRatio::Square,
            &default_variation_prompts(),
        )
        .unwrap();
        drive_session(slot.clone(), token, source, Arc::new(FakeProvider::ok())).await;

        let session = slot.read().clone().unwrap();
        assert_eq!(session.phase, Phase::Failed(0));
        assert!(session.produced_images.is_empty());
    }
}
