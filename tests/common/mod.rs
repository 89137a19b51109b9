//! Stub model backends and fixtures shared by the end-to-end tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use image::{Rgb, RgbImage};
use vidreason::{
    DispatchConfig, Dispatcher, FnBackend, FrameAnnotation, ModelCall, ModelId, ModelOutput, ModelRegistry,
    Sample, Video,
};

/// Dispatch settings with short timeouts so failures show up quickly.
pub fn fast_dispatch() -> DispatchConfig {
    DispatchConfig {
        servers: 4,
        reply_channels: 8,
        request_timeout_ms: 2_000,
        max_retries: 0,
        retry_backoff_ms: 1,
        ..DispatchConfig::default()
    }
}

/// A video whose frames are 8x8 squares of the given colors.
pub fn colored_video(colors: &[[u8; 3]]) -> Arc<Video> {
    let frames = colors.iter().map(|c| RgbImage::from_pixel(8, 8, Rgb(*c))).collect();
    Arc::new(Video::unannotated(frames))
}

/// A video of `n` grey frames, each with one subtitle line.
pub fn subtitled_video(n: usize) -> Arc<Video> {
    let frames = (0..n).map(|_| RgbImage::from_pixel(8, 8, Rgb([90, 90, 90]))).collect();
    let annotations = (0..n)
        .map(|i| FrameAnnotation {
            bboxes: Vec::new(),
            subtitles: vec![format!("line {i}")],
        })
        .collect();
    Arc::new(Video::new(frames, annotations).unwrap())
}

/// Embeds the color of the crop's first pixel; black crops have no face.
pub fn color_embedding(call: &ModelCall) -> Result<ModelOutput, String> {
    let crop = call.image_arg().ok_or("missing image")?;
    let Rgb([r, g, b]) = *crop.image.get_pixel(crop.bbox.left, crop.bbox.lower);
    if (r, g, b) == (0, 0, 0) {
        return Ok(ModelOutput::Embedding(None));
    }
    Ok(ModelOutput::Embedding(Some(vec![f32::from(r), f32::from(g), f32::from(b)])))
}

/// Summarizer that keeps the first half of its input.
pub fn halving_summarizer(call: &ModelCall) -> Result<ModelOutput, String> {
    let text = call.text_arg(0).unwrap_or_default();
    let keep = text.chars().count() / 2;
    Ok(ModelOutput::Text(text.chars().take(keep).collect()))
}

/// Decision model that always picks "yes".
pub fn decide_yes(_call: &ModelCall) -> Result<ModelOutput, String> {
    Ok(ModelOutput::Text(r#"Sure. {"answer": "yes", "reason": "seen in the notes"}"#.to_string()))
}

/// Language model that answers "Yes." after sleeping for the number of
/// milliseconds named in the question ("wait 30").
pub fn sleepy_llm(call: &ModelCall) -> Result<ModelOutput, String> {
    let question = call.text_arg(0).unwrap_or_default();
    let millis = question
        .split_whitespace()
        .find_map(|w| w.parse::<u64>().ok())
        .unwrap_or(0);
    thread::sleep(Duration::from_millis(millis));
    Ok(ModelOutput::Text(format!("Yes. {question}")))
}

/// Every model the e2e programs use.
pub fn stub_registry() -> ModelRegistry {
    ModelRegistry::new()
        .with(ModelId::Llm, FnBackend::new(sleepy_llm))
        .with(ModelId::Vqa, FnBackend::new(|_| Ok(ModelOutput::Text("yes".to_string()))))
        .with(ModelId::FaceEmbedding, FnBackend::new(color_embedding))
        .with(ModelId::Summarizer, FnBackend::new(halving_summarizer))
        .with(ModelId::Decision, FnBackend::new(decide_yes))
}

pub fn stub_dispatcher() -> Dispatcher {
    Dispatcher::start(&fast_dispatch(), stub_registry())
}

pub fn sample(id: &str, video: Arc<Video>, groundtruth: &str, group: Option<&str>) -> Sample {
    Sample {
        id: id.to_string(),
        video,
        query: format!("Question for {id}?"),
        possible_answers: vec!["yes".to_string(), "no".to_string()],
        groundtruth: groundtruth.to_string(),
        group: group.map(str::to_string),
    }
}
