//! Error conditions, failure policies and boundary conditions

use car_whitebg::{
    backends::ScriptedBackend,
    config::{BackendKind, ModelFailurePolicy, RemovalConfig},
    error::{Result, WhiteBgError},
    inference::{BackendFactory, SegmentationBackend, SharedSegmenter},
    processor::WhiteBackgroundProcessor,
    services::ImageIOService,
    session::{SessionState, UploadSession},
    types::{CompositeMethod, FallbackReason, MaskData, SegmentRecord},
};
use image::{Rgba, RgbaImage};
use std::sync::Arc;
use std::time::Duration;

/// A factory whose backend never loads
struct BrokenFactory;

impl BackendFactory for BrokenFactory {
    fn create_backend(&self, _config: &RemovalConfig) -> Result<Arc<dyn SegmentationBackend>> {
        Err(WhiteBgError::model("config.json missing"))
    }

    fn available_backends(&self) -> Vec<BackendKind> {
        Vec::new()
    }
}

fn png(width: u32, height: u32) -> Vec<u8> {
    ImageIOService::encode_png(&RgbaImage::from_pixel(width, height, Rgba([9, 9, 9, 255]))).unwrap()
}

fn strict_config() -> RemovalConfig {
    RemovalConfig::builder()
        .model_failure_policy(ModelFailurePolicy::Strict)
        .build()
        .unwrap()
}

#[test]
fn test_config_validation_edge_cases() {
    assert!(RemovalConfig::builder().border_ratio(0.0).build().is_ok());
    assert!(RemovalConfig::builder().border_ratio(0.5).build().is_ok());
    assert!(RemovalConfig::builder().border_ratio(-0.1).build().is_err());
    assert!(RemovalConfig::builder().border_ratio(0.51).build().is_err());
    assert!(RemovalConfig::builder().confidence_threshold(0.0).build().is_ok());
    assert!(RemovalConfig::builder()
        .inference_timeout(Duration::ZERO)
        .build()
        .is_err());

    let mut config = RemovalConfig::default();
    config.border_ratio = 0.9;
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("border ratio"));
}

#[tokio::test]
async fn test_undecodable_upload() {
    let processor =
        WhiteBackgroundProcessor::with_backend(RemovalConfig::default(), Arc::new(ScriptedBackend::empty()))
            .unwrap();

    for bytes in [&b""[..], b"GIF89a", &png(4, 4)[..10]] {
        let err = processor.process_bytes(bytes).await.unwrap_err();
        assert!(matches!(err, WhiteBgError::Decode(_)), "{err}");
        assert!(!err.is_model_failure());
    }
}

#[tokio::test]
async fn test_init_failure_uses_fallback() -> Result<()> {
    let segmenter = Arc::new(SharedSegmenter::new(
        Arc::new(BrokenFactory),
        RemovalConfig::default(),
    ));
    let processor = WhiteBackgroundProcessor::with_segmenter(RemovalConfig::default(), segmenter)?;

    let result = processor.process_bytes(&png(50, 20)).await?;
    assert!(matches!(
        result.method,
        CompositeMethod::BorderFallback {
            reason: FallbackReason::ModelUnavailable(_)
        }
    ));
    // border = floor(20 * 0.1) = 2
    assert_eq!(*result.image.get_pixel(1, 10), Rgba([255, 255, 255, 255]));
    assert_eq!(*result.image.get_pixel(2, 10), Rgba([9, 9, 9, 255]));
    Ok(())
}

#[tokio::test]
async fn test_init_failure_is_fatal_when_strict() {
    let segmenter = Arc::new(SharedSegmenter::new(Arc::new(BrokenFactory), strict_config()));
    let processor = WhiteBackgroundProcessor::with_segmenter(strict_config(), segmenter).unwrap();

    let err = processor.process_bytes(&png(8, 8)).await.unwrap_err();
    assert!(matches!(err, WhiteBgError::ModelUnavailable(_)));
}

#[tokio::test(start_paused = true)]
async fn test_inference_timeout() {
    let backend = ScriptedBackend::uniform("car", 4, 4, 255).with_delay(Duration::from_secs(600));
    let timeout = Duration::from_secs(5);

    let lenient = RemovalConfig::builder()
        .inference_timeout(timeout)
        .build()
        .unwrap();
    let processor =
        WhiteBackgroundProcessor::with_backend(lenient, Arc::new(backend)).unwrap();
    let result = processor.process_bytes(&png(10, 10)).await.unwrap();
    assert!(result.is_fallback());

    let strict = RemovalConfig::builder()
        .inference_timeout(timeout)
        .model_failure_policy(ModelFailurePolicy::Strict)
        .build()
        .unwrap();
    let backend = ScriptedBackend::uniform("car", 4, 4, 255).with_delay(Duration::from_secs(600));
    let processor = WhiteBackgroundProcessor::with_backend(strict, Arc::new(backend)).unwrap();
    let err = processor.process_bytes(&png(10, 10)).await.unwrap_err();
    assert!(matches!(err, WhiteBgError::Timeout(d) if d == timeout));
}

#[tokio::test]
async fn test_invalid_segment_records() {
    let invalid_score = ScriptedBackend::new(vec![SegmentRecord {
        label: "car".into(),
        score: Some(1.5),
        mask: MaskData::Raw {
            width: 1,
            height: 1,
            data: vec![255],
        },
    }]);
    let processor = WhiteBackgroundProcessor::with_backend(strict_config(), Arc::new(invalid_score))
        .unwrap();
    assert!(processor.process_bytes(&png(4, 4)).await.is_err());

    let short_mask = ScriptedBackend::new(vec![SegmentRecord {
        label: "car".into(),
        score: None,
        mask: MaskData::Raw {
            width: 4,
            height: 4,
            data: vec![255; 3],
        },
    }]);
    let processor =
        WhiteBackgroundProcessor::with_backend(RemovalConfig::default(), Arc::new(short_mask))
            .unwrap();
    let err = processor.process_bytes(&png(4, 4)).await.unwrap_err();
    assert!(matches!(err, WhiteBgError::Decode(_)));
}

fn car_segment() -> SegmentRecord {
    SegmentRecord {
        label: "car".into(),
        score: Some(0.9),
        mask: MaskData::Raw {
            width: 20,
            height: 20,
            data: vec![255; 400],
        },
    }
}

#[tokio::test]
async fn test_broken_non_subject_segments_are_ignored() -> Result<()> {
    let source = RgbaImage::from_pixel(20, 20, Rgba([9, 9, 9, 255]));
    let bytes = ImageIOService::encode_png(&source)?;

    let broken_skies = [
        SegmentRecord {
            label: "sky".into(),
            score: Some(0.8),
            mask: MaskData::Encoded(b"garbage".to_vec()),
        },
        SegmentRecord {
            label: "sky".into(),
            score: Some(1.000_000_1),
            mask: MaskData::Raw {
                width: 20,
                height: 20,
                data: vec![0; 400],
            },
        },
        SegmentRecord {
            label: "sky".into(),
            score: None,
            mask: MaskData::Absent,
        },
    ];

    for sky in broken_skies {
        for segments in [vec![car_segment(), sky.clone()], vec![sky.clone(), car_segment()]] {
            let processor =
                WhiteBackgroundProcessor::with_backend(strict_config(), Arc::new(ScriptedBackend::new(segments)))?;
            let result = processor.process_bytes(&bytes).await?;
            assert!(matches!(
                result.method,
                CompositeMethod::SubjectMask { ref label, .. } if label == "car"
            ));
            assert_eq!(result.image, source);
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_zero_sized_subject_mask_is_decode_failure() {
    let backend = ScriptedBackend::new(vec![SegmentRecord {
        label: "car".into(),
        score: Some(0.9),
        mask: MaskData::Raw {
            width: 0,
            height: 0,
            data: vec![],
        },
    }]);
    let processor =
        WhiteBackgroundProcessor::with_backend(RemovalConfig::default(), Arc::new(backend)).unwrap();
    let err = processor.process_bytes(&png(20, 20)).await.unwrap_err();
    assert!(matches!(err, WhiteBgError::Decode(_)), "{err}");
}

#[tokio::test]
async fn test_invalid_subject_score_follows_failure_policy() -> Result<()> {
    let mut car = car_segment();
    car.score = Some(1.5);
    let processor = WhiteBackgroundProcessor::with_backend(
        RemovalConfig::default(),
        Arc::new(ScriptedBackend::new(vec![car])),
    )?;
    let result = processor.process_bytes(&png(20, 20)).await?;
    assert!(matches!(
        result.method,
        CompositeMethod::BorderFallback {
            reason: FallbackReason::ModelUnavailable(_)
        }
    ));
    Ok(())
}

#[tokio::test]
async fn test_tiny_images() -> Result<()> {
    let processor =
        WhiteBackgroundProcessor::with_backend(RemovalConfig::default(), Arc::new(ScriptedBackend::empty()))?;

    // border = floor(1 * 0.1) = 0, nothing changes
    let result = processor.process_bytes(&png(1, 1)).await?;
    assert_eq!(*result.image.get_pixel(0, 0), Rgba([9, 9, 9, 255]));

    // border = floor(10 * 0.1) = 1
    let result = processor.process_bytes(&png(10, 30)).await?;
    assert_eq!(result.dimensions(), (10, 30));
    assert_eq!(*result.image.get_pixel(0, 15), Rgba([255, 255, 255, 255]));
    assert_eq!(*result.image.get_pixel(1, 15), Rgba([9, 9, 9, 255]));
    assert_eq!(*result.image.get_pixel(5, 29), Rgba([255, 255, 255, 255]));
    Ok(())
}

#[tokio::test]
async fn test_session_failure_returns_to_idle() {
    let segmenter = Arc::new(SharedSegmenter::new(Arc::new(BrokenFactory), strict_config()));
    let processor = WhiteBackgroundProcessor::with_segmenter(strict_config(), segmenter).unwrap();
    let mut session = UploadSession::new(processor);

    assert!(session.upload(&png(8, 8)).await.is_err());
    assert!(matches!(session.state(), SessionState::Idle));
    assert_eq!(
        session.notification(),
        Some("The image processing model is unavailable. Please try again later.")
    );

    let missing = session.upload_file("/nonexistent/car.jpg").await.unwrap_err();
    assert!(matches!(missing, WhiteBgError::Io(_)));
    assert!(matches!(session.state(), SessionState::Idle));
}
