use porter_core::detector::DetectorError;
use porter_core::recognizer::RecognizerError;
use porter_core::{Descriptor, FaceDetector, FaceRecognizer};
use porter_hw::frame::adjust_brightness_contrast;
use porter_hw::Frame;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("cannot start engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// The strongest face in a frame and its descriptor.
#[derive(Debug, Clone)]
pub struct AnalyzedFace {
    pub detection_confidence: f32,
    pub descriptor: Descriptor,
}

/// Result of analysing one frame.
#[derive(Debug, Clone)]
pub enum Analysis {
    /// No detection reached the requested minimum. Carries the best score
    /// seen, 0 when nothing was detected at all.
    NoFace { detection_confidence: f32 },
    Face(AnalyzedFace),
}

/// Blocking face analysis, run on the engine thread.
pub trait FaceAnalyzer: Send + 'static {
    fn analyze(&mut self, frame: Frame, min_confidence: f32) -> Result<Analysis, EngineError>;
}

/// Model paths and preprocessing for the ONNX analyzer.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub scrfd_path: String,
    pub arcface_path: String,
    pub contrast: f32,
    pub brightness: f32,
}

/// SCRFD + ArcFace analyzer with lighting normalisation.
pub struct OnnxAnalyzer {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    contrast: f32,
    brightness: f32,
}

impl OnnxAnalyzer {
    pub fn load(settings: &EngineSettings) -> Result<Self, EngineError> {
        let detector = FaceDetector::load(&settings.scrfd_path)?;
        tracing::info!(path = %settings.scrfd_path, "SCRFD detector loaded");

        let recognizer = FaceRecognizer::load(&settings.arcface_path)?;
        tracing::info!(path = %settings.arcface_path, "ArcFace recognizer loaded");

        Ok(Self {
            detector,
            recognizer,
            contrast: settings.contrast,
            brightness: settings.brightness,
        })
    }
}

impl FaceAnalyzer for OnnxAnalyzer {
    fn analyze(&mut self, mut frame: Frame, min_confidence: f32) -> Result<Analysis, EngineError> {
        adjust_brightness_contrast(&mut frame.data, self.contrast, self.brightness);

        let faces = self.detector.detect(&frame.data, frame.width, frame.height)?;
        let Some(face) = faces.into_iter().next() else {
            return Ok(Analysis::NoFace {
                detection_confidence: 0.0,
            });
        };

        tracing::debug!(
            confidence = face.confidence,
            sequence = frame.sequence,
            "best face detected"
        );

        if face.confidence < min_confidence {
            return Ok(Analysis::NoFace {
                detection_confidence: face.confidence,
            });
        }

        let descriptor = self
            .recognizer
            .extract(&frame.data, frame.width, frame.height, &face)?;

        Ok(Analysis::Face(AnalyzedFace {
            detection_confidence: face.confidence,
            descriptor,
        }))
    }
}

struct AnalyzeRequest {
    frame: Frame,
    min_confidence: f32,
    reply: oneshot::Sender<Result<Analysis, EngineError>>,
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<AnalyzeRequest>,
}

impl EngineHandle {
    /// Detect the strongest face in `frame` and compute its descriptor.
    pub async fn analyze(&self, frame: Frame, min_confidence: f32) -> Result<Analysis, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(AnalyzeRequest {
                frame,
                min_confidence,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Load both ONNX models and start the engine thread. Fails fast if a
/// model is missing.
pub fn spawn_engine(settings: &EngineSettings) -> Result<EngineHandle, EngineError> {
    spawn_worker(OnnxAnalyzer::load(settings)?)
}

/// Run `analyzer` on a dedicated OS thread serving requests in order.
///
/// The thread exits once every handle has been dropped.
pub fn spawn_worker<A: FaceAnalyzer>(mut analyzer: A) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<AnalyzeRequest>(4);

    std::thread::Builder::new()
        .name("porter-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                let result = analyzer.analyze(req.frame, req.min_confidence);
                // The requester may have given up (session teardown).
                let _ = req.reply.send(result);
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Analyzer driven by frame width: 0 = error, 1 = no face,
    /// anything else = a face whose descriptor is `[width, 0]`.
    pub(crate) struct WidthAnalyzer;

    impl FaceAnalyzer for WidthAnalyzer {
        fn analyze(&mut self, frame: Frame, min_confidence: f32) -> Result<Analysis, EngineError> {
            match frame.width {
                0 => Err(EngineError::ChannelClosed),
                1 => Ok(Analysis::NoFace {
                    detection_confidence: 0.0,
                }),
                w => {
                    let confidence = 0.9;
                    if confidence < min_confidence {
                        return Ok(Analysis::NoFace {
                            detection_confidence: confidence,
                        });
                    }
                    Ok(Analysis::Face(AnalyzedFace {
                        detection_confidence: confidence,
                        descriptor: Descriptor::new(vec![w as f32, 0.0]),
                    }))
                }
            }
        }
    }

    pub(crate) fn frame(width: u32) -> Frame {
        Frame::from_rgb(vec![0u8; width as usize * 3], width, 1).unwrap()
    }

    #[tokio::test]
    async fn test_worker_serves_requests() {
        let handle = spawn_worker(WidthAnalyzer).unwrap();
        match handle.analyze(frame(4), 0.5).await.unwrap() {
            Analysis::Face(face) => assert_eq!(face.descriptor.values, vec![4.0, 0.0]),
            other => panic!("expected face, got {other:?}"),
        }
        assert!(matches!(
            handle.analyze(frame(1), 0.5).await.unwrap(),
            Analysis::NoFace { .. }
        ));
    }

    #[tokio::test]
    async fn test_min_confidence_is_forwarded() {
        let handle = spawn_worker(WidthAnalyzer).unwrap();
        match handle.analyze(frame(4), 0.95).await.unwrap() {
            Analysis::NoFace {
                detection_confidence,
            } => assert!((detection_confidence - 0.9).abs() < 1e-6),
            other => panic!("expected no face, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_analyzer_error_is_returned() {
        let handle = spawn_worker(WidthAnalyzer).unwrap();
        assert!(handle.analyze(frame(0), 0.5).await.is_err());
        // The worker survives an error.
        assert!(handle.analyze(frame(3), 0.5).await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = EngineHandle { tx };
        assert!(matches!(
            handle.analyze(frame(2), 0.5).await,
            Err(EngineError::ChannelClosed)
        ));
    }

    #[test]
    fn test_missing_models_fail_fast() {
        let settings = EngineSettings {
            scrfd_path: "/nonexistent/det_10g.onnx".into(),
            arcface_path: "/nonexistent/w600k_r50.onnx".into(),
            contrast: 1.1,
            brightness: 10.0,
        };
        assert!(matches!(
            spawn_engine(&settings),
            Err(EngineError::Detector(DetectorError::ModelNotFound(_)))
        ));
    }
}
