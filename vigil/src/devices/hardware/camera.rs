use crate::error::CaptureError;
use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

/// Anything the capture loop can pull frames from.
pub trait FrameSource: Send {
    /// Next frame. Sources loop forever, so an error is a failed frame and
    /// not the end of the stream.
    fn next_frame(&mut self) -> Result<DynamicImage, CaptureError>;
}

/// Which frame source the streamer captures from.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum CameraConfig {
    /// Synthetic frames, no hardware needed.
    TestPattern { width: u32, height: u32 },
    /// Loop over the images in a directory in file name order.
    ImageSequence { directory: PathBuf },
}

impl Default for CameraConfig {
    fn default() -> Self {
        CameraConfig::TestPattern {
            width: 640,
            height: 480,
        }
    }
}

impl CameraConfig {
    /// Build the frame source described by this config.
    pub fn open(&self) -> Result<Box<dyn FrameSource>, CaptureError> {
        Ok(match self {
            CameraConfig::TestPattern { width, height } => {
                Box::new(TestPattern::new(*width, *height))
            }
            CameraConfig::ImageSequence { directory } => Box::new(ImageSequence::open(directory)?),
        })
    }
}

/// Pixels the test pattern bar moves per frame.
const BAR_STEP: u32 = 4;

/// Grey frame with a bright bar that moves one step per frame, so a viewer
/// can tell the stream is live.
pub struct TestPattern {
    width: u32,
    height: u32,
    /// Left edge of the bar, always below `width`.
    bar: u32,
}

impl TestPattern {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            bar: 0,
        }
    }
}

impl FrameSource for TestPattern {
    fn next_frame(&mut self) -> Result<DynamicImage, CaptureError> {
        let bar_width = (self.width / 16).max(1);
        let bar = self.bar;
        self.bar = (self.bar + BAR_STEP) % self.width;

        let frame = ImageBuffer::from_fn(self.width, self.height, |x, _| {
            if x >= bar && x < bar + bar_width {
                Rgb([240, 240, 240])
            } else {
                Rgb([64, 64, 64])
            }
        });
        Ok(DynamicImage::ImageRgb8(frame))
    }
}

/// Plays back a directory of still images on repeat.
pub struct ImageSequence {
    uuid: Uuid,
    paths: Vec<PathBuf>,
    next: usize,
}

impl ImageSequence {
    /// Index the images in `directory`. Files the image crate cannot name a
    /// format for are skipped.
    ///
    /// * `directory`: folder holding the frames.
    pub fn open(directory: &Path) -> Result<Self, CaptureError> {
        let entries = std::fs::read_dir(directory).map_err(|source| CaptureError::Io {
            path: directory.to_path_buf(),
            source,
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && ImageFormat::from_path(path).is_ok())
            .collect();
        paths.sort();

        if paths.is_empty() {
            return Err(CaptureError::Empty(directory.to_path_buf()));
        }

        let uuid = Uuid::new_v4();
        info!(source = %uuid, frames = paths.len(), ?directory, "opened image sequence");
        Ok(Self {
            uuid,
            paths,
            next: 0,
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

}

impl FrameSource for ImageSequence {
    fn next_frame(&mut self) -> Result<DynamicImage, CaptureError> {
        let path = &self.paths[self.next];
        self.next = (self.next + 1) % self.paths.len();
        Ok(image::open(path)?)
    }
}
