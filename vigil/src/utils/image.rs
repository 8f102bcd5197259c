use image::{codecs::jpeg::JpegEncoder, ColorType, DynamicImage, ImageResult};
use serde::{Deserialize, Serialize};

/// JPEG quality in the range the encoder accepts. Streamed frames use a low
/// quality to stay under a single datagram, analysed frames a high one.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(try_from = "u8", into = "u8")]
pub struct JpegQuality(u8);

impl JpegQuality {
    /// Quality used for frames pushed over UDP.
    pub const STREAM: JpegQuality = JpegQuality(30);
    /// Quality used for frames sent to the vision model.
    pub const ANALYSIS: JpegQuality = JpegQuality(95);

    /// Raw quality value.
    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for JpegQuality {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if (1..=100).contains(&value) {
            Ok(Self(value))
        } else {
            Err(format!("jpeg quality {value} is outside 1..=100"))
        }
    }
}

impl From<JpegQuality> for u8 {
    fn from(value: JpegQuality) -> Self {
        value.0
    }
}

/// Encode a frame as JPEG. Alpha is dropped since JPEG cannot carry it.
///
/// * `frame`: frame from a frame source.
/// * `quality`: encoder quality.
pub fn encode_jpeg(frame: &DynamicImage, quality: JpegQuality) -> ImageResult<Vec<u8>> {
    let rgb = frame.to_rgb8();
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, quality.get()).encode(
        rgb.as_raw(),
        rgb.width(),
        rgb.height(),
        ColorType::Rgb8,
    )?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use rstest::rstest;

    #[rstest]
    #[case(0, false)]
    #[case(1, true)]
    #[case(30, true)]
    #[case(100, true)]
    #[case(101, false)]
    fn test_jpeg_quality_bounds(#[case] raw: u8, #[case] valid: bool) {
        assert_eq!(JpegQuality::try_from(raw).is_ok(), valid);
    }

    #[test]
    fn test_encoded_frame_decodes_as_jpeg() {
        let frame = DynamicImage::ImageRgb8(ImageBuffer::from_fn(32, 16, |x, y| {
            Rgb([(x * 8) as u8, (y * 16) as u8, 128])
        }));
        let bytes = encode_jpeg(&frame, JpegQuality::STREAM).expect("encode");

        assert_eq!(
            image::guess_format(&bytes).expect("format"),
            image::ImageFormat::Jpeg
        );
        let decoded = image::load_from_memory(&bytes).expect("decode");
        assert_eq!((decoded.width(), decoded.height()), (32, 16));
    }

    #[test]
    fn test_quality_from_yaml() {
        let quality: JpegQuality = serde_yaml::from_str("45").expect("parse");
        assert_eq!(quality.get(), 45);
        assert!(serde_yaml::from_str::<JpegQuality>("0").is_err());
    }
}
