//! Frame geometry negotiation against the sensor's fixed line layout.
//!
//! The sensor clocks out whole lines of `line_stride` bytes (active pixels
//! plus blanking), so the image size is always `line_stride * height`.
//! Width is fixed by the sensor; only the line count per frame and the
//! pixel format are negotiable.

use serde::{Deserialize, Serialize};

use crate::capture::frame::PixelFormat;
use crate::error::FormatError;
use crate::SensorConfig;

/// A committed frame geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiatedFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub bytes_per_line: usize,
    pub size_image: usize,
}

/// What the device can do
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub driver: &'static str,
    pub card: String,
    pub bus_info: String,
    pub streaming: bool,
    pub read_write: bool,
    pub min_buffers: usize,
    pub max_buffers: usize,
    pub formats: Vec<PixelFormat>,
}

/// Validates requests against one sensor's geometry.
#[derive(Debug, Clone)]
pub struct FormatNegotiator {
    sensor: SensorConfig,
    word_bytes: usize,
}

impl FormatNegotiator {
    pub fn new(sensor: SensorConfig, bits_per_word: u8) -> Self {
        Self {
            sensor,
            word_bytes: usize::from(bits_per_word).div_ceil(8).max(1),
        }
    }

    pub fn formats(&self) -> &[PixelFormat] {
        &self.sensor.formats
    }

    /// Adjust a request to the nearest supported format. Never fails; the
    /// width always snaps to the sensor's line width.
    pub fn try_format(&self, _width: u32, height: u32, pixel_format: PixelFormat) -> NegotiatedFormat {
        let pixel_format = if self.sensor.formats.contains(&pixel_format) {
            pixel_format
        } else {
            self.sensor.formats.first().copied().unwrap_or(self.sensor.format)
        };
        let height = height.clamp(1, self.sensor.max_height.max(1));
        self.build(self.sensor.width, height, pixel_format)
    }

    /// Validate a request exactly; no adjustment.
    pub fn validate(
        &self,
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
    ) -> Result<NegotiatedFormat, FormatError> {
        if !self.sensor.formats.contains(&pixel_format) {
            return Err(FormatError::UnsupportedPixelFormat(pixel_format));
        }
        if width != self.sensor.width {
            return Err(FormatError::InvalidWidth {
                requested: width,
                supported: self.sensor.width,
            });
        }
        if height == 0 || height > self.sensor.max_height {
            return Err(FormatError::InvalidHeight {
                requested: height,
                max: self.sensor.max_height,
            });
        }
        let needed = width as usize * pixel_format.bytes_per_pixel();
        if needed > self.sensor.line_stride {
            return Err(FormatError::LineTooWide {
                width,
                format: pixel_format,
                needed,
                stride: self.sensor.line_stride,
            });
        }
        let format = self.build(width, height, pixel_format);
        if format.size_image % self.word_bytes != 0 {
            return Err(FormatError::Misaligned {
                size: format.size_image,
                word_bytes: self.word_bytes,
            });
        }
        Ok(format)
    }

    fn build(&self, width: u32, height: u32, pixel_format: PixelFormat) -> NegotiatedFormat {
        NegotiatedFormat {
            width,
            height,
            pixel_format,
            bytes_per_line: self.sensor.line_stride,
            size_image: self.sensor.line_stride * height as usize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;

    fn negotiator() -> FormatNegotiator {
        FormatNegotiator::new(Config::default().sensor, 32)
    }

    #[test]
    fn accepts_native_geometry() {
        let fmt = negotiator().validate(80, 60, PixelFormat::Argb32).unwrap();
        assert_eq!(fmt.bytes_per_line, 1024);
        assert_eq!(fmt.size_image, 1024 * 60);
    }

    #[test]
    fn rejects_unsupported_pixel_format() {
        assert_eq!(
            negotiator().validate(80, 60, PixelFormat::Rgb24),
            Err(FormatError::UnsupportedPixelFormat(PixelFormat::Rgb24))
        );
    }

    #[test]
    fn rejects_foreign_width_and_bad_height() {
        let n = negotiator();
        assert!(matches!(
            n.validate(640, 60, PixelFormat::Argb32),
            Err(FormatError::InvalidWidth { supported: 80, .. })
        ));
        assert!(matches!(
            n.validate(80, 0, PixelFormat::Argb32),
            Err(FormatError::InvalidHeight { .. })
        ));
        assert!(matches!(
            n.validate(80, 241, PixelFormat::Argb32),
            Err(FormatError::InvalidHeight { max: 240, .. })
        ));
    }

    #[test]
    fn rejects_line_wider_than_stride() {
        let mut sensor = Config::default().sensor;
        sensor.line_stride = 256;
        let n = FormatNegotiator::new(sensor, 8);
        assert!(matches!(
            n.validate(80, 10, PixelFormat::Argb32),
            Err(FormatError::LineTooWide { needed: 320, .. })
        ));
    }

    #[test]
    fn rejects_image_not_word_aligned() {
        let mut sensor = Config::default().sensor;
        sensor.line_stride = 322;
        let n = FormatNegotiator::new(sensor, 32);
        assert!(matches!(
            n.validate(80, 1, PixelFormat::Argb32),
            Err(FormatError::Misaligned { word_bytes: 4, .. })
        ));
    }

    #[test]
    fn try_format_clamps_instead_of_failing() {
        let fmt = negotiator().try_format(640, 1000, PixelFormat::Gray8);
        assert_eq!(fmt.width, 80);
        assert_eq!(fmt.height, 240);
        assert_eq!(fmt.pixel_format, PixelFormat::Argb32);
    }
}
