use crate::error::AnalysisError;
use crate::model::{ImageAnalysis, ImageBlob, ImageFormat};
use crate::plugins::ImageProcessor;
use async_trait::async_trait;
use image::{DynamicImage, GenericImageView, ImageOutputFormat};
use std::collections::HashMap;
use std::io::Cursor;
use std::time::Duration;

pub const DEFAULT_THUMBNAIL_SIZE: u32 = 160;

/// Decodes an image and derives a thumbnail plus simple colour statistics.
#[derive(Debug, Clone, Copy)]
pub struct RasterImageProcessor {
    thumbnail_size: u32,
}

impl Default for RasterImageProcessor {
    fn default() -> Self {
        Self::new(DEFAULT_THUMBNAIL_SIZE)
    }
}

impl RasterImageProcessor {
    pub fn new(thumbnail_size: u32) -> Self {
        Self {
            thumbnail_size: thumbnail_size.max(1),
        }
    }

    pub fn analyze(&self, data: &[u8]) -> Result<ImageAnalysis, AnalysisError> {
        let img = image::load_from_memory(data)
            .map_err(|e| AnalysisError::failed(format!("cannot decode image: {e}")))?;
        let (width, height) = img.dimensions();
        if width == 0 || height == 0 {
            return Err(AnalysisError::failed("image has no pixels"));
        }

        let size = self.thumbnail_size;
        let thumbnail = if width <= size && height <= size {
            img
        } else {
            img.thumbnail(size, size)
        };
        // Statistics over the thumbnail keep large screenshots cheap.
        let (mean_brightness, dominant_color) = color_stats(&thumbnail);

        Ok(ImageAnalysis {
            width,
            height,
            aspect_ratio: width as f64 / height as f64,
            mean_brightness,
            dominant_color,
            thumbnail: encode_png(&thumbnail)?,
        })
    }
}

#[async_trait]
impl ImageProcessor for RasterImageProcessor {
    async fn process(&self, image: &ImageBlob, timeout: Duration) -> Result<ImageAnalysis, AnalysisError> {
        let processor = *self;
        let data = image.data.clone();
        tokio::time::timeout(
            timeout,
            tokio::task::spawn_blocking(move || processor.analyze(&data)),
        )
        .await
        .map_err(|_| AnalysisError::timeout(timeout))?
        .map_err(AnalysisError::failed)?
    }
}

pub(crate) fn encode_png(img: &DynamicImage) -> Result<ImageBlob, AnalysisError> {
    let mut data = Vec::new();
    img.write_to(&mut Cursor::new(&mut data), ImageOutputFormat::Png)
        .map_err(|e| AnalysisError::failed(format!("cannot encode PNG: {e}")))?;
    let (width, height) = img.dimensions();
    Ok(ImageBlob {
        format: ImageFormat::Png,
        width,
        height,
        data,
    })
}

/// Mean luma (0-255) and the average colour of the most populated 4-bit-per-channel bucket.
fn color_stats(img: &DynamicImage) -> (f64, [u8; 3]) {
    let rgb = img.to_rgb8();
    let mut luma_sum = 0.0;
    let mut buckets: HashMap<(u8, u8, u8), (u64, [u64; 3])> = HashMap::new();

    for pixel in rgb.pixels() {
        let [r, g, b] = pixel.0;
        luma_sum += 0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64;

        let entry = buckets.entry((r >> 4, g >> 4, b >> 4)).or_insert((0, [0; 3]));
        entry.0 += 1;
        entry.1[0] += r as u64;
        entry.1[1] += g as u64;
        entry.1[2] += b as u64;
    }

    let pixels = (rgb.width() as u64 * rgb.height() as u64).max(1);
    let dominant = buckets
        .into_iter()
        .max_by(|(ka, (ca, _)), (kb, (cb, _))| ca.cmp(cb).then_with(|| kb.cmp(ka)))
        .map(|(_, (count, sums))| {
            [
                (sums[0] / count) as u8,
                (sums[1] / count) as u8,
                (sums[2] / count) as u8,
            ]
        })
        .unwrap_or([0, 0, 0]);

    (luma_sum / pixels as f64, dominant)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn png(img: RgbImage) -> Vec<u8> {
        encode_png(&DynamicImage::ImageRgb8(img)).unwrap().data
    }

    #[test]
    fn test_solid_image_stats() {
        let data = png(RgbImage::from_pixel(40, 20, Rgb([200, 10, 10])));
        let analysis = RasterImageProcessor::default().analyze(&data).unwrap();
        assert_eq!((analysis.width, analysis.height), (40, 20));
        assert_eq!(analysis.aspect_ratio, 2.0);
        assert_eq!(analysis.dominant_color, [200, 10, 10]);
        assert!((analysis.mean_brightness - (0.299 * 200.0 + 0.587 * 10.0 + 0.114 * 10.0)).abs() < 0.01);
    }

    #[test]
    fn test_thumbnail_fits_box() {
        let data = png(RgbImage::from_pixel(1280, 800, Rgb([0, 0, 0])));
        let analysis = RasterImageProcessor::default().analyze(&data).unwrap();
        assert_eq!(analysis.thumbnail.format, ImageFormat::Png);
        assert_eq!(analysis.thumbnail.width, 160);
        assert_eq!(analysis.thumbnail.height, 100);
    }

    #[test]
    fn test_dominant_color_prefers_majority() {
        let mut img = RgbImage::from_pixel(10, 10, Rgb([255, 255, 255]));
        for x in 0..3 {
            img.put_pixel(x, 0, Rgb([0, 0, 255]));
        }
        let analysis = RasterImageProcessor::default().analyze(&png(img)).unwrap();
        assert_eq!(analysis.dominant_color, [255, 255, 255]);
    }

    #[test]
    fn test_garbage_bytes_fail() {
        let err = RasterImageProcessor::default().analyze(b"not an image").unwrap_err();
        assert!(matches!(err, AnalysisError::Failed { .. }));
    }

    #[tokio::test]
    async fn test_process_blob() {
        let blob = encode_png(&DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([1, 2, 3])))).unwrap();
        let analysis = RasterImageProcessor::new(4)
            .process(&blob, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(analysis.thumbnail.width, 4);
    }
}
