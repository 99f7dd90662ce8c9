//! Grayscale frames decoded from photos, plus dark detection, CLAHE and resizing.

use crate::types::BoundingBox;
use image::DynamicImage;
use std::path::Path;
use thiserror::Error;

/// Share of pixels in the darkest bucket above which a frame counts as dark.
pub const DARK_FRAME_RATIO: f32 = 0.95;
const DARK_PIXEL_CEILING: u8 = 32;

const CLAHE_TILES: u32 = 8;
const CLAHE_CLIP_LIMIT: f32 = 0.02;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("cannot decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("invalid frame buffer: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("image has zero width or height")]
    Empty,
}

/// A grayscale frame, one byte per pixel in row-major order.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::Empty);
        }
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    pub fn from_image(image: &DynamicImage) -> Result<Self, FrameError> {
        let gray = image.to_luma8();
        let (width, height) = gray.dimensions();
        Self::new(gray.into_raw(), width, height)
    }

    /// Decode a photo from disk (any format the `image` crate understands).
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FrameError> {
        Self::from_image(&image::open(path)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        Self::from_image(&image::load_from_memory(bytes)?)
    }

    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&p| p as f32).sum::<f32>() / self.data.len() as f32
    }

    pub fn is_dark(&self) -> bool {
        is_dark_frame(&self.data, DARK_FRAME_RATIO)
    }

    /// Apply CLAHE contrast enhancement in place.
    pub fn enhance(&mut self) {
        clahe_enhance(&mut self.data, self.width, self.height, CLAHE_TILES, CLAHE_CLIP_LIMIT);
    }

    /// Crop the region under `face`, clamped to the frame. `None` if nothing remains.
    pub fn crop(&self, face: &BoundingBox) -> Option<Frame> {
        let x0 = face.x.floor().max(0.0) as u32;
        let y0 = face.y.floor().max(0.0) as u32;
        let x1 = ((face.x + face.width).ceil().max(0.0) as u32).min(self.width);
        let y1 = ((face.y + face.height).ceil().max(0.0) as u32).min(self.height);
        if x0 >= x1 || y0 >= y1 {
            return None;
        }

        let (w, h) = (x1 - x0, y1 - y0);
        let stride = self.width as usize;
        let mut data = Vec::with_capacity(w as usize * h as usize);
        for y in y0..y1 {
            let start = y as usize * stride + x0 as usize;
            data.extend_from_slice(&self.data[start..start + w as usize]);
        }
        Some(Frame {
            data,
            width: w,
            height: h,
        })
    }

    /// Bilinear resize to `width` × `height`.
    pub fn resized(&self, width: u32, height: u32) -> Frame {
        Frame {
            data: resize_bilinear(
                &self.data,
                self.width as usize,
                self.height as usize,
                width as usize,
                height as usize,
            ),
            width,
            height,
        }
    }
}

/// True if more than `threshold_pct` of pixels fall below 32.
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark = gray.iter().filter(|&&p| p < DARK_PIXEL_CEILING).count();
    (dark as f32 / gray.len() as f32) > threshold_pct
}

/// Bilinear resize of a grayscale buffer using pixel-center alignment.
pub fn resize_bilinear(
    src: &[u8],
    src_w: usize,
    src_h: usize,
    dst_w: usize,
    dst_h: usize,
) -> Vec<u8> {
    let mut out = vec![0u8; dst_w * dst_h];
    if src_w == 0 || src_h == 0 || src.len() < src_w * src_h {
        return out;
    }

    let scale_x = src_w as f32 / dst_w as f32;
    let scale_y = src_h as f32 / dst_h as f32;

    // Source coordinate → (low index, high index, weight of high).
    let taps = |dst: usize, scale: f32, len: usize| {
        let pos = ((dst as f32 + 0.5) * scale - 0.5).max(0.0);
        let lo = (pos.floor() as usize).min(len - 1);
        let hi = (lo + 1).min(len - 1);
        (lo, hi, (pos - lo as f32).clamp(0.0, 1.0))
    };

    for y in 0..dst_h {
        let (y0, y1, wy) = taps(y, scale_y, src_h);
        for x in 0..dst_w {
            let (x0, x1, wx) = taps(x, scale_x, src_w);
            let px = |xx: usize, yy: usize| src[yy * src_w + xx] as f32;

            let top = px(x0, y0) + (px(x1, y0) - px(x0, y0)) * wx;
            let bottom = px(x0, y1) + (px(x1, y1) - px(x0, y1)) * wx;
            out[y * dst_w + x] = (top + (bottom - top) * wy).round().clamp(0.0, 255.0) as u8;
        }
    }

    out
}

/// Contrast-Limited Adaptive Histogram Equalization on a square tile grid.
///
/// Each tile gets a clipped, redistributed histogram turned into a lookup
/// table; pixels blend the four nearest tile tables bilinearly.
pub fn clahe_enhance(gray: &mut [u8], width: u32, height: u32, tiles: u32, clip_limit: f32) {
    let (w, h, n) = (width as usize, height as usize, tiles as usize);
    if n == 0 || w == 0 || h == 0 || gray.len() < w * h {
        return;
    }
    let (tile_w, tile_h) = (w / n, h / n);
    if tile_w == 0 || tile_h == 0 {
        return;
    }

    let mut luts = Vec::with_capacity(n * n);
    for row in 0..n {
        for col in 0..n {
            let mut hist = [0u32; 256];
            for y in row * tile_h..(row + 1) * tile_h {
                for &p in &gray[y * w + col * tile_w..y * w + (col + 1) * tile_w] {
                    hist[p as usize] += 1;
                }
            }
            luts.push(tile_lut(&mut hist, tile_w * tile_h, clip_limit));
        }
    }

    let last = (n - 1) as f32;
    for y in 0..h {
        let fy = (y as f32 / tile_h as f32 - 0.5).clamp(0.0, last);
        let (r0, dy) = (fy as usize, fy.fract());
        let r1 = (r0 + 1).min(n - 1);
        for x in 0..w {
            let fx = (x as f32 / tile_w as f32 - 0.5).clamp(0.0, last);
            let (c0, dx) = (fx as usize, fx.fract());
            let c1 = (c0 + 1).min(n - 1);

            let p = gray[y * w + x] as usize;
            let top = luts[r0 * n + c0][p] * (1.0 - dx) + luts[r0 * n + c1][p] * dx;
            let bottom = luts[r1 * n + c0][p] * (1.0 - dx) + luts[r1 * n + c1][p] * dx;
            gray[y * w + x] = (top * (1.0 - dy) + bottom * dy).round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Clip a tile histogram, spread the excess evenly, and normalize its CDF to 0–255.
fn tile_lut(hist: &mut [u32; 256], tile_pixels: usize, clip_limit: f32) -> [f32; 256] {
    let clip = (clip_limit * tile_pixels as f32) as u32;
    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > clip {
            excess += *bin - clip;
            *bin = clip;
        }
    }
    let (share, leftover) = (excess / 256, (excess % 256) as usize);
    for (i, bin) in hist.iter_mut().enumerate() {
        *bin += share + u32::from(i < leftover);
    }

    let mut cdf = [0f32; 256];
    let mut running = 0f32;
    for (slot, &count) in cdf.iter_mut().zip(hist.iter()) {
        running += count as f32;
        *slot = running;
    }

    let cdf_min = cdf.iter().copied().find(|&v| v > 0.0).unwrap_or(0.0);
    let denom = tile_pixels as f32 - cdf_min;
    if denom > 0.0 {
        for v in cdf.iter_mut() {
            *v = ((*v - cdf_min) / denom * 255.0).clamp(0.0, 255.0);
        }
    }
    cdf
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, RgbImage};

    fn stddev(data: &[u8]) -> f32 {
        let n = data.len() as f32;
        let mean = data.iter().map(|&b| b as f32).sum::<f32>() / n;
        (data.iter().map(|&b| (b as f32 - mean).powi(2)).sum::<f32>() / n).sqrt()
    }

    #[test]
    fn test_new_rejects_bad_length() {
        assert!(matches!(
            Frame::new(vec![0; 5], 2, 2),
            Err(FrameError::InvalidLength { expected: 4, actual: 5 })
        ));
        assert!(matches!(Frame::new(vec![], 0, 2), Err(FrameError::Empty)));
    }

    #[test]
    fn test_from_image_converts_to_gray() {
        let rgb = RgbImage::from_pixel(4, 3, image::Rgb([200, 200, 200]));
        let frame = Frame::from_image(&DynamicImage::ImageRgb8(rgb)).unwrap();
        assert_eq!((frame.width, frame.height), (4, 3));
        assert_eq!(frame.data.len(), 12);
        assert!(frame.data.iter().all(|&p| p == 200));
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(matches!(Frame::from_bytes(b"not an image"), Err(FrameError::Decode(_))));
    }

    #[test]
    fn test_dark_frames() {
        assert!(is_dark_frame(&[0u8; 1000], DARK_FRAME_RATIO));
        assert!(!is_dark_frame(&[128u8; 1000], DARK_FRAME_RATIO));
        assert!(is_dark_frame(&[], DARK_FRAME_RATIO));

        let mut mostly_dark = vec![10u8; 960];
        mostly_dark.extend([128u8; 40]);
        assert!(is_dark_frame(&mostly_dark, DARK_FRAME_RATIO));

        let mut borderline = vec![10u8; 940];
        borderline.extend([128u8; 60]);
        assert!(!is_dark_frame(&borderline, DARK_FRAME_RATIO));
    }

    #[test]
    fn test_resize_uniform_stays_uniform() {
        let out = resize_bilinear(&[77u8; 100 * 60], 100, 60, 37, 211);
        assert_eq!(out.len(), 37 * 211);
        assert!(out.iter().all(|&p| p == 77));
    }

    #[test]
    fn test_resize_preserves_gradient_direction() {
        let src: Vec<u8> = (0..16).map(|i| (i % 4) as u8 * 60).collect();
        let out = resize_bilinear(&src, 4, 4, 8, 8);
        let row = &out[0..8];
        assert!(row.windows(2).all(|p| p[0] <= p[1]), "row not monotonic: {row:?}");
    }

    #[test]
    fn test_crop_clamps_to_frame() {
        let img = GrayImage::from_fn(10, 10, |x, y| Luma([(y * 10 + x) as u8]));
        let frame = Frame::from_image(&DynamicImage::ImageLuma8(img)).unwrap();
        let face = BoundingBox {
            x: 6.0,
            y: -3.0,
            width: 10.0,
            height: 5.0,
            confidence: 1.0,
            landmarks: None,
        };

        let crop = frame.crop(&face).unwrap();
        assert_eq!((crop.width, crop.height), (4, 2));
        assert_eq!(crop.data, vec![6, 7, 8, 9, 16, 17, 18, 19]);
    }

    #[test]
    fn test_crop_outside_frame() {
        let frame = Frame::new(vec![0; 16], 4, 4).unwrap();
        let face = BoundingBox {
            x: 10.0,
            y: 10.0,
            width: 5.0,
            height: 5.0,
            confidence: 1.0,
            landmarks: None,
        };
        assert!(frame.crop(&face).is_none());
    }

    #[test]
    fn test_clahe_increases_contrast() {
        let (w, h) = (16u32, 16u32);
        let mut gray: Vec<u8> = (0..(w * h) as usize).map(|i| 100 + (i % 11) as u8).collect();
        let before = stddev(&gray);
        clahe_enhance(&mut gray, w, h, 2, 0.02);
        assert!(stddev(&gray) > before);
    }
}
