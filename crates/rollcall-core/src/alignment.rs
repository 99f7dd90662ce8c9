//! Five-landmark face alignment to the canonical ArcFace 112×112 crop.

use crate::frame::Frame;

/// InsightFace reference landmarks for a 112×112 crop.
pub const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: usize = 112;

/// Similarity transform `dst = [a -b; b a] * src + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    /// Least-squares fit mapping `src` points onto `dst` points.
    ///
    /// With both point sets centred on their means the optimum has a closed
    /// form, so no linear solver is needed.
    pub fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Self {
        let mean = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
            (sx / 5.0, sy / 5.0)
        };
        let (smx, smy) = mean(src);
        let (dmx, dmy) = mean(dst);

        let (mut dot, mut cross, mut energy) = (0.0f32, 0.0f32, 0.0f32);
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst) {
            let (sx, sy, dx, dy) = (sx - smx, sy - smy, dx - dmx, dy - dmy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            energy += sx * sx + sy * sy;
        }

        if energy < 1e-12 {
            return Self {
                a: 1.0,
                b: 0.0,
                tx: dmx - smx,
                ty: dmy - smy,
            };
        }

        let a = dot / energy;
        let b = cross / energy;
        Self {
            a,
            b,
            tx: dmx - (a * smx - b * smy),
            ty: dmy - (b * smx + a * smy),
        }
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    /// Inverse transform, `None` when the scale collapses to zero.
    pub fn inverse(&self) -> Option<Similarity> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let (a, b) = (self.a / det, -self.b / det);
        Some(Similarity {
            a,
            b,
            tx: -(a * self.tx - b * self.ty),
            ty: -(b * self.tx + a * self.ty),
        })
    }
}

/// Warp the face under `landmarks` into an aligned 112×112 grayscale crop.
///
/// Pixels mapped from outside the frame are black.
pub fn align_face(frame: &Frame, landmarks: &[(f32, f32); 5]) -> Vec<u8> {
    let mut out = vec![0u8; ALIGNED_SIZE * ALIGNED_SIZE];
    let Some(back) = Similarity::estimate(landmarks, &REFERENCE_LANDMARKS_112).inverse() else {
        return out;
    };

    let (w, h) = (frame.width as i64, frame.height as i64);
    let sample = |x: i64, y: i64| {
        if (0..w).contains(&x) && (0..h).contains(&y) {
            frame.data[(y * w + x) as usize] as f32
        } else {
            0.0
        }
    };

    for oy in 0..ALIGNED_SIZE {
        for ox in 0..ALIGNED_SIZE {
            let (sx, sy) = back.apply((ox as f32, oy as f32));
            let (x0, y0) = (sx.floor() as i64, sy.floor() as i64);
            let (fx, fy) = (sx - x0 as f32, sy - y0 as f32);

            let top = sample(x0, y0) * (1.0 - fx) + sample(x0 + 1, y0) * fx;
            let bottom = sample(x0, y0 + 1) * (1.0 - fx) + sample(x0 + 1, y0 + 1) * fx;
            let value = top * (1.0 - fy) + bottom * fy;
            out[oy * ALIGNED_SIZE + ox] = value.round().clamp(0.0, 255.0) as u8;
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_estimate() {
        let t = Similarity::estimate(&REFERENCE_LANDMARKS_112, &REFERENCE_LANDMARKS_112);
        assert!((t.a - 1.0).abs() < 1e-4, "a = {}", t.a);
        assert!(t.b.abs() < 1e-4, "b = {}", t.b);
        assert!(t.tx.abs() < 1e-3 && t.ty.abs() < 1e-3);
    }

    #[test]
    fn test_scaled_estimate() {
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * 2.0 + 10.0, y * 2.0 - 4.0));
        let t = Similarity::estimate(&src, &REFERENCE_LANDMARKS_112);
        assert!((t.a - 0.5).abs() < 1e-3, "a = {}", t.a);
        for (s, d) in src.iter().zip(REFERENCE_LANDMARKS_112.iter()) {
            let (x, y) = t.apply(*s);
            assert!((x - d.0).abs() < 1e-2 && (y - d.1).abs() < 1e-2);
        }
    }

    #[test]
    fn test_rotation_estimate() {
        // 90° rotation: (x, y) → (-y, x)
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (-y, x));
        let t = Similarity::estimate(&REFERENCE_LANDMARKS_112, &src);
        assert!(t.a.abs() < 1e-4 && (t.b - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_inverse_roundtrip() {
        let t = Similarity {
            a: 0.8,
            b: 0.3,
            tx: 5.0,
            ty: -2.0,
        };
        let inv = t.inverse().unwrap();
        let (x, y) = inv.apply(t.apply((13.0, 7.0)));
        assert!((x - 13.0).abs() < 1e-4 && (y - 7.0).abs() < 1e-4);
    }

    #[test]
    fn test_align_output_size() {
        let frame = Frame::new(vec![128u8; 640 * 480], 640, 480).unwrap();
        assert_eq!(align_face(&frame, &REFERENCE_LANDMARKS_112).len(), ALIGNED_SIZE * ALIGNED_SIZE);
    }

    #[test]
    fn test_landmark_lands_on_reference() {
        let (w, h) = (200usize, 200usize);
        let mut data = vec![0u8; w * h];
        let landmarks: [(f32, f32); 5] = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];

        // Bright 5×5 patch on the left eye.
        for y in 58..63 {
            for x in 78..83 {
                data[y * w + x] = 255;
            }
        }
        let frame = Frame::new(data, w as u32, h as u32).unwrap();
        let aligned = align_face(&frame, &landmarks);

        let (rx, ry) = (
            REFERENCE_LANDMARKS_112[0].0.round() as usize,
            REFERENCE_LANDMARKS_112[0].1.round() as usize,
        );
        let brightest = (ry - 1..=ry + 1)
            .flat_map(|y| (rx - 1..=rx + 1).map(move |x| (x, y)))
            .map(|(x, y)| aligned[y * ALIGNED_SIZE + x])
            .max()
            .unwrap_or(0);
        assert!(brightest > 100, "left eye patch missing near ({rx}, {ry}): {brightest}");
    }
}
