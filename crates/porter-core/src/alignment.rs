//! Face alignment to the ArcFace canonical crop.
//!
//! Fits a similarity transform (scale, rotation, translation) from the
//! five detected landmarks to the reference template, then resamples the
//! RGB frame into a 112×112 crop.

/// Landmark template for a 112×112 ArcFace crop.
const TEMPLATE_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth corner
    (70.7299, 92.2041), // right mouth corner
];

pub const ALIGNED_SIZE: usize = 112;
const CHANNELS: usize = 3;

/// Similarity transform `dst = [[a, -b], [b, a]] * src + [tx, ty]`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Least-squares fit mapping `src` points onto `dst`.
    ///
    /// Each point pair contributes two rows to the normal equations
    /// `AᵀA · [a, b, tx, ty] = Aᵀy`.
    fn fit(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Self {
        let mut normal = [[0.0f32; 5]; 4];

        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
            for (row, target) in [([sx, -sy, 1.0, 0.0], dx), ([sy, sx, 0.0, 1.0], dy)] {
                for j in 0..4 {
                    for k in 0..4 {
                        normal[j][k] += row[j] * row[k];
                    }
                    normal[j][4] += row[j] * target;
                }
            }
        }

        match solve_augmented(normal) {
            Some([a, b, tx, ty]) => Self { a, b, tx, ty },
            None => Self::IDENTITY,
        }
    }

    const IDENTITY: Self = Self {
        a: 1.0,
        b: 0.0,
        tx: 0.0,
        ty: 0.0,
    };

    fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    /// Inverse transform, or `None` when the scale collapsed to zero.
    fn inverse(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let ia = self.a / det;
        let ib = -self.b / det;
        Some(Self {
            a: ia,
            b: ib,
            tx: -(ia * self.tx - ib * self.ty),
            ty: -(ib * self.tx + ia * self.ty),
        })
    }
}

/// Gauss-Jordan style elimination with partial pivoting on a 4×5
/// augmented system. `None` if the system is singular.
#[allow(clippy::needless_range_loop)]
fn solve_augmented(mut m: [[f32; 5]; 4]) -> Option<[f32; 4]> {
    for col in 0..4 {
        let pivot_row = (col..4)
            .max_by(|&r1, &r2| m[r1][col].abs().total_cmp(&m[r2][col].abs()))
            .unwrap_or(col);
        m.swap(col, pivot_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return None;
        }
        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        let tail: f32 = ((i + 1)..4).map(|j| m[i][j] * x[j]).sum();
        x[i] = (m[i][4] - tail) / m[i][i];
    }
    Some(x)
}

/// Resample an RGB frame through the inverse of `to_crop`.
/// Samples outside the frame are black.
fn warp_rgb(rgb: &[u8], width: usize, height: usize, to_crop: &Similarity, out: usize) -> Vec<u8> {
    let mut output = vec![0u8; out * out * CHANNELS];
    let Some(to_frame) = to_crop.inverse() else {
        return output;
    };

    let texel = |x: i64, y: i64, c: usize| -> f32 {
        if x >= 0 && y >= 0 && (x as usize) < width && (y as usize) < height {
            rgb[(y as usize * width + x as usize) * CHANNELS + c] as f32
        } else {
            0.0
        }
    };

    for oy in 0..out {
        for ox in 0..out {
            let (sx, sy) = to_frame.apply((ox as f32, oy as f32));
            let x0 = sx.floor() as i64;
            let y0 = sy.floor() as i64;
            let fx = sx - x0 as f32;
            let fy = sy - y0 as f32;

            let base = (oy * out + ox) * CHANNELS;
            for c in 0..CHANNELS {
                let v = texel(x0, y0, c) * (1.0 - fx) * (1.0 - fy)
                    + texel(x0 + 1, y0, c) * fx * (1.0 - fy)
                    + texel(x0, y0 + 1, c) * (1.0 - fx) * fy
                    + texel(x0 + 1, y0 + 1, c) * fx * fy;
                output[base + c] = v.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    output
}

/// Align a detected face into a packed RGB 112×112 crop.
pub fn align_face(rgb: &[u8], width: u32, height: u32, landmarks: &[(f32, f32); 5]) -> Vec<u8> {
    let to_crop = Similarity::fit(landmarks, &TEMPLATE_112);
    warp_rgb(rgb, width as usize, height as usize, &to_crop, ALIGNED_SIZE)
}
