//! Rectangles, pixel regions and the small amount of matrix math the
//! renderer needs.
//!
//! A [`Region`] is kept as a set of non-overlapping rectangles; damage
//! tracking, opaque-region clipping and partial swaps all operate on these
//! sets. Matrices are 3×3 column-major, enough for the 2D homogeneous
//! transforms a compositor applies to surfaces.

/// An axis-aligned rectangle in integer pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub fn right(&self) -> i32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.height
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.x < other.right()
            && other.x < self.right()
            && self.y < other.bottom()
            && other.y < self.bottom()
    }

    /// The overlapping area of two rectangles, if any.
    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if right > x && bottom > y {
            Some(Rect::new(x, y, right - x, bottom - y))
        } else {
            None
        }
    }

    /// Smallest rectangle containing both inputs.
    pub fn union(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        Rect::new(x, y, right - x, bottom - y)
    }

    pub fn contains(&self, other: &Rect) -> bool {
        other.is_empty()
            || (self.x <= other.x
                && self.y <= other.y
                && self.right() >= other.right()
                && self.bottom() >= other.bottom())
    }

    pub fn translated(&self, dx: i32, dy: i32) -> Rect {
        Rect::new(self.x + dx, self.y + dy, self.width, self.height)
    }

    /// Splits `self` minus `hole` into at most four disjoint rectangles.
    fn subtract(&self, hole: &Rect) -> impl Iterator<Item = Rect> {
        let mut out = [Rect::default(); 4];
        let mut n = 0;
        match self.intersection(hole) {
            None => {
                out[0] = *self;
                n = 1;
            }
            Some(cut) => {
                // Top band, bottom band, then the left/right remnants of the
                // middle band. All four are disjoint by construction.
                if cut.y > self.y {
                    out[n] = Rect::new(self.x, self.y, self.width, cut.y - self.y);
                    n += 1;
                }
                if cut.bottom() < self.bottom() {
                    out[n] = Rect::new(self.x, cut.bottom(), self.width, self.bottom() - cut.bottom());
                    n += 1;
                }
                if cut.x > self.x {
                    out[n] = Rect::new(self.x, cut.y, cut.x - self.x, cut.height);
                    n += 1;
                }
                if cut.right() < self.right() {
                    out[n] = Rect::new(cut.right(), cut.y, self.right() - cut.right(), cut.height);
                    n += 1;
                }
            }
        }
        out.into_iter().take(n)
    }
}

/// A set of non-overlapping rectangles.
///
/// The disjointness invariant is maintained by every mutating operation, so
/// rectangle counts stay proportional to the actual shape complexity and
/// consumers never repaint the same pixel twice.
#[derive(Debug, Clone, Default)]
pub struct Region {
    rects: Vec<Rect>,
}

impl Region {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rect(rect: Rect) -> Self {
        let mut region = Self::new();
        region.add(rect);
        region
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    pub fn clear(&mut self) {
        self.rects.clear();
    }

    /// Adds a rectangle, keeping the stored set disjoint by inserting only
    /// the parts of `rect` not already covered.
    pub fn add(&mut self, rect: Rect) {
        if rect.is_empty() {
            return;
        }
        let mut pending = vec![rect];
        for existing in &self.rects {
            let mut next = Vec::with_capacity(pending.len());
            for piece in pending {
                next.extend(piece.subtract(existing));
            }
            pending = next;
            if pending.is_empty() {
                return;
            }
        }
        self.rects.extend(pending);
    }

    /// Unions another region into this one.
    pub fn union_with(&mut self, other: &Region) {
        for rect in &other.rects {
            self.add(*rect);
        }
    }

    /// Removes the given rectangle from the region.
    pub fn subtract_rect(&mut self, rect: Rect) {
        if rect.is_empty() || self.rects.is_empty() {
            return;
        }
        let mut out = Vec::with_capacity(self.rects.len());
        for existing in &self.rects {
            out.extend(existing.subtract(&rect));
        }
        self.rects = out;
    }

    /// The part of this region inside `rect`.
    pub fn intersected(&self, rect: Rect) -> Region {
        let mut out = Region::new();
        for existing in &self.rects {
            if let Some(cut) = existing.intersection(&rect) {
                // Pieces of a disjoint set stay disjoint after clipping.
                out.rects.push(cut);
            }
        }
        out
    }

    /// Bounding box of the whole region.
    pub fn bounds(&self) -> Rect {
        let mut bounds = Rect::default();
        for rect in &self.rects {
            bounds = bounds.union(rect);
        }
        bounds
    }

    pub fn contains_rect(&self, rect: &Rect) -> bool {
        if rect.is_empty() {
            return true;
        }
        let mut remaining = vec![*rect];
        for existing in &self.rects {
            let mut next = Vec::new();
            for piece in remaining {
                next.extend(piece.subtract(existing));
            }
            remaining = next;
            if remaining.is_empty() {
                return true;
            }
        }
        false
    }
}

/// The eight axis-aligned output transforms a surface or output can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transform {
    #[default]
    Normal,
    Rotate90,
    Rotate180,
    Rotate270,
    Flipped,
    Flipped90,
    Flipped180,
    Flipped270,
}

/// A 3×3 column-major matrix for 2D homogeneous transforms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mat3 {
    /// Column-major storage: element (row, col) lives at `m[col * 3 + row]`.
    pub m: [f32; 9],
}

/// Coarse classification used to pick the damage-mesh clipping path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatrixKind {
    /// Pure integer-free translation and positive scale: transformed
    /// rectangles stay axis-aligned with unchanged winding.
    ScaleTranslate,
    /// Any combination of 90° rotations, flips, scales and translations:
    /// still axis-aligned but axes may swap or mirror.
    AxisAligned,
    /// Arbitrary (rotation/shear): transformed rectangles become general
    /// convex quads.
    Arbitrary,
}

impl Mat3 {
    pub const IDENTITY: Mat3 = Mat3 {
        m: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
    };

    pub fn translation(dx: f32, dy: f32) -> Mat3 {
        Mat3 {
            m: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, dx, dy, 1.0],
        }
    }

    pub fn scale(sx: f32, sy: f32) -> Mat3 {
        Mat3 {
            m: [sx, 0.0, 0.0, 0.0, sy, 0.0, 0.0, 0.0, 1.0],
        }
    }

    /// 2D orthographic projection mapping `area` to clip space with Y
    /// pointing down, matching the compositor's coordinate convention.
    #[rustfmt::skip]
    pub fn orthographic(width: f32, height: f32) -> Mat3 {
        Mat3 {
            m: [
                2.0 / width, 0.0,           0.0,
                0.0,         -2.0 / height, 0.0,
                -1.0,        1.0,           1.0,
            ],
        }
    }

    pub fn multiply(&self, rhs: &Mat3) -> Mat3 {
        let mut out = [0.0f32; 9];
        for col in 0..3 {
            for row in 0..3 {
                let mut acc = 0.0;
                for k in 0..3 {
                    acc += self.m[k * 3 + row] * rhs.m[col * 3 + k];
                }
                out[col * 3 + row] = acc;
            }
        }
        Mat3 { m: out }
    }

    /// Applies the transform to a 2D point (w = 1).
    pub fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        (
            self.m[0] * x + self.m[3] * y + self.m[6],
            self.m[1] * x + self.m[4] * y + self.m[7],
        )
    }

    /// Inverse of an affine 2D matrix (last row `0 0 1`). Returns `None`
    /// for singular matrices.
    pub fn invert_affine(&self) -> Option<Mat3> {
        let a = self.m[0];
        let b = self.m[1];
        let c = self.m[3];
        let d = self.m[4];
        let tx = self.m[6];
        let ty = self.m[7];
        let det = a * d - b * c;
        if det.abs() < 1e-9 {
            return None;
        }
        let inv_det = 1.0 / det;
        let ia = d * inv_det;
        let ib = -b * inv_det;
        let ic = -c * inv_det;
        let id = a * inv_det;
        Some(Mat3 {
            m: [
                ia,
                ib,
                0.0,
                ic,
                id,
                0.0,
                -(ia * tx + ic * ty),
                -(ib * tx + id * ty),
                1.0,
            ],
        })
    }

    /// Classifies the linear part, ignoring translation.
    pub fn classify(&self) -> MatrixKind {
        let a = self.m[0];
        let b = self.m[1];
        let c = self.m[3];
        let d = self.m[4];
        let near_zero = |v: f32| v.abs() < 1e-6;
        if near_zero(b) && near_zero(c) {
            if a > 0.0 && d > 0.0 {
                MatrixKind::ScaleTranslate
            } else {
                MatrixKind::AxisAligned
            }
        } else if near_zero(a) && near_zero(d) {
            MatrixKind::AxisAligned
        } else {
            MatrixKind::Arbitrary
        }
    }

    pub fn from_transform(transform: Transform, width: f32, height: f32) -> Mat3 {
        // Rotations are around the output origin, so each case re-anchors
        // the result to keep coordinates non-negative.
        match transform {
            Transform::Normal => Mat3::IDENTITY,
            Transform::Rotate90 => Mat3 {
                m: [0.0, 1.0, 0.0, -1.0, 0.0, 0.0, height, 0.0, 1.0],
            },
            Transform::Rotate180 => Mat3 {
                m: [-1.0, 0.0, 0.0, 0.0, -1.0, 0.0, width, height, 1.0],
            },
            Transform::Rotate270 => Mat3 {
                m: [0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, width, 1.0],
            },
            Transform::Flipped => Mat3 {
                m: [-1.0, 0.0, 0.0, 0.0, 1.0, 0.0, width, 0.0, 1.0],
            },
            Transform::Flipped90 => Mat3 {
                m: [0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0],
            },
            Transform::Flipped180 => Mat3 {
                m: [1.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, height, 1.0],
            },
            Transform::Flipped270 => Mat3 {
                m: [0.0, -1.0, 0.0, -1.0, 0.0, 0.0, width, height, 1.0],
            },
        }
    }
}
