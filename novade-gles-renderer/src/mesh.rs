//! Damage-driven mesh construction.
//!
//! Each damage rectangle is carried back into the surface's own coordinate
//! space and clipped against the surface extent, producing a convex
//! polygon of at most eight vertices. Polygons are fanned into one shared
//! triangle strip with zig-zag indexing, chained through degenerate
//! triangles, so an entire surface's damage is a single draw. Texture
//! coordinates are derived in the vertex stage from the surface-to-buffer
//! matrix, never stored per vertex here.

use crate::device::Vertex;
use crate::geometry::{Mat3, MatrixKind, Rect};

/// Hard ceiling imposed by 16-bit indices.
const MAX_VERTICES: usize = u16::MAX as usize + 1;

/// Vertices clipping a quad against a box can produce at most.
const MAX_POLYGON_VERTICES: usize = 8;

/// Points closer than this are merged; clipping exactly through a corner
/// otherwise emits the corner twice.
const MERGE_EPSILON: f32 = 1.0 / 1024.0;

/// Outcome of offering one damage rectangle to the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshAdd {
    Added,
    /// The rectangle does not touch the surface; nothing was added.
    Skipped,
    /// Adding would overflow the 16-bit index space. Nothing was added;
    /// the caller must draw and clear the batch, then retry.
    Full,
}

/// Accumulates clipped damage polygons into one strip-indexed mesh.
#[derive(Debug, Default)]
pub struct MeshBuilder {
    vertices: Vec<Vertex>,
    indices: Vec<u16>,
}

impl MeshBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn indices(&self) -> &[u16] {
        &self.indices
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn clear(&mut self) {
        self.vertices.clear();
        self.indices.clear();
    }

    /// Clips one output-space damage rectangle against a surface-space
    /// rectangle (one rect of the opaque or blended region) and appends
    /// the result.
    ///
    /// `inverse` maps output coordinates back to surface coordinates;
    /// `kind` classifies the forward matrix and selects between the
    /// axis-aligned fast path and general convex clipping.
    pub fn add_damage_rect(
        &mut self,
        damage: &Rect,
        inverse: &Mat3,
        kind: MatrixKind,
        clip: &Rect,
    ) -> MeshAdd {
        if damage.is_empty() || clip.is_empty() {
            return MeshAdd::Skipped;
        }

        let corners = [
            inverse.apply(damage.x as f32, damage.y as f32),
            inverse.apply(damage.right() as f32, damage.y as f32),
            inverse.apply(damage.right() as f32, damage.bottom() as f32),
            inverse.apply(damage.x as f32, damage.bottom() as f32),
        ];

        let mut polygon: Vec<[f32; 2]> = Vec::with_capacity(MAX_POLYGON_VERTICES);
        match kind {
            MatrixKind::ScaleTranslate | MatrixKind::AxisAligned => {
                // The transformed rectangle is still axis-aligned, so the
                // clip is a box intersection.
                let mut min_x = f32::INFINITY;
                let mut min_y = f32::INFINITY;
                let mut max_x = f32::NEG_INFINITY;
                let mut max_y = f32::NEG_INFINITY;
                for (x, y) in corners {
                    min_x = min_x.min(x);
                    min_y = min_y.min(y);
                    max_x = max_x.max(x);
                    max_y = max_y.max(y);
                }
                let x0 = min_x.max(clip.x as f32);
                let y0 = min_y.max(clip.y as f32);
                let x1 = max_x.min(clip.right() as f32);
                let y1 = max_y.min(clip.bottom() as f32);
                if x1 - x0 < MERGE_EPSILON || y1 - y0 < MERGE_EPSILON {
                    return MeshAdd::Skipped;
                }
                polygon.extend_from_slice(&[[x0, y0], [x1, y0], [x1, y1], [x0, y1]]);
            }
            MatrixKind::Arbitrary => {
                let quad: Vec<[f32; 2]> = corners.iter().map(|&(x, y)| [x, y]).collect();
                polygon = clip_convex(&quad, clip);
                if polygon.len() < 3 {
                    return MeshAdd::Skipped;
                }
            }
        }

        let n = polygon.len();
        if self.vertices.len() + n > MAX_VERTICES {
            return MeshAdd::Full;
        }

        let base = self.vertices.len() as u16;
        if let Some(&last) = self.indices.last() {
            // Two degenerate indices chain the previous submesh into this
            // one without splitting the strip.
            self.indices.push(last);
            self.indices.push(base);
        }
        for point in &polygon {
            self.vertices.push(Vertex::at(point[0], point[1]));
        }
        // Zig-zag strip order 0, 1, n-1, 2, n-2, ... covers any convex
        // polygon.
        self.indices.push(base);
        let mut front = 1usize;
        let mut back = n - 1;
        let mut take_front = true;
        while front <= back {
            if take_front {
                self.indices.push(base + front as u16);
                front += 1;
            } else {
                self.indices.push(base + back as u16);
                back -= 1;
            }
            take_front = !take_front;
        }
        MeshAdd::Added
    }
}

/// Sutherland-Hodgman clip of a convex polygon against an axis-aligned
/// rectangle.
fn clip_convex(input: &[[f32; 2]], clip: &Rect) -> Vec<[f32; 2]> {
    let mut current = input.to_vec();
    let edges: [(usize, f32, bool); 4] = [
        (0, clip.x as f32, true),
        (0, clip.right() as f32, false),
        (1, clip.y as f32, true),
        (1, clip.bottom() as f32, false),
    ];
    for (axis, bound, keep_greater) in edges {
        if current.is_empty() {
            break;
        }
        let inside = |p: &[f32; 2]| {
            if keep_greater {
                p[axis] >= bound
            } else {
                p[axis] <= bound
            }
        };
        let mut next = Vec::with_capacity(MAX_POLYGON_VERTICES);
        for i in 0..current.len() {
            let a = current[i];
            let b = current[(i + 1) % current.len()];
            let a_in = inside(&a);
            let b_in = inside(&b);
            if a_in {
                next.push(a);
            }
            if a_in != b_in {
                let t = (bound - a[axis]) / (b[axis] - a[axis]);
                let other = 1 - axis;
                let mut p = [0.0; 2];
                p[axis] = bound;
                p[other] = a[other] + t * (b[other] - a[other]);
                next.push(p);
            }
        }
        current = next;
    }
    dedup_points(&mut current);
    current
}

fn dedup_points(points: &mut Vec<[f32; 2]>) {
    let mut i = 0;
    while points.len() > 1 && i < points.len() {
        let next = (i + 1) % points.len();
        let a = points[i];
        let b = points[next];
        if (a[0] - b[0]).abs() < MERGE_EPSILON && (a[1] - b[1]).abs() < MERGE_EPSILON {
            points.remove(next);
        } else {
            i += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Mat3;

    fn add(builder: &mut MeshBuilder, damage: Rect, forward: &Mat3, clip: Rect) -> MeshAdd {
        let inverse = forward.invert_affine().unwrap();
        builder.add_damage_rect(&damage, &inverse, forward.classify(), &clip)
    }

    fn surface(size: i32) -> Rect {
        Rect::new(0, 0, size, size)
    }

    #[test]
    fn interior_damage_becomes_one_quad() {
        let mut builder = MeshBuilder::new();
        let result = add(
            &mut builder,
            Rect::new(10, 20, 30, 40),
            &Mat3::IDENTITY,
            surface(100),
        );
        assert_eq!(result, MeshAdd::Added);
        assert_eq!(builder.vertices().len(), 4);
        assert_eq!(builder.indices(), &[0, 1, 3, 2]);
        assert_eq!(builder.vertices()[0].position, [10.0, 20.0]);
        assert_eq!(builder.vertices()[2].position, [40.0, 60.0]);
    }

    #[test]
    fn damage_is_clipped_to_the_surface() {
        let mut builder = MeshBuilder::new();
        // Surface placed at (50, 0); damage hangs off its left edge.
        let forward = Mat3::translation(50.0, 0.0);
        add(&mut builder, Rect::new(40, 0, 20, 10), &forward, surface(100));
        assert_eq!(builder.vertices().len(), 4);
        for vertex in builder.vertices() {
            assert!(vertex.position[0] >= 0.0);
        }
        assert_eq!(builder.vertices()[1].position[0], 10.0);
    }

    #[test]
    fn damage_outside_the_surface_is_skipped() {
        let mut builder = MeshBuilder::new();
        let result = add(
            &mut builder,
            Rect::new(500, 500, 10, 10),
            &Mat3::IDENTITY,
            surface(100),
        );
        assert_eq!(result, MeshAdd::Skipped);
        assert!(builder.is_empty());
    }

    #[test]
    fn submeshes_are_chained_with_two_degenerate_indices() {
        let mut builder = MeshBuilder::new();
        add(&mut builder, Rect::new(0, 0, 10, 10), &Mat3::IDENTITY, surface(100));
        add(&mut builder, Rect::new(20, 20, 10, 10), &Mat3::IDENTITY, surface(100));
        assert_eq!(builder.vertices().len(), 8);
        // 4 strip indices, 2 degenerate, 4 strip.
        assert_eq!(builder.indices().len(), 10);
        assert_eq!(&builder.indices()[3..6], &[2, 2, 4]);
    }

    #[test]
    fn rotated_damage_clips_to_a_convex_polygon() {
        let s = std::f32::consts::FRAC_1_SQRT_2;
        let rotation = Mat3 {
            m: [s, s, 0.0, -s, s, 0.0, 30.0, -10.0, 1.0],
        };
        assert_eq!(rotation.classify(), MatrixKind::Arbitrary);
        let mut builder = MeshBuilder::new();
        let result = add(&mut builder, Rect::new(0, 0, 60, 60), &rotation, surface(40));
        assert_eq!(result, MeshAdd::Added);
        let n = builder.vertices().len();
        assert!((3..=8).contains(&n), "unexpected vertex count {n}");
        for vertex in builder.vertices() {
            assert!(vertex.position[0] >= -MERGE_EPSILON);
            assert!(vertex.position[0] <= 40.0 + MERGE_EPSILON);
            assert!(vertex.position[1] >= -MERGE_EPSILON);
            assert!(vertex.position[1] <= 40.0 + MERGE_EPSILON);
        }
    }

    #[test]
    fn builder_reports_full_before_overflowing_indices() {
        let mut builder = MeshBuilder::new();
        let mut adds = 0usize;
        loop {
            match add(
                &mut builder,
                Rect::new(0, 0, 10, 10),
                &Mat3::IDENTITY,
                surface(100),
            ) {
                MeshAdd::Added => adds += 1,
                MeshAdd::Full => break,
                MeshAdd::Skipped => unreachable!(),
            }
        }
        assert_eq!(adds, MAX_VERTICES / 4);
        assert_eq!(builder.vertices().len(), MAX_VERTICES);
        // After draining, the same rectangle fits again.
        builder.clear();
        assert_eq!(
            add(&mut builder, Rect::new(0, 0, 10, 10), &Mat3::IDENTITY, surface(100)),
            MeshAdd::Added
        );
    }
}
