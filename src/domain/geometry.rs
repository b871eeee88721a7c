//! ROI polygon geometry
//!
//! Point-in-polygon uses the even-odd rule with edges counted as inside.
//! Containment is preceded by an AABB check so venue-wide lookups stay cheap.

use serde::{Deserialize, Serialize};

const EDGE_EPSILON: f64 = 1e-9;

/// A point in venue coordinates (meters by convention)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub z: f64,
}

/// Axis-aligned bounding box used as a pre-filter for containment
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min_x: f64,
    pub min_z: f64,
    pub max_x: f64,
    pub max_z: f64,
}

impl Aabb {
    fn of(vertices: &[Point]) -> Self {
        let mut aabb = Aabb {
            min_x: f64::INFINITY,
            min_z: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            max_z: f64::NEG_INFINITY,
        };
        for v in vertices {
            aabb.min_x = aabb.min_x.min(v.x);
            aabb.min_z = aabb.min_z.min(v.z);
            aabb.max_x = aabb.max_x.max(v.x);
            aabb.max_z = aabb.max_z.max(v.z);
        }
        aabb
    }

    #[inline]
    pub fn contains(&self, x: f64, z: f64) -> bool {
        x >= self.min_x - EDGE_EPSILON
            && x <= self.max_x + EDGE_EPSILON
            && z >= self.min_z - EDGE_EPSILON
            && z <= self.max_z + EDGE_EPSILON
    }
}

/// Rejection reasons for ROI vertex sequences
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolygonError {
    TooFewVertices(usize),
    SelfIntersecting,
}

impl std::fmt::Display for PolygonError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolygonError::TooFewVertices(n) => {
                write!(f, "polygon needs at least 3 vertices, got {n}")
            }
            PolygonError::SelfIntersecting => write!(f, "polygon edges self-intersect"),
        }
    }
}

impl std::error::Error for PolygonError {}

/// A simple (non-self-intersecting) closed polygon in venue coordinates
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    vertices: Vec<Point>,
    aabb: Aabb,
}

impl Polygon {
    /// Validate and build a polygon. The vertex sequence is implicitly closed;
    /// a trailing duplicate of the first vertex is tolerated and stripped.
    pub fn new(mut vertices: Vec<Point>) -> Result<Self, PolygonError> {
        if vertices.len() > 3 {
            let first = vertices[0];
            let last = *vertices.last().unwrap();
            if (first.x - last.x).abs() < EDGE_EPSILON && (first.z - last.z).abs() < EDGE_EPSILON {
                vertices.pop();
            }
        }
        if vertices.len() < 3 {
            return Err(PolygonError::TooFewVertices(vertices.len()));
        }
        if Self::self_intersects(&vertices) {
            return Err(PolygonError::SelfIntersecting);
        }
        let aabb = Aabb::of(&vertices);
        Ok(Self { vertices, aabb })
    }

    pub fn vertices(&self) -> &[Point] {
        &self.vertices
    }

    pub fn aabb(&self) -> &Aabb {
        &self.aabb
    }

    /// Even-odd containment test; points on an edge or vertex count as inside.
    pub fn contains(&self, x: f64, z: f64) -> bool {
        if !self.aabb.contains(x, z) {
            return false;
        }

        let n = self.vertices.len();
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let a = self.vertices[j];
            let b = self.vertices[i];

            if point_on_segment(x, z, a, b) {
                return true;
            }

            // Edge crosses the horizontal ray through (x, z)
            if (b.z > z) != (a.z > z) {
                let x_intersect = b.x + (z - b.z) * (a.x - b.x) / (a.z - b.z);
                if x < x_intersect {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }

    /// Polygon centroid (area-weighted; falls back to the vertex mean for
    /// degenerate zero-area rings)
    pub fn centroid(&self) -> Point {
        let n = self.vertices.len();
        let mut area2 = 0.0;
        let mut cx = 0.0;
        let mut cz = 0.0;
        let mut j = n - 1;
        for i in 0..n {
            let a = self.vertices[j];
            let b = self.vertices[i];
            let cross = a.x * b.z - b.x * a.z;
            area2 += cross;
            cx += (a.x + b.x) * cross;
            cz += (a.z + b.z) * cross;
            j = i;
        }
        if area2.abs() < EDGE_EPSILON {
            let inv = 1.0 / n as f64;
            return Point {
                x: self.vertices.iter().map(|v| v.x).sum::<f64>() * inv,
                z: self.vertices.iter().map(|v| v.z).sum::<f64>() * inv,
            };
        }
        let scale = 1.0 / (3.0 * area2);
        Point { x: cx * scale, z: cz * scale }
    }

    /// Check every pair of non-adjacent edges for a proper crossing
    fn self_intersects(vertices: &[Point]) -> bool {
        let n = vertices.len();
        for i in 0..n {
            let a1 = vertices[i];
            let a2 = vertices[(i + 1) % n];
            // Offsets 1 and n-1 are the adjacent edges; they share a vertex
            for offset in 2..n - 1 {
                let k = (i + offset) % n;
                let b1 = vertices[k];
                let b2 = vertices[(k + 1) % n];
                if segments_cross(a1, a2, b1, b2) {
                    return true;
                }
            }
        }
        false
    }
}

#[inline]
fn orient(a: Point, b: Point, c: Point) -> f64 {
    (b.x - a.x) * (c.z - a.z) - (b.z - a.z) * (c.x - a.x)
}

fn point_on_segment(x: f64, z: f64, a: Point, b: Point) -> bool {
    let p = Point { x, z };
    if orient(a, b, p).abs() > EDGE_EPSILON {
        return false;
    }
    x >= a.x.min(b.x) - EDGE_EPSILON
        && x <= a.x.max(b.x) + EDGE_EPSILON
        && z >= a.z.min(b.z) - EDGE_EPSILON
        && z <= a.z.max(b.z) + EDGE_EPSILON
}

fn segments_cross(a1: Point, a2: Point, b1: Point, b2: Point) -> bool {
    let d1 = orient(a1, a2, b1);
    let d2 = orient(a1, a2, b2);
    let d3 = orient(b1, b2, a1);
    let d4 = orient(b1, b2, a2);
    d1 * d2 < -EDGE_EPSILON && d3 * d4 < -EDGE_EPSILON
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pt(x: f64, z: f64) -> Point {
        Point { x, z }
    }

    fn square() -> Polygon {
        Polygon::new(vec![pt(0.0, 0.0), pt(4.0, 0.0), pt(4.0, 4.0), pt(0.0, 4.0)]).unwrap()
    }

    #[test]
    fn test_square_contains_interior() {
        let p = square();
        assert!(p.contains(2.0, 2.0));
        assert!(p.contains(0.1, 3.9));
    }

    #[test]
    fn test_square_excludes_exterior() {
        let p = square();
        assert!(!p.contains(5.0, 2.0));
        assert!(!p.contains(-0.1, 2.0));
        assert!(!p.contains(2.0, 4.1));
    }

    #[test]
    fn test_edges_and_vertices_count_as_inside() {
        let p = square();
        assert!(p.contains(2.0, 0.0)); // edge
        assert!(p.contains(4.0, 2.0)); // edge
        assert!(p.contains(0.0, 0.0)); // vertex
        assert!(p.contains(4.0, 4.0)); // vertex
    }

    #[test]
    fn test_containment_stable_under_vertex_rotation() {
        let vertices = vec![pt(0.0, 0.0), pt(4.0, 0.0), pt(4.0, 4.0), pt(0.0, 4.0)];
        let probes = [(2.0, 2.0), (0.5, 0.5), (3.9, 3.9), (2.0, 0.0), (4.5, 2.0)];
        for rotation in 0..vertices.len() {
            let mut rotated = vertices.clone();
            rotated.rotate_left(rotation);
            let p = Polygon::new(rotated).unwrap();
            for &(x, z) in &probes {
                assert_eq!(
                    p.contains(x, z),
                    square().contains(x, z),
                    "rotation {rotation} diverged at ({x},{z})"
                );
            }
        }
    }

    #[test]
    fn test_concave_polygon() {
        // L-shape: notch at the top right
        let p = Polygon::new(vec![
            pt(0.0, 0.0),
            pt(4.0, 0.0),
            pt(4.0, 2.0),
            pt(2.0, 2.0),
            pt(2.0, 4.0),
            pt(0.0, 4.0),
        ])
        .unwrap();
        assert!(p.contains(1.0, 3.0));
        assert!(p.contains(3.0, 1.0));
        assert!(!p.contains(3.0, 3.0)); // inside the AABB but in the notch
    }

    #[test]
    fn test_closed_ring_is_tolerated() {
        let p = Polygon::new(vec![
            pt(0.0, 0.0),
            pt(4.0, 0.0),
            pt(4.0, 4.0),
            pt(0.0, 4.0),
            pt(0.0, 0.0),
        ])
        .unwrap();
        assert_eq!(p.vertices().len(), 4);
    }

    #[test]
    fn test_rejects_too_few_vertices() {
        assert_eq!(
            Polygon::new(vec![pt(0.0, 0.0), pt(1.0, 1.0)]),
            Err(PolygonError::TooFewVertices(2))
        );
    }

    #[test]
    fn test_rejects_self_intersection() {
        // Bowtie
        let result =
            Polygon::new(vec![pt(0.0, 0.0), pt(4.0, 4.0), pt(4.0, 0.0), pt(0.0, 4.0)]);
        assert_eq!(result, Err(PolygonError::SelfIntersecting));
    }

    #[test]
    fn test_centroid_of_square() {
        let c = square().centroid();
        assert!((c.x - 2.0).abs() < 1e-9);
        assert!((c.z - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_aabb_prefilter() {
        let p = square();
        assert!(p.aabb().contains(2.0, 2.0));
        assert!(!p.aabb().contains(10.0, 2.0));
    }
}
