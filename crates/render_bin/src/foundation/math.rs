//! Math utilities and types
//!
//! Provides the vector, matrix and bounding-volume types used by the bins
//! for culling and transparency depth sorting.

pub use nalgebra::{Matrix4, Point3 as NPoint3, Vector3, Vector4};

/// 3D vector type
pub type Vec3 = Vector3<f32>;

/// 4D vector type
pub type Vec4 = Vector4<f32>;

/// 4x4 matrix type
pub type Mat4 = Matrix4<f32>;

/// 3D point type
pub type Point3 = NPoint3<f32>;

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    /// Minimum corner of the bounding box
    pub min: Point3,
    /// Maximum corner of the bounding box
    pub max: Point3,
}

impl Bounds {
    /// Create a new bounding box from min and max points
    pub fn new(min: Point3, max: Point3) -> Self {
        Self { min, max }
    }

    /// Create a bounding box centered at a point with given half extents
    pub fn from_center_extents(center: Point3, extents: Vec3) -> Self {
        Self {
            min: center - extents,
            max: center + extents,
        }
    }

    /// Get the center of the box, used as the depth-sort centroid
    pub fn center(&self) -> Point3 {
        nalgebra::center(&self.min, &self.max)
    }

    /// Smallest box enclosing both
    pub fn union(&self, other: &Self) -> Self {
        Self {
            min: self.min.inf(&other.min),
            max: self.max.sup(&other.max),
        }
    }

    /// Transform the eight corners and re-fit an axis-aligned box around them
    pub fn transformed(&self, matrix: &Mat4) -> Self {
        let mut min = Point3::new(f32::INFINITY, f32::INFINITY, f32::INFINITY);
        let mut max = Point3::new(f32::NEG_INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY);
        for i in 0..8 {
            let corner = Point3::new(
                if i & 1 == 0 { self.min.x } else { self.max.x },
                if i & 2 == 0 { self.min.y } else { self.max.y },
                if i & 4 == 0 { self.min.z } else { self.max.z },
            );
            let p = matrix.transform_point(&corner);
            min = min.inf(&p);
            max = max.sup(&p);
        }
        Self { min, max }
    }
}

impl Default for Bounds {
    fn default() -> Self {
        Self::from_center_extents(Point3::origin(), Vec3::new(0.5, 0.5, 0.5))
    }
}

/// Plane defined by normal and distance from origin
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    /// Normal vector, pointing into the half space that is kept
    pub normal: Vec3,
    /// Signed distance term of the plane equation
    pub distance: f32,
}

impl Plane {
    /// Create a plane, normalizing the equation
    pub fn new(normal: Vec3, distance: f32) -> Self {
        let length = normal.norm();
        if length > f32::EPSILON {
            Self {
                normal: normal / length,
                distance: distance / length,
            }
        } else {
            Self { normal, distance }
        }
    }

    /// Signed distance from the plane to a point
    pub fn distance_to_point(&self, point: &Point3) -> f32 {
        self.normal.dot(&point.coords) + self.distance
    }
}

/// View frustum used to cull visibility candidates
#[derive(Debug, Clone, PartialEq)]
pub struct Frustum {
    /// Six planes (left, right, bottom, top, near, far); `None` disables culling
    pub planes: Option<[Plane; 6]>,
}

impl Frustum {
    /// A frustum that accepts everything
    pub fn infinite() -> Self {
        Self { planes: None }
    }

    /// Extract frustum planes from a view-projection matrix (Gribb-Hartmann)
    pub fn from_matrix(vp: &Mat4) -> Self {
        let row = |i: usize| Vec4::new(vp[(i, 0)], vp[(i, 1)], vp[(i, 2)], vp[(i, 3)]);
        let (r0, r1, r2, r3) = (row(0), row(1), row(2), row(3));
        let plane = |v: Vec4| Plane::new(Vec3::new(v.x, v.y, v.z), v.w);
        Self {
            planes: Some([
                plane(r3 + r0),
                plane(r3 - r0),
                plane(r3 + r1),
                plane(r3 - r1),
                plane(r3 + r2),
                plane(r3 - r2),
            ]),
        }
    }

    /// Check if a bounding box is inside or intersects the frustum
    pub fn intersects(&self, bounds: &Bounds) -> bool {
        let Some(planes) = &self.planes else {
            return true;
        };
        planes.iter().all(|plane| {
            // Corner of the box furthest along the plane normal
            let p = Point3::new(
                if plane.normal.x >= 0.0 { bounds.max.x } else { bounds.min.x },
                if plane.normal.y >= 0.0 { bounds.max.y } else { bounds.min.y },
                if plane.normal.z >= 0.0 { bounds.max.z } else { bounds.min.z },
            );
            plane.distance_to_point(&p) >= 0.0
        })
    }
}

impl Default for Frustum {
    fn default() -> Self {
        Self::infinite()
    }
}
