//! Orthographic transform uniform

use bytemuck::{Pod, Zeroable};
use nalgebra::{Matrix3, Point2};

/// 2D orthographic transform from surface pixels to clip space
///
/// Row-major 3x4 floats: each matrix row padded to four floats, read by the
/// shader as a `layout(row_major) mat3` under std140.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct OrthoUniform {
    /// Padded matrix rows
    pub rows: [[f32; 4]; 3],
}

impl OrthoUniform {
    /// Map `(0,0)..(width,height)` to `(-1,-1)..(1,1)`
    pub fn for_surface(width: u32, height: u32) -> Self {
        Self::from_matrix(&ortho_matrix(width, height))
    }

    /// Pack any 2D homogeneous transform
    pub fn from_matrix(matrix: &Matrix3<f32>) -> Self {
        let mut rows = [[0.0; 4]; 3];
        for (r, row) in rows.iter_mut().enumerate() {
            for (c, value) in row.iter_mut().take(3).enumerate() {
                *value = matrix[(r, c)];
            }
        }
        Self { rows }
    }

    /// Raw bytes for a uniform buffer write
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

/// Surface-pixel to clip-space matrix
#[rustfmt::skip]
pub fn ortho_matrix(width: u32, height: u32) -> Matrix3<f32> {
    let w = width.max(1) as f32;
    let h = height.max(1) as f32;
    Matrix3::new(
        2.0 / w, 0.0, -1.0,
        0.0, 2.0 / h, -1.0,
        0.0, 0.0, 1.0,
    )
}

/// Apply `matrix` to a surface point
pub fn project(matrix: &Matrix3<f32>, x: f32, y: f32) -> Point2<f32> {
    matrix.transform_point(&Point2::new(x, y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_corners_map_to_clip_space() {
        let m = ortho_matrix(800, 600);
        let origin = project(&m, 0.0, 0.0);
        assert_relative_eq!(origin.x, -1.0);
        assert_relative_eq!(origin.y, -1.0);

        let far = project(&m, 800.0, 600.0);
        assert_relative_eq!(far.x, 1.0);
        assert_relative_eq!(far.y, 1.0);

        let center = project(&m, 400.0, 300.0);
        assert_relative_eq!(center.x, 0.0);
        assert_relative_eq!(center.y, 0.0);
    }

    #[test]
    fn test_uniform_layout() {
        assert_eq!(std::mem::size_of::<OrthoUniform>(), 48);

        let u = OrthoUniform::for_surface(200, 100);
        assert_relative_eq!(u.rows[0][0], 0.01);
        assert_relative_eq!(u.rows[1][1], 0.02);
        // Translation lives in the last used column of each row
        assert_relative_eq!(u.rows[0][2], -1.0);
        assert_relative_eq!(u.rows[1][2], -1.0);
        assert_relative_eq!(u.rows[2][2], 1.0);
        assert!(u.rows.iter().all(|row| row[3] == 0.0));
    }

    #[test]
    fn test_zero_surface_does_not_divide_by_zero() {
        let u = OrthoUniform::for_surface(0, 0);
        assert!(u.rows.iter().flatten().all(|v| v.is_finite()));
    }
}
