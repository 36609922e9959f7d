//! Affine face alignment: 3-point transform estimation via Cramer's rule.

use super::Point;

/// Determinants this close to zero mean the landmark triangle is degenerate
/// and no stable alignment exists.
const DET_EPSILON: f32 = 1e-6;

/// 2×3 affine map between two 2D coordinate systems:
/// `x' = a·x + b·y + c`, `y' = d·x + e·y + f`, coefficients `[a,b,c,d,e,f]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineTransform(pub [f32; 6]);

impl AffineTransform {
    pub fn apply(&self, p: Point) -> Point {
        let [a, b, c, d, e, f] = self.0;
        Point::new(a * p.x + b * p.y + c, d * p.x + e * p.y + f)
    }

    /// Inverse map; `None` when the linear part is near-singular.
    pub fn invert(&self) -> Option<AffineTransform> {
        let [a, b, c, d, e, f] = self.0;
        let det = a * e - b * d;
        if det.abs() < DET_EPSILON {
            return None;
        }
        Some(AffineTransform([
            e / det,
            -b / det,
            (b * f - c * e) / det,
            -d / det,
            a / det,
            (c * d - a * f) / det,
        ]))
    }

    /// Estimate the transform mapping `src[i]` to `dst[i]` for three point
    /// pairs, solving one 3×3 linear system per output coordinate with
    /// Cramer's rule. `None` when the source points are collinear.
    pub fn estimate(src: &[Point; 3], dst: &[Point; 3]) -> Option<AffineTransform> {
        // coefficient matrix rows: [src.x, src.y, 1]
        let m = [
            [src[0].x, src[0].y, 1.0],
            [src[1].x, src[1].y, 1.0],
            [src[2].x, src[2].y, 1.0],
        ];
        let det = det3(&m);
        if det.abs() < DET_EPSILON {
            return None;
        }

        let xs = [dst[0].x, dst[1].x, dst[2].x];
        let ys = [dst[0].y, dst[1].y, dst[2].y];
        let (a, b, c) = cramer(&m, &xs, det);
        let (d, e, f) = cramer(&m, &ys, det);
        Some(AffineTransform([a, b, c, d, e, f]))
    }
}

fn det3(m: &[[f32; 3]; 3]) -> f32 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

fn replace_column(m: &[[f32; 3]; 3], col: usize, rhs: &[f32; 3]) -> [[f32; 3]; 3] {
    let mut out = *m;
    for row in 0..3 {
        out[row][col] = rhs[row];
    }
    out
}

fn cramer(m: &[[f32; 3]; 3], rhs: &[f32; 3], det: f32) -> (f32, f32, f32) {
    (
        det3(&replace_column(m, 0, rhs)) / det,
        det3(&replace_column(m, 1, rhs)) / det,
        det3(&replace_column(m, 2, rhs)) / det,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: Point, b: Point, tol: f32) {
        assert!(
            (a.x - b.x).abs() < tol && (a.y - b.y).abs() < tol,
            "{a:?} != {b:?}"
        );
    }

    #[test]
    fn test_identity_estimation() {
        let pts = [Point::new(0.0, 0.0), Point::new(1.0, 0.0), Point::new(0.0, 1.0)];
        let t = AffineTransform::estimate(&pts, &pts).unwrap();
        assert_close(t.apply(Point::new(0.3, 0.7)), Point::new(0.3, 0.7), 1e-5);
    }

    #[test]
    fn test_estimation_reproduces_target_points() {
        let src = [
            Point::new(192.98, 239.71),
            Point::new(318.90, 240.19),
            Point::new(256.63, 314.01),
        ];
        let dst = [
            Point::new(101.0, 80.5),
            Point::new(163.2, 84.9),
            Point::new(131.7, 120.3),
        ];
        let t = AffineTransform::estimate(&src, &dst).unwrap();
        for i in 0..3 {
            assert_close(t.apply(src[i]), dst[i], 1e-2);
        }
    }

    #[test]
    fn test_collinear_points_fail() {
        let src = [Point::new(0.0, 0.0), Point::new(1.0, 1.0), Point::new(2.0, 2.0)];
        let dst = [Point::new(0.0, 0.0), Point::new(1.0, 0.0), Point::new(0.0, 1.0)];
        assert!(AffineTransform::estimate(&src, &dst).is_none());
    }

    #[test]
    fn test_invert_round_trip() {
        let t = AffineTransform([1.2, 0.1, 5.0, -0.2, 0.9, -3.0]);
        let inv = t.invert().unwrap();
        let p = Point::new(7.0, -2.0);
        assert_close(inv.apply(t.apply(p)), p, 1e-4);
    }

    #[test]
    fn test_invert_singular_fails() {
        // rank-1 linear part
        let t = AffineTransform([1.0, 2.0, 0.0, 2.0, 4.0, 0.0]);
        assert!(t.invert().is_none());
    }
}
