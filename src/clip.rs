use glam::Vec3;

use crate::geometry::{Aabb, Axis};

/// Splits a triangle by the axial plane `axis = position` and returns the
/// bounds of the two pieces, both restricted to `parent`. The caller must
/// pass a plane strictly inside `parent`; a side the triangle never
/// touches comes back as a degenerate (inverted) box.
///
/// Cut points are found by interpolating the two edges that cross the
/// plane; their coordinates on the non-split axes are clamped against
/// `parent` to keep interpolation drift from leaking outside the node.
pub fn clip_triangle(verts: &[Vec3; 3], parent: &Aabb, axis: Axis, position: f32) -> (Aabb, Aabb) {
    let a = axis as usize;
    let (o0, o1) = axis.others();

    let mut left = Aabb::EMPTY;
    let mut right = Aabb::EMPTY;

    for v in verts {
        if v[a] <= position {
            left = left.union_point(*v);
        }
        if v[a] >= position {
            right = right.union_point(*v);
        }
    }

    for i in 0..3 {
        let p0 = verts[i];
        let p1 = verts[(i + 1) % 3];

        let crosses = (p0[a] < position && p1[a] > position)
            || (p0[a] > position && p1[a] < position);
        if !crosses {
            continue;
        }

        let t = (position - p0[a]) / (p1[a] - p0[a]);
        let mut cut = p0 + (p1 - p0) * t;
        cut[a] = position;
        cut[o0 as usize] = cut[o0 as usize].clamp(parent.min[o0 as usize], parent.max[o0 as usize]);
        cut[o1 as usize] = cut[o1 as usize].clamp(parent.min[o1 as usize], parent.max[o1 as usize]);

        left = left.union_point(cut);
        right = right.union_point(cut);
    }

    (left.intersection(*parent), right.intersection(*parent))
}

#[cfg(test)]
mod test_clip {
    use glam::vec3;

    use super::*;

    fn unit_box() -> Aabb {
        Aabb::new(Vec3::ZERO, Vec3::ONE)
    }

    #[test]
    fn test_straddling_split() {
        // Right triangle in the z=0 plane, split by x = 0.5
        let verts = [vec3(0., 0., 0.), vec3(1., 0., 0.), vec3(0., 1., 0.)];
        let parent = unit_box();

        let (left, right) = clip_triangle(&verts, &parent, Axis::X, 0.5);

        assert_eq!(left, Aabb::new(vec3(0., 0., 0.), vec3(0.5, 1., 0.)));
        // The hypotenuse crosses x = 0.5 at y = 0.5
        assert_eq!(right, Aabb::new(vec3(0.5, 0., 0.), vec3(1., 0.5, 0.)));
    }

    #[test]
    fn test_one_sided_triangle() {
        let verts = [vec3(0., 0., 0.), vec3(0.2, 0., 0.), vec3(0., 0.2, 0.)];
        let parent = unit_box();

        let (left, right) = clip_triangle(&verts, &parent, Axis::X, 0.5);
        assert!(!left.is_degenerate());
        assert!(right.is_degenerate());
    }

    #[test]
    fn test_cut_points_clamped_to_parent() {
        // Triangle pokes far outside the node on y; the cut points must not
        // drag the child boxes beyond the parent.
        let verts = [vec3(0., -5., 0.5), vec3(1., 5., 0.5), vec3(1., -5., 0.5)];
        let parent = unit_box();

        let (left, right) = clip_triangle(&verts, &parent, Axis::X, 0.4);
        assert!(left.fits_within(parent));
        assert!(right.fits_within(parent));
        assert_eq!(left.max.x, 0.4);
        assert_eq!(right.min.x, 0.4);
    }

    #[test]
    fn test_reclip_is_idempotent() {
        let verts = [vec3(0., 0., 0.), vec3(1., 0., 0.), vec3(0., 1., 0.)];
        let parent = unit_box();
        let (left, _) = clip_triangle(&verts, &parent, Axis::X, 0.5);

        // Clipping the left piece at the same plane changes nothing on the
        // left and leaves only a zero-width sliver on the right.
        let (releft, reright) = clip_triangle(&verts, &left, Axis::X, 0.5);
        assert_eq!(releft, left);
        assert_eq!(reright.min.x, reright.max.x);
    }
}
