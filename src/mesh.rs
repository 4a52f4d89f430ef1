use glam::{vec2, Vec3};

use crate::{
    clip::clip_triangle,
    geometry::{Aabb, Axis, Ray},
    object_set::{ClipObjectSet, ObjectSet, RayHit},
    util::apply_permutation,
};

/// A triangle-list mesh: the sample object set the acceleration structures
/// are exercised with. Object ids are triangle indices.
#[derive(Clone, Debug)]
pub struct BasicMesh {
    positions: Box<[Vec3]>,
    indices: Box<[u32]>,
}

impl BasicMesh {
    pub fn new(positions: Vec<Vec3>, indices: Vec<u32>) -> Self {
        debug_assert!(indices.len() % 3 == 0);
        debug_assert!(indices.iter().all(|&i| (i as usize) < positions.len()));

        Self {
            positions: positions.into_boxed_slice(),
            indices: indices.into_boxed_slice(),
        }
    }

    /// A mesh of disconnected triangles, one per vertex triple.
    pub fn from_triangles(triangles: &[[Vec3; 3]]) -> Self {
        let positions = triangles.iter().flatten().copied().collect();
        let indices = (0..triangles.len() as u32 * 3).collect();
        Self::new(positions, indices)
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn triangle_positions(&self, id: u32) -> [Vec3; 3] {
        let i = id as usize * 3;
        [
            self.positions[self.indices[i] as usize],
            self.positions[self.indices[i + 1] as usize],
            self.positions[self.indices[i + 2] as usize],
        ]
    }
}

impl ObjectSet for BasicMesh {
    fn object_count(&self) -> u32 {
        self.triangle_count() as u32
    }

    fn bounds(&self) -> Aabb {
        (0..self.object_count()).fold(Aabb::EMPTY, |bounds, id| {
            bounds.union_aabb(self.object_bounds(id))
        })
    }

    fn object_bounds(&self, id: u32) -> Aabb {
        let [p0, p1, p2] = self.triangle_positions(id);
        Aabb::new(p0, p1).union_point(p2)
    }

    /// Moller-Trumbore intersection against one triangle.
    fn ray_intersect(&self, ray: &mut Ray, hit: &mut RayHit, id: u32) {
        let eps = 0.0000001;

        let [p0, p1, p2] = self.triangle_positions(id);

        let e1 = p1 - p0;
        let e2 = p2 - p0;

        let h = ray.dir.cross(e2);
        let a = e1.dot(h);

        if a > -eps && a < eps {
            return;
        }

        let f = 1. / a;
        let s = ray.orig - p0;
        let u = f * s.dot(h);
        if u < 0. || u > 1. {
            return;
        }

        let q = s.cross(e1);
        let v = f * ray.dir.dot(q);
        if v < 0. || u + v > 1. {
            return;
        }

        let t = f * e2.dot(q);
        if t < ray.tmin || t > ray.tmax {
            return;
        }
        // An exact tie goes to whichever object reported first
        if hit.is_hit() && t >= ray.tmax {
            return;
        }

        ray.tmax = t;
        *hit = RayHit {
            object: id,
            uv: vec2(u, v),
        };
    }

    fn remap(&mut self, perm: &[u32]) {
        debug_assert_eq!(perm.len(), self.triangle_count());

        let mut triples: Vec<[u32; 3]> = self
            .indices
            .chunks_exact(3)
            .map(|c| [c[0], c[1], c[2]])
            .collect();
        apply_permutation(&mut triples, perm.to_vec());

        self.indices = triples.into_iter().flatten().collect();
    }
}

impl ClipObjectSet for BasicMesh {
    fn clip_object(&self, id: u32, parent: &Aabb, axis: Axis, position: f32) -> (Aabb, Aabb) {
        clip_triangle(&self.triangle_positions(id), parent, axis, position)
    }
}

#[cfg(test)]
mod test_mesh {
    use glam::vec3;

    use super::*;

    fn corner_triangle() -> BasicMesh {
        BasicMesh::from_triangles(&[[vec3(0., 0., 0.), vec3(1., 0., 0.), vec3(0., 1., 0.)]])
    }

    #[test]
    fn test_hit_with_barycentrics() {
        let mesh = corner_triangle();
        let mut ray = Ray::new(vec3(0.25, 0.25, -1.), vec3(0., 0., 1.));
        let mut hit = RayHit::NONE;

        mesh.ray_intersect(&mut ray, &mut hit, 0);

        assert!(hit.is_hit());
        assert_eq!(hit.object, 0);
        assert_eq!(ray.tmax, 1.);
        assert_eq!(hit.uv, vec2(0.25, 0.25));
    }

    #[test]
    fn test_miss_outside_triangle() {
        let mesh = corner_triangle();
        let mut ray = Ray::new(vec3(0.75, 0.75, -1.), vec3(0., 0., 1.));
        let mut hit = RayHit::NONE;

        mesh.ray_intersect(&mut ray, &mut hit, 0);

        assert!(!hit.is_hit());
        assert_eq!(ray.tmax, f32::INFINITY);
    }

    #[test]
    fn test_interval_prunes() {
        let mesh = corner_triangle();
        let mut ray = Ray::with_interval(vec3(0.25, 0.25, -1.), vec3(0., 0., 1.), 0., 0.5);
        let mut hit = RayHit::NONE;

        mesh.ray_intersect(&mut ray, &mut hit, 0);
        assert!(!hit.is_hit());
    }

    #[test]
    fn test_closer_hit_shrinks_interval() {
        let tri = |z: f32| [vec3(0., 0., z), vec3(1., 0., z), vec3(0., 1., z)];
        let mesh = BasicMesh::from_triangles(&[tri(3.), tri(1.)]);

        let mut ray = Ray::new(vec3(0.25, 0.25, 0.), vec3(0., 0., 1.));
        let mut hit = RayHit::NONE;

        mesh.ray_intersect(&mut ray, &mut hit, 0);
        assert_eq!(ray.tmax, 3.);
        mesh.ray_intersect(&mut ray, &mut hit, 1);
        assert_eq!(ray.tmax, 1.);
        assert_eq!(hit.object, 1);

        // The farther triangle can no longer displace the closer hit
        mesh.ray_intersect(&mut ray, &mut hit, 0);
        assert_eq!(hit.object, 1);
    }

    #[test]
    fn test_coplanar_tie_is_stable() {
        let tri = [vec3(0., 0., 0.), vec3(1., 0., 0.), vec3(0., 1., 0.)];
        let mesh = BasicMesh::from_triangles(&[tri, tri]);

        let mut ray = Ray::new(vec3(0.25, 0.25, -1.), vec3(0., 0., 1.));
        let mut hit = RayHit::NONE;

        mesh.ray_intersect(&mut ray, &mut hit, 0);
        mesh.ray_intersect(&mut ray, &mut hit, 1);

        assert_eq!(hit.object, 0);
    }

    #[test]
    fn test_remap() {
        let tri = |x: f32| [vec3(x, 0., 0.), vec3(x + 1., 0., 0.), vec3(x, 1., 0.)];
        let mut mesh = BasicMesh::from_triangles(&[tri(0.), tri(10.), tri(20.)]);

        let before: Vec<Aabb> = (0..3).map(|id| mesh.object_bounds(id)).collect();
        mesh.remap(&[2, 0, 1]);

        assert_eq!(mesh.object_bounds(0), before[2]);
        assert_eq!(mesh.object_bounds(1), before[0]);
        assert_eq!(mesh.object_bounds(2), before[1]);
    }
}
