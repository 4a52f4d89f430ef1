use glam::Vec3;

use crate::{
    error::BuildError,
    geometry::{ray_aabb_test, Aabb, Ray},
    mailbox::Mailbox,
    object_set::{ObjectSet, RayHit},
    stats::MemoryUsage,
};

/// A regular-subdivision index: the object set's bounds divided into a
/// fixed lattice of cells, each cell holding the ids of every object whose
/// AABB overlaps it. Per-cell lists are slices of one contiguous id array.
pub struct UniformGrid {
    bounds: Aabb,
    cells: [u32; 3],
    cell_size: Vec3,
    inv_cell_size: Vec3,
    offsets: Vec<u32>,
    ids: Vec<u32>,
}

impl UniformGrid {
    /// Builds the grid with a cell resolution derived from `density`:
    /// roughly `density` cells per object, distributed over the axes in
    /// proportion to the bounds' extents.
    pub fn build<S: ObjectSet>(objects: &S, density: f32) -> Result<Self, BuildError> {
        if !density.is_finite() || density <= 0. {
            return Err(BuildError::InvalidDensity(density));
        }

        let object_count = objects.object_count();
        if object_count == 0 {
            return Ok(Self {
                bounds: Aabb::EMPTY,
                cells: [1; 3],
                cell_size: Vec3::ZERO,
                inv_cell_size: Vec3::ZERO,
                offsets: vec![0; 2],
                ids: Vec::new(),
            });
        }

        let bounds = objects.bounds();
        if !bounds.is_finite() {
            return Err(BuildError::InvalidBounds);
        }

        let extent = bounds.diagonal();
        let max_extent = extent.max_element();
        let scale = (density * object_count as f32).cbrt();

        let mut cells = [1u32; 3];
        let mut cell_size = Vec3::ZERO;
        let mut inv_cell_size = Vec3::ZERO;
        for i in 0..3 {
            if max_extent > 0. && extent[i] > 0. {
                cells[i] = ((scale * extent[i] / max_extent).ceil() as u32).max(1);
                cell_size[i] = extent[i] / cells[i] as f32;
                inv_cell_size[i] = cells[i] as f32 / extent[i];
            }
        }

        let cell_count = cells.iter().product::<u32>() as usize;

        // Two passes: count per cell, prefix-sum into offsets, scatter ids.
        let mut counts = vec![0u32; cell_count];
        let grid = Self {
            bounds,
            cells,
            cell_size,
            inv_cell_size,
            offsets: Vec::new(),
            ids: Vec::new(),
        };

        for id in 0..object_count {
            grid.for_overlapped_cells(&objects.object_bounds(id), |cell| {
                counts[cell] += 1;
            });
        }

        let mut offsets = vec![0u32; cell_count + 1];
        for i in 0..cell_count {
            offsets[i + 1] = offsets[i] + counts[i];
        }

        let mut ids = vec![0u32; offsets[cell_count] as usize];
        let mut next = offsets.clone();
        for id in 0..object_count {
            grid.for_overlapped_cells(&objects.object_bounds(id), |cell| {
                ids[next[cell] as usize] = id;
                next[cell] += 1;
            });
        }

        log::debug!(
            "grid build: {} objects, {}x{}x{} cells, {} references",
            object_count,
            cells[0],
            cells[1],
            cells[2],
            ids.len()
        );

        Ok(Self {
            offsets,
            ids,
            ..grid
        })
    }

    pub fn bounding_box(&self) -> Aabb {
        self.bounds
    }

    pub fn cell_counts(&self) -> [u32; 3] {
        self.cells
    }

    pub fn cell_objects(&self, cell: [u32; 3]) -> &[u32] {
        let i = self.cell_index(cell);
        &self.ids[self.offsets[i] as usize..self.offsets[i + 1] as usize]
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        let mut usage = MemoryUsage::default();
        usage.add(&self.offsets);
        usage.add(&self.ids);
        usage
    }

    /// Expected cost of shooting an arbitrary ray through the grid:
    /// each cell weighted by its relative surface area times the number of
    /// object tests it would trigger. Reported verbatim for density tuning.
    pub fn sah_cost(&self, intersect_cost: f32) -> f32 {
        let root_area = self.bounds.area();
        if !(root_area > 0.) {
            return 0.;
        }
        let cell_area = Aabb::new(Vec3::ZERO, self.cell_size).area();
        cell_area / root_area * self.ids.len() as f32 * intersect_cost
    }

    fn cell_index(&self, cell: [u32; 3]) -> usize {
        ((cell[2] * self.cells[1] + cell[1]) * self.cells[0] + cell[0]) as usize
    }

    fn cell_of(&self, p: Vec3) -> [i32; 3] {
        let c = (p - self.bounds.min) * self.inv_cell_size;
        let mut cell = [0i32; 3];
        for i in 0..3 {
            cell[i] = (c[i].floor() as i32).clamp(0, self.cells[i] as i32 - 1);
        }
        cell
    }

    fn for_overlapped_cells(&self, aabb: &Aabb, mut visit: impl FnMut(usize)) {
        let lo = self.cell_of(aabb.min);
        let hi = self.cell_of(aabb.max);
        for z in lo[2]..=hi[2] {
            for y in lo[1]..=hi[1] {
                for x in lo[0]..=hi[0] {
                    visit(self.cell_index([x as u32, y as u32, z as u32]));
                }
            }
        }
    }
}

/// Walks the ray through the grid cell by cell (3D-DDA), testing each
/// visited cell's objects under the mailbox until the interval is exhausted
/// or the ray leaves the lattice.
pub fn raycast_grid<S: ObjectSet, M: Mailbox>(
    grid: &UniformGrid,
    objects: &S,
    ray: &mut Ray,
    hit: &mut RayHit,
    mailbox: &mut M,
) {
    mailbox.begin_ray();

    let Some((t0, _)) = ray_aabb_test(&grid.bounds, ray) else {
        return;
    };

    let entry = ray.at(t0.max(ray.tmin));
    let mut cell = grid.cell_of(entry);

    let mut step = [0i32; 3];
    let mut delta = [f32::INFINITY; 3];
    let mut tnext = [f32::INFINITY; 3];
    for i in 0..3 {
        if ray.dir[i] > 0. {
            step[i] = 1;
            delta[i] = grid.cell_size[i] * ray.inv_dir[i];
            let boundary = grid.bounds.min[i] + (cell[i] + 1) as f32 * grid.cell_size[i];
            tnext[i] = (boundary - ray.orig[i]) * ray.inv_dir[i];
        } else if ray.dir[i] < 0. {
            step[i] = -1;
            delta[i] = -grid.cell_size[i] * ray.inv_dir[i];
            let boundary = grid.bounds.min[i] + cell[i] as f32 * grid.cell_size[i];
            tnext[i] = (boundary - ray.orig[i]) * ray.inv_dir[i];
        }
    }

    loop {
        for &id in grid.cell_objects([cell[0] as u32, cell[1] as u32, cell[2] as u32]) {
            if !mailbox.check_mailbox(id) {
                objects.ray_intersect(ray, hit, id);
            }
        }

        // Lowest axis wins ties so grazing rays step deterministically
        let mut axis = 0;
        if tnext[1] < tnext[axis] {
            axis = 1;
        }
        if tnext[2] < tnext[axis] {
            axis = 2;
        }

        if tnext[axis] > ray.tmax {
            return;
        }

        cell[axis] += step[axis];
        if cell[axis] < 0 || cell[axis] >= grid.cells[axis] as i32 {
            return;
        }
        tnext[axis] += delta[axis];
    }
}

#[cfg(test)]
mod test_grid {
    use glam::vec3;
    use rand::{rngs::SmallRng, SeedableRng};

    use crate::mailbox::NullMailbox;
    use crate::mesh::BasicMesh;
    use crate::test_support::{brute_force_raycast, random_rays, random_soup, CountingSet};

    use super::*;

    /// One diagonal triangle per cell of a k^3 lattice over the unit cube;
    /// each triangle's AABB is exactly its cell, so the mesh bounds are the
    /// whole cube and every cell holds exactly one object.
    fn lattice_soup(k: u32) -> BasicMesh {
        let mut triangles = Vec::new();
        let cell = 1. / k as f32;
        for z in 0..k {
            for y in 0..k {
                for x in 0..k {
                    let lo = vec3(x as f32, y as f32, z as f32) * cell;
                    let hi = lo + Vec3::splat(cell);
                    triangles.push([lo, vec3(hi.x, hi.y, lo.z), vec3(lo.x, hi.y, hi.z)]);
                }
            }
        }
        BasicMesh::from_triangles(&triangles)
    }

    #[test]
    fn test_resolution_follows_density() {
        let mesh = lattice_soup(4);
        let grid = UniformGrid::build(&mesh, 1.).unwrap();
        assert_eq!(grid.cell_counts(), [4, 4, 4]);

        let coarse = UniformGrid::build(&mesh, 1. / 64.).unwrap();
        assert_eq!(coarse.cell_counts(), [1, 1, 1]);
    }

    #[test]
    fn test_invalid_density() {
        let mesh = lattice_soup(2);
        assert!(matches!(
            UniformGrid::build(&mesh, 0.),
            Err(BuildError::InvalidDensity(_))
        ));
        assert!(matches!(
            UniformGrid::build(&mesh, f32::NAN),
            Err(BuildError::InvalidDensity(_))
        ));
    }

    #[test]
    fn test_objects_land_in_overlapped_cells() {
        let mesh = lattice_soup(4);
        let grid = UniformGrid::build(&mesh, 1.).unwrap();

        let mut total = 0;
        for z in 0..4 {
            for y in 0..4 {
                for x in 0..4 {
                    for &id in grid.cell_objects([x, y, z]) {
                        let cell_box = Aabb::new(
                            grid.bounds.min
                                + vec3(x as f32, y as f32, z as f32) * grid.cell_size,
                            grid.bounds.min
                                + vec3((x + 1) as f32, (y + 1) as f32, (z + 1) as f32)
                                    * grid.cell_size,
                        );
                        let obj = mesh.object_bounds(id);
                        assert!(obj.min.cmple(cell_box.max).all());
                        assert!(obj.max.cmpge(cell_box.min).all());
                        total += 1;
                    }
                }
            }
        }
        assert!(total >= mesh.object_count() as usize);
    }

    #[test]
    fn test_raycast_matches_brute_force() {
        let mut rng = SmallRng::seed_from_u64(0);
        let mesh = random_soup(&mut rng, 200);
        let grid = UniformGrid::build(&mesh, 2.).unwrap();

        for proto in random_rays(&mut rng, 1_000) {
            let mut ray = proto.clone();
            let mut hit = RayHit::NONE;
            raycast_grid(&grid, &mesh, &mut ray, &mut hit, &mut NullMailbox);

            let mut ref_ray = proto.clone();
            let mut ref_hit = RayHit::NONE;
            brute_force_raycast(&mesh, &mut ref_ray, &mut ref_hit);

            assert_eq!(hit.object, ref_hit.object);
            assert_eq!(ray.tmax, ref_ray.tmax);
        }
    }

    /// The DDA must visit every pierced cell exactly once: a ray marching
    /// down a lattice column triggers one object test per cell in that
    /// column, and none from neighbouring columns.
    #[test]
    fn test_dda_visits_pierced_column() {
        let mesh = lattice_soup(4);
        let counting = CountingSet::new(mesh);
        let grid = UniformGrid::build(&counting, 1.).unwrap();

        // Below the y >= x half each triangle covers, so nothing shortens
        // the interval.
        let mut ray = Ray::new(vec3(0.02, 0.01, -1.), vec3(0., 0., 1.));
        let mut hit = RayHit::NONE;
        raycast_grid(&grid, &counting, &mut ray, &mut hit, &mut NullMailbox);

        assert!(!hit.is_hit());
        assert_eq!(counting.calls(), 4);
    }

    /// A confirmed hit clamps the interval and stops the walk before the
    /// remaining cells are opened.
    #[test]
    fn test_hit_prunes_remaining_cells() {
        let mesh = lattice_soup(4);
        let counting = CountingSet::new(mesh);
        let grid = UniformGrid::build(&counting, 1.).unwrap();

        let mut ray = Ray::new(vec3(0.1, 0.15, -1.), vec3(0., 0., 1.));
        let mut hit = RayHit::NONE;
        raycast_grid(&grid, &counting, &mut ray, &mut hit, &mut NullMailbox);

        assert!(hit.is_hit());
        assert_eq!(counting.calls(), 1);
    }

    #[test]
    fn test_grazing_face_ray() {
        // Ray travelling exactly on the boundary plane between y-cells.
        let mut rng = SmallRng::seed_from_u64(3);
        let mesh = random_soup(&mut rng, 64);
        let grid = UniformGrid::build(&mesh, 1.).unwrap();

        let mut ray = Ray::new(vec3(-1., 0.5, 0.5), vec3(1., 0., 0.));
        let mut hit = RayHit::NONE;
        raycast_grid(&grid, &mesh, &mut ray, &mut hit, &mut NullMailbox);

        let mut ref_ray = Ray::new(vec3(-1., 0.5, 0.5), vec3(1., 0., 0.));
        let mut ref_hit = RayHit::NONE;
        brute_force_raycast(&mesh, &mut ref_ray, &mut ref_hit);

        assert_eq!(hit.object, ref_hit.object);
    }

    #[test]
    fn test_empty_set() {
        let mesh = BasicMesh::from_triangles(&[]);
        let grid = UniformGrid::build(&mesh, 1.).unwrap();

        let mut ray = Ray::new(vec3(0.5, 0.5, -1.), vec3(0., 0., 1.));
        let mut hit = RayHit::NONE;
        raycast_grid(&grid, &mesh, &mut ray, &mut hit, &mut NullMailbox);
        assert!(!hit.is_hit());
    }

    #[test]
    fn test_sah_cost_scales_with_occupancy() {
        let sparse = lattice_soup(2);
        let grid = UniformGrid::build(&sparse, 1.).unwrap();
        let cost = grid.sah_cost(1.);
        assert!(cost > 0.);
        assert!(grid.sah_cost(2.) > cost);
    }
}
