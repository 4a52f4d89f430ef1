use glam::Vec3;
use smallvec::{smallvec, SmallVec};

use crate::{
    error::BuildError,
    geometry::{ray_aabb_test, Aabb, Axis, Ray},
    mailbox::Mailbox,
    object_set::{ObjectSet, RayHit},
    scratch::{Scratch, ScratchArray},
    stats::{MemoryUsage, TreeStats},
};

/// 32-byte alignment to make sure that a node doesn't cross into 2 cache
/// lines.
#[derive(Debug, Clone, Copy)]
#[repr(C, align(32))]
pub struct BvhNode {
    pub aabb: Aabb,
    /// Leaf: index of its first object reference. Inner: index of the left
    /// child; the right child sits in the next slot.
    pub first: u32,
    /// Objects in a leaf, 0 for inner nodes.
    pub count: u16,
    pub axis: Axis,
}

impl BvhNode {
    fn new_leaf(aabb: Aabb, first: u32, count: u16) -> Self {
        Self {
            aabb,
            first,
            count,
            axis: Axis::X,
        }
    }

    fn new_inner(aabb: Aabb, left_child: u32, axis: Axis) -> Self {
        Self {
            aabb,
            first: left_child,
            count: 0,
            axis,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.count > 0
    }

    pub fn left_child(&self) -> u32 {
        debug_assert!(!self.is_leaf());
        self.first
    }

    pub fn right_child(&self) -> u32 {
        debug_assert!(!self.is_leaf());
        self.first + 1
    }
}

/// Binary tree of axis-aligned boxes in one contiguous node array; sibling
/// nodes occupy consecutive slots. Leaves reference ranges of `refs`, a
/// permutation of `0..N` (every object lands in exactly one leaf).
pub struct AabbTree {
    nodes: Vec<BvhNode>,
    refs: Vec<u32>,
    stack_depth: u32,
}

impl AabbTree {
    pub fn build<S: ObjectSet>(
        objects: &S,
        builder: &impl TreeBuilder,
    ) -> Result<Self, BuildError> {
        builder.build(objects)
    }

    pub fn nodes(&self) -> &[BvhNode] {
        &self.nodes
    }

    pub fn refs(&self) -> &[u32] {
        &self.refs
    }

    pub fn bounding_box(&self) -> Aabb {
        self.nodes.first().map_or(Aabb::EMPTY, |root| root.aabb)
    }

    /// Deepest descent a traversal can make, for sizing its stack.
    pub fn stack_depth(&self) -> u32 {
        self.stack_depth
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        let mut usage = MemoryUsage::default();
        usage.add(&self.nodes);
        usage.add(&self.refs);
        usage
    }

    pub fn stats(&self) -> TreeStats {
        let mut stats = TreeStats {
            nodes: self.nodes.len(),
            object_refs: self.refs.len(),
            ..TreeStats::default()
        };
        if self.nodes.is_empty() {
            return stats;
        }

        let mut walk = vec![(0u32, 1usize)];
        while let Some((index, depth)) = walk.pop() {
            let node = &self.nodes[index as usize];
            if node.is_leaf() {
                stats.record_leaf(node.count as usize, depth);
            } else {
                walk.push((node.left_child(), depth + 1));
                walk.push((node.right_child(), depth + 1));
            }
        }
        stats
    }

    /// Validates the structural invariants: every object referenced exactly
    /// once, every node's box containing its children and its leaf objects.
    pub fn check_tree<S: ObjectSet>(&self, objects: &S) {
        assert_eq!(self.refs.len(), objects.object_count() as usize);
        if self.nodes.is_empty() {
            return;
        }

        let mut seen = vec![false; self.refs.len()];
        for node in &self.nodes {
            if node.is_leaf() {
                for &id in &self.refs[node.first as usize..][..node.count as usize] {
                    assert!(!seen[id as usize], "object {id} referenced twice");
                    seen[id as usize] = true;
                    assert!(objects.object_bounds(id).fits_within(node.aabb));
                }
            } else {
                let left = &self.nodes[node.left_child() as usize];
                let right = &self.nodes[node.right_child() as usize];
                assert!(left.aabb.fits_within(node.aabb));
                assert!(right.aabb.fits_within(node.aabb));
            }
        }
        assert!(seen.iter().all(|&s| s), "some object is not in any leaf");
    }
}

pub trait TreeBuilder {
    fn build<S: ObjectSet>(&self, objects: &S) -> Result<AabbTree, BuildError>;
}

/// Indices above this no longer fit the packed node encodings.
pub(crate) const MAX_INDEX: usize = 1 << 30;

#[derive(Clone, Copy)]
struct BuildPrim {
    id: u32,
    aabb: Aabb,
    centroid: Vec3,
}

fn gather_prims<S: ObjectSet>(objects: &S) -> Result<Vec<BuildPrim>, BuildError> {
    let count = objects.object_count() as usize;
    if count >= MAX_INDEX {
        return Err(BuildError::TooManyRefs);
    }

    let prims = (0..count as u32)
        .map(|id| {
            let aabb = objects.object_bounds(id);
            BuildPrim {
                id,
                aabb,
                centroid: aabb.center(),
            }
        })
        .collect::<Vec<_>>();

    if prims.iter().any(|p| !p.aabb.is_finite()) {
        return Err(BuildError::InvalidBounds);
    }
    Ok(prims)
}

fn centroid_bounds(prims: &[BuildPrim]) -> Aabb {
    prims
        .iter()
        .fold(Aabb::EMPTY, |bounds, p| bounds.union_point(p.centroid))
}

fn prims_bounds(prims: &[BuildPrim]) -> Aabb {
    prims
        .iter()
        .fold(Aabb::EMPTY, |bounds, p| bounds.union_aabb(p.aabb))
}

/// Moves every prim satisfying `pred` to the front, returning the count.
fn partition_in_place(prims: &mut [BuildPrim], pred: impl Fn(&BuildPrim) -> bool) -> usize {
    let mut mid = 0;
    for i in 0..prims.len() {
        if pred(&prims[i]) {
            prims.swap(mid, i);
            mid += 1;
        }
    }
    mid
}

struct TreeSink {
    nodes: Vec<BvhNode>,
    refs: Vec<u32>,
    stack_depth: u32,
}

impl TreeSink {
    fn with_capacity(count: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(2 * count),
            refs: Vec::with_capacity(count),
            stack_depth: 0,
        }
    }

    fn push_leaf(&mut self, slot: usize, aabb: Aabb, prims: &[BuildPrim], depth: u32) {
        debug_assert!(prims.len() <= u16::MAX as usize);
        let first = self.refs.len() as u32;
        self.refs.extend(prims.iter().map(|p| p.id));
        self.nodes[slot] = BvhNode::new_leaf(aabb, first, prims.len() as u16);
        self.stack_depth = self.stack_depth.max(depth);
    }

    /// Reserves the consecutive sibling pair and links it into `slot`.
    fn push_inner(&mut self, slot: usize, aabb: Aabb, axis: Axis) -> (usize, usize) {
        let left = self.nodes.len();
        self.nodes.push(BvhNode::new_leaf(Aabb::EMPTY, 0, 0));
        self.nodes.push(BvhNode::new_leaf(Aabb::EMPTY, 0, 0));
        self.nodes[slot] = BvhNode::new_inner(aabb, left as u32, axis);
        (left, left + 1)
    }

    fn into_tree(self) -> AabbTree {
        AabbTree {
            nodes: self.nodes,
            refs: self.refs,
            stack_depth: self.stack_depth,
        }
    }
}

/// Partitions by the median object centroid along the widest centroid
/// axis. Fast, and good enough for coherent scenes.
pub struct MedianCutBuilder {
    pub max_leaf_size: usize,
    pub max_depth: usize,
}

impl Default for MedianCutBuilder {
    fn default() -> Self {
        Self {
            max_leaf_size: 4,
            max_depth: 64,
        }
    }
}

impl TreeBuilder for MedianCutBuilder {
    fn build<S: ObjectSet>(&self, objects: &S) -> Result<AabbTree, BuildError> {
        let mut prims = gather_prims(objects)?;
        let mut sink = TreeSink::with_capacity(prims.len());

        if !prims.is_empty() {
            sink.nodes.push(BvhNode::new_leaf(Aabb::EMPTY, 0, 0));
            self.build_node(&mut prims, &mut sink, 0, 1);
        }

        log::debug!(
            "median-cut build: {} objects, {} nodes, depth {}",
            objects.object_count(),
            sink.nodes.len(),
            sink.stack_depth
        );
        Ok(sink.into_tree())
    }
}

impl MedianCutBuilder {
    fn build_node(&self, prims: &mut [BuildPrim], sink: &mut TreeSink, slot: usize, depth: u32) {
        let aabb = prims_bounds(prims);

        let centroids = centroid_bounds(prims);
        if prims.len() <= self.max_leaf_size
            || depth as usize >= self.max_depth
            || centroids.diagonal().cmple(Vec3::ZERO).all()
        {
            sink.push_leaf(slot, aabb, prims, depth);
            return;
        }

        let axis = centroids.max_axis();
        let mid = prims.len() / 2;
        prims.select_nth_unstable_by(mid, |p0, p1| {
            p0.centroid[axis as usize].total_cmp(&p1.centroid[axis as usize])
        });

        let (left_slot, right_slot) = sink.push_inner(slot, aabb, axis);
        let (left, right) = prims.split_at_mut(mid);
        self.build_node(left, sink, left_slot, depth + 1);
        self.build_node(right, sink, right_slot, depth + 1);
    }
}

/// Top-down binned surface-area-heuristic builder; slower than the median
/// cut but produces substantially cheaper trees on irregular scenes.
pub struct BinnedSahBuilder {
    pub bins: usize,
    pub traversal_cost: f32,
    pub intersect_cost: f32,
    pub max_leaf_size: usize,
    pub max_depth: usize,
}

impl Default for BinnedSahBuilder {
    fn default() -> Self {
        Self {
            bins: 16,
            traversal_cost: 0.5,
            intersect_cost: 1.,
            max_leaf_size: 4,
            max_depth: 64,
        }
    }
}

#[derive(Clone, Copy)]
struct SahBin {
    count: u32,
    aabb: Aabb,
}

impl SahBin {
    const EMPTY: SahBin = SahBin {
        count: 0,
        aabb: Aabb::EMPTY,
    };
}

struct SahSplit {
    axis: Axis,
    bin: usize,
    cost: f32,
}

impl TreeBuilder for BinnedSahBuilder {
    fn build<S: ObjectSet>(&self, objects: &S) -> Result<AabbTree, BuildError> {
        self.validate()?;

        let mut prims = gather_prims(objects)?;
        let mut sink = TreeSink::with_capacity(prims.len());

        if !prims.is_empty() {
            sink.nodes.push(BvhNode::new_leaf(Aabb::EMPTY, 0, 0));
            self.build_node(&mut prims, &mut sink, 0, 1);
        }

        log::debug!(
            "sah build: {} objects, {} nodes, depth {}",
            objects.object_count(),
            sink.nodes.len(),
            sink.stack_depth
        );
        Ok(sink.into_tree())
    }
}

impl BinnedSahBuilder {
    fn validate(&self) -> Result<(), BuildError> {
        for cost in [self.traversal_cost, self.intersect_cost] {
            if !cost.is_finite() || cost <= 0. {
                return Err(BuildError::InvalidCost(cost));
            }
        }
        debug_assert!((2..=64).contains(&self.bins));
        Ok(())
    }

    fn build_node(&self, prims: &mut [BuildPrim], sink: &mut TreeSink, slot: usize, depth: u32) {
        let aabb = prims_bounds(prims);
        let centroids = centroid_bounds(prims);

        let make_leaf = |sink: &mut TreeSink| {
            sink.push_leaf(slot, aabb, prims, depth);
        };

        if prims.len() == 1 || depth as usize >= self.max_depth {
            make_leaf(sink);
            return;
        }

        let (axis, mid) = if prims.len() <= 2 {
            // Equal-counts split method, applying the SAH here doesn't
            // make sense
            let axis = centroids.max_axis();
            let mid = prims.len() / 2;
            prims.select_nth_unstable_by(mid, |p0, p1| {
                p0.centroid[axis as usize].total_cmp(&p1.centroid[axis as usize])
            });
            (axis, mid)
        } else {
            let Some(split) = self.find_split(prims, &centroids, aabb.area()) else {
                // No usable candidate plane: degenerate centroid extents
                make_leaf(sink);
                return;
            };

            let leaf_cost = prims.len() as f32 * self.intersect_cost;
            if prims.len() <= self.max_leaf_size && split.cost >= leaf_cost {
                make_leaf(sink);
                return;
            }

            let mid = partition_in_place(prims, |p| {
                self.bin_of(&centroids, p, split.axis) <= split.bin
            });
            debug_assert!(mid > 0 && mid < prims.len());
            (split.axis, mid)
        };

        let (left_slot, right_slot) = sink.push_inner(slot, aabb, axis);
        let (left, right) = prims.split_at_mut(mid);
        self.build_node(left, sink, left_slot, depth + 1);
        self.build_node(right, sink, right_slot, depth + 1);
    }

    fn bin_of(&self, centroids: &Aabb, prim: &BuildPrim, axis: Axis) -> usize {
        let offset = centroids.offset_of(prim.centroid)[axis as usize];
        ((self.bins as f32 * offset) as usize).min(self.bins - 1)
    }

    /// Scans the candidate planes of all three axes and returns the
    /// cheapest one; ties go to the lowest axis, then the lowest plane.
    fn find_split(&self, prims: &[BuildPrim], centroids: &Aabb, parent_area: f32) -> Option<SahSplit> {
        let mut best: Option<SahSplit> = None;
        let extent = centroids.diagonal();

        for axis in Axis::ALL {
            if extent[axis as usize] <= 0. {
                continue;
            }

            let mut bins: SmallVec<[SahBin; 32]> = smallvec![SahBin::EMPTY; self.bins];
            for prim in prims {
                let bin = &mut bins[self.bin_of(centroids, prim, axis)];
                bin.count += 1;
                bin.aabb = bin.aabb.union_aabb(prim.aabb);
            }

            let split_count = self.bins - 1;
            let mut below: SmallVec<[(u32, f32); 32]> = smallvec![(0, 0.); split_count];
            let mut count_below = 0;
            let mut aabb_below = Aabb::EMPTY;
            for i in 0..split_count {
                aabb_below = aabb_below.union_aabb(bins[i].aabb);
                count_below += bins[i].count;
                below[i] = (count_below, aabb_below.area());
            }

            let mut count_above = 0;
            let mut aabb_above = Aabb::EMPTY;
            for i in (1..=split_count).rev() {
                aabb_above = aabb_above.union_aabb(bins[i].aabb);
                count_above += bins[i].count;

                let (count_b, area_b) = below[i - 1];
                if count_b == 0 || count_above == 0 {
                    continue;
                }

                let cost = self.traversal_cost
                    + self.intersect_cost
                        * (count_b as f32 * area_b + count_above as f32 * aabb_above.area())
                        / parent_area;

                let beats = match &best {
                    None => true,
                    Some(b) => {
                        cost < b.cost
                            || (cost == b.cost
                                && (axis as u8, i - 1) < (b.axis as u8, b.bin))
                    }
                };
                if beats {
                    best = Some(SahSplit {
                        axis,
                        bin: i - 1,
                        cost,
                    });
                }
            }
        }

        best
    }
}

/// Casts the ray through the tree, nearest child first, keeping the
/// deferred far children on an explicit scratch stack.
pub fn raycast_bvh<S: ObjectSet, M: Mailbox>(
    tree: &AabbTree,
    objects: &S,
    ray: &mut Ray,
    hit: &mut RayHit,
    mailbox: &mut M,
    scratch: &mut Scratch,
) {
    mailbox.begin_ray();

    if tree.nodes.is_empty() {
        return;
    }

    let dir_is_neg = ray.dir_is_neg();
    let mut stack = ScratchArray::<u32>::new(scratch, tree.stack_depth as usize + 1);
    let mut top = 0usize;
    let mut current = 0u32;

    loop {
        let node = &tree.nodes[current as usize];
        if ray_aabb_test(&node.aabb, ray).is_some() {
            if node.is_leaf() {
                for &id in &tree.refs[node.first as usize..][..node.count as usize] {
                    if !mailbox.check_mailbox(id) {
                        objects.ray_intersect(ray, hit, id);
                    }
                }

                if top == 0 {
                    break;
                }
                top -= 1;
                current = stack[top];
            } else {
                let is_neg = match node.axis {
                    Axis::X => dir_is_neg.x,
                    Axis::Y => dir_is_neg.y,
                    Axis::Z => dir_is_neg.z,
                };

                let (near, far) = if is_neg {
                    (node.right_child(), node.left_child())
                } else {
                    (node.left_child(), node.right_child())
                };

                if top >= stack.len() {
                    debug_assert!(false, "traversal stack overflow");
                    return;
                }
                stack[top] = far;
                top += 1;
                current = near;
            }
        } else {
            if top == 0 {
                break;
            }
            top -= 1;
            current = stack[top];
        }
    }
}

#[cfg(test)]
mod test_bvh {
    use glam::vec3;
    use rand::{rngs::SmallRng, SeedableRng};

    use crate::mailbox::NullMailbox;
    use crate::mesh::BasicMesh;
    use crate::test_support::{brute_force_raycast, random_rays, random_soup};

    use super::*;

    fn four_corner_mesh() -> BasicMesh {
        let tri = |c: Vec3| [c, c + vec3(0.2, 0., 0.), c + vec3(0., 0.2, 0.)];
        BasicMesh::from_triangles(&[
            tri(vec3(2., 0., 1.)),
            tri(vec3(2., 0., -1.)),
            tri(vec3(-2., 0., 1.)),
            tri(vec3(-2., 0., -1.)),
        ])
    }

    #[test]
    fn test_build_layout() {
        let mesh = four_corner_mesh();
        let builder = BinnedSahBuilder {
            max_leaf_size: 1,
            ..Default::default()
        };
        let tree = AabbTree::build(&mesh, &builder).unwrap();

        let root = &tree.nodes()[0];
        assert!(!root.is_leaf());
        assert_eq!(root.right_child(), root.left_child() + 1);
        assert_eq!(root.aabb, mesh.bounds());

        let stats = tree.stats();
        assert_eq!(stats.object_refs, 4);
        assert_eq!(stats.max_leaf_size, 1);
        assert!(stats.max_depth >= 2);

        tree.check_tree(&mesh);
    }

    #[test]
    fn test_invariants_on_random_soup() {
        let mut rng = SmallRng::seed_from_u64(1);
        let mesh = random_soup(&mut rng, 300);

        for tree in [
            AabbTree::build(&mesh, &MedianCutBuilder::default()).unwrap(),
            AabbTree::build(&mesh, &BinnedSahBuilder::default()).unwrap(),
        ] {
            tree.check_tree(&mesh);
            assert!(tree.stack_depth() > 0);
            assert!(tree.memory_usage().used > 0);
        }
    }

    /// All intersections through the tree must match manual intersections.
    #[test]
    fn test_raycast_matches_brute_force() {
        let mut rng = SmallRng::seed_from_u64(0);
        let mesh = random_soup(&mut rng, 250);

        let median = AabbTree::build(&mesh, &MedianCutBuilder::default()).unwrap();
        let sah = AabbTree::build(&mesh, &BinnedSahBuilder::default()).unwrap();
        let mut scratch = Scratch::new();

        for proto in random_rays(&mut rng, 1_000) {
            let mut ref_ray = proto.clone();
            let mut ref_hit = RayHit::NONE;
            brute_force_raycast(&mesh, &mut ref_ray, &mut ref_hit);

            for tree in [&median, &sah] {
                let mut ray = proto.clone();
                let mut hit = RayHit::NONE;
                raycast_bvh(tree, &mesh, &mut ray, &mut hit, &mut NullMailbox, &mut scratch);

                assert_eq!(hit.object, ref_hit.object);
                assert_eq!(ray.tmax, ref_ray.tmax);
            }
        }
    }

    #[test]
    fn test_empty_set() {
        let mesh = BasicMesh::from_triangles(&[]);
        let tree = AabbTree::build(&mesh, &BinnedSahBuilder::default()).unwrap();
        assert_eq!(tree.bounding_box(), Aabb::EMPTY);

        let mut ray = Ray::new(Vec3::ZERO, Vec3::Z);
        let mut hit = RayHit::NONE;
        let mut scratch = Scratch::new();
        raycast_bvh(&tree, &mesh, &mut ray, &mut hit, &mut NullMailbox, &mut scratch);
        assert!(!hit.is_hit());
    }

    #[test]
    fn test_invalid_costs_rejected() {
        let mesh = four_corner_mesh();
        let builder = BinnedSahBuilder {
            intersect_cost: -1.,
            ..Default::default()
        };
        assert!(matches!(
            AabbTree::build(&mesh, &builder),
            Err(BuildError::InvalidCost(_))
        ));
    }

    #[test]
    fn test_coincident_centroids_become_leaf() {
        // All centroids identical: no axis has extent, so the builders must
        // fall back to one leaf instead of recursing forever.
        let tri = [vec3(0., 0., 0.), vec3(1., 0., 0.), vec3(0., 1., 0.)];
        let mesh = BasicMesh::from_triangles(&[tri; 9]);

        let tree = AabbTree::build(&mesh, &BinnedSahBuilder::default()).unwrap();
        assert_eq!(tree.stats().leaves, 1);
        tree.check_tree(&mesh);
    }
}
