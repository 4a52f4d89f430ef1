use bytemuck::{Pod, Zeroable};

use crate::{
    bvh::MAX_INDEX,
    error::BuildError,
    geometry::{ray_aabb_test, Aabb, Axis, Ray},
    mailbox::Mailbox,
    object_set::{ClipObjectSet, ObjectSet, RayHit},
    scratch::{Scratch, ScratchArray},
    stats::{MemoryUsage, TreeStats},
};

const TAG_MASK: u32 = 0b11;
const LEAF_TAG: u32 = 3;

/// 8-byte packed node. The first word carries a 2-bit tag (an axis for
/// inner nodes, 3 for leaves) and a 30-bit index: the left child for inner
/// nodes (the right child is the next slot), the first object reference
/// for leaves. The second word is the split position's bits or the leaf's
/// object count.
#[derive(Clone, Copy, Debug)]
pub struct KdNode {
    word: u32,
    data: u32,
}

impl KdNode {
    fn new_inner(axis: Axis, left_child: u32, split: f32) -> Self {
        debug_assert!((left_child as usize) < MAX_INDEX);
        Self {
            word: (left_child << 2) | axis as u32,
            data: split.to_bits(),
        }
    }

    fn new_leaf(first_ref: u32, count: u32) -> Self {
        debug_assert!((first_ref as usize) < MAX_INDEX);
        Self {
            word: (first_ref << 2) | LEAF_TAG,
            data: count,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.word & TAG_MASK == LEAF_TAG
    }

    pub fn axis(&self) -> Axis {
        debug_assert!(!self.is_leaf());
        Axis::from_index((self.word & TAG_MASK) as usize)
    }

    pub fn split_position(&self) -> f32 {
        debug_assert!(!self.is_leaf());
        f32::from_bits(self.data)
    }

    pub fn left_child(&self) -> u32 {
        debug_assert!(!self.is_leaf());
        self.word >> 2
    }

    pub fn right_child(&self) -> u32 {
        self.left_child() + 1
    }

    pub fn first_ref(&self) -> u32 {
        debug_assert!(self.is_leaf());
        self.word >> 2
    }

    pub fn object_count(&self) -> u32 {
        debug_assert!(self.is_leaf());
        self.data
    }
}

/// Axis-aligned binary space partition. Unlike the bounding-volume trees,
/// an object clipped by a split plane is referenced from both sides, so
/// `refs` may hold duplicates and traversal wants a mailbox.
pub struct KdTree {
    nodes: Vec<KdNode>,
    refs: Vec<u32>,
    bounds: Aabb,
    stack_depth: u32,
}

impl KdTree {
    pub fn build<S: ClipObjectSet>(
        objects: &S,
        builder: &SahKdBuilder,
    ) -> Result<Self, BuildError> {
        builder.build(objects)
    }

    pub fn nodes(&self) -> &[KdNode] {
        &self.nodes
    }

    pub fn refs(&self) -> &[u32] {
        &self.refs
    }

    pub fn bounding_box(&self) -> Aabb {
        self.bounds
    }

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
                stats.record_leaf(node.object_count() as usize, depth);
            } else {
                walk.push((node.left_child(), depth + 1));
                walk.push((node.right_child(), depth + 1));
            }
        }
        stats
    }

    /// Validates leaf and inner encodings independently: leaf ranges must
    /// stay inside `refs` and reference real objects, child links must stay
    /// inside the node array.
    pub fn check_tree<S: ObjectSet>(&self, objects: &S) {
        let mut covered = vec![false; objects.object_count() as usize];
        for node in &self.nodes {
            if node.is_leaf() {
                let first = node.first_ref() as usize;
                let count = node.object_count() as usize;
                assert!(first + count <= self.refs.len());
                for &id in &self.refs[first..first + count] {
                    assert!(id < objects.object_count());
                    covered[id as usize] = true;
                }
            } else {
                assert!((node.right_child() as usize) < self.nodes.len());
            }
        }
        assert!(
            covered.iter().all(|&c| c),
            "some object is not referenced by any leaf"
        );
    }
}

/// Sweep SAH builder with perfect triangle clipping: split candidates are
/// the clipped object extents on each axis, costed with the surface-area
/// heuristic; straddling objects are clipped and handed to both children
/// with their refined boxes.
pub struct SahKdBuilder {
    pub traversal_cost: f32,
    pub intersect_cost: f32,
    /// Candidate lists at or below this size stop splitting.
    pub min_leaf_size: usize,
    /// `None` derives the usual `8 + 1.3 log2 N` bound.
    pub max_depth: Option<u32>,
}

impl Default for SahKdBuilder {
    fn default() -> Self {
        // Cost ratio from "On building fast kd-trees for ray tracing"
        Self {
            traversal_cost: 15.,
            intersect_cost: 20.,
            min_leaf_size: 2,
            max_depth: None,
        }
    }
}

#[derive(Clone, Copy)]
struct KdCandidate {
    id: u32,
    aabb: Aabb,
}

/// Event kinds ordered so that, at equal positions, intervals close before
/// planar objects are counted and new intervals open last.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum EventKind {
    End = 0,
    Planar = 1,
    Begin = 2,
}

#[derive(Clone, Copy)]
struct SweepEvent {
    position: f32,
    kind: EventKind,
    id: u32,
}

impl SweepEvent {
    /// Total order `(position, kind, id)`; id last keeps the sweep
    /// deterministic for coincident geometry.
    fn sort_key(&self) -> (f32, EventKind, u32) {
        (self.position, self.kind, self.id)
    }
}

struct KdSplit {
    axis: Axis,
    position: f32,
    cost: f32,
    planar_left: bool,
}

struct KdSink {
    nodes: Vec<KdNode>,
    refs: Vec<u32>,
    stack_depth: u32,
}

impl SahKdBuilder {
    fn build<S: ClipObjectSet>(&self, objects: &S) -> Result<KdTree, BuildError> {
        for cost in [self.traversal_cost, self.intersect_cost] {
            if !cost.is_finite() || cost <= 0. {
                return Err(BuildError::InvalidCost(cost));
            }
        }

        let count = objects.object_count();
        if count == 0 {
            return Ok(KdTree {
                nodes: Vec::new(),
                refs: Vec::new(),
                bounds: Aabb::EMPTY,
                stack_depth: 0,
            });
        }

        let bounds = objects.bounds();
        if !bounds.is_finite() {
            return Err(BuildError::InvalidBounds);
        }

        let candidates = (0..count)
            .map(|id| KdCandidate {
                id,
                aabb: objects.object_bounds(id),
            })
            .collect::<Vec<_>>();

        let max_depth = self
            .max_depth
            .unwrap_or_else(|| (8. + 1.3 * (count as f32).log2()).ceil() as u32);

        let mut sink = KdSink {
            nodes: vec![KdNode::new_leaf(0, 0)],
            refs: Vec::new(),
            stack_depth: 0,
        };
        self.build_node(objects, candidates, bounds, &mut sink, 0, 1, max_depth)?;

        log::debug!(
            "kd build: {} objects, {} nodes, {} references, depth {}",
            count,
            sink.nodes.len(),
            sink.refs.len(),
            sink.stack_depth
        );

        Ok(KdTree {
            nodes: sink.nodes,
            refs: sink.refs,
            bounds,
            stack_depth: sink.stack_depth,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn build_node<S: ClipObjectSet>(
        &self,
        objects: &S,
        candidates: Vec<KdCandidate>,
        bounds: Aabb,
        sink: &mut KdSink,
        slot: usize,
        depth: u32,
        max_depth: u32,
    ) -> Result<(), BuildError> {
        let split = if candidates.len() <= self.min_leaf_size || depth >= max_depth {
            None
        } else {
            self.find_split(&candidates, &bounds)
        };

        let Some(split) = split else {
            return self.push_leaf(&candidates, sink, slot, depth);
        };

        let mut left = Vec::with_capacity(candidates.len());
        let mut right = Vec::with_capacity(candidates.len());
        let a = split.axis as usize;

        for c in candidates {
            let (lo, hi) = (c.aabb.min[a], c.aabb.max[a]);
            if lo == split.position && hi == split.position {
                if split.planar_left {
                    left.push(c);
                } else {
                    right.push(c);
                }
            } else if hi <= split.position {
                left.push(c);
            } else if lo >= split.position {
                right.push(c);
            } else {
                let (lbox, rbox) =
                    objects.clip_object(c.id, &c.aabb, split.axis, split.position);
                if lbox.is_degenerate() && rbox.is_degenerate() {
                    // Clipper fell apart numerically; keep the object on
                    // both sides with its unclipped extents
                    let (fall_l, fall_r) = c.aabb.split_at(split.axis, split.position);
                    left.push(KdCandidate { id: c.id, aabb: fall_l });
                    right.push(KdCandidate { id: c.id, aabb: fall_r });
                } else {
                    if !lbox.is_degenerate() {
                        left.push(KdCandidate { id: c.id, aabb: lbox });
                    }
                    if !rbox.is_degenerate() {
                        right.push(KdCandidate { id: c.id, aabb: rbox });
                    }
                }
            }
        }

        let left_slot = sink.nodes.len();
        if left_slot + 1 >= MAX_INDEX {
            return Err(BuildError::TooManyNodes);
        }
        sink.nodes.push(KdNode::new_leaf(0, 0));
        sink.nodes.push(KdNode::new_leaf(0, 0));
        sink.nodes[slot] = KdNode::new_inner(split.axis, left_slot as u32, split.position);

        let (lbounds, rbounds) = bounds.split_at(split.axis, split.position);
        self.build_node(objects, left, lbounds, sink, left_slot, depth + 1, max_depth)?;
        self.build_node(objects, right, rbounds, sink, left_slot + 1, depth + 1, max_depth)
    }

    fn push_leaf(
        &self,
        candidates: &[KdCandidate],
        sink: &mut KdSink,
        slot: usize,
        depth: u32,
    ) -> Result<(), BuildError> {
        let first = sink.refs.len();
        if first + candidates.len() >= MAX_INDEX {
            return Err(BuildError::TooManyRefs);
        }
        sink.refs.extend(candidates.iter().map(|c| c.id));
        sink.nodes[slot] = KdNode::new_leaf(first as u32, candidates.len() as u32);
        sink.stack_depth = sink.stack_depth.max(depth);
        Ok(())
    }

    /// Sweeps the clipped-extent events of all three axes and returns the
    /// cheapest in-box plane, or `None` when no plane beats the leaf.
    fn find_split(&self, candidates: &[KdCandidate], bounds: &Aabb) -> Option<KdSplit> {
        let parent_area = bounds.area();
        if !(parent_area > 0.) {
            return None;
        }

        let mut best: Option<KdSplit> = None;
        let mut events = Vec::with_capacity(2 * candidates.len());

        for axis in Axis::ALL {
            let a = axis as usize;
            if bounds.max[a] <= bounds.min[a] {
                continue;
            }

            events.clear();
            for c in candidates {
                let (lo, hi) = (c.aabb.min[a], c.aabb.max[a]);
                if lo == hi {
                    events.push(SweepEvent {
                        position: lo,
                        kind: EventKind::Planar,
                        id: c.id,
                    });
                } else {
                    events.push(SweepEvent {
                        position: lo,
                        kind: EventKind::Begin,
                        id: c.id,
                    });
                    events.push(SweepEvent {
                        position: hi,
                        kind: EventKind::End,
                        id: c.id,
                    });
                }
            }
            events.sort_unstable_by(|e0, e1| {
                let (p0, k0, i0) = e0.sort_key();
                let (p1, k1, i1) = e1.sort_key();
                p0.total_cmp(&p1).then(k0.cmp(&k1)).then(i0.cmp(&i1))
            });

            let mut n_left = 0usize;
            let mut n_right = candidates.len();
            let mut i = 0;
            while i < events.len() {
                let position = events[i].position;
                let mut ending = 0usize;
                let mut planar = 0usize;
                let mut starting = 0usize;

                while i < events.len() && events[i].position == position {
                    match events[i].kind {
                        EventKind::End => ending += 1,
                        EventKind::Planar => planar += 1,
                        EventKind::Begin => starting += 1,
                    }
                    i += 1;
                }

                n_right -= ending + planar;

                if position > bounds.min[a] && position < bounds.max[a] {
                    let (lbounds, rbounds) = bounds.split_at(axis, position);
                    let area_l = lbounds.area() / parent_area;
                    let area_r = rbounds.area() / parent_area;

                    let cost_planar_left = self.traversal_cost
                        + self.intersect_cost
                            * (area_l * (n_left + planar) as f32 + area_r * n_right as f32);
                    let cost_planar_right = self.traversal_cost
                        + self.intersect_cost
                            * (area_l * n_left as f32 + area_r * (n_right + planar) as f32);

                    let (cost, planar_left) = if cost_planar_left <= cost_planar_right {
                        (cost_planar_left, true)
                    } else {
                        (cost_planar_right, false)
                    };

                    if best.as_ref().map_or(true, |b| cost < b.cost) {
                        best = Some(KdSplit {
                            axis,
                            position,
                            cost,
                            planar_left,
                        });
                    }
                }

                n_left += starting + planar;
            }
        }

        let leaf_cost = candidates.len() as f32 * self.intersect_cost;
        best.filter(|b| b.cost < leaf_cost)
    }
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct KdStackEntry {
    node: u32,
    tmin: f32,
    tmax: f32,
}

/// Walks the tree front to back with an explicit near/far stack sized by
/// the recorded build depth. Popped entries that start beyond the current
/// best hit are discarded unvisited.
pub fn raycast_kdtree<S: ObjectSet, M: Mailbox>(
    tree: &KdTree,
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
    let Some((t0, t1)) = ray_aabb_test(&tree.bounds, ray) else {
        return;
    };
    let mut tmin = t0.max(ray.tmin);
    let mut tmax = t1.min(ray.tmax);

    let mut stack = ScratchArray::<KdStackEntry>::new(scratch, tree.stack_depth as usize + 1);
    let mut top = 0usize;
    let mut node_index = 0u32;

    loop {
        let node = &tree.nodes[node_index as usize];

        if !node.is_leaf() {
            let a = node.axis() as usize;
            let split = node.split_position();
            let thit = (split - ray.orig[a]) * ray.inv_dir[a];

            // The near child holds the origin; an origin exactly on the
            // plane falls to the direction sign, which keeps rays with a
            // zero component on the correct side
            let below = ray.orig[a] < split || (ray.orig[a] == split && ray.dir[a] <= 0.);
            let (near, far) = if below {
                (node.left_child(), node.right_child())
            } else {
                (node.right_child(), node.left_child())
            };

            // A crossing at t <= 0 (plane on or behind the origin) leaves
            // the whole segment on the near side
            if thit > tmax || thit <= 0. {
                node_index = near;
            } else if thit < tmin {
                node_index = far;
            } else {
                if top >= stack.len() {
                    debug_assert!(false, "traversal stack overflow");
                    return;
                }
                // max/min also launder a NaN plane distance (ray inside
                // the split plane with a zero direction component) into
                // visiting both children over the full interval
                stack[top] = KdStackEntry {
                    node: far,
                    tmin: thit.max(tmin),
                    tmax,
                };
                top += 1;
                node_index = near;
                tmax = thit.min(tmax);
            }
        } else {
            let first = node.first_ref() as usize;
            for &id in &tree.refs[first..first + node.object_count() as usize] {
                if !mailbox.check_mailbox(id) {
                    objects.ray_intersect(ray, hit, id);
                }
            }

            loop {
                if top == 0 {
                    return;
                }
                top -= 1;
                let entry = stack[top];
                if entry.tmin <= ray.tmax {
                    node_index = entry.node;
                    tmin = entry.tmin;
                    tmax = entry.tmax;
                    break;
                }
            }
        }
    }
}
