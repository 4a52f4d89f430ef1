use glam::Vec4;
use smallvec::SmallVec;

use crate::{
    bvh::{AabbTree, BinnedSahBuilder, TreeBuilder},
    error::BuildError,
    geometry::{Aabb, Ray},
    mailbox::Mailbox,
    object_set::{ObjectSet, RayHit},
    scratch::{Scratch, ScratchArray},
    stats::{MemoryUsage, TreeStats},
};

/// Boxes of up to four sibling children, stored lane-wise so one slab test
/// covers all four. Unused lanes hold inverted boxes and can never report
/// a hit.
#[derive(Clone, Copy, Debug)]
pub struct QuadAabb {
    pub min_x: Vec4,
    pub max_x: Vec4,
    pub min_y: Vec4,
    pub max_y: Vec4,
    pub min_z: Vec4,
    pub max_z: Vec4,
}

impl QuadAabb {
    pub const EMPTY: QuadAabb = QuadAabb {
        min_x: Vec4::splat(f32::MAX),
        max_x: Vec4::splat(f32::MIN),
        min_y: Vec4::splat(f32::MAX),
        max_y: Vec4::splat(f32::MIN),
        min_z: Vec4::splat(f32::MAX),
        max_z: Vec4::splat(f32::MIN),
    };

    pub fn set_lane(&mut self, lane: usize, aabb: Aabb) {
        self.min_x[lane] = aabb.min.x;
        self.max_x[lane] = aabb.max.x;
        self.min_y[lane] = aabb.min.y;
        self.max_y[lane] = aabb.max.y;
        self.min_z[lane] = aabb.min.z;
        self.max_z[lane] = aabb.max.z;
    }

    fn near_far(&self, axis: usize, neg: bool) -> (Vec4, Vec4) {
        let (min, max) = match axis {
            0 => (self.min_x, self.max_x),
            1 => (self.min_y, self.max_y),
            _ => (self.min_z, self.max_z),
        };
        if neg {
            (max, min)
        } else {
            (min, max)
        }
    }
}

/// Four-wide slab test. `dir_signs` picks the near/far slab per axis once
/// per ray. Returns a 4-bit lane mask plus the per-lane entry distances
/// (clamped to the ray interval) for traversal ordering.
pub fn ray_quad_aabb_test(quad: &QuadAabb, ray: &Ray, dir_signs: [bool; 3]) -> (u32, Vec4) {
    let mut tmin = Vec4::splat(ray.tmin);
    let mut tmax = Vec4::splat(ray.tmax);

    for axis in 0..3 {
        let (near, far) = quad.near_far(axis, dir_signs[axis]);
        let orig = Vec4::splat(ray.orig[axis]);
        let inv = Vec4::splat(ray.inv_dir[axis]);

        // Accumulator on the right so NaN lanes (origin on a slab with a
        // zero direction component) fall back to the previous bound
        tmin = ((near - orig) * inv).max(tmin);
        tmax = ((far - orig) * inv).min(tmax);
    }

    (tmin.cmple(tmax).bitmask(), tmin)
}

/// One 4-way node: lane-wise child bounds plus per-lane references. A lane
/// with `counts[i] > 0` is a leaf child holding the object references
/// `refs[children[i] .. children[i] + counts[i]]`; otherwise `children[i]`
/// indexes another node.
pub struct QbvhNode {
    pub bounds: QuadAabb,
    pub children: [u32; 4],
    pub counts: [u16; 4],
    pub child_count: u8,
}

/// Four-way bounding-volume hierarchy, built by collapsing pairs of levels
/// of a binary SAH tree so each node's children can be tested with one
/// vectorised slab test.
pub struct Qbvh {
    nodes: Vec<QbvhNode>,
    refs: Vec<u32>,
    stack_depth: u32,
}

impl Qbvh {
    pub fn build<S: ObjectSet>(
        objects: &S,
        builder: &BinnedSahBuilder,
    ) -> Result<Self, BuildError> {
        let binary = builder.build(objects)?;
        Ok(Self::collapse(&binary))
    }

    /// Lifts the grandchildren of every other binary level into one 4-way
    /// node. A side that is already a leaf contributes itself, so nodes
    /// carry 2-4 children.
    pub fn collapse(binary: &AabbTree) -> Self {
        let mut qbvh = Self {
            nodes: Vec::new(),
            refs: binary.refs().to_vec(),
            stack_depth: 0,
        };

        let Some(root) = binary.nodes().first() else {
            return qbvh;
        };

        let depth = if root.is_leaf() {
            let mut bounds = QuadAabb::EMPTY;
            bounds.set_lane(0, root.aabb);
            qbvh.nodes.push(QbvhNode {
                bounds,
                children: [root.first, 0, 0, 0],
                counts: [root.count, 0, 0, 0],
                child_count: 1,
            });
            1
        } else {
            let (_, depth) = qbvh.emit(binary, 0);
            depth
        };
        qbvh.stack_depth = depth;

        log::debug!(
            "qbvh collapse: {} binary nodes -> {} wide nodes, depth {}",
            binary.nodes().len(),
            qbvh.nodes.len(),
            depth
        );
        qbvh
    }

    fn emit(&mut self, binary: &AabbTree, node_index: u32) -> (u32, u32) {
        let node = &binary.nodes()[node_index as usize];
        debug_assert!(!node.is_leaf());

        let mut slots: SmallVec<[u32; 4]> = SmallVec::new();
        for side in [node.left_child(), node.right_child()] {
            let child = &binary.nodes()[side as usize];
            if child.is_leaf() {
                slots.push(side);
            } else {
                slots.push(child.left_child());
                slots.push(child.right_child());
            }
        }

        let slot_index = self.nodes.len();
        self.nodes.push(QbvhNode {
            bounds: QuadAabb::EMPTY,
            children: [0; 4],
            counts: [0; 4],
            child_count: slots.len() as u8,
        });

        let mut bounds = QuadAabb::EMPTY;
        let mut children = [0u32; 4];
        let mut counts = [0u16; 4];
        let mut child_depth = 0;

        for (lane, &side) in slots.iter().enumerate() {
            let child = &binary.nodes()[side as usize];
            bounds.set_lane(lane, child.aabb);
            if child.is_leaf() {
                children[lane] = child.first;
                counts[lane] = child.count;
            } else {
                let (index, depth) = self.emit(binary, side);
                children[lane] = index;
                child_depth = child_depth.max(depth);
            }
        }

        let slot = &mut self.nodes[slot_index];
        slot.bounds = bounds;
        slot.children = children;
        slot.counts = counts;

        (slot_index as u32, child_depth + 1)
    }

    pub fn nodes(&self) -> &[QbvhNode] {
        &self.nodes
    }

    pub fn refs(&self) -> &[u32] {
        &self.refs
    }

    pub fn bounding_box(&self) -> Aabb {
        let Some(root) = self.nodes.first() else {
            return Aabb::EMPTY;
        };
        let mut bounds = Aabb::EMPTY;
        for lane in 0..root.child_count as usize {
            bounds = bounds.union_aabb(Aabb {
                min: glam::vec3(
                    root.bounds.min_x[lane],
                    root.bounds.min_y[lane],
                    root.bounds.min_z[lane],
                ),
                max: glam::vec3(
                    root.bounds.max_x[lane],
                    root.bounds.max_y[lane],
                    root.bounds.max_z[lane],
                ),
            });
        }
        bounds
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
        for node in &self.nodes {
            for lane in 0..node.child_count as usize {
                if node.counts[lane] > 0 {
                    // Leaf lanes sit one level below their node
                    stats.record_leaf(node.counts[lane] as usize, 1);
                }
            }
        }
        stats.max_depth = self.stack_depth as usize;
        stats
    }
}

const ENTRY_LEAF: u32 = 1;

fn inner_entry(node: u32) -> u32 {
    node << 3
}

fn leaf_entry(node: u32, lane: usize) -> u32 {
    (node << 3) | ((lane as u32) << 1) | ENTRY_LEAF
}

/// Casts the ray through the wide tree. Hit children are pushed far to
/// near by their slab entry distance so the closest is popped first and
/// can shrink the interval before its siblings are opened.
pub fn raycast_qbvh<S: ObjectSet, M: Mailbox>(
    qbvh: &Qbvh,
    objects: &S,
    ray: &mut Ray,
    hit: &mut RayHit,
    mailbox: &mut M,
    scratch: &mut Scratch,
) {
    mailbox.begin_ray();

    if qbvh.nodes.is_empty() {
        return;
    }

    let dir_signs = [
        ray.inv_dir.x < 0.,
        ray.inv_dir.y < 0.,
        ray.inv_dir.z < 0.,
    ];

    let mut stack = ScratchArray::<u32>::new(scratch, qbvh.stack_depth as usize * 4 + 4);
    let mut top = 0usize;
    stack[top] = inner_entry(0);
    top += 1;

    while top > 0 {
        top -= 1;
        let entry = stack[top];
        let node = &qbvh.nodes[(entry >> 3) as usize];

        if entry & ENTRY_LEAF != 0 {
            let lane = ((entry >> 1) & 0b11) as usize;
            let first = node.children[lane] as usize;
            let span = &qbvh.refs[first..first + node.counts[lane] as usize];

            if M::FILTERS {
                for &id in span {
                    if !mailbox.check_mailbox(id) {
                        objects.ray_intersect(ray, hit, id);
                    }
                }
            } else {
                objects.ray_intersect_span(ray, hit, span);
            }
            continue;
        }

        let (mask, tmins) = ray_quad_aabb_test(&node.bounds, ray, dir_signs);
        if mask == 0 {
            continue;
        }

        let mut hits: SmallVec<[(f32, u32); 4]> = SmallVec::new();
        for lane in 0..node.child_count as usize {
            if mask & (1 << lane) != 0 {
                let entry = if node.counts[lane] > 0 {
                    leaf_entry(entry >> 3, lane)
                } else {
                    inner_entry(node.children[lane])
                };
                hits.push((tmins[lane], entry));
            }
        }

        // Far to near: the nearest lane must end on top of the stack
        hits.sort_unstable_by(|a, b| b.0.total_cmp(&a.0));

        for &(_, child_entry) in &hits {
            if top >= stack.len() {
                debug_assert!(false, "traversal stack overflow");
                return;
            }
            stack[top] = child_entry;
            top += 1;
        }
    }
}
