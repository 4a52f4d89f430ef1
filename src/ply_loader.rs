use std::{
    fs::File,
    io::{BufReader, Read},
    path::Path,
};

use eyre::{eyre, Result};
use flate2::read::GzDecoder;
use glam::Vec3;
use ply_rs::ply;
use smallvec::SmallVec;

use crate::mesh::BasicMesh;

struct PlyVertex {
    pos: Vec3,
}

impl ply::PropertyAccess for PlyVertex {
    fn new() -> Self {
        PlyVertex { pos: Vec3::ZERO }
    }

    fn set_property(&mut self, key: String, property: ply::Property) {
        match (key.as_ref(), property) {
            ("x", ply::Property::Float(v)) => self.pos.x = v,
            ("y", ply::Property::Float(v)) => self.pos.y = v,
            ("z", ply::Property::Float(v)) => self.pos.z = v,
            // Normals, uvs and colors are irrelevant for raycasting
            _ => (),
        }
    }
}

struct PlyFace {
    indices: SmallVec<[i32; 4]>,
}

impl ply::PropertyAccess for PlyFace {
    fn new() -> Self {
        PlyFace {
            indices: SmallVec::new(),
        }
    }

    fn set_property(&mut self, key: String, property: ply::Property) {
        match (key.as_ref(), property) {
            ("vertex_indices", ply::Property::ListInt(vec)) => {
                self.indices.extend(vec);
            }
            ("vertex_indices", ply::Property::ListUInt(vec)) => {
                self.indices.extend(vec.into_iter().map(|i| i as i32));
            }
            ("vertex_indices", ply::Property::ListUChar(vec)) => {
                self.indices.extend(vec.into_iter().map(|i| i as i32));
            }
            (k, _) => eprintln!("Face: Unexpected key/value combination: key: {}", k),
        }
    }
}

/// A whole triangle strip; `-1` entries restart the strip.
struct PlyStrip {
    indices: Vec<i32>,
}

impl ply::PropertyAccess for PlyStrip {
    fn new() -> Self {
        PlyStrip {
            indices: Vec::new(),
        }
    }

    fn set_property(&mut self, key: String, property: ply::Property) {
        match (key.as_ref(), property) {
            ("vertex_indices", ply::Property::ListInt(vec)) => {
                self.indices.extend(vec);
            }
            (k, _) => eprintln!("Strip: Unexpected key/value combination: key: {}", k),
        }
    }
}

/// Converts strip runs into a triangle list, flipping the winding of every
/// other face so the normals stay consistent.
fn flatten_strips(strip: &[i32], indices: &mut Vec<u32>) {
    for run in strip.split(|&v| v < 0) {
        for j in 0..run.len().saturating_sub(2) {
            let (a, b, c) = (run[j] as u32, run[j + 1] as u32, run[j + 2] as u32);
            if j % 2 == 0 {
                indices.extend([a, b, c]);
            } else {
                indices.extend([a, c, b]);
            }
        }
    }
}

/// Loads a PLY mesh (binary or ASCII, optionally gzipped) with either
/// `face` triangle/quad lists or `tristrips` elements. With `normalize`
/// the mesh is shifted so its lowest point sits at `y = 0` with `x` and
/// `z` centered, and scaled to fit a unit-length bounding box.
pub fn load_ply_mesh(path: &Path, normalize: bool) -> Result<BasicMesh> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut bytes = Vec::new();
    if path.extension().and_then(|e| e.to_str()) == Some("gz") {
        GzDecoder::new(reader).read_to_end(&mut bytes)?;
    } else {
        reader.read_to_end(&mut bytes)?;
    }

    let header_parser = ply_rs::parser::Parser::<ply::DefaultElement>::new();
    let mut cursor = bytes.as_slice();
    let header = header_parser.read_header(&mut cursor)?;

    let vertex_parser = ply_rs::parser::Parser::<PlyVertex>::new();
    let face_parser = ply_rs::parser::Parser::<PlyFace>::new();
    let strip_parser = ply_rs::parser::Parser::<PlyStrip>::new();

    let mut positions: Vec<Vec3> = Vec::new();
    let mut indices: Vec<u32> = Vec::new();

    for (_, element) in &header.elements {
        match element.name.as_ref() {
            "vertex" => {
                let vertices =
                    vertex_parser.read_payload_for_element(&mut cursor, element, &header)?;
                positions = vertices.iter().map(|v| v.pos).collect();
            }
            "face" => {
                let faces =
                    face_parser.read_payload_for_element(&mut cursor, element, &header)?;
                for face in faces {
                    match face.indices.as_slice() {
                        [a, b, c] => indices.extend([*a as u32, *b as u32, *c as u32]),
                        [a, b, c, d] => {
                            // Fan-triangulated quad
                            indices.extend([*a as u32, *b as u32, *c as u32]);
                            indices.extend([*a as u32, *c as u32, *d as u32]);
                        }
                        other => {
                            return Err(eyre!("unsupported PLY face length {}", other.len()))
                        }
                    }
                }
            }
            "tristrips" => {
                let strips =
                    strip_parser.read_payload_for_element(&mut cursor, element, &header)?;
                for strip in strips {
                    flatten_strips(&strip.indices, &mut indices);
                }
            }
            other => log::debug!("skipping PLY element '{other}'"),
        }
    }

    if positions.is_empty() || indices.len() < 3 {
        return Err(eyre!("PLY mesh has no triangles"));
    }
    if indices.iter().any(|&i| i as usize >= positions.len()) {
        return Err(eyre!("PLY face index out of range"));
    }

    if normalize {
        normalize_vertices(&mut positions);
    }

    Ok(BasicMesh::new(positions, indices))
}

/// Rests the mesh on the `y = 0` plane, centered in `x` and `z`, and
/// scaled so the largest extent becomes unit length.
fn normalize_vertices(positions: &mut [Vec3]) {
    let (mut min, mut max) = (Vec3::splat(f32::MAX), Vec3::splat(f32::MIN));
    for p in positions.iter() {
        min = min.min(*p);
        max = max.max(*p);
    }

    let center = (min + max) / 2.;
    let size = max - min;
    let scale = 1. / size.max_element().max(f32::MIN_POSITIVE);

    for p in positions.iter_mut() {
        p.x -= center.x;
        p.y -= min.y;
        p.z -= center.z;
        *p *= scale;
    }
}
