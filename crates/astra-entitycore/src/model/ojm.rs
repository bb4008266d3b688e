//! OJM models.
//!
//! An `.ojm` file is line-oriented text, one or more shapes each opened by
//! `o <name>`:
//!
//! ```text
//! o hull
//! T hull.png
//! Ka 0.1 0.1 0.1
//! Kd 0.8 0.8 0.8
//! Ks 1 1 1
//! Ns 32
//! v 0 0 1
//! vt 0.5 0.5
//! vn 0 0 1
//! i 0 1 2
//! ```
//!
//! The n-th `v`, `vt` and `vn` of a shape make its n-th vertex; `i` lines
//! list triangle indices into the shape. Parsing is slow for large models,
//! so every load leaves a `.bin` next to the source:
//!
//! ```text
//! "OJMB" | u32 version | i64 source mtime | f32 radius | u32 shapes | u8 poorly centered
//! per shape: u32 vertices | u32 indices | u8 flags | material | texture | name
//!            | vertices × OjmVertex | indices × u32
//! ```
//!
//! A cache whose magic, version or mtime doesn't match is ignored and
//! rewritten.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ash::vk;
use astra_common::files::modification_time;
use bytemuck::{Pod, Zeroable};

use crate::buffer::{BufferAccess, BufferMgr, BufferType, IndexBuffer, VertexArray, VertexBuffer};
use crate::error::{CoreError, CoreResult};
use crate::vulkan::MemoryManager;

const CACHE_MAGIC: [u8; 4] = *b"OJMB";
const CACHE_VERSION: u32 = 1;

/// The AABB center may drift this fraction of the radius before the model
/// counts as poorly centered.
pub const CENTER_TOLERANCE: f32 = 0.25;

const HAS_AMBIENT: u8 = 1 << 0;
const HAS_DIFFUSE: u8 = 1 << 1;
const HAS_SPECULAR: u8 = 1 << 2;
const HAS_SHININESS: u8 = 1 << 3;
const HAS_TEXTURE: u8 = 1 << 4;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct OjmVertex {
    pub position: [f32; 3],
    pub texcoord: [f32; 2],
    pub normal: [f32; 3],
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Material {
    pub ambient: Option<[f32; 3]>,
    pub diffuse: Option<[f32; 3]>,
    pub specular: Option<[f32; 3]>,
    pub shininess: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Shape {
    pub name: String,
    pub vertices: Vec<OjmVertex>,
    pub indices: Vec<u32>,
    pub material: Material,
    pub texture: Option<String>,
}

/// Where one shape lands in the combined buffers of an `OjmMesh`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShapeDraw {
    pub first_index: u32,
    pub index_count: u32,
    pub vertex_offset: i32,
}

/// Draw ranges for `shapes` packed one after the other.
pub fn draw_ranges(shapes: &[Shape]) -> Vec<ShapeDraw> {
    let mut first_index = 0;
    let mut vertex_offset = 0;
    shapes
        .iter()
        .map(|shape| {
            let draw = ShapeDraw { first_index, index_count: shape.indices.len() as u32, vertex_offset };
            first_index += shape.indices.len() as u32;
            vertex_offset += shape.vertices.len() as i32;
            draw
        })
        .collect()
}

/// Device buffers for a loaded model.
pub struct OjmMesh {
    pub vertices: VertexBuffer,
    pub indices: IndexBuffer,
    pub draws: Vec<ShapeDraw>,
}

impl OjmMesh {
    /// Copy staged data to the device; static buffers detach afterwards.
    pub unsafe fn update(&mut self, device: &ash::Device, cmd: vk::CommandBuffer) -> bool {
        self.vertices.update(device, cmd) & self.indices.update(device, cmd)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ojm {
    shapes: Vec<Shape>,
    radius: f32,
    poorly_centered: bool,
    ok: bool,
}

impl Ojm {
    /// Load `path`, through its `.bin` cache when that is current. Never
    /// fails: a broken model is logged and comes back with `is_ok() == false`.
    pub fn load(path: &Path) -> Self {
        let mtime = modification_time(path);
        let cache = cache_path_for(path);

        if let Some(mtime) = mtime {
            match Self::read_cache(&cache, mtime) {
                Ok(model) => return model,
                Err(CoreError::Io { .. }) => {}
                Err(e) => log::debug!("Ignoring model cache: {}", e),
            }
        }

        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                log::error!("{}", CoreError::io(path, e));
                return Self::default();
            }
        };
        let model = match Self::parse(&text) {
            Ok(model) => model,
            Err(message) => {
                log::error!("{}", CoreError::format(path, message));
                return Self::default();
            }
        };

        if let Some(mtime) = mtime {
            if let Err(e) = model.write_cache(&cache, mtime) {
                log::warn!("Couldn't write model cache: {}", e);
            }
        }
        model
    }

    /// Parse OJM text. The error is a message naming the offending line.
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut shapes: Vec<Shape> = Vec::new();
        let mut positions: Vec<[f32; 3]> = Vec::new();
        let mut texcoords: Vec<[f32; 2]> = Vec::new();
        let mut normals: Vec<[f32; 3]> = Vec::new();

        for (n, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
            let rest = rest.trim();
            let at = |message: String| format!("line {}: {}", n + 1, message);

            if key == "o" {
                if let Some(shape) = shapes.last_mut() {
                    close_shape(shape, &mut positions, &mut texcoords, &mut normals).map_err(at)?;
                }
                shapes.push(Shape { name: rest.to_string(), ..Default::default() });
                continue;
            }
            let Some(shape) = shapes.last_mut() else {
                return Err(at(format!("'{}' before any 'o'", key)));
            };
            match key {
                "v" => positions.push(floats(rest).map_err(at)?),
                "vt" => texcoords.push(floats(rest).map_err(at)?),
                "vn" => normals.push(floats(rest).map_err(at)?),
                "i" => {
                    for word in rest.split_whitespace() {
                        let index = word.parse::<u32>().map_err(|_| at(format!("bad index '{}'", word)))?;
                        shape.indices.push(index);
                    }
                }
                "Ka" => shape.material.ambient = Some(floats(rest).map_err(at)?),
                "Kd" => shape.material.diffuse = Some(floats(rest).map_err(at)?),
                "Ks" => shape.material.specular = Some(floats(rest).map_err(at)?),
                "Ns" => shape.material.shininess = Some(floats::<1>(rest).map_err(at)?[0]),
                "T" => shape.texture = (!rest.is_empty()).then(|| rest.to_string()),
                _ => return Err(at(format!("unknown key '{}'", key))),
            }
        }

        match shapes.last_mut() {
            Some(shape) => close_shape(shape, &mut positions, &mut texcoords, &mut normals)
                .map_err(|message| format!("end of file: {}", message))?,
            None => return Err("no shapes".into()),
        }

        let (radius, poorly_centered) = bounds(&shapes);
        Ok(Self { shapes, radius, poorly_centered, ok: true })
    }

    pub fn is_ok(&self) -> bool {
        self.ok
    }

    pub fn shapes(&self) -> &[Shape] {
        &self.shapes
    }

    /// Distance from the origin to the farthest vertex.
    pub fn radius(&self) -> f32 {
        self.radius
    }

    pub fn is_poorly_centered(&self) -> bool {
        self.poorly_centered
    }

    pub fn vertex_count(&self) -> usize {
        self.shapes.iter().map(|s| s.vertices.len()).sum()
    }

    pub fn index_count(&self) -> usize {
        self.shapes.iter().map(|s| s.indices.len()).sum()
    }

    /// Attribute layout matching `OjmVertex`.
    pub fn vertex_array() -> VertexArray {
        let mut array = VertexArray::new();
        array.register_vertex_buffer(BufferType::Vec3, vk::VertexInputRate::VERTEX);
        array.register_vertex_buffer(BufferType::Vec2, vk::VertexInputRate::VERTEX);
        array.register_vertex_buffer(BufferType::Vec3, vk::VertexInputRate::VERTEX);
        array
    }

    /// Static buffers holding every shape; `OjmMesh::update` must be
    /// recorded once before the first draw.
    pub unsafe fn build_mesh(&self, memory: &MemoryManager, stream: Option<&Arc<BufferMgr>>, name: &str) -> CoreResult<OjmMesh> {
        if !self.ok {
            return Err(CoreError::Misuse(format!("{}: mesh of a model that failed to load", name)));
        }
        let array = Self::vertex_array();
        let mut vertices = array.create_buffer(
            memory,
            stream,
            name,
            vk::VertexInputRate::VERTEX,
            self.vertex_count() as u32,
            BufferAccess::Static,
        )?;
        let mut indices = array.create_index_buffer(memory, stream, name, self.index_count() as u32, BufferAccess::Static)?;

        let draws = draw_ranges(&self.shapes);
        for (shape, draw) in self.shapes.iter().zip(&draws) {
            vertices.fill(draw.vertex_offset as u32, &shape.vertices);
            indices.fill(draw.first_index, &shape.indices);
        }
        Ok(OjmMesh { vertices, indices, draws })
    }

    // ============================================================
    // Cache
    // ============================================================

    pub fn write_cache(&self, path: &Path, mtime: i64) -> CoreResult<()> {
        let mut out = Vec::new();
        out.extend_from_slice(&CACHE_MAGIC);
        out.extend_from_slice(&CACHE_VERSION.to_le_bytes());
        out.extend_from_slice(&mtime.to_le_bytes());
        out.extend_from_slice(&self.radius.to_le_bytes());
        out.extend_from_slice(&(self.shapes.len() as u32).to_le_bytes());
        out.push(self.poorly_centered as u8);

        for shape in &self.shapes {
            let m = &shape.material;
            let flags = [
                (m.ambient.is_some(), HAS_AMBIENT),
                (m.diffuse.is_some(), HAS_DIFFUSE),
                (m.specular.is_some(), HAS_SPECULAR),
                (m.shininess.is_some(), HAS_SHININESS),
                (shape.texture.is_some(), HAS_TEXTURE),
            ]
            .iter()
            .filter(|(set, _)| *set)
            .fold(0u8, |acc, (_, bit)| acc | bit);

            out.extend_from_slice(&(shape.vertices.len() as u32).to_le_bytes());
            out.extend_from_slice(&(shape.indices.len() as u32).to_le_bytes());
            out.push(flags);
            for color in [m.ambient, m.diffuse, m.specular].into_iter().flatten() {
                color.iter().for_each(|c| out.extend_from_slice(&c.to_le_bytes()));
            }
            if let Some(shininess) = m.shininess {
                out.extend_from_slice(&shininess.to_le_bytes());
            }
            if let Some(texture) = &shape.texture {
                write_str(&mut out, texture);
            }
            write_str(&mut out, &shape.name);
            out.extend_from_slice(bytemuck::cast_slice(&shape.vertices));
            out.extend_from_slice(bytemuck::cast_slice(&shape.indices));
        }

        fs::write(path, out).map_err(|e| CoreError::io(path, e))
    }

    /// Read a cache written for a source with modification time `mtime`.
    pub fn read_cache(path: &Path, mtime: i64) -> CoreResult<Self> {
        let data = fs::read(path).map_err(|e| CoreError::io(path, e))?;
        parse_cache(&data, mtime).map_err(|message| CoreError::format(path, message))
    }
}

/// `model.ojm` caches to `model.bin`.
pub fn cache_path_for(source: &Path) -> PathBuf {
    source.with_extension("bin")
}

fn floats<const N: usize>(text: &str) -> Result<[f32; N], String> {
    let mut out = [0.0; N];
    let mut words = text.split_whitespace();
    for value in &mut out {
        let word = words.next().ok_or_else(|| format!("expected {} numbers", N))?;
        *value = word.parse().map_err(|_| format!("bad number '{}'", word))?;
    }
    if words.next().is_some() {
        return Err(format!("expected {} numbers", N));
    }
    Ok(out)
}

/// Zip the collected attributes into `shape.vertices` and check its indices.
fn close_shape(
    shape: &mut Shape,
    positions: &mut Vec<[f32; 3]>,
    texcoords: &mut Vec<[f32; 2]>,
    normals: &mut Vec<[f32; 3]>,
) -> Result<(), String> {
    let count = positions.len();
    if (!texcoords.is_empty() && texcoords.len() != count) || (!normals.is_empty() && normals.len() != count) {
        return Err(format!(
            "shape '{}': {} positions, {} texcoords, {} normals",
            shape.name,
            count,
            texcoords.len(),
            normals.len()
        ));
    }
    if shape.indices.len() % 3 != 0 {
        return Err(format!("shape '{}': {} indices is not whole triangles", shape.name, shape.indices.len()));
    }
    if let Some(&bad) = shape.indices.iter().find(|&&i| i as usize >= count) {
        return Err(format!("shape '{}': index {} out of {} vertices", shape.name, bad, count));
    }

    shape.vertices = (0..count)
        .map(|i| OjmVertex {
            position: positions[i],
            texcoord: texcoords.get(i).copied().unwrap_or_default(),
            normal: normals.get(i).copied().unwrap_or_default(),
        })
        .collect();
    positions.clear();
    texcoords.clear();
    normals.clear();
    Ok(())
}

/// Radius around the origin, and whether the bounding box center is far
/// from it.
fn bounds(shapes: &[Shape]) -> (f32, bool) {
    let mut mins = [f32::MAX; 3];
    let mut maxs = [f32::MIN; 3];
    let mut radius_sq = 0.0f32;
    let mut any = false;
    for vertex in shapes.iter().flat_map(|s| &s.vertices) {
        let p = vertex.position;
        for axis in 0..3 {
            mins[axis] = mins[axis].min(p[axis]);
            maxs[axis] = maxs[axis].max(p[axis]);
        }
        radius_sq = radius_sq.max(p[0] * p[0] + p[1] * p[1] + p[2] * p[2]);
        any = true;
    }
    if !any {
        return (0.0, false);
    }
    let radius = radius_sq.sqrt();
    let center: f32 = (0..3).map(|a| ((mins[a] + maxs[a]) * 0.5).powi(2)).sum::<f32>().sqrt();
    (radius, center > CENTER_TOLERANCE * radius)
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

struct Reader<'a> {
    data: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], String> {
        let bytes = self
            .at
            .checked_add(len)
            .and_then(|end| self.data.get(self.at..end))
            .ok_or_else(|| format!("truncated at byte {}", self.at))?;
        self.at += len;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], String> {
        let mut out = [0; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, String> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, String> {
        self.array().map(u32::from_le_bytes)
    }

    fn f32(&mut self) -> Result<f32, String> {
        self.array().map(f32::from_le_bytes)
    }

    fn vec3(&mut self) -> Result<[f32; 3], String> {
        Ok([self.f32()?, self.f32()?, self.f32()?])
    }

    fn string(&mut self) -> Result<String, String> {
        let len = self.u32()? as usize;
        String::from_utf8(self.take(len)?.to_vec()).map_err(|_| "string is not UTF-8".to_string())
    }

    fn pods<T: Pod>(&mut self, count: usize) -> Result<Vec<T>, String> {
        let len = count.checked_mul(std::mem::size_of::<T>()).ok_or("element count overflows")?;
        Ok(bytemuck::pod_collect_to_vec(self.take(len)?))
    }
}

fn parse_cache(data: &[u8], mtime: i64) -> Result<Ojm, String> {
    let mut r = Reader { data, at: 0 };
    if r.array::<4>()? != CACHE_MAGIC {
        return Err("bad magic".into());
    }
    let version = r.u32()?;
    if version != CACHE_VERSION {
        return Err(format!("version {}", version));
    }
    let cached = r.array().map(i64::from_le_bytes)?;
    if cached != mtime {
        return Err(format!("stale (source changed since {})", cached));
    }
    let radius = r.f32()?;
    let count = r.u32()?;
    let poorly_centered = r.u8()? != 0;

    let mut shapes = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        let vertex_count = r.u32()? as usize;
        let index_count = r.u32()? as usize;
        let flags = r.u8()?;

        let mut material = Material::default();
        if flags & HAS_AMBIENT != 0 {
            material.ambient = Some(r.vec3()?);
        }
        if flags & HAS_DIFFUSE != 0 {
            material.diffuse = Some(r.vec3()?);
        }
        if flags & HAS_SPECULAR != 0 {
            material.specular = Some(r.vec3()?);
        }
        if flags & HAS_SHININESS != 0 {
            material.shininess = Some(r.f32()?);
        }
        let texture = if flags & HAS_TEXTURE != 0 { Some(r.string()?) } else { None };
        let name = r.string()?;
        let vertices = r.pods::<OjmVertex>(vertex_count)?;
        let indices = r.pods::<u32>(index_count)?;
        if indices.iter().any(|&i| i as usize >= vertex_count) {
            return Err(format!("shape '{}' has an index out of range", name));
        }
        shapes.push(Shape { name, vertices, indices, material, texture });
    }
    if r.at != data.len() {
        return Err(format!("{} trailing bytes", data.len() - r.at));
    }
    Ok(Ojm { shapes, radius, poorly_centered, ok: true })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_SHAPES: &str = "\
# two triangles
o hull
T hull.png
Ka 0.1 0.1 0.1
Kd 0.8 0.7 0.6
Ns 32
v 0 0 1
v 1 0 0
v 0 1 0
vt 0 0
vt 1 0
vt 0 1
vn 0 0 1
vn 0 0 1
vn 0 0 1
i 0 1 2

o antenna
Ks 1 1 1
v 0 0 -2
v 0.1 0 -2
v 0 0.1 -2
v 0.1 0.1 -2
i 0 1 2 1 3 2
";

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("astra_ojm_{}_{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    // ============================================================
    // Parsing
    // ============================================================

    #[test]
    fn test_parse_shapes() {
        let model = Ojm::parse(TWO_SHAPES).unwrap();
        assert!(model.is_ok());
        assert_eq!(model.shapes().len(), 2);
        assert_eq!(model.vertex_count(), 7);
        assert_eq!(model.index_count(), 9);

        let hull = &model.shapes()[0];
        assert_eq!(hull.name, "hull");
        assert_eq!(hull.texture.as_deref(), Some("hull.png"));
        assert_eq!(hull.material.diffuse, Some([0.8, 0.7, 0.6]));
        assert_eq!(hull.material.shininess, Some(32.0));
        assert_eq!(hull.material.specular, None);
        assert_eq!(hull.vertices[1].texcoord, [1.0, 0.0]);

        let antenna = &model.shapes()[1];
        assert_eq!(antenna.texture, None);
        assert_eq!(antenna.vertices[3].normal, [0.0, 0.0, 0.0]);
        assert_eq!(model.radius(), (0.1f32 * 0.1 * 2.0 + 4.0).sqrt());
    }

    #[test]
    fn test_parse_rejects_bad_models() {
        assert!(Ojm::parse("").is_err());
        assert!(Ojm::parse("v 0 0 0\n").unwrap_err().contains("before any 'o'"));
        assert!(Ojm::parse("o a\nv 0 0 0\ni 0 0 1\n").unwrap_err().contains("out of"));
        assert!(Ojm::parse("o a\nv 0 0\n").unwrap_err().contains("line 2"));
        assert!(Ojm::parse("o a\nv 0 0 0\nvt 0 0\nv 1 1 1\n").is_err());
        assert!(Ojm::parse("o a\nv 0 0 0\ni 0 0\n").is_err());
        assert!(Ojm::parse("o a\nfoo 1\n").unwrap_err().contains("unknown key"));
    }

    #[test]
    fn test_poorly_centered() {
        let centered = Ojm::parse("o a\nv -1 0 0\nv 1 0 0\nv 0 1 0\nv 0 -1 0\ni 0 1 2 0 3 1\n").unwrap();
        assert!(!centered.is_poorly_centered());

        let offset = Ojm::parse("o a\nv 4 0 0\nv 5 0 0\nv 4 1 0\ni 0 1 2\n").unwrap();
        assert!(offset.is_poorly_centered());
        assert_eq!(offset.radius(), 5.0);
    }

    #[test]
    fn test_draw_ranges() {
        let model = Ojm::parse(TWO_SHAPES).unwrap();
        assert_eq!(
            draw_ranges(model.shapes()),
            vec![
                ShapeDraw { first_index: 0, index_count: 3, vertex_offset: 0 },
                ShapeDraw { first_index: 3, index_count: 6, vertex_offset: 3 },
            ]
        );
    }

    #[test]
    fn test_vertex_array_matches_vertex() {
        let array = Ojm::vertex_array();
        assert_eq!(array.vertex_layout().stride() as usize, std::mem::size_of::<OjmVertex>());
        assert_eq!(array.vertex_layout().offsets(), &[0, 12, 20]);
    }

    // ============================================================
    // Cache
    // ============================================================

    #[test]
    fn test_cache_matches_direct_parse() {
        let dir = temp_dir("roundtrip");
        let path = dir.join("ship.bin");
        let parsed = Ojm::parse(TWO_SHAPES).unwrap();
        parsed.write_cache(&path, 1234).unwrap();

        let cached = Ojm::read_cache(&path, 1234).unwrap();
        assert_eq!(cached, parsed);
        assert!(matches!(Ojm::read_cache(&path, 1235), Err(CoreError::Format { .. })));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_corrupt_cache_is_rejected() {
        let parsed = Ojm::parse(TWO_SHAPES).unwrap();
        let dir = temp_dir("corrupt");
        let path = dir.join("ship.bin");
        parsed.write_cache(&path, 7).unwrap();
        let bytes = fs::read(&path).unwrap();

        assert!(parse_cache(&bytes[..bytes.len() - 1], 7).unwrap_err().contains("truncated"));
        let mut extra = bytes.clone();
        extra.push(0);
        assert!(parse_cache(&extra, 7).unwrap_err().contains("trailing"));
        let mut magic = bytes.clone();
        magic[0] = b'X';
        assert_eq!(parse_cache(&magic, 7).unwrap_err(), "bad magic");
        let mut version = bytes;
        version[4] = 9;
        assert_eq!(parse_cache(&version, 7).unwrap_err(), "version 9");
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_load_writes_and_uses_cache() {
        let dir = temp_dir("load");
        let source = dir.join("ship.ojm");
        fs::write(&source, TWO_SHAPES).unwrap();

        let first = Ojm::load(&source);
        assert!(first.is_ok());
        let cache = cache_path_for(&source);
        assert_eq!(cache, dir.join("ship.bin"));
        let mtime = modification_time(&source).unwrap();
        assert_eq!(Ojm::read_cache(&cache, mtime).unwrap(), first);

        // A stale cache is replaced.
        first.write_cache(&cache, mtime - 1).unwrap();
        assert_eq!(Ojm::load(&source), first);
        assert!(Ojm::read_cache(&cache, mtime).is_ok());
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_load_failures_are_not_ok() {
        let dir = temp_dir("bad");
        assert!(!Ojm::load(&dir.join("missing.ojm")).is_ok());

        let source = dir.join("broken.ojm");
        fs::write(&source, "o a\nv 0 0 0\ni 5 5 5\n").unwrap();
        let model = Ojm::load(&source);
        assert!(!model.is_ok());
        assert!(model.shapes().is_empty());
        assert!(!cache_path_for(&source).exists());
        fs::remove_dir_all(&dir).ok();
    }
}
