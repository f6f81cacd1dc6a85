//! Model and texture loading.
//!
//! Loaders hand back plain CPU arrays; nothing here touches the device.

use crate::geometry::{Geometry, Vertex};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Asset loading errors
#[derive(Error, Debug)]
pub enum AssetError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed file contents
    #[error("Parse error: {0}")]
    Parse(String),
    /// Geometry breaks an invariant
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),
    /// Decoder failure
    #[error("Failed to load asset: {0}")]
    LoadFailed(String),
}

/// Raw pixel data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureInfo {
    /// Pixel bytes, row-major, no row padding
    pub pixels: Vec<u8>,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Bytes per pixel
    pub stride: u32,
    /// Byte offset of the texture inside its GPU buffer
    pub offset: u64,
}

impl TextureInfo {
    /// Black and white checkerboard in RGBA8
    pub fn checkerboard(size: u32, cell: u32) -> Self {
        let cell = cell.max(1);
        let mut pixels = Vec::with_capacity((size * size * 4) as usize);
        for y in 0..size {
            for x in 0..size {
                let value = if ((x / cell) + (y / cell)) % 2 == 0 { 0xFF } else { 0x20 };
                pixels.extend_from_slice(&[value, value, value, 0xFF]);
            }
        }
        Self {
            pixels,
            width: size,
            height: size,
            stride: 4,
            offset: 0,
        }
    }
}

/// Convert 1, 2, 3 or 4 byte-per-pixel data into opaque RGBA8.
///
/// Grey formats are replicated into the color channels. Any source alpha is
/// discarded; the output alpha is always `0xFF`.
pub fn format_rgba8(info: &TextureInfo) -> Result<TextureInfo, AssetError> {
    let pixel_count = info.width as usize * info.height as usize;
    let stride = info.stride as usize;
    if !(1..=4).contains(&stride) {
        return Err(AssetError::LoadFailed(format!("unsupported pixel stride {stride}")));
    }
    if info.pixels.len() < pixel_count * stride {
        return Err(AssetError::LoadFailed(format!(
            "{} bytes is too small for {}x{} at {stride} bytes per pixel",
            info.pixels.len(),
            info.width,
            info.height
        )));
    }

    let mut pixels = Vec::with_capacity(pixel_count * 4);
    for source in info.pixels.chunks_exact(stride).take(pixel_count) {
        let (r, g, b) = match stride {
            1 | 2 => (source[0], source[0], source[0]),
            _ => (source[0], source[1], source[2]),
        };
        pixels.extend_from_slice(&[r, g, b, 0xFF]);
    }

    Ok(TextureInfo {
        pixels,
        width: info.width,
        height: info.height,
        stride: 4,
        offset: info.offset,
    })
}

/// Surface description referenced by a model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Material {
    /// Material name
    pub name: String,
    /// Diffuse texture, relative to the model file
    pub texture_path: Option<PathBuf>,
    /// Resolution to generate when no texture is available
    pub texture_resolution: u32,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            texture_path: None,
            texture_resolution: 512,
        }
    }
}

/// Geometry plus its first material
#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    /// Triangles
    pub geometry: Geometry,
    /// Material
    pub material: Material,
}

/// Loads geometry from a file
pub trait ModelLoader {
    /// Load the model at `path`
    fn load_model(&self, path: &Path) -> Result<Model, AssetError>;
}

/// Loads pixels from a file
pub trait TextureLoader {
    /// Load the texture at `path`
    fn load_texture(&self, path: &Path) -> Result<TextureInfo, AssetError>;
}

/// Wavefront OBJ loader
///
/// Faces are fan-triangulated and identical vertices are merged. Positions
/// are read as (z, y, x) and v texture coordinates are flipped, matching the
/// right-handed camera the ray generation program uses.
pub struct ObjLoader;

impl ObjLoader {
    fn parse_floats<const N: usize>(parts: &[&str], what: &str) -> Result<[f32; N], AssetError> {
        let mut values = [0.0f32; N];
        for (i, value) in values.iter_mut().enumerate() {
            let text = parts
                .get(i + 1)
                .ok_or_else(|| AssetError::Parse(format!("{what} needs {N} components")))?;
            *value = text
                .parse()
                .map_err(|_| AssetError::Parse(format!("invalid {what} component '{text}'")))?;
        }
        Ok(values)
    }

    fn resolve_index(text: &str, len: usize, what: &str) -> Result<usize, AssetError> {
        let raw: i64 = text
            .parse()
            .map_err(|_| AssetError::Parse(format!("invalid {what} index '{text}'")))?;
        let resolved = if raw < 0 { len as i64 + raw } else { raw - 1 };
        usize::try_from(resolved)
            .ok()
            .filter(|&index| index < len)
            .ok_or_else(|| AssetError::Parse(format!("{what} index {raw} out of range")))
    }

    /// Parse OBJ text; `base_dir` resolves `mtllib` references
    pub fn parse(reader: impl BufRead, base_dir: &Path) -> Result<Model, AssetError> {
        let mut positions: Vec<[f32; 3]> = Vec::new();
        let mut tex_coords: Vec<[f32; 2]> = Vec::new();
        let mut vertices: Vec<Vertex> = Vec::new();
        let mut indices: Vec<u32> = Vec::new();
        let mut unique: HashMap<[u32; 5], u32> = HashMap::new();
        let mut material = Material::default();

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let parts: Vec<&str> = line.split_whitespace().collect();
            match parts[0] {
                "v" => {
                    let [x, y, z] = Self::parse_floats::<3>(&parts, "position")?;
                    positions.push([z, y, x]);
                }
                "vt" => {
                    let [u, v] = Self::parse_floats::<2>(&parts, "texture coordinate")?;
                    tex_coords.push([u, 1.0 - v]);
                }
                "mtllib" => {
                    if let Some(name) = parts.get(1) {
                        if let Some(found) = Self::first_material(&base_dir.join(name))? {
                            material = found;
                        }
                    }
                }
                "f" => {
                    if parts.len() < 4 {
                        return Err(AssetError::Parse("face needs at least three vertices".to_string()));
                    }
                    let mut face = Vec::with_capacity(parts.len() - 1);
                    for corner in &parts[1..] {
                        let mut fields = corner.split('/');
                        let position = fields
                            .next()
                            .ok_or_else(|| AssetError::Parse("empty face corner".to_string()))?;
                        let position = positions[Self::resolve_index(position, positions.len(), "position")?];
                        let uv = match fields.next() {
                            Some(text) if !text.is_empty() => {
                                tex_coords[Self::resolve_index(text, tex_coords.len(), "texture coordinate")?]
                            }
                            _ => [0.0, 0.0],
                        };

                        let vertex = Vertex::new(position, uv);
                        let key = [
                            position[0].to_bits(),
                            position[1].to_bits(),
                            position[2].to_bits(),
                            uv[0].to_bits(),
                            uv[1].to_bits(),
                        ];
                        let index = *unique.entry(key).or_insert_with(|| {
                            vertices.push(vertex);
                            (vertices.len() - 1) as u32
                        });
                        face.push(index);
                    }
                    for i in 1..face.len() - 1 {
                        indices.extend([face[0], face[i], face[i + 1]]);
                    }
                }
                _ => {}
            }
        }

        let geometry = Geometry::new(vertices, indices)?;
        log::debug!(
            "Parsed OBJ: {} unique vertices, {} triangles",
            geometry.vertices().len(),
            geometry.triangle_count()
        );
        Ok(Model { geometry, material })
    }

    fn first_material(path: &Path) -> Result<Option<Material>, AssetError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) => {
                log::warn!("Material library {} unavailable: {err}", path.display());
                return Ok(None);
            }
        };

        let mut material: Option<Material> = None;
        for line in BufReader::new(file).lines() {
            let line = line?;
            let parts: Vec<&str> = line.split_whitespace().collect();
            match parts.as_slice() {
                ["newmtl", name, ..] => {
                    if material.is_some() {
                        break;
                    }
                    material = Some(Material {
                        name: (*name).to_string(),
                        ..Material::default()
                    });
                }
                ["map_Kd", texture, ..] => {
                    if let Some(material) = material.as_mut() {
                        material.texture_path = Some(PathBuf::from(texture));
                    }
                }
                _ => {}
            }
        }
        Ok(material)
    }
}

impl ModelLoader for ObjLoader {
    fn load_model(&self, path: &Path) -> Result<Model, AssetError> {
        let file = File::open(path)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let model = Self::parse(BufReader::new(file), base_dir)?;
        log::info!("Loaded model {}", path.display());
        Ok(model)
    }
}

/// Decodes images with the `image` crate
pub struct ImageLoader;

impl TextureLoader for ImageLoader {
    fn load_texture(&self, path: &Path) -> Result<TextureInfo, AssetError> {
        log::debug!("Loading texture from: {}", path.display());

        let image = image::open(path)
            .map_err(|e| AssetError::LoadFailed(format!("Failed to load image {}: {e}", path.display())))?;
        let color = image.color();
        let raw = if color.bytes_per_pixel() == color.channel_count() {
            TextureInfo {
                pixels: image.as_bytes().to_vec(),
                width: image.width(),
                height: image.height(),
                stride: u32::from(color.bytes_per_pixel()),
                offset: 0,
            }
        } else {
            let rgba = image.to_rgba8();
            TextureInfo {
                width: rgba.width(),
                height: rgba.height(),
                pixels: rgba.into_raw(),
                stride: 4,
                offset: 0,
            }
        };

        let texture = format_rgba8(&raw)?;
        log::info!("Loaded texture {}x{} from {}", texture.width, texture.height, path.display());
        Ok(texture)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const QUAD: &str = "\
# two triangles
v 0 0 0
v 1 0 0
v 1 1 0
v 0 1 0
vt 0 0
vt 1 0
vt 1 1
vt 0 1
f 1/1 2/2 3/3 4/4
";

    #[test]
    fn test_parse_quad_fan() {
        let model = ObjLoader::parse(Cursor::new(QUAD), Path::new(".")).unwrap();
        assert_eq!(model.geometry.vertices().len(), 4);
        assert_eq!(model.geometry.indices(), &[0, 1, 2, 0, 2, 3]);
        assert_eq!(model.material, Material::default());
    }

    #[test]
    fn test_positions_swizzled_and_v_flipped() {
        let model = ObjLoader::parse(Cursor::new(QUAD), Path::new(".")).unwrap();
        let second = model.geometry.vertices()[1];
        assert_eq!(second.position, [0.0, 0.0, 1.0]);
        assert_eq!(second.uv, [1.0, 1.0]);
    }

    #[test]
    fn test_duplicate_vertices_are_merged() {
        let text = "v 0 0 0\nv 1 0 0\nv 0 1 0\nf 1 2 3\nf 1 2 3\n";
        let model = ObjLoader::parse(Cursor::new(text), Path::new(".")).unwrap();
        assert_eq!(model.geometry.vertices().len(), 3);
        assert_eq!(model.geometry.indices().len(), 6);
    }

    #[test]
    fn test_bad_index_is_an_error() {
        let text = "v 0 0 0\nf 1 2 3\n";
        assert!(ObjLoader::parse(Cursor::new(text), Path::new(".")).is_err());
    }

    #[test]
    fn test_material_library() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("scene.mtl"), "newmtl brick\nmap_Kd brick.png\nnewmtl other\n").unwrap();
        let text = format!("mtllib scene.mtl\n{QUAD}");
        let model = ObjLoader::parse(Cursor::new(text), dir.path()).unwrap();
        assert_eq!(model.material.name, "brick");
        assert_eq!(model.material.texture_path, Some(PathBuf::from("brick.png")));
        assert_eq!(model.material.texture_resolution, 512);
    }

    #[test]
    fn test_format_rgb_to_rgba() {
        let info = TextureInfo {
            pixels: vec![1, 2, 3, 4, 5, 6],
            width: 2,
            height: 1,
            stride: 3,
            offset: 0,
        };
        let rgba = format_rgba8(&info).unwrap();
        assert_eq!(rgba.stride, 4);
        assert_eq!(rgba.pixels, vec![1, 2, 3, 0xFF, 4, 5, 6, 0xFF]);
    }

    #[test]
    fn test_format_forces_opaque_alpha() {
        let info = TextureInfo {
            pixels: vec![9, 8, 7, 0, 50, 60],
            width: 1,
            height: 1,
            stride: 4,
            offset: 0,
        };
        assert_eq!(format_rgba8(&info).unwrap().pixels, vec![9, 8, 7, 0xFF]);

        let grey = TextureInfo {
            pixels: vec![40, 200],
            width: 1,
            height: 1,
            stride: 2,
            offset: 0,
        };
        assert_eq!(format_rgba8(&grey).unwrap().pixels, vec![40, 40, 40, 0xFF]);
    }

    #[test]
    fn test_format_rejects_short_buffer() {
        let info = TextureInfo {
            pixels: vec![0; 5],
            width: 2,
            height: 1,
            stride: 3,
            offset: 0,
        };
        assert!(format_rgba8(&info).is_err());
    }

    #[test]
    fn test_checkerboard() {
        let texture = TextureInfo::checkerboard(8, 4);
        assert_eq!(texture.pixels.len(), 8 * 8 * 4);
        assert_eq!(&texture.pixels[..4], &[0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(&texture.pixels[16..20], &[0x20, 0x20, 0x20, 0xFF]);
    }

    #[test]
    fn test_image_loader_reads_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.png");
        image::RgbImage::from_raw(2, 1, vec![10, 20, 30, 40, 50, 60])
            .unwrap()
            .save(&path)
            .unwrap();

        let texture = ImageLoader.load_texture(&path).unwrap();
        assert_eq!((texture.width, texture.height, texture.stride), (2, 1, 4));
        assert_eq!(texture.pixels, vec![10, 20, 30, 0xFF, 40, 50, 60, 0xFF]);
    }
}
