// src/texture.rs
//! CPU-side textures: decoding, mip chains and the file-name convention that
//! assigns a file to a bind slot.
//!
//! Texture files are named `<Name>_<Letter>.<ext>`: `Lunar_T.png` is the
//! diffuse map of the `Lunar` texture set, `Sky_C.dds` a cube map. DDS files
//! keep the mips they ship with; PNG/JPEG get a full chain generated on the CPU.

use std::io::Cursor;
use std::ops::Range;
use std::path::Path;

use ddsfile::{Caps2, D3DFormat, Dds, DxgiFormat, MiscFlag};
use image::{DynamicImage, ImageBuffer, Rgba};
use log::debug;

use crate::context::Context;
use crate::error::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Slots and file names
// ─────────────────────────────────────────────────────────────────────────────

/// Pixel-stage texture slot a file is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureSlot {
    Diffuse = 0,
    Normal = 1,
    Specular = 2,
    Roughness = 3,
    Cube = 4,
}

impl TextureSlot {
    pub const COUNT: usize = 5;

    /// Slot for a file-name role letter. Specular has no letter yet.
    pub fn from_letter(letter: char) -> Option<Self> {
        match letter.to_ascii_uppercase() {
            'T' => Some(TextureSlot::Diffuse),
            'N' => Some(TextureSlot::Normal),
            'R' => Some(TextureSlot::Roughness),
            'C' => Some(TextureSlot::Cube),
            _ => None,
        }
    }

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Split `Lunar_T.png` into (`Lunar`, `T`). The suffix after the last `_`
/// must be exactly one character.
pub fn split_texture_file_name(path: &Path) -> Option<(String, char)> {
    let stem = path.file_stem()?.to_str()?;
    let (name, suffix) = stem.rsplit_once('_')?;
    let mut chars = suffix.chars();
    let letter = chars.next()?;
    if name.is_empty() || chars.next().is_some() {
        return None;
    }
    Some((name.to_string(), letter))
}

// ─────────────────────────────────────────────────────────────────────────────
// Formats
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    Rgba16Float,
    Rgba32Float,
    Bc1RgbaUnorm,
    Bc1RgbaUnormSrgb,
    Bc3RgbaUnorm,
    Bc3RgbaUnormSrgb,
    Bc7RgbaUnorm,
    Bc7RgbaUnormSrgb,
}

impl TextureFormat {
    #[inline]
    pub fn is_compressed(self) -> bool {
        self.block_dim() > 1
    }

    /// Edge length of one compression block in pixels (1 for uncompressed).
    #[inline]
    pub fn block_dim(self) -> u32 {
        match self {
            TextureFormat::Bc1RgbaUnorm
            | TextureFormat::Bc1RgbaUnormSrgb
            | TextureFormat::Bc3RgbaUnorm
            | TextureFormat::Bc3RgbaUnormSrgb
            | TextureFormat::Bc7RgbaUnorm
            | TextureFormat::Bc7RgbaUnormSrgb => 4,
            _ => 1,
        }
    }

    /// Bytes per block (per pixel for uncompressed formats).
    #[inline]
    pub fn block_bytes(self) -> u32 {
        match self {
            TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba8UnormSrgb
            | TextureFormat::Bgra8Unorm
            | TextureFormat::Bgra8UnormSrgb => 4,
            TextureFormat::Rgba16Float => 8,
            TextureFormat::Rgba32Float => 16,
            TextureFormat::Bc1RgbaUnorm | TextureFormat::Bc1RgbaUnormSrgb => 8,
            TextureFormat::Bc3RgbaUnorm
            | TextureFormat::Bc3RgbaUnormSrgb
            | TextureFormat::Bc7RgbaUnorm
            | TextureFormat::Bc7RgbaUnormSrgb => 16,
        }
    }

    /// Bytes in one row of blocks.
    #[inline]
    pub fn bytes_per_row(self, width: u32) -> u32 {
        width.div_ceil(self.block_dim()) * self.block_bytes()
    }

    /// Rows of blocks in an image of `height` pixels.
    #[inline]
    pub fn block_rows(self, height: u32) -> u32 {
        height.div_ceil(self.block_dim())
    }

    #[inline]
    pub fn level_bytes(self, width: u32, height: u32) -> usize {
        self.bytes_per_row(width) as usize * self.block_rows(height) as usize
    }

    fn from_dxgi(format: DxgiFormat) -> Option<Self> {
        Some(match format {
            DxgiFormat::R8G8B8A8_UNorm => TextureFormat::Rgba8Unorm,
            DxgiFormat::R8G8B8A8_UNorm_sRGB => TextureFormat::Rgba8UnormSrgb,
            DxgiFormat::B8G8R8A8_UNorm => TextureFormat::Bgra8Unorm,
            DxgiFormat::B8G8R8A8_UNorm_sRGB => TextureFormat::Bgra8UnormSrgb,
            DxgiFormat::R16G16B16A16_Float => TextureFormat::Rgba16Float,
            DxgiFormat::R32G32B32A32_Float => TextureFormat::Rgba32Float,
            DxgiFormat::BC1_UNorm => TextureFormat::Bc1RgbaUnorm,
            DxgiFormat::BC1_UNorm_sRGB => TextureFormat::Bc1RgbaUnormSrgb,
            DxgiFormat::BC3_UNorm => TextureFormat::Bc3RgbaUnorm,
            DxgiFormat::BC3_UNorm_sRGB => TextureFormat::Bc3RgbaUnormSrgb,
            DxgiFormat::BC7_UNorm => TextureFormat::Bc7RgbaUnorm,
            DxgiFormat::BC7_UNorm_sRGB => TextureFormat::Bc7RgbaUnormSrgb,
            _ => return None,
        })
    }

    fn from_d3d(format: D3DFormat) -> Option<Self> {
        Some(match format {
            D3DFormat::A8B8G8R8 => TextureFormat::Rgba8Unorm,
            D3DFormat::A8R8G8B8 => TextureFormat::Bgra8Unorm,
            D3DFormat::A16B16G16R16F => TextureFormat::Rgba16Float,
            D3DFormat::A32B32G32R32F => TextureFormat::Rgba32Float,
            D3DFormat::DXT1 => TextureFormat::Bc1RgbaUnorm,
            D3DFormat::DXT5 => TextureFormat::Bc3RgbaUnorm,
            _ => return None,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Texture data
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureDimension {
    D2,
    Cube,
}

/// Decoded texture with its full mip chain.
///
/// `data` holds layer-major subresources: every mip of layer 0, then every
/// mip of layer 1, and so on. Cube maps have six layers in +X, -X, +Y, -Y, +Z, -Z order.
#[derive(Debug, Clone, PartialEq)]
pub struct TextureData {
    pub format: TextureFormat,
    pub dimension: TextureDimension,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    pub mip_levels: u32,
    pub data: Vec<u8>,
}

/// Maximum number of mip levels for a given dimension pair.
#[inline]
pub fn max_mip_levels(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

impl TextureData {
    /// Size of mip `level` in pixels.
    #[inline]
    pub fn level_extent(&self, level: u32) -> (u32, u32) {
        ((self.width >> level).max(1), (self.height >> level).max(1))
    }

    fn layer_bytes(&self) -> usize {
        (0..self.mip_levels)
            .map(|level| {
                let (w, h) = self.level_extent(level);
                self.format.level_bytes(w, h)
            })
            .sum()
    }

    /// Bytes `data` must hold for the declared format, size, layers and mips.
    pub fn expected_len(&self) -> usize {
        self.layer_bytes() * self.layers as usize
    }

    /// Byte range of one subresource within `data`.
    pub fn subresource(&self, layer: u32, level: u32) -> Range<usize> {
        let mut start = self.layer_bytes() * layer as usize;
        for l in 0..level {
            let (w, h) = self.level_extent(l);
            start += self.format.level_bytes(w, h);
        }
        let (w, h) = self.level_extent(level);
        start..start + self.format.level_bytes(w, h)
    }

    /// 1x1 texture of a single RGBA8 colour; cube dimension repeats it on six faces.
    pub fn solid(rgba: [u8; 4], dimension: TextureDimension) -> Self {
        let layers = match dimension {
            TextureDimension::D2 => 1,
            TextureDimension::Cube => 6,
        };
        Self {
            format: TextureFormat::Rgba8Unorm,
            dimension,
            width: 1,
            height: 1,
            layers,
            mip_levels: 1,
            data: rgba.repeat(layers as usize),
        }
    }

    /// RGBA8 texture with a CPU-generated mip chain.
    pub fn from_image(image: DynamicImage) -> Self {
        let rgba = image.into_rgba8();
        let (width, height) = rgba.dimensions();
        let mip_levels = max_mip_levels(width, height);
        let mut data = Vec::with_capacity(rgba.as_raw().len() * 4 / 3 + 4);
        data.extend_from_slice(rgba.as_raw());
        generate_mipmaps_cpu(&rgba, mip_levels, &mut data);
        Self {
            format: TextureFormat::Rgba8Unorm,
            dimension: TextureDimension::D2,
            width,
            height,
            layers: 1,
            mip_levels,
            data,
        }
    }

    /// Decode PNG/JPEG bytes.
    pub fn from_image_bytes(bytes: &[u8]) -> Result<Self> {
        let image = image::load_from_memory(bytes)?;
        Ok(Self::from_image(image))
    }

    /// Parse a DDS container, keeping its mips and detecting cube maps.
    pub fn from_dds_bytes(bytes: &[u8]) -> Result<Self> {
        let dds = Dds::read(&mut Cursor::new(bytes))?;
        let format = dds
            .get_dxgi_format()
            .and_then(TextureFormat::from_dxgi)
            .or_else(|| dds.get_d3d_format().and_then(TextureFormat::from_d3d))
            .ok_or_else(|| {
                Error::Dds(format!(
                    "unsupported pixel format (dxgi {:?}, d3d {:?})",
                    dds.get_dxgi_format(),
                    dds.get_d3d_format()
                ))
            })?;

        let is_cube = dds.header.caps2.contains(Caps2::CUBEMAP)
            || dds
                .header10
                .as_ref()
                .is_some_and(|h| h.misc_flag.contains(MiscFlag::TEXTURECUBE));
        let array_layers = dds.get_num_array_layers().max(1);
        let (dimension, layers) = if is_cube {
            (TextureDimension::Cube, array_layers * 6)
        } else {
            (TextureDimension::D2, array_layers)
        };

        let mut texture = Self {
            format,
            dimension,
            width: dds.get_width(),
            height: dds.get_height(),
            layers,
            mip_levels: dds.get_num_mipmap_levels().max(1),
            data: Vec::new(),
        };
        if is_cube && texture.layers > 6 {
            // a cube array; only the first cube is bound
            texture.layers = 6;
        }
        if texture.width == 0 || texture.height == 0 {
            return Err(Error::Dds(format!("zero extent {}x{}", texture.width, texture.height)));
        }
        let max_mips = max_mip_levels(texture.width, texture.height);
        if texture.mip_levels > max_mips {
            return Err(Error::Dds(format!(
                "{} mips declared, a {}x{} image has at most {max_mips}",
                texture.mip_levels, texture.width, texture.height
            )));
        }
        let expected = texture.expected_len();
        if dds.data.len() < expected {
            return Err(Error::Dds(format!(
                "payload is {} bytes, {}x{} {:?} with {} layers and {} mips needs {}",
                dds.data.len(),
                texture.width,
                texture.height,
                texture.format,
                texture.layers,
                texture.mip_levels,
                expected
            )));
        }
        texture.data = dds.data[..expected].to_vec();
        Ok(texture)
    }

    /// Load a texture file, choosing the decoder by extension.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).with_context(|| format!("reading texture {}", path.display()))?;
        let is_dds = path
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case("dds"));
        let texture = if is_dds {
            Self::from_dds_bytes(&bytes)
        } else {
            Self::from_image_bytes(&bytes)
        }
        .with_context(|| format!("decoding texture {}", path.display()))?;
        debug!(
            "Decoded {} ({}x{} {:?}, {} layers, {} mips)",
            path.display(),
            texture.width,
            texture.height,
            texture.format,
            texture.layers,
            texture.mip_levels
        );
        Ok(texture)
    }
}

/// Append mips 1..levels of `base` to `out`, each a Lanczos3 downsample of the previous level.
fn generate_mipmaps_cpu(base: &ImageBuffer<Rgba<u8>, Vec<u8>>, levels: u32, out: &mut Vec<u8>) {
    let (mut width, mut height) = base.dimensions();
    let mut src = base.clone();

    for _ in 1..levels {
        let new_w = (width / 2).max(1);
        let new_h = (height / 2).max(1);
        let dst = image::imageops::resize(&src, new_w, new_h, image::imageops::FilterType::Lanczos3);
        out.extend_from_slice(dst.as_raw());
        src = dst;
        width = new_w;
        height = new_h;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ddsfile::{AlphaMode, D3D10ResourceDimension, NewDxgiParams};

    #[test]
    fn test_split_file_name() {
        assert_eq!(
            split_texture_file_name(Path::new("assets/Lunar_T.png")),
            Some(("Lunar".to_string(), 'T'))
        );
        assert_eq!(
            split_texture_file_name(Path::new("Moon_Rock_N.jpg")),
            Some(("Moon_Rock".to_string(), 'N'))
        );
        assert_eq!(split_texture_file_name(Path::new("Lunar.png")), None);
        assert_eq!(split_texture_file_name(Path::new("Lunar_TX.png")), None);
        assert_eq!(split_texture_file_name(Path::new("_T.png")), None);
    }

    #[test]
    fn test_slot_letters() {
        assert_eq!(TextureSlot::from_letter('T'), Some(TextureSlot::Diffuse));
        assert_eq!(TextureSlot::from_letter('n'), Some(TextureSlot::Normal));
        assert_eq!(TextureSlot::from_letter('R'), Some(TextureSlot::Roughness));
        assert_eq!(TextureSlot::from_letter('C').map(TextureSlot::index), Some(4));
        assert_eq!(TextureSlot::from_letter('Q'), None);
    }

    #[test]
    fn test_mip_levels() {
        assert_eq!(max_mip_levels(1, 1), 1);
        assert_eq!(max_mip_levels(256, 256), 9);
        assert_eq!(max_mip_levels(300, 20), 9);
    }

    #[test]
    fn test_image_gets_full_mip_chain() {
        let image = DynamicImage::ImageRgba8(ImageBuffer::from_pixel(4, 2, Rgba([10, 20, 30, 255])));
        let texture = TextureData::from_image(image);
        assert_eq!(texture.mip_levels, 3);
        // 4x2 + 2x1 + 1x1 pixels
        assert_eq!(texture.data.len(), (8 + 2 + 1) * 4);
        assert_eq!(texture.data.len(), texture.expected_len());
        assert_eq!(texture.subresource(0, 2), 40..44);
    }

    #[test]
    fn test_block_compressed_sizes() {
        let format = TextureFormat::Bc1RgbaUnorm;
        assert_eq!(format.level_bytes(1, 1), 8);
        assert_eq!(format.level_bytes(8, 8), 32);
        assert_eq!(TextureFormat::Bc7RgbaUnorm.bytes_per_row(5), 32);
    }

    #[test]
    fn test_dds_cube_map() {
        let params = NewDxgiParams {
            height: 2,
            width: 2,
            depth: None,
            format: DxgiFormat::R8G8B8A8_UNorm,
            mipmap_levels: Some(1),
            array_layers: Some(1),
            caps2: None,
            is_cubemap: true,
            resource_dimension: D3D10ResourceDimension::Texture2D,
            alpha_mode: AlphaMode::Unknown,
        };
        let mut dds = Dds::new_dxgi(params).unwrap();
        dds.data = (0..6 * 16).map(|i| i as u8).collect();
        let mut bytes = Vec::new();
        dds.write(&mut bytes).unwrap();

        let texture = TextureData::from_dds_bytes(&bytes).unwrap();
        assert_eq!(texture.dimension, TextureDimension::Cube);
        assert_eq!(texture.layers, 6);
        assert_eq!(texture.format, TextureFormat::Rgba8Unorm);
        assert_eq!(texture.subresource(5, 0), 80..96);
        assert_eq!(texture.data[80], 80);
    }

    #[test]
    fn test_truncated_dds_is_an_error() {
        let params = NewDxgiParams {
            height: 4,
            width: 4,
            depth: None,
            format: DxgiFormat::R32G32B32A32_Float,
            mipmap_levels: Some(1),
            array_layers: Some(1),
            caps2: None,
            is_cubemap: false,
            resource_dimension: D3D10ResourceDimension::Texture2D,
            alpha_mode: AlphaMode::Unknown,
        };
        let mut dds = Dds::new_dxgi(params).unwrap();
        dds.data = vec![0; 16];
        let mut bytes = Vec::new();
        dds.write(&mut bytes).unwrap();
        let err = TextureData::from_dds_bytes(&bytes).unwrap_err();
        assert!(matches!(err, Error::Dds(_)));
    }

    #[test]
    fn test_dds_mip_count_beyond_extent_is_an_error() {
        let params = NewDxgiParams {
            height: 4,
            width: 4,
            depth: None,
            format: DxgiFormat::R8G8B8A8_UNorm,
            mipmap_levels: Some(40),
            array_layers: Some(1),
            caps2: None,
            is_cubemap: false,
            resource_dimension: D3D10ResourceDimension::Texture2D,
            alpha_mode: AlphaMode::Unknown,
        };
        let mut dds = Dds::new_dxgi(params).unwrap();
        dds.data = vec![0; 64];
        let mut bytes = Vec::new();
        dds.write(&mut bytes).unwrap();
        let err = TextureData::from_dds_bytes(&bytes).unwrap_err();
        assert!(matches!(err, Error::Dds(_)));
    }

    #[test]
    fn test_solid_cube_has_six_faces() {
        let cube = TextureData::solid([255; 4], TextureDimension::Cube);
        assert_eq!(cube.data.len(), 24);
        assert_eq!(cube.expected_len(), 24);
    }
}
