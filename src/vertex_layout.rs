// src/vertex_layout.rs
//! Vertex buffer layouts derived from a vertex shader's reflected input signature.
//!
//! Each input's component mask is turned into a byte size and elements are
//! packed tightly in signature order. Inputs whose semantic name starts with
//! `INSTANCE` form a second, per-instance stream.

use thiserror::Error;

/// Semantic-name prefix that marks a per-instance input.
pub const INSTANCE_PREFIX: &str = "INSTANCE";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("input `{name}` has an empty component mask")]
    EmptyMask { name: String },
    #[error("input `{name}` has component mask {mask:#06b}, wider than 4 components")]
    MaskTooWide { name: String, mask: u8 },
    #[error("per-vertex input `{name}` follows an instance input; instance inputs must come last")]
    InterleavedInstanceSemantics { name: String },
}

/// One input parameter of a vertex shader, as reported by reflection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflectedInput {
    /// Upper-case name without the trailing index (`TEXCOORD` for `texcoord1`).
    pub semantic_name: String,
    pub semantic_index: u32,
    /// Shader location the input is read from.
    pub location: u32,
    /// Bitmask of used components: bit 0 = x ... bit 3 = w.
    pub component_mask: u8,
}

impl ReflectedInput {
    /// Split a raw input name into upper-case semantic name and trailing index:
    /// `texcoord1` → (`TEXCOORD`, 1), `instance_world0` → (`INSTANCE_WORLD`, 0).
    pub fn from_raw_name(raw: &str, location: u32, component_mask: u8) -> Self {
        let upper = raw.to_ascii_uppercase();
        let digits = upper.len() - upper.trim_end_matches(|c: char| c.is_ascii_digit()).len();
        let (name, index) = upper.split_at(upper.len() - digits);
        let semantic_index = if digits == 0 { 0 } else { index.parse().unwrap_or(0) };
        let semantic_name = if name.is_empty() { upper.clone() } else { name.to_string() };
        Self {
            semantic_name,
            semantic_index,
            location,
            component_mask,
        }
    }
}

/// What a vertex element carries. Drives mesh packing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Semantic {
    Position,
    Normal,
    TexCoord,
    Tangent,
    Bitangent,
    Color,
    /// Per-instance data, filled by the renderer rather than the mesh.
    Instance(String),
    /// Unrecognised semantic; mesh packing writes zeros.
    Other(String),
}

impl Semantic {
    pub fn from_name(name: &str) -> Self {
        let upper = name.to_ascii_uppercase();
        if upper.starts_with(INSTANCE_PREFIX) {
            return Semantic::Instance(upper);
        }
        match upper.as_str() {
            "POSITION" | "POS" | "SV_POSITION" => Semantic::Position,
            "NORMAL" | "NORM" => Semantic::Normal,
            "TEXCOORD" | "UV" => Semantic::TexCoord,
            "TANGENT" => Semantic::Tangent,
            "BINORMAL" | "BITANGENT" => Semantic::Bitangent,
            "COLOR" | "COLOUR" => Semantic::Color,
            _ => Semantic::Other(upper),
        }
    }

    #[inline]
    pub fn is_instance(&self) -> bool {
        matches!(self, Semantic::Instance(_))
    }
}

/// Bytes a component mask occupies: one 32-bit float per component up to the highest set bit.
pub fn component_bytes(name: &str, mask: u8) -> Result<u32, LayoutError> {
    match mask {
        0 => Err(LayoutError::EmptyMask { name: name.to_string() }),
        1 => Ok(4),
        2..=3 => Ok(8),
        4..=7 => Ok(12),
        8..=15 => Ok(16),
        _ => Err(LayoutError::MaskTooWide { name: name.to_string(), mask }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexElement {
    pub semantic: Semantic,
    pub semantic_name: String,
    pub semantic_index: u32,
    pub location: u32,
    /// Number of 32-bit float components (1..=4).
    pub components: u32,
    /// Byte offset within the stream's element.
    pub offset: u32,
}

impl VertexElement {
    #[inline]
    pub fn byte_size(&self) -> u32 {
        self.components * 4
    }
}

/// One buffer stream: tightly packed elements and the total stride.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamLayout {
    pub elements: Vec<VertexElement>,
    pub byte_size: u32,
}

impl StreamLayout {
    fn push(&mut self, input: &ReflectedInput) -> Result<(), LayoutError> {
        let bytes = component_bytes(&input.semantic_name, input.component_mask)?;
        self.elements.push(VertexElement {
            semantic: Semantic::from_name(&input.semantic_name),
            semantic_name: input.semantic_name.clone(),
            semantic_index: input.semantic_index,
            location: input.location,
            components: bytes / 4,
            offset: self.byte_size,
        });
        self.byte_size += bytes;
        Ok(())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

/// Layout of a mesh's vertex stream plus an optional per-instance stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VertexBufferDescription {
    pub per_vertex: StreamLayout,
    pub per_instance: Option<StreamLayout>,
}

impl VertexBufferDescription {
    /// Build the layout for a reflected input signature.
    ///
    /// The instance stream starts at the first `INSTANCE*` input; every later
    /// input must also be an instance input.
    pub fn from_reflection(inputs: &[ReflectedInput]) -> Result<Self, LayoutError> {
        let split = inputs
            .iter()
            .position(|i| i.semantic_name.to_ascii_uppercase().starts_with(INSTANCE_PREFIX))
            .unwrap_or(inputs.len());

        let mut per_vertex = StreamLayout::default();
        for input in &inputs[..split] {
            per_vertex.push(input)?;
        }

        let per_instance = if split < inputs.len() {
            let mut stream = StreamLayout::default();
            for input in &inputs[split..] {
                if !input.semantic_name.to_ascii_uppercase().starts_with(INSTANCE_PREFIX) {
                    return Err(LayoutError::InterleavedInstanceSemantics {
                        name: input.semantic_name.clone(),
                    });
                }
                stream.push(input)?;
            }
            Some(stream)
        } else {
            None
        };

        Ok(Self { per_vertex, per_instance })
    }

    /// Stride of one mesh vertex.
    #[inline]
    pub fn byte_size(&self) -> u32 {
        self.per_vertex.byte_size
    }

    /// Stride of one instance element, 0 without an instance stream.
    #[inline]
    pub fn instance_stride(&self) -> u32 {
        self.per_instance.as_ref().map_or(0, |s| s.byte_size)
    }

    #[inline]
    pub fn is_instanced(&self) -> bool {
        self.per_instance.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(name: &str, location: u32, mask: u8) -> ReflectedInput {
        ReflectedInput::from_raw_name(name, location, mask)
    }

    #[test]
    fn test_masks_pack_tightly() {
        let layout = VertexBufferDescription::from_reflection(&[
            input("weight", 0, 0b0001),
            input("texcoord", 1, 0b0011),
            input("position", 2, 0b0111),
            input("color", 3, 0b1111),
        ])
        .unwrap();

        let offsets: Vec<u32> = layout.per_vertex.elements.iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![0, 4, 12, 24]);
        assert_eq!(layout.byte_size(), 40);
        assert!(layout.per_instance.is_none());
        assert_eq!(layout.instance_stride(), 0);
    }

    #[test]
    fn test_instance_inputs_form_second_stream() {
        let layout = VertexBufferDescription::from_reflection(&[
            input("position", 0, 0b0111),
            input("normal", 1, 0b0111),
            input("texcoord0", 2, 0b0011),
            input("instance_world0", 3, 0b1111),
            input("instance_world1", 4, 0b1111),
            input("instance_world2", 5, 0b1111),
            input("instance_world3", 6, 0b1111),
        ])
        .unwrap();

        assert_eq!(layout.byte_size(), 32);
        let instance = layout.per_instance.as_ref().unwrap();
        assert_eq!(instance.elements.len(), 4);
        assert_eq!(instance.byte_size, 64);
        assert_eq!(instance.elements[0].offset, 0);
        assert_eq!(instance.elements[3].offset, 48);
        assert_eq!(instance.elements[2].semantic_index, 2);
        assert!(instance.elements.iter().all(|e| e.semantic.is_instance()));
    }

    #[test]
    fn test_single_instance_input_starts_at_zero() {
        let layout = VertexBufferDescription::from_reflection(&[
            input("POSITION", 0, 0b0111),
            input("NORMAL", 1, 0b0111),
            input("INSTANCE_POSITION", 2, 0b0111),
        ])
        .unwrap();
        let names: Vec<&str> = layout.per_vertex.elements.iter().map(|e| e.semantic_name.as_str()).collect();
        assert_eq!(names, vec!["POSITION", "NORMAL"]);
        let instance = layout.per_instance.unwrap();
        assert_eq!(instance.elements.len(), 1);
        assert_eq!(instance.elements[0].semantic_name, "INSTANCE_POSITION");
        assert_eq!(instance.elements[0].offset, 0);
        assert_eq!(instance.byte_size, 12);
    }

    #[test]
    fn test_interleaved_instance_inputs_are_rejected() {
        let err = VertexBufferDescription::from_reflection(&[
            input("position", 0, 0b0111),
            input("instance_world0", 1, 0b1111),
            input("normal", 2, 0b0111),
        ])
        .unwrap_err();
        assert_eq!(err, LayoutError::InterleavedInstanceSemantics { name: "NORMAL".into() });
    }

    #[test]
    fn test_bad_masks_are_rejected() {
        assert!(matches!(component_bytes("x", 0), Err(LayoutError::EmptyMask { .. })));
        assert!(matches!(component_bytes("x", 16), Err(LayoutError::MaskTooWide { .. })));
        assert_eq!(component_bytes("y_only", 0b0010).unwrap(), 8);
    }

    #[test]
    fn test_raw_name_split() {
        let i = ReflectedInput::from_raw_name("texcoord12", 5, 3);
        assert_eq!(i.semantic_name, "TEXCOORD");
        assert_eq!(i.semantic_index, 12);
        assert_eq!(ReflectedInput::from_raw_name("Normal", 0, 7).semantic_index, 0);
        assert_eq!(Semantic::from_name("binormal"), Semantic::Bitangent);
        assert_eq!(Semantic::from_name("blendweight"), Semantic::Other("BLENDWEIGHT".into()));
    }
}
