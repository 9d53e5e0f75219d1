// src/hash.rs
//! 32-bit FNV-1a name hashing and the strongly typed resource ids derived from it.
//!
//! Every asset in the [`Codex`](crate::resource_manager::Codex) is keyed by the
//! hash of its logical name, so `"Cube.obj"` always resolves to the same mesh id
//! no matter when or where it was loaded.

pub const FNV_OFFSET_BASIS: u32 = 0x811C_9DC5;
pub const FNV_PRIME: u32 = 0x0100_0193;

/// FNV-1a over raw bytes. Usable in `const` contexts for compile-time ids.
#[inline]
pub const fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
        i += 1;
    }
    hash
}

/// FNV-1a over 16-bit code units, one mixing step per unit.
///
/// For ASCII input this is identical to [`fnv1a`] over the narrow bytes.
#[inline]
pub fn fnv1a_wide(units: &[u16]) -> u32 {
    units.iter().fold(FNV_OFFSET_BASIS, |hash, &unit| {
        (hash ^ unit as u32).wrapping_mul(FNV_PRIME)
    })
}

/// Hash a string by its UTF-8 bytes.
#[inline]
pub const fn hash_str(name: &str) -> u32 {
    fnv1a(name.as_bytes())
}

/// Hash a string by its UTF-16 code units. Used for names that arrive from
/// platform APIs as wide strings (directory listings on Windows).
#[inline]
pub fn hash_wide_str(name: &str) -> u32 {
    let units: Vec<u16> = name.encode_utf16().collect();
    fnv1a_wide(&units)
}

macro_rules! resource_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl $name {
            /// Id of a logical asset name.
            #[inline]
            pub const fn from_name(name: &str) -> Self {
                Self(hash_str(name))
            }

            #[inline]
            pub const fn raw(self) -> u32 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{:#010x}", self.0)
            }
        }
    };
}

resource_id!(
    /// Id of a mesh, the hash of its file name (`"Cube.obj"`).
    MeshId
);
resource_id!(
    /// Id of a compiled vertex or pixel shader, the hash of its file name.
    ShaderId
);
resource_id!(
    /// Id of a texture bind chord, the hash of the logical texture name.
    TextureId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vectors() {
        assert_eq!(fnv1a(b""), 0x811C_9DC5);
        assert_eq!(fnv1a(b"a"), 0xE40C_292C);
        assert_eq!(fnv1a(b"foobar"), 0xBF9C_F968);
    }

    #[test]
    fn test_empty_string_is_offset_basis() {
        assert_eq!(hash_str(""), FNV_OFFSET_BASIS);
        assert_eq!(fnv1a_wide(&[]), FNV_OFFSET_BASIS);
    }

    #[test]
    fn test_wide_matches_narrow_for_ascii() {
        for name in ["Cube.obj", "InstancedVS.wgsl", "Lunar", "x"] {
            assert_eq!(hash_wide_str(name), hash_str(name), "{name}");
        }
    }

    #[test]
    fn test_ids_are_stable_and_distinct() {
        assert_eq!(MeshId::from_name("Cube.obj"), MeshId::from_name("Cube.obj"));
        assert_ne!(MeshId::from_name("Cube.obj"), MeshId::from_name("cube.obj"));
        const AT_COMPILE_TIME: MeshId = MeshId::from_name("Cube.obj");
        assert_eq!(AT_COMPILE_TIME.raw(), hash_str("Cube.obj"));
    }
}
