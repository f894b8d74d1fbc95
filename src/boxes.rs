// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Box type identifiers for the subset of ISOBMFF used by HEIF images.

use std::fmt;

macro_rules! box_database {
    ($($(#[$attr:meta])* $boxenum:ident $boxtype:literal),+ $(,)?) => {
        #[derive(Clone, Copy, PartialEq, Eq)]
        pub(crate) enum BoxType {
            $($(#[$attr])* $boxenum),*,
            UnknownBox(u32),
        }

        impl From<u32> for BoxType {
            fn from(t: u32) -> Self {
                use self::BoxType::*;
                match t {
                    $($boxtype => $boxenum),*,
                    _ => UnknownBox(t),
                }
            }
        }

        impl From<BoxType> for u32 {
            fn from(b: BoxType) -> u32 {
                use self::BoxType::*;
                match b {
                    $($boxenum => $boxtype),*,
                    UnknownBox(t) => t,
                }
            }
        }
    }
}

box_database!(
    FileTypeBox                  0x6674_7970, // "ftyp"
    MetadataBox                  0x6d65_7461, // "meta"
    HandlerBox                   0x6864_6c72, // "hdlr"
    PrimaryItemBox               0x7069_746d, // "pitm"
    ItemInfoBox                  0x6969_6e66, // "iinf"
    ItemInfoEntry                0x696e_6665, // "infe"
    ItemLocationBox              0x696c_6f63, // "iloc"
    ItemDataBox                  0x6964_6174, // "idat"
    ItemReferenceBox             0x6972_6566, // "iref"
    ItemPropertiesBox            0x6970_7270, // "iprp"
    ItemPropertyContainerBox     0x6970_636f, // "ipco"
    ItemPropertyAssociationBox   0x6970_6d61, // "ipma"
    ImageSpatialExtentsBox       0x6973_7065, // "ispe"
    HevcConfigurationBox         0x6876_6343, // "hvcC"
    AuxiliaryTypeProperty        0x6175_7843, // "auxC"
    ImageRotationBox             0x6972_6f74, // "irot"
    ImageMirrorBox               0x696d_6972, // "imir"
    CleanApertureBox             0x636c_6170, // "clap"
    PixelInformationBox          0x7069_7869, // "pixi"
    MediaDataBox                 0x6d64_6174, // "mdat"
    DataInformationBox           0x6469_6e66, // "dinf"
    DataReferenceBox             0x6472_6566, // "dref"
    DataEntryUrlBox              0x7572_6c20, // "url "
    GroupsListBox                0x6772_706c, // "grpl"
    UuidBox                      0x7575_6964, // "uuid"
);

impl fmt::Debug for BoxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fourcc: FourCC = From::from(*self);
        fmt::Debug::fmt(&fourcc, f)
    }
}

/// Four ASCII bytes packed into a 32-bit type tag.
#[derive(Default, PartialEq, Eq, Clone, Copy)]
pub struct FourCC {
    pub value: [u8; 4],
}

impl From<u32> for FourCC {
    fn from(number: u32) -> Self {
        Self {
            value: number.to_be_bytes(),
        }
    }
}

impl From<FourCC> for u32 {
    fn from(fourcc: FourCC) -> Self {
        u32::from_be_bytes(fourcc.value)
    }
}

impl From<[u8; 4]> for FourCC {
    fn from(v: [u8; 4]) -> Self {
        Self { value: v }
    }
}

impl From<BoxType> for FourCC {
    fn from(t: BoxType) -> Self {
        let number: u32 = t.into();
        Self::from(number)
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}'", self)
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.value) {
            Ok(s) => f.write_str(s),
            Err(_) => write!(f, "0x{:08x}", u32::from(*self)),
        }
    }
}

impl PartialEq<&[u8]> for FourCC {
    fn eq(&self, other: &&[u8]) -> bool {
        self.value.as_slice() == *other
    }
}

impl PartialEq<&[u8; 4]> for FourCC {
    fn eq(&self, other: &&[u8; 4]) -> bool {
        &self.value == *other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_to_display() {
        let ftyp: FourCC = BoxType::FileTypeBox.into();
        assert_eq!(ftyp.to_string(), "ftyp");
        assert_eq!(ftyp, b"ftyp");
    }

    #[test]
    fn box_type_roundtrip() {
        let t = BoxType::from(u32::from_be_bytes(*b"hvcC"));
        assert_eq!(t, BoxType::HevcConfigurationBox);
        let back: u32 = t.into();
        assert_eq!(back.to_be_bytes(), *b"hvcC");

        let unknown = BoxType::from(u32::from_be_bytes(*b"zzzz"));
        assert!(matches!(unknown, BoxType::UnknownBox(_)));
    }
}
