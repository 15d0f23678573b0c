// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;

macro_rules! box_database {
    ($($(#[$attr:meta])* $boxenum:ident $boxtype:literal),*,) => {
        #[derive(Clone, Copy, PartialEq, Eq)]
        pub(crate) enum BoxType {
            $($(#[$attr])* $boxenum),*,
            UnknownBox(u32),
        }

        impl From<u32> for BoxType {
            fn from(t: u32) -> BoxType {
                use self::BoxType::*;
                match t {
                    $($(#[$attr])* $boxtype => $boxenum),*,
                    _ => UnknownBox(t),
                }
            }
        }

        impl From<BoxType> for u32 {
            fn from(b: BoxType) -> u32 {
                use self::BoxType::*;
                match b {
                    $($(#[$attr])* $boxenum => $boxtype),*,
                    UnknownBox(t) => t,
                }
            }
        }
    }
}

impl fmt::Debug for BoxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fourcc: FourCC = From::from(*self);
        fourcc.fmt(f)
    }
}

/// A four-character code, as used by ISO-BMFF box types, RIFF chunk ids,
/// handler types and sample entry formats.
#[derive(Default, PartialEq, Eq, Clone, Copy, Hash)]
pub struct FourCC {
    pub value: [u8; 4],
}

impl FourCC {
    pub const fn new(value: &[u8; 4]) -> Self {
        Self { value: *value }
    }

    pub(crate) fn to_u32(self) -> u32 {
        u32::from_be_bytes(self.value)
    }
}

impl From<u32> for FourCC {
    fn from(number: u32) -> Self {
        Self { value: number.to_be_bytes() }
    }
}

impl From<BoxType> for FourCC {
    fn from(t: BoxType) -> Self {
        let box_num: u32 = Into::into(t);
        From::from(box_num)
    }
}

impl From<[u8; 4]> for FourCC {
    fn from(value: [u8; 4]) -> Self {
        Self { value }
    }
}

impl From<FourCC> for BoxType {
    fn from(fourcc: FourCC) -> Self {
        BoxType::from(fourcc.to_u32())
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.value) {
            Ok(s) => f.write_str(s),
            Err(_) => self.value.fmt(f),
        }
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl PartialEq<&[u8; 4]> for FourCC {
    fn eq(&self, other: &&[u8; 4]) -> bool {
        self.value.eq(*other)
    }
}

box_database!(
    FileTypeBox                       0x6674_7970, // "ftyp"
    MediaDataBox                      0x6d64_6174, // "mdat"
    FreeSpaceBox                      0x6672_6565, // "free"
    SkipBox                           0x736b_6970, // "skip"
    WideBox                           0x7769_6465, // "wide"
    MovieBox                          0x6d6f_6f76, // "moov"
    MovieHeaderBox                    0x6d76_6864, // "mvhd"
    MovieExtendsBox                   0x6d76_6578, // "mvex"
    MovieExtendsHeaderBox             0x6d65_6864, // "mehd"
    TrackBox                          0x7472_616b, // "trak"
    TrackHeaderBox                    0x746b_6864, // "tkhd"
    MediaBox                          0x6d64_6961, // "mdia"
    MediaHeaderBox                    0x6d64_6864, // "mdhd"
    HandlerBox                        0x6864_6c72, // "hdlr"
    MediaInformationBox               0x6d69_6e66, // "minf"
    SampleTableBox                    0x7374_626c, // "stbl"
    SampleDescriptionBox              0x7374_7364, // "stsd"
    SampleSizeBox                     0x7374_737a, // "stsz"
    ESDBox                            0x6573_6473, // "esds"
    ALACSpecificBox                   0x616c_6163, // "alac"
    BitRateBox                        0x6274_7274, // "btrt"
    UserDataBox                       0x7564_7461, // "udta"
    MetadataBox                       0x6d65_7461, // "meta"
    MovieFragmentBox                  0x6d6f_6f66, // "moof"
    UuidBox                           0x7575_6964, // "uuid"
);
