// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;

macro_rules! element_database {
    ($($(#[$attr:meta])* $name:ident $id:literal),*,) => {
        #[derive(Clone, Copy, PartialEq, Eq)]
        pub(crate) enum ElementId {
            $($(#[$attr])* $name),*,
            Unknown(u32),
        }

        impl From<u32> for ElementId {
            fn from(id: u32) -> ElementId {
                use self::ElementId::*;
                match id {
                    $($(#[$attr])* $id => $name),*,
                    _ => Unknown(id),
                }
            }
        }

        impl From<ElementId> for u32 {
            fn from(id: ElementId) -> u32 {
                use self::ElementId::*;
                match id {
                    $($(#[$attr])* $name => $id),*,
                    Unknown(id) => id,
                }
            }
        }

        impl fmt::Debug for ElementId {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                use self::ElementId::*;
                match self {
                    $($(#[$attr])* $name => f.write_str(stringify!($name))),*,
                    Unknown(id) => write!(f, "Unknown({id:#X})"),
                }
            }
        }
    }
}

element_database!(
    Ebml                    0x1A45_DFA3,
    DocType                 0x4282,
    Segment                 0x1853_8067,
    SeekHead                0x114D_9B74,
    Seek                    0x4DBB,
    SeekId                  0x53AB,
    SeekPosition            0x53AC,
    Info                    0x1549_A966,
    TimestampScale          0x2A_D7B1,
    Duration                0x4489,
    Tracks                  0x1654_AE6B,
    TrackEntry              0xAE,
    TrackType               0x83,
    CodecId                 0x86,
    Video                   0xE0,
    PixelWidth              0xB0,
    PixelHeight             0xBA,
    Audio                   0xE1,
    SamplingFrequency       0xB5,
    OutputSamplingFrequency 0x78B5,
    Channels                0x9F,
    BitDepth                0x6264,
    Cluster                 0x1F43_B675,
    Cues                    0x1C53_BB6B,
    Tags                    0x1254_C367,
    Void                    0xEC,
    Crc32                   0xBF,
);

/// `TrackType` values.
pub(crate) const TRACK_TYPE_VIDEO: u64 = 1;
pub(crate) const TRACK_TYPE_AUDIO: u64 = 2;

/// Nanoseconds per `Duration` tick unless `TimestampScale` says otherwise.
pub(crate) const DEFAULT_TIMESTAMP_SCALE: u64 = 1_000_000;

#[test]
fn ids_round_trip() {
    assert_eq!(ElementId::from(0x1853_8067), ElementId::Segment);
    assert_eq!(u32::from(ElementId::OutputSamplingFrequency), 0x78B5);
    assert_eq!(ElementId::from(0x4321), ElementId::Unknown(0x4321));
    assert_eq!(format!("{:?}", ElementId::from(0x4321)), "Unknown(0x4321)");
}
