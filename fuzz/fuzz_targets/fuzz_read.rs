// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#![no_main]

use libfuzzer_sys::fuzz_target;
use mediaprops::{ContainerFormat, ParseConfig, ReadStyle};
use std::io::Cursor;

const FORMATS: [ContainerFormat; 5] = [
    ContainerFormat::Matroska,
    ContainerFormat::Mp4,
    ContainerFormat::Asf,
    ContainerFormat::Ogg,
    ContainerFormat::Riff,
];

fuzz_target!(|data: &[u8]| {
    let config = ParseConfig::default().with_read_style(ReadStyle::Accurate);
    let _ = mediaprops::read_properties(&mut Cursor::new(data), &config, &enough::Unstoppable);

    // Force each reader, whatever the signature says
    let Some((&selector, rest)) = data.split_first() else { return };
    let format = FORMATS[usize::from(selector) % FORMATS.len()];
    let _ = mediaprops::read_properties_as(&mut Cursor::new(rest), format, &ParseConfig::default(), &enough::Unstoppable);
});
