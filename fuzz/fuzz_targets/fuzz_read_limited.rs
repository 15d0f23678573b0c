// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#![no_main]

use libfuzzer_sys::fuzz_target;
use mediaprops::ParseConfig;
use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    let config = ParseConfig::default()
        .with_max_depth(4)
        .with_max_elements(64)
        .with_max_packet_size(4096)
        .with_max_seek_head_depth(1);
    if let Ok(probe) = mediaprops::read_properties(&mut Cursor::new(data), &config, &enough::Unstoppable) {
        for entry in probe.ledger.iter() {
            assert!(!entry.reason.is_empty());
        }
    }
});
