// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ogg. Headers are rebuilt from the first pages; durations come from the
//! granule position of each stream's last page.

mod codecs;
mod page;
mod reassembler;

use self::codecs::StreamRecognizer;
use self::page::{find_capture, read_page, Page, PageFlags, CAPTURE};
use self::reassembler::Reassembler;
use crate::properties::{average_kbps, Properties};
use crate::{Error, ReadStyle, Result, Session, ToU64, TryVec};
use log::debug;
use std::io::{Read, Seek};

/// Tail windows searched for the last pages, before widening.
const FAST_TAIL_WINDOW: u64 = 64 * 1024;
const AVERAGE_TAIL_WINDOW: u64 = 256 * 1024;

/// Last known granule position per stream serial.
#[derive(Debug, Default)]
struct Granules {
    entries: TryVec<(u32, u64)>,
}

impl Granules {
    fn set(&mut self, serial: u32, granule: u64) -> Result<()> {
        match self.entries.iter_mut().find(|(s, _)| *s == serial) {
            Some(entry) => entry.1 = granule,
            None => self.entries.push((serial, granule))?,
        }
        Ok(())
    }

    fn get(&self, serial: u32) -> Option<u64> {
        self.entries.iter().find(|(s, _)| *s == serial).map(|&(_, granule)| granule)
    }
}

pub(crate) fn read<R: Read + Seek>(session: &mut Session<'_, R>) -> Result<Properties> {
    session.src.seek(0)?;
    if session.src.read_array::<4>()? != CAPTURE {
        return Err(Error::Unsupported("missing Ogg capture pattern"));
    }

    let accurate = session.read_style() == ReadStyle::Accurate;
    let len = session.src.len();
    let mut reassembler = Reassembler::<StreamRecognizer>::new(session.config.max_packet_size);
    let mut granules = Granules::default();
    let mut offset = 0;

    while offset < len {
        session.check_stop()?;
        let page = match read_page(&mut session.src, offset) {
            Ok(page) => page,
            Err(err) if err.is_recoverable() => {
                session.ledger.record(offset, &err);
                match find_capture(&mut session.src, offset + 1, len)? {
                    Some(next) => {
                        debug!("resynchronized at {next}");
                        offset = next;
                        continue;
                    },
                    None => break,
                }
            },
            Err(err) => return Err(err),
        };
        let body = session.src.read_try_vec(page.body_len())?;
        if accurate && page.compute_checksum(&body) != page.checksum {
            session.ledger.record(
                page.offset,
                format_args!("checksum mismatch on page {} of stream {:#x}", page.sequence, page.serial),
            );
        }
        if let Some(granule) = page.granule() {
            granules.set(page.serial, granule)?;
        }
        reassembler.push_page(&page, &body, &mut session.ledger)?;
        offset = page.end_offset();

        // Every stream announces itself before any stream's data pages
        if !accurate && reassembler.all_done() && !page.flags.contains(PageFlags::FIRST) {
            break;
        }
    }
    reassembler.finish(offset, &mut session.ledger)?;

    if reassembler.streams().is_empty() {
        session.ledger.record(0, "no readable Ogg pages");
        return Properties::aggregate(None, &[]);
    }

    let wanted = recognized_serials(&reassembler)?;
    if offset < len && !wanted.is_empty() {
        let window = match session.read_style() {
            ReadStyle::Fast => FAST_TAIL_WINDOW,
            _ => AVERAGE_TAIL_WINDOW,
        };
        last_granules(session, offset, window, &wanted, &mut granules)?;
    }

    let mut facts = TryVec::new();
    for stream in reassembler.streams() {
        let Some(recognized) = &stream.consumer.recognized else { continue };
        let mut fact = recognized.fact.clone();
        match granules.get(stream.serial).and_then(|g| recognized.clock.duration(g)) {
            Some(duration) if !duration.is_zero() => fact = fact.with_duration(duration),
            _ => debug!("no duration for stream {:#x}", stream.serial),
        }
        facts.push(fact)?;
    }
    // A lone stream with no declared bitrate gets the file average
    if let [fact] = &mut facts[..] {
        if fact.bitrate == 0 {
            if let Some(duration) = fact.duration {
                fact.bitrate = average_kbps(len, duration);
            }
        }
    }
    Properties::aggregate(None, &facts)
}

fn recognized_serials(reassembler: &Reassembler<StreamRecognizer>) -> Result<TryVec<u32>> {
    let mut serials = TryVec::new();
    for stream in reassembler.streams() {
        if stream.consumer.recognized.is_some() {
            serials.push(stream.serial)?;
        }
    }
    Ok(serials)
}

/// Find the last granule position of every stream in `wanted`, searching a
/// tail window that grows fourfold until it reaches `from`.
fn last_granules<R: Read + Seek>(
    session: &mut Session<'_, R>,
    from: u64,
    mut window: u64,
    wanted: &[u32],
    granules: &mut Granules,
) -> Result<()> {
    let len = session.src.len();
    let mut end = len;
    let mut resolved = TryVec::new();
    loop {
        let start = len.saturating_sub(window).max(from);
        let mut found = Granules::default();
        scan_tail(session, start, end, &mut found)?;
        // Earlier rounds looked nearer the end, so their pages win
        for &(serial, granule) in found.entries.iter() {
            if wanted.contains(&serial) && !resolved.contains(&serial) {
                granules.set(serial, granule)?;
                resolved.push(serial)?;
            }
        }
        if start == from || wanted.iter().all(|s| resolved.contains(s)) {
            break;
        }
        debug!("widening the Ogg tail search past {start}");
        end = start;
        window = window.saturating_mul(4);
    }
    Ok(())
}

/// Record the granule of every intact page that starts in `start..end`.
fn scan_tail<R: Read + Seek>(session: &mut Session<'_, R>, start: u64, end: u64, found: &mut Granules) -> Result<()> {
    let search_end = end.saturating_add(CAPTURE.len().to_u64() - 1);
    let mut offset = start;
    while let Some(at) = find_capture(&mut session.src, offset, search_end)? {
        if at >= end {
            break;
        }
        session.check_stop()?;
        offset = at + 1;
        let page = match read_page(&mut session.src, at) {
            Ok(page) => page,
            Err(err @ Error::OutOfBounds(_)) => {
                session.ledger.record(at, &err);
                continue;
            },
            // Most likely a capture pattern inside packet data
            Err(err) if err.is_recoverable() => continue,
            Err(err) => return Err(err),
        };
        if !intact(session, &page)? {
            continue;
        }
        if let Some(granule) = page.granule() {
            found.set(page.serial, granule)?;
        }
        offset = page.end_offset();
    }
    Ok(())
}

/// Whether the page checksum holds. Capture patterns found by scanning may
/// sit inside packet data.
fn intact<R: Read + Seek>(session: &mut Session<'_, R>, page: &Page) -> Result<bool> {
    session.src.seek(page.body_offset())?;
    let body = session.src.read_try_vec(page.body_len())?;
    Ok(page.compute_checksum(&body) == page.checksum)
}

#[cfg(test)]
mod tests {
    use super::codecs::{opus_header, vorbis_header};
    use super::page::build_page;
    use super::*;
    use crate::ledger::CorruptionLedger;
    use crate::sizes::lacing_values;
    use crate::{ParseConfig, Unstoppable};
    use std::time::Duration;

    fn page(flags: PageFlags, granule: u64, serial: u32, sequence: u32, packets: &[&[u8]]) -> std::vec::Vec<u8> {
        let lens: std::vec::Vec<usize> = packets.iter().map(|p| p.len()).collect();
        let lacing = lacing_values(&lens, false).unwrap();
        build_page(flags, granule, serial, sequence, &lacing, &packets.concat())
    }

    fn vorbis_file(data_pages: u32, last_granule: u64) -> std::vec::Vec<u8> {
        let mut file = page(PageFlags::FIRST, 0, 0x77, 0, &[&vorbis_header(2, 44100, 128_000)]);
        file.extend(page(PageFlags::empty(), 0, 0x77, 1, &[&b"\x03vorbis"[..], &b"\x05vorbis"[..]]));
        for i in 0..data_pages {
            file.extend(page(PageFlags::empty(), u64::from(i + 1) * 4410, 0x77, i + 2, &[&[0x55; 4000]]));
        }
        file.extend(page(PageFlags::LAST, last_granule, 0x77, data_pages + 2, &[&[0x55; 100]]));
        file
    }

    fn read_bytes(bytes: std::vec::Vec<u8>, config: &ParseConfig) -> (Properties, CorruptionLedger) {
        let mut cursor = std::io::Cursor::new(bytes);
        let mut session = Session::new(&mut cursor, config, &Unstoppable).unwrap();
        let properties = read(&mut session).unwrap();
        (properties, session.ledger)
    }

    #[test]
    fn vorbis_duration_from_last_page() {
        let (properties, ledger) = read_bytes(vorbis_file(3, 441_000), &ParseConfig::default());
        assert_eq!(properties.duration(), Duration::from_secs(10));
        assert_eq!((properties.sample_rate(), properties.channels(), properties.bitrate()), (44100, 2, 128));
        assert!(ledger.is_empty());
    }

    #[test]
    fn identification_header_split_across_pages() {
        let mut header = vorbis_header(1, 8000, 0);
        header.resize(300, 0);
        let mut file = build_page(PageFlags::FIRST, u64::MAX, 9, 0, &lacing_values(&[255], true).unwrap(), &header[..255]);
        file.extend(build_page(PageFlags::CONTINUED, 0, 9, 1, &[45], &header[255..]));
        file.extend(page(PageFlags::LAST, 8000, 9, 2, &[&[1; 10]]));
        let (properties, ledger) = read_bytes(file, &ParseConfig::default());
        assert_eq!(properties.sample_rate(), 8000);
        assert_eq!(properties.duration(), Duration::from_secs(1));
        // No declared bitrate: the file average
        assert!(properties.bitrate() > 0);
        assert!(ledger.is_empty());
    }

    #[test]
    fn truncated_last_page() {
        let mut file = vorbis_file(3, 441_000);
        file.truncate(file.len() - 50);
        let (properties, ledger) = read_bytes(file, &ParseConfig::default());
        assert_eq!(properties.duration(), Duration::from_millis(300));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn accurate_checks_every_page() {
        let mut file = vorbis_file(3, 441_000);
        let middle = file.len() / 2;
        file[middle] ^= 0xFF;
        let (_, ledger) = read_bytes(file.clone(), &ParseConfig::default());
        assert!(ledger.is_empty());
        let accurate = ParseConfig::default().with_read_style(ReadStyle::Accurate);
        let (properties, ledger) = read_bytes(file, &accurate);
        assert_eq!(properties.duration(), Duration::from_secs(10));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn tail_window_widens_for_early_ending_streams() {
        let mut file = page(PageFlags::FIRST, 0, 1, 0, &[&vorbis_header(2, 44100, 0)]);
        file.extend(page(PageFlags::FIRST, 0, 2, 0, &[&opus_header(2, 312, 48000)]));
        file.extend(page(PageFlags::empty(), 0, 1, 1, &[&b"\x03vorbis"[..]]));
        file.extend(page(PageFlags::empty(), 0, 2, 1, &[&b"OpusTags"[..]]));
        let from = file.len() as u64;
        file.extend(page(PageFlags::LAST, 48_312, 2, 2, &[&[0; 50]]));
        for i in 0..20 {
            file.extend(page(PageFlags::empty(), u64::from(i + 1) * 4410, 1, i + 2, &[&[0x55; 4000]]));
        }
        file.extend(page(PageFlags::LAST, 441_000, 1, 22, &[&[0x55; 10]]));
        assert!(file.len() as u64 > FAST_TAIL_WINDOW + 1024);

        let mut cursor = std::io::Cursor::new(file);
        let config = ParseConfig::default().with_read_style(ReadStyle::Fast);
        let mut session = Session::new(&mut cursor, &config, &Unstoppable).unwrap();
        let mut granules = Granules::default();
        last_granules(&mut session, from, FAST_TAIL_WINDOW, &[1, 2], &mut granules).unwrap();
        assert_eq!(granules.get(1), Some(441_000));
        assert_eq!(granules.get(2), Some(48_312));

        let properties = read(&mut session).unwrap();
        assert_eq!(properties.duration(), Duration::from_secs(10));
        assert_eq!(properties.codecs().len(), 2);
        assert!(session.ledger.is_empty());
    }

    #[test]
    fn garbage_between_pages_resynchronizes() {
        let mut file = page(PageFlags::FIRST, 0, 3, 0, &[&opus_header(1, 0, 16000)]);
        file.extend_from_slice(b"junk");
        file.extend(page(PageFlags::LAST, 96_000, 3, 1, &[&b"OpusTags"[..]]));
        let (properties, ledger) = read_bytes(file, &ParseConfig::default());
        assert_eq!(properties.sample_rate(), 16000);
        assert_eq!(properties.duration(), Duration::from_secs(2));
        assert_eq!(ledger.len(), 1);
    }
}
