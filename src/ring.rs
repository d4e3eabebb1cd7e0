//! Circular record buffer over a NOR flash partition
//!
//! [`FlashRing`] owns a sector-aligned partition `[addr_start, addr_end)` of
//! a [`SpiFlash`] device and runs an append-only, wrap-around record log on
//! it. Producers call [`write_data`](FlashRing::write_data); consumers call
//! [`read_data`](FlashRing::read_data) for the oldest unread record and
//! [`mark_as_read`](FlashRing::mark_as_read) to acknowledge it. When the
//! partition fills, the oldest sealed sector is erased and reissued, silently
//! discarding whatever the consumer had not gotten to.
//!
//! Sector ordering rides on 32-bit sequence numbers: `format` hands out
//! `1..=sector_count`, and every recycled sector takes `last_sequence + 1`.
//! The oldest live sector carries `first_sequence`, the sector currently
//! accepting appends carries `write_sequence`, and the sequences of all
//! sectors always form one contiguous run ending at `last_sequence`.
//!
//! All public operations serialize on one reentrant mutex; a flash erase can
//! stall the holder for the duration of the device's erase cycle. Exactly
//! one `FlashRing` may own a partition at a time.

use std::cell::RefCell;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use crate::buffer::DataBuffer;
use crate::cache::{SectorCache, DEFAULT_CACHE_SIZE};
use crate::error::{Result, RingError};
use crate::flash::SpiFlash;
use crate::sector::{
    check_record_header, max_record_size, RecordCommon, Sector, SectorCommon, SectorHeader,
    RECORD_HEADER_SIZE, SECTOR_HEADER_SIZE, SECTOR_MAGIC,
};

/// Offset of the [`SectorCommon`] word within a sector.
const COMMON_OFFSET: u32 = 4;

/// Flag nibble programmed with every new record (all bits still set).
const RECORD_FLAGS_FRESH: u8 = 0xf;

/// Bound on consecutive read-sector recycles inside one `read_data` call.
const READ_ADVANCE_LIMIT: usize = 4;

/// Tunables for a [`FlashRing`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingConfig {
    /// Bound on resident decoded sectors. Affects RAM and the number of SPI
    /// reads per operation, not correctness.
    pub sector_cache_size: usize,
}

impl RingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sector_cache_size(mut self, size: usize) -> Self {
        self.sector_cache_size = size;
        self
    }
}

impl Default for RingConfig {
    fn default() -> Self {
        RingConfig {
            sector_cache_size: DEFAULT_CACHE_SIZE,
        }
    }
}

/// Everything known about one record returned by
/// [`read_data`](FlashRing::read_data).
///
/// Carries a snapshot of the sector's state word; `mark_as_read` compares
/// the snapshot's sequence against the sector's current one to detect that
/// the producer recycled the sector underneath the reader.
#[derive(Debug, Clone)]
pub struct ReadInfo {
    pub sector_num: u16,
    pub sector: SectorCommon,
    pub index: usize,
    pub record: RecordCommon,
    pub data: DataBuffer,
}

/// Aggregate usage counters reported by
/// [`usage_stats`](FlashRing::usage_stats).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UsageStats {
    /// Records written but not yet acknowledged.
    pub record_count: usize,
    /// Payload bytes across those records.
    pub data_size: usize,
    /// Sectors holding no unread data.
    pub free_sectors: usize,
}

struct Geometry {
    addr_start: u32,
    sector_size: usize,
    sector_count: usize,
}

struct Inner<F: SpiFlash> {
    flash: F,
    geometry: Geometry,
    /// One state word per physical sector, kept in sync with every header
    /// mutation.
    meta: Vec<SectorCommon>,
    cache: SectorCache,
    first_sequence: u32,
    write_sequence: u32,
    last_sequence: u32,
    is_valid: bool,
}

/// Handle returned by [`FlashRing::lock`]; the mutex is released on drop.
pub struct RingGuard<'a, F: SpiFlash> {
    _guard: ReentrantMutexGuard<'a, RefCell<Inner<F>>>,
}

/// Persistent circular record buffer on a NOR flash partition.
pub struct FlashRing<F: SpiFlash> {
    addr_start: u32,
    addr_end: u32,
    sector_size: usize,
    sector_count: usize,
    state: ReentrantMutex<RefCell<Inner<F>>>,
}

impl<F: SpiFlash> FlashRing<F> {
    /// Bind a ring to the partition `[addr_start, addr_end)`.
    ///
    /// Both bounds must be sector aligned. The ring starts out not loaded;
    /// call [`load`](Self::load) for an existing partition or
    /// [`format`](Self::format) for a blank one.
    pub fn new(flash: F, addr_start: u32, addr_end: u32) -> Result<Self> {
        Self::with_config(flash, addr_start, addr_end, RingConfig::default())
    }

    pub fn with_config(
        flash: F,
        addr_start: u32,
        addr_end: u32,
        config: RingConfig,
    ) -> Result<Self> {
        if !flash.is_valid() {
            return Err(RingError::DeviceNotValid);
        }
        let sector_size = flash.sector_size();
        if addr_start as usize % sector_size != 0 {
            return Err(RingError::UnalignedStart(addr_start));
        }
        if addr_end as usize % sector_size != 0 {
            return Err(RingError::UnalignedEnd(addr_end));
        }
        if addr_end <= addr_start {
            return Err(RingError::EmptyPartition {
                start: addr_start,
                end: addr_end,
            });
        }
        let sector_count = (addr_end - addr_start) as usize / sector_size;

        let inner = Inner {
            flash,
            geometry: Geometry {
                addr_start,
                sector_size,
                sector_count,
            },
            meta: vec![SectorCommon::default(); sector_count],
            cache: SectorCache::new(config.sector_cache_size),
            first_sequence: 0,
            write_sequence: 0,
            last_sequence: 0,
            is_valid: false,
        };
        Ok(FlashRing {
            addr_start,
            addr_end,
            sector_size,
            sector_count,
            state: ReentrantMutex::new(RefCell::new(inner)),
        })
    }

    pub fn addr_start(&self) -> u32 {
        self.addr_start
    }

    pub fn addr_end(&self) -> u32 {
        self.addr_end
    }

    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    pub fn sector_count(&self) -> usize {
        self.sector_count
    }

    /// Largest payload accepted by [`write_data`](Self::write_data).
    pub fn max_record_size(&self) -> usize {
        max_record_size(self.sector_size)
    }

    /// True after a successful [`load`](Self::load) or
    /// [`format`](Self::format).
    pub fn is_loaded(&self) -> bool {
        self.state.lock().borrow().is_valid
    }

    /// Hold the ring's mutex across several calls.
    ///
    /// The lock is reentrant, so operations invoked while the guard lives
    /// simply nest. Dropping the guard unlocks.
    pub fn lock(&self) -> RingGuard<'_, F> {
        RingGuard {
            _guard: self.state.lock(),
        }
    }

    /// Try to take the mutex without blocking.
    pub fn try_lock(&self) -> Option<RingGuard<'_, F>> {
        self.state
            .try_lock()
            .map(|guard| RingGuard { _guard: guard })
    }

    /// Scan every sector header and rebuild the in-RAM state.
    ///
    /// Fails (leaving the ring unloaded) on a bad magic or a broken
    /// sequence chain; [`fsck`](Self::fsck) or [`format`](Self::format)
    /// recover from that.
    pub fn load(&self) -> Result<()> {
        let guard = self.state.lock();
        let result = guard.borrow_mut().load();
        result
    }

    /// Erase the whole partition and initialize every sector header with
    /// sequences `1..=sector_count`, then load.
    pub fn format(&self) -> Result<()> {
        let guard = self.state.lock();
        let result = guard.borrow_mut().format();
        result
    }

    /// Erase every sector to raw all-ones, without writing headers.
    ///
    /// The ring is left unloaded; only [`format`](Self::format) makes the
    /// partition usable again.
    pub fn erase(&self) -> Result<()> {
        let guard = self.state.lock();
        guard.borrow_mut().erase_all();
        Ok(())
    }

    /// Re-run the load-time consistency checks.
    ///
    /// With `repair`, sectors that fail the scan are erased and reissued
    /// with fresh sequences; if the chain still cannot be validated the
    /// partition is reformatted.
    pub fn fsck(&self, repair: bool) -> Result<()> {
        let guard = self.state.lock();
        let result = guard.borrow_mut().fsck(repair);
        result
    }

    /// Append one record, sealing and advancing the write sector as needed.
    ///
    /// When the partition is full this reclaims the oldest sealed sector,
    /// discarding its unread records.
    pub fn write_data(&self, data: &DataBuffer) -> Result<()> {
        if !data.is_allocated() {
            return Err(RingError::UnallocatedBuffer);
        }
        self.write(data.as_bytes())
    }

    /// [`write_data`](Self::write_data) over a plain byte slice.
    pub fn write(&self, payload: &[u8]) -> Result<()> {
        let guard = self.state.lock();
        let result = guard.borrow_mut().write_data(payload);
        result
    }

    /// Return the oldest unread record, or `None` when the consumer has
    /// caught up with the producer.
    pub fn read_data(&self) -> Result<Option<ReadInfo>> {
        let guard = self.state.lock();
        let result = guard.borrow_mut().read_data();
        result
    }

    /// Acknowledge a record returned by [`read_data`](Self::read_data) so it
    /// is never delivered again.
    ///
    /// Returns `Ok(false)` without touching the flash when the sector was
    /// recycled since the read; the producer wins and the acknowledgement is
    /// simply stale.
    pub fn mark_as_read(&self, info: &ReadInfo) -> Result<bool> {
        let guard = self.state.lock();
        let result = guard.borrow_mut().mark_as_read(info);
        result
    }

    /// Count unread records, their payload bytes, and free sectors.
    pub fn usage_stats(&self) -> Result<UsageStats> {
        let guard = self.state.lock();
        let result = guard.borrow_mut().usage_stats();
        result
    }
}

impl<F: SpiFlash> Inner<F> {
    fn check_loaded(&self) -> Result<()> {
        if self.is_valid {
            Ok(())
        } else {
            Err(RingError::NotLoaded)
        }
    }

    fn sector_addr(&self, sector_num: u16) -> u32 {
        self.geometry.addr_start + sector_num as u32 * self.geometry.sector_size as u32
    }

    fn read_header(&mut self, sector_num: u16) -> SectorHeader {
        let mut bytes = [0u8; SECTOR_HEADER_SIZE];
        self.flash.read(self.sector_addr(sector_num), &mut bytes);
        SectorHeader::from_bytes(&bytes)
    }

    /// Physical sector currently carrying `sequence`.
    fn find_sector(&self, sequence: u32) -> Option<u16> {
        self.meta
            .iter()
            .position(|c| c.sequence == sequence)
            .map(|n| n as u16)
    }

    /// Pull a sector out of the cache, decoding it from flash on a miss.
    fn take_sector(&mut self, sector_num: u16) -> Result<Sector> {
        match self.cache.take(sector_num) {
            Some(sector) => Ok(sector),
            None => self.read_sector(sector_num),
        }
    }

    /// Decode a sector's header and record index from flash.
    fn read_sector(&mut self, sector_num: u16) -> Result<Sector> {
        let addr = self.sector_addr(sector_num);
        let header = self.read_header(sector_num);
        if header.magic != SECTOR_MAGIC {
            self.meta[sector_num as usize].mark_corrupted();
            self.is_valid = false;
            error!(
                sector = sector_num,
                "invalid sector magic {:#010x}", header.magic
            );
            return Err(RingError::InvalidMagic {
                sector: sector_num,
                magic: header.magic,
            });
        }

        let sector_size = self.geometry.sector_size;
        let mut sector = Sector::new(sector_num, header.common);
        let mut offset = SECTOR_HEADER_SIZE;
        while offset + RECORD_HEADER_SIZE <= sector_size {
            let mut word = [0u8; RECORD_HEADER_SIZE];
            self.flash.read(addr + offset as u32, &mut word);
            match check_record_header(u16::from_le_bytes(word), sector_num, offset, sector_size) {
                Ok(None) => break,
                Ok(Some(record)) => {
                    offset += RECORD_HEADER_SIZE + record.size as usize;
                    sector.records.push(record);
                }
                Err(err) => {
                    self.meta[sector_num as usize].mark_corrupted();
                    self.is_valid = false;
                    error!(sector = sector_num, offset, "corrupt record index: {err}");
                    return Err(err);
                }
            }
        }
        sector.trace_dump("read sector");
        Ok(sector)
    }

    /// Initialize a sector header, optionally erasing first, and mirror the
    /// new state into the metadata table and cache.
    fn write_sector_header(&mut self, sector_num: u16, erase: bool, sequence: u32) {
        let addr = self.sector_addr(sector_num);
        if erase {
            self.flash.erase_sector(addr);
        }
        let header = SectorHeader::fresh(sequence);
        self.flash.program(addr, &header.to_bytes());
        self.meta[sector_num as usize] = header.common;
        self.cache.reset(sector_num, header.common);
    }

    /// Append one record to `sector` if it fits. Clears the sector's
    /// STARTED bit on the first append.
    fn append_record(&mut self, sector: &mut Sector, payload: &[u8], flags: u8) -> bool {
        let offset = sector.end_offset();
        let space_left = self.geometry.sector_size - offset;
        if payload.len() + RECORD_HEADER_SIZE > space_left {
            return false;
        }

        let addr = self.sector_addr(sector.sector_num);
        if !sector.common.is_started() {
            self.flash
                .program(addr + COMMON_OFFSET, &SectorCommon::clear_started_bytes());
            sector.common.clear_started();
            self.meta[sector.sector_num as usize] = sector.common;
        }

        let record = RecordCommon::new(payload.len() as u16, flags);
        self.flash
            .program(addr + offset as u32, &record.to_word().to_le_bytes());
        self.flash
            .program(addr + (offset + RECORD_HEADER_SIZE) as u32, payload);
        sector.records.push(record);
        true
    }

    /// Seal `sector`: clear FINALIZED and land the record count and payload
    /// total in the state word. No further appends are possible.
    fn finalize_sector(&mut self, sector: &mut Sector) -> Result<()> {
        let record_count = sector.records.len() as u16;
        let data_size = sector.data_size() as u16;
        let addr = self.sector_addr(sector.sector_num);
        self.flash.program(
            addr + COMMON_OFFSET,
            &SectorCommon::finalize_bytes(record_count, data_size),
        );
        sector.common.clear_finalized();
        sector.common.record_count = record_count;
        sector.common.data_size = data_size;
        self.meta[sector.sector_num as usize] = sector.common;
        trace!(
            sector = sector.sector_num,
            record_count,
            data_size,
            "sector finalized"
        );
        self.validate_sector(sector)
    }

    /// Cross-check a sector's state word against its record index.
    fn validate_sector(&mut self, sector: &Sector) -> Result<()> {
        let counts_ok = !sector.common.is_finalized()
            || (sector.common.record_count as usize == sector.records.len()
                && sector.common.data_size as usize == sector.data_size());
        if sector.end_offset() <= self.geometry.sector_size && counts_ok {
            return Ok(());
        }
        self.meta[sector.sector_num as usize].mark_corrupted();
        self.is_valid = false;
        error!(sector = sector.sector_num, "sector failed validation");
        Err(RingError::ValidationFailed {
            sector: sector.sector_num,
        })
    }

    /// Copy the payload of `sector.records[index]` off the flash.
    fn read_record(&mut self, sector: &Sector, index: usize) -> Result<DataBuffer> {
        let record = sector
            .records
            .get(index)
            .copied()
            .ok_or(RingError::RecordNotFound {
                sector: sector.sector_num,
                index,
            })?;
        let offset = sector.record_offset(index) + RECORD_HEADER_SIZE;
        let addr = self.sector_addr(sector.sector_num) + offset as u32;
        let mut data = DataBuffer::new();
        self.flash.read(addr, data.allocate(record.size as usize));
        Ok(data)
    }

    fn load(&mut self) -> Result<()> {
        self.is_valid = false;
        self.cache.clear();

        let count = self.geometry.sector_count;
        for n in 0..count {
            let header = self.read_header(n as u16);
            if header.magic != SECTOR_MAGIC {
                let mut common = header.common;
                common.mark_corrupted();
                self.meta[n] = common;
                error!(sector = n, "invalid sector magic {:#010x}", header.magic);
                return Err(RingError::InvalidMagic {
                    sector: n as u16,
                    magic: header.magic,
                });
            }
            trace!(
                sector = n,
                sequence = header.common.sequence,
                "scanned sector flags={:#x}",
                header.common.flags
            );
            self.meta[n] = header.common;
        }

        let first = self.meta.iter().map(|c| c.sequence).min().unwrap_or(0);
        let last = self.meta.iter().map(|c| c.sequence).max().unwrap_or(0);
        let write = self
            .meta
            .iter()
            .filter(|c| !c.is_finalized())
            .map(|c| c.sequence)
            .min()
            .ok_or(RingError::MissingWriteSector)?;

        // Walking physically from the oldest sector must visit sequences in
        // +1 steps; anything else means the ring structure is damaged.
        let origin = self
            .meta
            .iter()
            .position(|c| c.sequence == first)
            .unwrap_or(0);
        for i in 0..count {
            let n = (origin + i) % count;
            let expected = first + i as u32;
            if self.meta[n].sequence != expected {
                error!(
                    sector = n,
                    expected,
                    found = self.meta[n].sequence,
                    "sequence chain broken"
                );
                return Err(RingError::BrokenChain { sector: n as u16 });
            }
        }

        self.first_sequence = first;
        self.write_sequence = write;
        self.last_sequence = last;
        self.is_valid = true;
        debug!(first, write, last, "load complete");
        Ok(())
    }

    fn format(&mut self) -> Result<()> {
        debug!(sectors = self.geometry.sector_count, "formatting partition");
        for n in 0..self.geometry.sector_count {
            self.write_sector_header(n as u16, true, n as u32 + 1);
        }
        self.load()
    }

    fn erase_all(&mut self) {
        debug!(sectors = self.geometry.sector_count, "erasing partition");
        for n in 0..self.geometry.sector_count {
            let addr = self.sector_addr(n as u16);
            self.flash.erase_sector(addr);
        }
        self.meta.fill(SectorCommon::default());
        self.cache.clear();
        self.is_valid = false;
    }

    fn fsck(&mut self, repair: bool) -> Result<()> {
        // Corruption marks raised since the last load live only in RAM;
        // snapshot them before the rescan rebuilds the table.
        let flagged: Vec<u16> = self
            .meta
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_corrupted())
            .map(|(n, _)| n as u16)
            .collect();

        let loaded = self.load();
        if !repair {
            return loaded;
        }
        match loaded {
            Ok(()) if flagged.is_empty() => Ok(()),
            outcome => {
                if let Err(err) = &outcome {
                    warn!(error = %err, "consistency check failed, repairing");
                }
                self.repair(&flagged)
            }
        }
    }

    /// Erase every damaged sector and reissue it with the sequence its
    /// physical position demands, so the surviving chain stays intact.
    /// Reformats if the chain cannot be reconstructed.
    fn repair(&mut self, flagged: &[u16]) -> Result<()> {
        let count = self.geometry.sector_count;
        let mut sequences: Vec<Option<u32>> = Vec::with_capacity(count);
        for n in 0..count {
            let header = self.read_header(n as u16);
            let damaged = header.magic != SECTOR_MAGIC
                || header.common.is_corrupted()
                || flagged.contains(&(n as u16));
            sequences.push((!damaged).then_some(header.common.sequence));
        }

        let last = sequences.iter().flatten().copied().max();
        let Some(last) = last.filter(|&l| l >= count as u32 - 1) else {
            // Nothing usable survives (blank or fully damaged partition).
            warn!("no usable sectors survive, reformatting");
            return self.format();
        };
        let first = last - (count as u32 - 1);

        // A damaged sector's sequence follows from its physical
        // predecessor: +1, wrapping back to `first` after `last`. Resolve
        // repeatedly so runs of damaged sectors heal front to back.
        let mut progress = true;
        while progress {
            progress = false;
            for n in 0..count {
                if sequences[n].is_some() {
                    continue;
                }
                let prev = (n + count - 1) % count;
                let Some(prev_seq) = sequences[prev] else {
                    continue;
                };
                let seq = if prev_seq == last { first } else { prev_seq + 1 };
                warn!(sector = n, sequence = seq, "resetting damaged sector");
                self.write_sector_header(n as u16, true, seq);
                sequences[n] = Some(seq);
                progress = true;
            }
        }

        if sequences.iter().all(Option::is_some) && self.load().is_ok() {
            return Ok(());
        }
        warn!("sequence chain unrecoverable, reformatting");
        self.format()
    }

    fn write_data(&mut self, payload: &[u8]) -> Result<()> {
        self.check_loaded()?;
        let max = max_record_size(self.geometry.sector_size);
        if payload.len() > max {
            return Err(RingError::RecordTooLarge {
                size: payload.len(),
                max,
            });
        }

        let n = self
            .find_sector(self.write_sequence)
            .ok_or(RingError::SequenceNotFound {
                sequence: self.write_sequence,
            })?;
        let mut sector = self.take_sector(n)?;
        if self.append_record(&mut sector, payload, RECORD_FLAGS_FRESH) {
            self.cache.insert(sector);
            return Ok(());
        }

        // Sector full: seal it and move to the next sector in physical
        // order, reclaiming it from the reader if it still holds data.
        self.finalize_sector(&mut sector)?;
        self.cache.insert(sector);
        self.write_sequence += 1;

        let next = ((n as usize + 1) % self.geometry.sector_count) as u16;
        if self.meta[next as usize].is_started() {
            debug!(
                sector = next,
                sequence = self.meta[next as usize].sequence,
                "reclaiming oldest sector"
            );
            if self.meta[next as usize].sequence == self.first_sequence {
                self.first_sequence += 1;
            }
            self.last_sequence += 1;
            self.write_sector_header(next, true, self.last_sequence);
        }
        if self.meta[next as usize].sequence != self.write_sequence {
            self.is_valid = false;
            return Err(RingError::BrokenChain { sector: next });
        }

        let mut sector = self.take_sector(next)?;
        if !self.append_record(&mut sector, payload, RECORD_FLAGS_FRESH) {
            // A sector-max record always fits a fresh sector.
            self.is_valid = false;
            return Err(RingError::NoSpaceAfterReclaim { sector: next });
        }
        self.cache.insert(sector);
        Ok(())
    }

    fn read_data(&mut self) -> Result<Option<ReadInfo>> {
        self.check_loaded()?;
        for _ in 0..READ_ADVANCE_LIMIT {
            let n = self
                .find_sector(self.first_sequence)
                .ok_or(RingError::SequenceNotFound {
                    sequence: self.first_sequence,
                })?;
            let sector = self.take_sector(n)?;

            if let Some(index) = sector.first_unread() {
                let data = self.read_record(&sector, index)?;
                let info = ReadInfo {
                    sector_num: n,
                    sector: sector.common,
                    index,
                    record: sector.records[index],
                    data,
                };
                self.cache.insert(sector);
                return Ok(Some(info));
            }

            let finalized = sector.common.is_finalized();
            self.cache.insert(sector);
            if !finalized {
                // Nothing unread and the sector is still accepting appends.
                return Ok(None);
            }
            trace!(sector = n, "read sector drained, recycling");
            self.recycle(n);
        }
        warn!("read sector advance limit reached");
        Ok(None)
    }

    /// Retire the oldest sector: erase it and reissue it as the newest.
    fn recycle(&mut self, sector_num: u16) {
        self.first_sequence += 1;
        self.last_sequence += 1;
        self.write_sector_header(sector_num, true, self.last_sequence);
    }

    fn mark_as_read(&mut self, info: &ReadInfo) -> Result<bool> {
        self.check_loaded()?;
        if info.sector_num as usize >= self.geometry.sector_count {
            return Err(RingError::RecordNotFound {
                sector: info.sector_num,
                index: info.index,
            });
        }

        let mut sector = self.take_sector(info.sector_num)?;
        if sector.common.sequence != info.sector.sequence {
            debug!(
                sector = info.sector_num,
                held = info.sector.sequence,
                current = sector.common.sequence,
                "stale acknowledgement ignored"
            );
            self.cache.insert(sector);
            return Ok(false);
        }
        if info.index >= sector.records.len() {
            self.cache.insert(sector);
            return Ok(false);
        }

        if info.index + 1 == sector.records.len() && sector.common.is_finalized() {
            // Last record of a sealed sector: retire the whole sector
            // instead of burning a program cycle on the READ bit.
            self.cache.insert(sector);
            self.recycle(info.sector_num);
            return Ok(true);
        }

        let offset = sector.record_offset(info.index);
        let addr = self.sector_addr(info.sector_num) + offset as u32;
        self.flash
            .program(addr, &RecordCommon::clear_read_word().to_le_bytes());
        sector.records[info.index].clear_read();
        self.cache.insert(sector);
        Ok(true)
    }

    fn usage_stats(&mut self) -> Result<UsageStats> {
        self.check_loaded()?;
        let mut stats = UsageStats::default();
        for n in 0..self.geometry.sector_count {
            let common = self.meta[n];
            let scan = common.sequence == self.first_sequence
                || common.sequence == self.write_sequence
                || (common.is_started() && !common.is_finalized());
            if scan {
                // The read and write sectors can be partially consumed, so
                // their unread records are counted from the record index.
                let sector = self.take_sector(n as u16)?;
                let mut records = 0usize;
                let mut bytes = 0usize;
                for record in sector.records.iter().filter(|r| r.is_unread()) {
                    records += 1;
                    bytes += record.size as usize;
                }
                if records == 0 {
                    stats.free_sectors += 1;
                } else {
                    stats.record_count += records;
                    stats.data_size += bytes;
                }
                self.cache.insert(sector);
            } else if common.is_started() {
                stats.record_count += common.record_count as usize;
                stats.data_size += common.data_size as usize;
            } else {
                stats.free_sectors += 1;
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::MemFlash;

    fn small_ring(sectors: usize) -> FlashRing<MemFlash> {
        let flash = MemFlash::new(sectors * 4096);
        FlashRing::new(flash, 0, (sectors * 4096) as u32).unwrap()
    }

    fn sequences(ring: &FlashRing<MemFlash>) -> (u32, u32, u32) {
        let guard = ring.state.lock();
        let inner = guard.borrow();
        (
            inner.first_sequence,
            inner.write_sequence,
            inner.last_sequence,
        )
    }

    #[test]
    fn test_new_rejects_unaligned_partition() {
        let flash = MemFlash::new(64 * 1024);
        assert!(matches!(
            FlashRing::new(flash, 100, 8192),
            Err(RingError::UnalignedStart(100))
        ));

        let flash = MemFlash::new(64 * 1024);
        assert!(matches!(
            FlashRing::new(flash, 0, 8200),
            Err(RingError::UnalignedEnd(8200))
        ));

        let flash = MemFlash::new(64 * 1024);
        assert!(matches!(
            FlashRing::new(flash, 4096, 4096),
            Err(RingError::EmptyPartition { .. })
        ));
    }

    #[test]
    fn test_operations_require_load() {
        let ring = small_ring(4);
        assert!(matches!(ring.write(b"x"), Err(RingError::NotLoaded)));
        assert!(matches!(ring.read_data(), Err(RingError::NotLoaded)));
        assert!(matches!(ring.usage_stats(), Err(RingError::NotLoaded)));
        assert!(!ring.is_loaded());
    }

    #[test]
    fn test_load_of_blank_flash_fails() {
        let ring = small_ring(4);
        assert!(matches!(
            ring.load(),
            Err(RingError::InvalidMagic { sector: 0, .. })
        ));
    }

    #[test]
    fn test_format_establishes_sequences() {
        let ring = small_ring(4);
        ring.format().unwrap();
        assert!(ring.is_loaded());
        assert_eq!(sequences(&ring), (1, 1, 4));

        let guard = ring.state.lock();
        let inner = guard.borrow();
        for (n, common) in inner.meta.iter().enumerate() {
            assert_eq!(common.sequence, n as u32 + 1);
            assert!(!common.is_started());
            assert!(!common.is_finalized());
        }
    }

    #[test]
    fn test_first_append_clears_started_on_flash() {
        let ring = small_ring(4);
        ring.format().unwrap();
        ring.write(b"hello").unwrap();

        let guard = ring.state.lock();
        let mut inner = guard.borrow_mut();
        assert!(inner.meta[0].is_started());
        let header = inner.read_header(0);
        assert!(header.common.is_started());
        assert!(!header.common.is_finalized());
        assert_eq!(header.common.sequence, 1);
    }

    #[test]
    fn test_record_too_large_is_rejected() {
        let ring = small_ring(4);
        ring.format().unwrap();
        let payload = vec![0u8; ring.max_record_size() + 1];
        assert!(matches!(
            ring.write(&payload),
            Err(RingError::RecordTooLarge { .. })
        ));
        // The cap itself fits.
        let payload = vec![0u8; ring.max_record_size()];
        ring.write(&payload).unwrap();
    }

    #[test]
    fn test_full_sector_is_finalized_and_write_advances() {
        let ring = small_ring(4);
        ring.format().unwrap();

        // Two max-size records: the second cannot fit in sector 0.
        let payload = vec![0xaa; ring.max_record_size()];
        ring.write(&payload).unwrap();
        ring.write(&payload).unwrap();

        assert_eq!(sequences(&ring), (1, 2, 4));
        let guard = ring.state.lock();
        let inner = guard.borrow();
        assert!(inner.meta[0].is_finalized());
        assert_eq!(inner.meta[0].record_count, 1);
        assert!(inner.meta[1].is_started());
        assert!(!inner.meta[1].is_finalized());
    }

    #[test]
    fn test_wrap_reclaims_oldest_sector() {
        let ring = small_ring(2);
        ring.format().unwrap();

        let payload = vec![0x55; ring.max_record_size()];
        ring.write(&payload).unwrap(); // sector 0, seq 1
        ring.write(&payload).unwrap(); // sector 1, seq 2
        ring.write(&payload).unwrap(); // wraps: sector 0 reissued as seq 3

        assert_eq!(sequences(&ring), (2, 3, 3));
        let guard = ring.state.lock();
        let inner = guard.borrow();
        assert_eq!(inner.meta[0].sequence, 3);
        assert!(inner.meta[0].is_started());
    }

    #[test]
    fn test_read_drained_write_sector_returns_none() {
        let ring = small_ring(4);
        ring.format().unwrap();
        ring.write(b"only").unwrap();

        let info = ring.read_data().unwrap().unwrap();
        assert!(ring.mark_as_read(&info).unwrap());
        // The record lived in the (unsealed) write sector, so the READ bit
        // was cleared in place and there is nothing left to return.
        assert!(ring.read_data().unwrap().is_none());
        assert_eq!(sequences(&ring), (1, 1, 4));
    }

    #[test]
    fn test_ack_of_last_record_in_sealed_sector_recycles_it() {
        let ring = small_ring(4);
        ring.format().unwrap();

        let payload = vec![0x11; ring.max_record_size()];
        ring.write(&payload).unwrap();
        ring.write(b"next sector").unwrap(); // seals sector 0

        let info = ring.read_data().unwrap().unwrap();
        assert_eq!(info.sector_num, 0);
        assert!(ring.mark_as_read(&info).unwrap());

        // Sector 0 was erased and reissued as the newest sequence.
        assert_eq!(sequences(&ring), (2, 2, 5));
        let guard = ring.state.lock();
        let inner = guard.borrow();
        assert_eq!(inner.meta[0].sequence, 5);
        assert!(!inner.meta[0].is_started());
    }

    #[test]
    fn test_stale_ack_after_reclaim_is_ignored() {
        let ring = small_ring(2);
        ring.format().unwrap();

        ring.write(b"victim").unwrap();
        let info = ring.read_data().unwrap().unwrap();

        // Overrun the reader until sector 0 is recycled.
        let payload = vec![0x77; ring.max_record_size()];
        ring.write(&payload).unwrap();
        ring.write(&payload).unwrap();
        ring.write(&payload).unwrap();

        assert!(!ring.mark_as_read(&info).unwrap());
        // The next read is the current oldest record, not the stale one.
        let next = ring.read_data().unwrap().unwrap();
        assert_eq!(next.data.as_bytes(), &payload[..]);
    }

    #[test]
    fn test_usage_stats_track_unread_records() {
        let ring = small_ring(4);
        ring.format().unwrap();
        assert_eq!(
            ring.usage_stats().unwrap(),
            UsageStats {
                record_count: 0,
                data_size: 0,
                free_sectors: 4
            }
        );

        ring.write(b"12345").unwrap();
        assert_eq!(
            ring.usage_stats().unwrap(),
            UsageStats {
                record_count: 1,
                data_size: 5,
                free_sectors: 3
            }
        );

        let info = ring.read_data().unwrap().unwrap();
        ring.mark_as_read(&info).unwrap();
        assert_eq!(
            ring.usage_stats().unwrap(),
            UsageStats {
                record_count: 0,
                data_size: 0,
                free_sectors: 4
            }
        );
    }

    #[test]
    fn test_reload_preserves_state() {
        let ring = small_ring(4);
        ring.format().unwrap();
        ring.write(b"one").unwrap();
        ring.write(b"two").unwrap();

        let before = ring.usage_stats().unwrap();
        let seq_before = sequences(&ring);
        ring.load().unwrap();
        assert_eq!(ring.usage_stats().unwrap(), before);
        assert_eq!(sequences(&ring), seq_before);

        let info = ring.read_data().unwrap().unwrap();
        assert_eq!(info.data.as_bytes(), b"one");
    }

    #[test]
    fn test_unallocated_buffer_is_rejected() {
        let ring = small_ring(4);
        ring.format().unwrap();
        assert!(matches!(
            ring.write_data(&DataBuffer::new()),
            Err(RingError::UnallocatedBuffer)
        ));

        // A zero-length allocated buffer is a valid (empty) record.
        let mut empty = DataBuffer::new();
        empty.allocate(0);
        ring.write_data(&empty).unwrap();
        let info = ring.read_data().unwrap().unwrap();
        assert_eq!(info.data.len(), 0);
        assert!(info.data.is_allocated());
    }

    #[test]
    fn test_geometry_accessors() {
        let flash = MemFlash::new(64 * 1024);
        let ring = FlashRing::new(flash, 8192, 40960).unwrap();
        assert_eq!(ring.addr_start(), 8192);
        assert_eq!(ring.addr_end(), 40960);
        assert_eq!(ring.sector_size(), 4096);
        assert_eq!(ring.sector_count(), 8);
        assert_eq!(ring.max_record_size(), 4082);
    }

    #[test]
    fn test_tiny_sector_cache_stays_correct() {
        let flash = MemFlash::new(16 * 4096);
        let ring = FlashRing::with_config(
            flash,
            0,
            16 * 4096,
            RingConfig::new().sector_cache_size(1),
        )
        .unwrap();
        ring.format().unwrap();

        // Bounce between sectors so every operation misses the cache.
        let payload = vec![0x33; ring.max_record_size()];
        for _ in 0..6 {
            ring.write(&payload).unwrap();
            ring.write(b"small").unwrap();
        }

        let mut seen = 0;
        while let Some(info) = ring.read_data().unwrap() {
            assert!(ring.mark_as_read(&info).unwrap());
            seen += 1;
        }
        assert_eq!(seen, 12);
    }

    #[test]
    fn test_lock_guard_nests_with_operations() {
        let ring = small_ring(4);
        ring.format().unwrap();

        let guard = ring.lock();
        ring.write(b"under guard").unwrap();
        let info = ring.read_data().unwrap().unwrap();
        assert_eq!(info.data.as_bytes(), b"under guard");
        drop(guard);

        assert!(ring.try_lock().is_some());
    }
}
