//! Persistent circular record buffer for SPI NOR flash
//!
//! `flashring` stores variable-length byte records on a NOR flash partition
//! and hands them back oldest-first. When the partition fills, the oldest
//! sealed sector is erased and reused, so a producer is never blocked by a
//! slow consumer — the consumer just loses the oldest data.
//!
//! ## Features
//!
//! - **4 KiB sector granularity** matching the erase unit of common SPI NOR
//!   parts
//! - **In-place state transitions** that exploit NOR program semantics
//!   (bits only clear), so appending and acknowledging records never
//!   rewrites a sector
//! - **O(sector) recovery**: loading scans one 12-byte header per sector
//! - **Bounded RAM**: 8 bytes of metadata per sector plus a small cache of
//!   decoded sectors
//! - **At-most-once delivery** across producer overruns, verified by
//!   sequence snapshots
//!
//! ## Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Sector n (4096 bytes)                        │
//! ├──────────────────────────────────────────────┤
//! │ 0..4   magic 0x0CEB6443                      │
//! │ 4..8   sequence                              │
//! │ 8..12  flags / record count / payload total  │
//! ├──────────────────────────────────────────────┤
//! │ 12..   [size | flags][payload] repeated      │
//! │        until erased flash (size = 0xFFF)     │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use flashring::{DataBuffer, FlashRing, MemFlash};
//!
//! let flash = MemFlash::new(1024 * 1024);
//! let ring = FlashRing::new(flash, 0, 1024 * 1024)?;
//! ring.format()?;
//!
//! ring.write_data(&DataBuffer::from_str("hello"))?;
//!
//! let info = ring.read_data()?.expect("a record was just written");
//! assert_eq!(info.data.as_cstr().to_bytes(), b"hello");
//! ring.mark_as_read(&info)?;
//! # Ok::<(), flashring::RingError>(())
//! ```

pub mod buffer;
pub mod cache;
pub mod error;
pub mod flash;
pub mod ring;
pub mod sector;

pub use buffer::DataBuffer;
pub use error::{Result, RingError};
pub use flash::{MemFlash, SpiFlash};
pub use ring::{FlashRing, ReadInfo, RingConfig, RingGuard, UsageStats};
pub use sector::{RecordCommon, Sector, SectorCommon, SectorHeader, SECTOR_MAGIC};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
