//! Basic flashring usage
//!
//! Demonstrates the core flow against an in-memory flash emulation:
//! - formatting a partition
//! - writing records
//! - reading and acknowledging them oldest-first
//! - usage statistics and wrap-around loss
//!
//! Run with: cargo run --example basic

use flashring::{DataBuffer, FlashRing, MemFlash};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    println!("=== flashring basic usage ===\n");

    // A 64 KiB partition: 16 sectors of 4 KiB.
    let flash = MemFlash::new(64 * 1024);
    let ring = FlashRing::new(flash, 0, 64 * 1024)?;

    println!("1. Formatting {} sectors...", ring.sector_count());
    ring.format()?;

    println!("2. Writing events...");
    for event in ["boot", "connect", "publish temperature=21.5", "sleep"] {
        ring.write_data(&DataBuffer::from_str(event))?;
        println!("   + {event}");
    }

    let stats = ring.usage_stats()?;
    println!(
        "\n3. Usage: {} records, {} bytes, {} free sectors",
        stats.record_count, stats.data_size, stats.free_sectors
    );

    println!("\n4. Draining oldest-first...");
    while let Some(info) = ring.read_data()? {
        println!("   - {}", info.data.as_str_lossy());
        ring.mark_as_read(&info)?;
    }

    println!("\n5. Overrunning the partition (writes never block)...");
    let big = vec![0x42u8; ring.max_record_size()];
    for _ in 0..ring.sector_count() + 4 {
        ring.write(&big)?;
    }
    let stats = ring.usage_stats()?;
    println!(
        "   oldest sectors were reclaimed; {} records survive",
        stats.record_count
    );

    println!("\nDone.");
    Ok(())
}
