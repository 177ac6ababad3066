use anyhow::{Context, Result};
use clap::Parser;
use diskpatch::disk::{BlockDevice, ImageFile, SECTOR_SIZE};
use diskpatch::table::{self, GptHeader, PartitionKind, TableFormat};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// CLI tool to list the partitions of a disk node or image file
#[derive(Parser, Debug)]
#[clap(name = "diskpatch-partition-lister", about = "List partitions on a disk")]
struct Args {
    /// Path to the disk device or image (e.g., /dev/sda, \\.\PhysicalDrive0, disk.img)
    #[clap(short, long)]
    device: PathBuf,

    /// Show detailed partition information
    #[clap(short, long)]
    verbose: bool,

    /// Check the GPT entry array CRC
    #[clap(long)]
    verify: bool,

    /// Dump the first sectors in hex instead of parsing them
    #[clap(long)]
    raw: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(if args.verbose { "debug" } else { "warn" })
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .init();

    // Opened read-only: listing never writes
    let mut disk = ImageFile::open(&args.device)
        .with_context(|| format!("Failed to open {}", args.device.display()))?;
    info!("{} has {} sectors", args.device.display(), disk.total_sectors());

    if args.raw {
        return dump_raw_sectors(&mut disk, 4);
    }

    let format = table::probe_format(&mut disk)
        .with_context(|| format!("No partition table on {}", args.device.display()))?;
    let partitions = table::read_partitions(&mut disk)
        .with_context(|| format!("Failed to read {} partition table", format))?;

    if partitions.is_empty() {
        println!("No partitions found on device: {}", args.device.display());
    } else {
        println!(
            "Found {} partitions on device: {} ({})",
            partitions.len(),
            args.device.display(),
            format
        );
    }

    for p in &partitions {
        let size_mb = p.len_sectors.saturating_mul(SECTOR_SIZE as u64) as f64 / (1024.0 * 1024.0);
        match &p.kind {
            PartitionKind::Mbr { type_id, active } => println!(
                "{}. type {:02X}{} start {} sectors {} ({:.2} MB)",
                p.display_number(),
                type_id,
                if *active { " active" } else { "" },
                p.start_lba,
                p.len_sectors,
                size_mb
            ),
            PartitionKind::Gpt {
                unique_guid, name, ..
            } => println!(
                "{}. {}: {} ({:.2} MB)",
                p.display_number(),
                if name.is_empty() { "(unnamed)" } else { name },
                unique_guid,
                size_mb
            ),
        }
        if args.verbose {
            println!(
                "   first {} last {} entry at sector {} + 0x{:X}",
                p.start_lba,
                p.end_lba().saturating_sub(1),
                p.table_lba,
                p.entry_offset
            );
            if let PartitionKind::Gpt { type_guid, attributes, .. } = &p.kind {
                println!("   type {} attributes {:016X}", type_guid, attributes);
            }
        }
    }

    if format == TableFormat::Gpt && (args.verify || args.verbose) {
        let header = GptHeader::find(&mut disk)?;
        println!(
            "GPT header at sector {} (sector size {}), {} entries of {} bytes",
            header.header_lba,
            SECTOR_SIZE << header.sector_shift,
            header.num_partition_entries,
            header.partition_entry_size
        );
        if header.entries_crc_matches(&mut disk)? {
            println!("Entry array CRC {:08X} matches", header.partition_entry_array_crc32);
        } else {
            warn!("GPT entry array CRC mismatch");
            println!("Entry array CRC {:08X} does NOT match", header.partition_entry_array_crc32);
        }
    }

    Ok(())
}

/// Print the first `sectors` sectors in hex, 32 bytes per line
fn dump_raw_sectors<D: BlockDevice>(disk: &mut D, sectors: u64) -> Result<()> {
    let sectors = sectors.min(disk.total_sectors());
    for lba in 0..sectors {
        let data = disk.read_sector(lba)?;
        debug!("dumping sector {}", lba);
        println!("=== LBA {} ===", lba);
        for (i, line) in data.chunks(32).enumerate() {
            println!("{:04X}: {}", i * 32, hex::encode(line));
        }
    }
    Ok(())
}
