use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use diskpatch::boot::{self, MbrLoader, MbrSource, PayloadStore, PbrLoader};
use diskpatch::config::Settings;
use diskpatch::disk::{BlockDevice, ImageFile, RawDisk, list_disks};
use diskpatch::extract::ExtractSource;
use diskpatch::table::{self, PartitionKind};
use diskpatch::{DiskContext, OpenOptions, edit, fat, logging, probe, utils};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, warn};

/// Edit partition tables and boot records of disks and disk images
#[derive(Parser, Debug)]
#[command(name = "diskpatch", version)]
struct Cli {
    /// Settings file (defaults to diskpatch.toml in the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding vendor boot payloads; overrides the settings file
    #[arg(long, global = true)]
    payload_dir: Option<PathBuf>,

    /// Log more; repeat for trace output
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

/// A disk number, or the path of a disk node or image file
#[derive(Debug, Clone)]
enum DiskSpec {
    Number(u32),
    Path(PathBuf),
}

impl FromStr for DiskSpec {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.is_empty() {
            return Err("empty disk".to_string());
        }
        Ok(match s.parse::<u32>() {
            Ok(number) => DiskSpec::Number(number),
            Err(_) => DiskSpec::Path(PathBuf::from(s)),
        })
    }
}

impl fmt::Display for DiskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskSpec::Number(n) => write!(f, "disk {}", n),
            DiskSpec::Path(p) => write!(f, "{}", p.display()),
        }
    }
}

impl DiskSpec {
    fn open(&self) -> Result<RawDisk> {
        let disk = match self {
            DiskSpec::Number(n) => RawDisk::open(*n),
            DiskSpec::Path(p) => RawDisk::open_path(p),
        };
        disk.with_context(|| format!("Failed to open {}", self))
    }

    fn open_partition(&self, partition: u32, lock_volume: bool) -> Result<DiskContext> {
        let disk = self.open()?;
        DiskContext::open_disk(disk, partition, OpenOptions { lock_volume })
            .with_context(|| format!("Failed to open partition {} of {}", partition, self))
    }
}

fn parse_type_id(s: &str) -> std::result::Result<u8, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u8::from_str_radix(digits, 16).map_err(|e| format!("'{}' is not a hex type byte: {}", s, e))
}

/// FAT variant for `mkfs`
#[derive(Debug, Clone, Copy, ValueEnum)]
enum FatVariant {
    Fat12,
    Fat16,
    Fat32,
}

impl From<FatVariant> for fat::FatType {
    fn from(variant: FatVariant) -> Self {
        match variant {
            FatVariant::Fat12 => fat::FatType::Fat12,
            FatVariant::Fat16 => fat::FatType::Fat16,
            FatVariant::Fat32 => fat::FatType::Fat32,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List disks, or the partitions of one disk
    List {
        disk: Option<DiskSpec>,
        /// Include system disks
        #[arg(long)]
        all: bool,
        #[arg(long)]
        json: bool,
    },
    /// Show the filesystem and reserved sectors of a partition
    Probe { disk: DiskSpec, partition: u32 },
    /// Write boot code to the MBR of a disk
    Setmbr {
        disk: DiskSpec,
        /// Built-in or payload-directory boot code
        #[arg(long, required_unless_present = "image", conflicts_with = "image")]
        loader: Option<MbrLoader>,
        /// Boot sector image file
        #[arg(long)]
        image: Option<PathBuf>,
        /// Keep the disk signature and partition table when writing an image
        #[arg(long, conflicts_with = "no_keep_table")]
        keep_table: bool,
        /// Overwrite the partition table with the image's bytes
        #[arg(long)]
        no_keep_table: bool,
    },
    /// Install a boot record into a partition
    Setpbr {
        disk: DiskSpec,
        partition: u32,
        #[arg(long)]
        loader: PbrLoader,
    },
    /// Print the type byte of an MBR entry (1 to 4)
    Getid { disk: DiskSpec, index: u32 },
    /// Change the type byte of an MBR entry, e.g. `setid 1 1 0x07`
    Setid {
        disk: DiskSpec,
        index: u32,
        #[arg(value_parser = parse_type_id)]
        type_id: u8,
    },
    /// Make an MBR entry the only active one
    Setactive { disk: DiskSpec, index: u32 },
    /// Exchange two MBR entries
    Swap { disk: DiskSpec, a: u32, b: u32 },
    /// List a directory of a FAT partition
    Ls {
        disk: DiskSpec,
        partition: u32,
        #[arg(default_value = "/")]
        path: String,
    },
    /// Print a file of a FAT partition
    Cat { disk: DiskSpec, partition: u32, path: String },
    /// Save a file of a FAT partition to the host
    Dump {
        disk: DiskSpec,
        partition: u32,
        path: String,
        dest: PathBuf,
    },
    /// Copy a host file into a FAT partition
    Copy {
        disk: DiskSpec,
        partition: u32,
        src: PathBuf,
        dest: String,
    },
    /// Create a directory, with parents, in a FAT partition
    Mkdir { disk: DiskSpec, partition: u32, path: String },
    /// Delete a file or empty directory of a FAT partition
    Remove {
        disk: DiskSpec,
        partition: u32,
        path: String,
        /// Delete directories with everything in them
        #[arg(short, long)]
        recursive: bool,
    },
    /// Rename a file or directory, or move it into an existing directory
    Move {
        disk: DiskSpec,
        partition: u32,
        src: String,
        dest: String,
    },
    /// Create a new FAT filesystem on a partition
    Mkfs {
        disk: DiskSpec,
        partition: u32,
        /// FAT variant; picked from the partition size when omitted
        #[arg(long, value_enum)]
        fat: Option<FatVariant>,
        /// Cluster size in bytes
        #[arg(long)]
        cluster_size: Option<u32>,
        #[arg(long)]
        label: Option<String>,
    },
    /// Print the volume label of a FAT partition, set it, or clear it
    Label {
        disk: DiskSpec,
        partition: u32,
        label: Option<String>,
        #[arg(long, conflicts_with = "label")]
        clear: bool,
    },
    /// Copy every file of a FAT or ISO9660 image into a FAT partition
    Extract {
        disk: DiskSpec,
        partition: u32,
        image: PathBuf,
    },
}

impl Command {
    fn disk(&self) -> Option<&DiskSpec> {
        match self {
            Command::List { disk, .. } => disk.as_ref(),
            Command::Probe { disk, .. }
            | Command::Setmbr { disk, .. }
            | Command::Setpbr { disk, .. }
            | Command::Getid { disk, .. }
            | Command::Setid { disk, .. }
            | Command::Setactive { disk, .. }
            | Command::Swap { disk, .. }
            | Command::Ls { disk, .. }
            | Command::Cat { disk, .. }
            | Command::Dump { disk, .. }
            | Command::Copy { disk, .. }
            | Command::Mkdir { disk, .. }
            | Command::Remove { disk, .. }
            | Command::Move { disk, .. }
            | Command::Mkfs { disk, .. }
            | Command::Label { disk, .. }
            | Command::Extract { disk, .. } => Some(disk),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load(cli.config.as_deref())?;
    let filter = logging::verbosity_filter(cli.verbose).unwrap_or(settings.log_filter.as_str());
    let _guard = logging::init(filter, settings.log_dir.as_deref())?;

    // Image paths need no privileges, OS disks do
    if !matches!(cli.command.disk(), Some(DiskSpec::Path(_))) {
        if let Some(warning) = utils::elevation_warning() {
            warn!("{}", warning);
        }
    }

    let payloads = PayloadStore::new(cli.payload_dir.clone().or(settings.payload_dir.clone()));
    run(cli.command, &settings, &payloads)
}

fn run(command: Command, settings: &Settings, payloads: &PayloadStore) -> Result<()> {
    match command {
        Command::List { disk: None, all, json } => {
            let disks: Vec<_> = list_disks()?
                .into_iter()
                .filter(|d| all || d.system != Some(true))
                .collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&disks)?);
                return Ok(());
            }
            for d in &disks {
                println!(
                    "{:>3}  {:<22} {:>10}  {}",
                    d.number,
                    d.path.display(),
                    utils::format_size(d.size),
                    d.description.as_deref().unwrap_or("")
                );
            }
        }
        Command::List { disk: Some(disk), json, .. } => {
            let mut raw = disk.open()?;
            let format = table::probe_format(&mut raw)
                .with_context(|| format!("No partition table on {}", disk))?;
            let partitions = table::read_partitions(&mut raw)
                .with_context(|| format!("Failed to read partition table of {}", disk))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&partitions)?);
                return Ok(());
            }
            println!("{}: {} partition table, {} partitions", disk, format, partitions.len());
            for p in &partitions {
                let extra = match &p.kind {
                    PartitionKind::Mbr { active: true, .. } => "active".to_string(),
                    PartitionKind::Mbr { .. } => String::new(),
                    PartitionKind::Gpt { name, .. } => name.clone(),
                };
                println!(
                    "{:>3}  start {:>10}  sectors {:>10}  {:>10}  {}  {}",
                    p.display_number(),
                    p.start_lba,
                    p.len_sectors,
                    utils::format_size(p.len_sectors.saturating_mul(512)),
                    p.type_label(),
                    extra
                );
            }
        }
        Command::Probe { disk, partition } => {
            let mut ctx = disk.open_partition(partition, false)?;
            let fs = probe::probe(ctx.device())?;
            let reserved = probe::reserved_sectors(ctx.device(), fs);
            println!("{}  reserved sectors: {}", fs, reserved);
        }
        Command::Setmbr {
            disk,
            loader,
            image,
            keep_table,
            no_keep_table,
        } => {
            let keep = if keep_table {
                true
            } else if no_keep_table {
                false
            } else {
                settings.keep_partition_table
            };

            let image_bytes;
            let source = match (loader, image) {
                (_, Some(path)) => {
                    image_bytes = std::fs::read(&path)
                        .with_context(|| format!("Failed to read {}", path.display()))?;
                    MbrSource::Image {
                        bytes: &image_bytes,
                        keep_table: keep,
                    }
                }
                (Some(loader), None) => MbrSource::Loader(loader),
                (None, None) => bail!("Either --loader or --image is required"),
            };

            let mut raw = disk.open()?;
            let report = boot::install_mbr(&mut raw, source, payloads)
                .with_context(|| format!("Failed to write MBR of {}", disk))?;
            raw.flush()?;
            info!("Wrote {} to {} in {} writes", report.payload, disk, report.writes.len());
            println!("MBR of {} updated ({})", disk, report.payload);
        }
        Command::Setpbr {
            disk,
            partition,
            loader,
        } => {
            let mut ctx = disk.open_partition(partition, settings.lock_volumes)?;
            let report = boot::install_pbr(ctx.device(), loader, payloads).with_context(|| {
                format!("Failed to install {} boot record on partition {}", loader, partition)
            })?;
            ctx.close()?;
            println!(
                "Installed {} boot record on {} partition {} ({})",
                report.loader, disk, partition, report.fs
            );
            if let Some(checksum) = report.exfat_checksum {
                println!("exFAT boot checksum {:08X}", checksum);
            }
        }
        Command::Getid { disk, index } => {
            let mut raw = disk.open()?;
            println!("0x{:02X}", edit::get_type(&mut raw, index)?);
        }
        Command::Setid {
            disk,
            index,
            type_id,
        } => {
            let mut raw = disk.open()?;
            edit::set_type(&mut raw, index, type_id)?;
            raw.flush()?;
        }
        Command::Setactive { disk, index } => {
            let mut raw = disk.open()?;
            edit::set_active(&mut raw, index)?;
            raw.flush()?;
        }
        Command::Swap { disk, a, b } => {
            let mut raw = disk.open()?;
            edit::swap(&mut raw, a, b)?;
        }
        Command::Ls {
            disk,
            partition,
            path,
        } => {
            let mut ctx = disk.open_partition(partition, false)?;
            let volume = fat::mount(ctx.device())?;
            for entry in fat::list_dir(&volume, &path)? {
                if entry.is_dir {
                    println!("{:>12}  {}/", "<DIR>", entry.name);
                } else {
                    println!("{:>12}  {}", entry.size, entry.name);
                }
            }
        }
        Command::Cat {
            disk,
            partition,
            path,
        } => {
            let mut ctx = disk.open_partition(partition, false)?;
            let volume = fat::mount(ctx.device())?;
            let stdout = io::stdout();
            let mut out = stdout.lock();
            fat::read_file(&volume, &path, &mut out)?;
            out.flush()?;
        }
        Command::Dump {
            disk,
            partition,
            path,
            dest,
        } => {
            let mut ctx = disk.open_partition(partition, false)?;
            let volume = fat::mount(ctx.device())?;
            let file = File::create(&dest)
                .with_context(|| format!("Failed to create {}", dest.display()))?;
            let mut out = BufWriter::new(file);
            let bytes = fat::read_file(&volume, &path, &mut out)?;
            out.flush()?;
            println!("{} -> {} ({} bytes)", path, dest.display(), bytes);
        }
        Command::Copy {
            disk,
            partition,
            src,
            dest,
        } => {
            let file =
                File::open(&src).with_context(|| format!("Failed to open {}", src.display()))?;
            let mut ctx = disk.open_partition(partition, settings.lock_volumes)?;
            let volume = fat::mount(ctx.device())?;
            let bytes = fat::write_file(&volume, &dest, &mut BufReader::new(file))?;
            volume.unmount().context("Failed to unmount FAT filesystem")?;
            ctx.close()?;
            println!("{} -> {} ({} bytes)", src.display(), dest, bytes);
        }
        Command::Mkdir {
            disk,
            partition,
            path,
        } => {
            let mut ctx = disk.open_partition(partition, settings.lock_volumes)?;
            let volume = fat::mount(ctx.device())?;
            fat::make_dir(&volume, &path)?;
            volume.unmount().context("Failed to unmount FAT filesystem")?;
            ctx.close()?;
        }
        Command::Remove {
            disk,
            partition,
            path,
            recursive,
        } => {
            let mut ctx = disk.open_partition(partition, settings.lock_volumes)?;
            let volume = fat::mount(ctx.device())?;
            let removed = fat::remove(&volume, &path, recursive)?;
            volume.unmount().context("Failed to unmount FAT filesystem")?;
            ctx.close()?;
            println!("Removed {} ({} entries)", path, removed);
        }
        Command::Move {
            disk,
            partition,
            src,
            dest,
        } => {
            let mut ctx = disk.open_partition(partition, settings.lock_volumes)?;
            let volume = fat::mount(ctx.device())?;
            fat::rename(&volume, &src, &dest)?;
            volume.unmount().context("Failed to unmount FAT filesystem")?;
            ctx.close()?;
        }
        Command::Mkfs {
            disk,
            partition,
            fat: variant,
            cluster_size,
            label,
        } => {
            let mkfs = fat::MkfsOptions {
                fat_type: variant.map(Into::into),
                cluster_size,
                label,
            };
            let mut ctx = disk.open_partition(partition, settings.lock_volumes)?;
            fat::format(ctx.device(), &mkfs)?;
            let fs_kind = probe::probe(ctx.device())?;
            ctx.close()?;
            println!("Partition {} of {} is now {}", partition, disk, fs_kind);
        }
        Command::Label {
            disk,
            partition,
            label: None,
            clear: false,
        } => {
            let mut ctx = disk.open_partition(partition, false)?;
            let volume = fat::mount(ctx.device())?;
            println!("{}", fat::label(&volume));
        }
        Command::Label {
            disk,
            partition,
            label,
            ..
        } => {
            let mut ctx = disk.open_partition(partition, settings.lock_volumes)?;
            fat::set_label(ctx.device(), label.as_deref().unwrap_or(""))?;
            ctx.close()?;
        }
        Command::Extract {
            disk,
            partition,
            image,
        } => {
            let mut source = ImageFile::open(&image)?;
            let src = ExtractSource::open(&mut source).with_context(|| {
                format!("{} is neither a FAT nor an ISO9660 image", image.display())
            })?;

            let mut ctx = disk.open_partition(partition, settings.lock_volumes)?;
            let dst = fat::mount(ctx.device())?;
            let stats = src.copy_into(&dst)?;
            dst.unmount().context("Failed to unmount FAT filesystem")?;
            ctx.close()?;
            println!(
                "Extracted {} files and {} directories from {} ({})",
                stats.files,
                stats.dirs,
                src,
                utils::format_size(stats.bytes)
            );
        }
    }
    Ok(())
}
