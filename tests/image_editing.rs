// End-to-end checks against disk image files

use diskpatch::boot::{self, MbrLoader, MbrSource, PayloadStore, PbrLoader};
use diskpatch::disk::{BlockDevice, ImageFile, PartitionDevice, RawDisk, SectorStream};
use diskpatch::extract::ExtractSource;
use diskpatch::probe;
use diskpatch::table::{self, PartitionKind, TableFormat};
use diskpatch::{DiskContext, DiskError, OpenOptions, edit, fat, iso};
use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::NamedTempFile;

const IMAGE_SECTORS: u64 = 64 * 1024 * 1024 / 512;
const PART_START: u32 = 2048;

/// 64 MiB image with one FAT32-LBA (0x0C) primary partition at sector 2048
fn single_partition_image() -> NamedTempFile {
    let mut image = NamedTempFile::new().unwrap();
    image.as_file().set_len(IMAGE_SECTORS * 512).unwrap();

    let mut mbr = [0u8; 512];
    mbr[0x1B8..0x1BC].copy_from_slice(&0x1234_5678u32.to_le_bytes());
    let entry = &mut mbr[0x1BE..0x1CE];
    entry[4] = 0x0C;
    entry[8..12].copy_from_slice(&PART_START.to_le_bytes());
    entry[12..16].copy_from_slice(&(IMAGE_SECTORS as u32 - PART_START).to_le_bytes());
    mbr[0x1FE] = 0x55;
    mbr[0x1FF] = 0xAA;

    image.seek(SeekFrom::Start(0)).unwrap();
    image.write_all(&mbr).unwrap();
    image.flush().unwrap();
    image
}

/// Put a fresh FAT filesystem on partition 1 of `path`
fn format_partition(path: &Path) {
    let mut disk = RawDisk::open_path(path).unwrap();
    let record = table::find_partition(&mut disk, 1).unwrap();
    let mut part = PartitionDevice::new(&mut disk, &record).unwrap();
    fatfs::format_volume(SectorStream::new(&mut part), fatfs::FormatVolumeOptions::new())
        .unwrap();
}

fn sorted_names<T: fatfs::ReadWriteSeek>(fs: &fatfs::FileSystem<T>, path: &str) -> Vec<String> {
    let mut names: Vec<String> = fat::list_dir(fs, path)
        .unwrap()
        .into_iter()
        .map(|e| e.name.to_lowercase())
        .collect();
    names.sort();
    names
}

const ISO_BLOCK: usize = 2048;

fn both_endian_u32(dst: &mut [u8], value: u32) {
    dst[..4].copy_from_slice(&value.to_le_bytes());
    dst[4..8].copy_from_slice(&value.to_be_bytes());
}

fn both_endian_u16(dst: &mut [u8], value: u16) {
    dst[..2].copy_from_slice(&value.to_le_bytes());
    dst[2..4].copy_from_slice(&value.to_be_bytes());
}

/// Append a directory record to `dir`, returning the new length
fn dir_record(dir: &mut [u8], at: usize, block: u32, len: u32, is_dir: bool, id: &[u8]) -> usize {
    let size = 33 + id.len() + (id.len() + 1) % 2;
    let rec = &mut dir[at..at + size];
    rec[0] = size as u8;
    both_endian_u32(&mut rec[2..10], block);
    both_endian_u32(&mut rec[10..18], len);
    rec[18..25].copy_from_slice(&[124, 1, 1, 0, 0, 0, 0]);
    rec[25] = if is_dir { 0x02 } else { 0x00 };
    both_endian_u16(&mut rec[28..32], 1);
    rec[32] = id.len() as u8;
    rec[33..33 + id.len()].copy_from_slice(id);
    at + size
}

/// Minimal ISO9660 image:
///   /README.TXT (5000 bytes, spans three blocks)
///   /BOOT/GRUB.CFG
fn iso_image(readme: &[u8], grub_cfg: &[u8]) -> NamedTempFile {
    const ROOT: u32 = 20;
    const BOOT: u32 = 21;
    const README: u32 = 22;
    const GRUB: u32 = 25;
    const BLOCKS: u32 = 26;

    let mut data = vec![0u8; BLOCKS as usize * ISO_BLOCK];
    let date = b"2024010100000000\0";

    let pvd = &mut data[16 * ISO_BLOCK..17 * ISO_BLOCK];
    pvd[0] = 1;
    pvd[1..6].copy_from_slice(b"CD001");
    pvd[6] = 1;
    pvd[8..72].fill(b' ');
    pvd[40..49].copy_from_slice(b"DISKPATCH");
    both_endian_u32(&mut pvd[80..88], BLOCKS);
    both_endian_u16(&mut pvd[120..124], 1);
    both_endian_u16(&mut pvd[124..128], 1);
    both_endian_u16(&mut pvd[128..132], ISO_BLOCK as u16);
    both_endian_u32(&mut pvd[132..140], 10);
    pvd[140..144].copy_from_slice(&18u32.to_le_bytes());
    pvd[148..152].copy_from_slice(&19u32.to_be_bytes());
    dir_record(pvd, 156, ROOT, ISO_BLOCK as u32, true, &[0]);
    pvd[190..813].fill(b' ');
    for at in [813, 830, 847, 864] {
        pvd[at..at + 17].copy_from_slice(date);
    }
    pvd[881] = 1;

    let term = &mut data[17 * ISO_BLOCK..18 * ISO_BLOCK];
    term[0] = 255;
    term[1..6].copy_from_slice(b"CD001");
    term[6] = 1;

    // path tables: the root only
    for (block, lba) in [(18usize, ROOT.to_le_bytes()), (19, ROOT.to_be_bytes())] {
        let table = &mut data[block * ISO_BLOCK..];
        table[0] = 1;
        table[2..6].copy_from_slice(&lba);
        table[6..8].copy_from_slice(&if block == 18 { 1u16.to_le_bytes() } else { 1u16.to_be_bytes() });
    }

    let root = &mut data[ROOT as usize * ISO_BLOCK..(ROOT + 1) as usize * ISO_BLOCK];
    let mut at = dir_record(root, 0, ROOT, ISO_BLOCK as u32, true, &[0]);
    at = dir_record(root, at, ROOT, ISO_BLOCK as u32, true, &[1]);
    at = dir_record(root, at, BOOT, ISO_BLOCK as u32, true, b"BOOT");
    dir_record(root, at, README, readme.len() as u32, false, b"README.TXT;1");

    let boot = &mut data[BOOT as usize * ISO_BLOCK..(BOOT + 1) as usize * ISO_BLOCK];
    let mut at = dir_record(boot, 0, BOOT, ISO_BLOCK as u32, true, &[0]);
    at = dir_record(boot, at, ROOT, ISO_BLOCK as u32, true, &[1]);
    dir_record(boot, at, GRUB, grub_cfg.len() as u32, false, b"GRUB.CFG;1");

    let readme_at = README as usize * ISO_BLOCK;
    data[readme_at..readme_at + readme.len()].copy_from_slice(readme);
    let grub_at = GRUB as usize * ISO_BLOCK;
    data[grub_at..grub_at + grub_cfg.len()].copy_from_slice(grub_cfg);

    let mut image = NamedTempFile::new().unwrap();
    image.write_all(&data).unwrap();
    image.flush().unwrap();
    image
}

fn read_sector0(path: &Path) -> Vec<u8> {
    fs::read(path).unwrap()[..512].to_vec()
}

#[test]
fn single_partition_is_read_and_retyped() {
    let image = single_partition_image();
    let mut disk = RawDisk::open_path(image.path()).unwrap();
    assert_eq!(disk.total_sectors(), IMAGE_SECTORS);

    assert_eq!(table::probe_format(&mut disk).unwrap(), TableFormat::Mbr);
    let parts = table::read_partitions(&mut disk).unwrap();
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].number, 0);
    assert_eq!(parts[0].start_lba, 2048);
    assert_eq!(parts[0].len_sectors, IMAGE_SECTORS - 2048);
    assert_eq!(
        parts[0].kind,
        PartitionKind::Mbr {
            type_id: 0x0C,
            active: false
        }
    );

    assert_eq!(edit::get_type(&mut disk, 1).unwrap(), 0x0C);
    edit::set_type(&mut disk, 1, 0x07).unwrap();
    assert_eq!(edit::get_type(&mut disk, 1).unwrap(), 0x07);
    drop(disk);

    // the change reached the file
    assert_eq!(read_sector0(image.path())[0x1BE + 4], 0x07);
}

#[test]
fn active_flag_and_swap_on_image() {
    let image = single_partition_image();
    let mut disk = RawDisk::open_path(image.path()).unwrap();

    edit::set_active(&mut disk, 1).unwrap();
    let parts = table::read_partitions(&mut disk).unwrap();
    assert!(matches!(parts[0].kind, PartitionKind::Mbr { active: true, .. }));

    let before = read_sector0(image.path());
    edit::swap(&mut disk, 1, 3).unwrap();
    assert_eq!(edit::get_type(&mut disk, 3).unwrap(), 0x0C);
    assert_eq!(edit::get_type(&mut disk, 1).unwrap(), 0x00);

    // primary numbers follow the slot
    let record = table::find_partition(&mut disk, 3).unwrap();
    assert_eq!(record.start_lba, 2048);

    edit::swap(&mut disk, 3, 1).unwrap();
    drop(disk);
    assert_eq!(read_sector0(image.path()), before);
}

#[test]
fn mbr_image_keeps_partition_table() {
    let image = single_partition_image();
    let original = read_sector0(image.path());
    let boot_code: Vec<u8> = (0..512u32).map(|i| (i % 251) as u8).collect();

    let mut disk = RawDisk::open_path(image.path()).unwrap();
    boot::install_mbr(
        &mut disk,
        MbrSource::Image {
            bytes: &boot_code,
            keep_table: true,
        },
        &PayloadStore::default(),
    )
    .unwrap();
    drop(disk);

    let written = read_sector0(image.path());
    assert_eq!(&written[0x1B8..0x1FE], &original[0x1B8..0x1FE]);
    assert_eq!(&written[..0x1B8], &boot_code[..0x1B8]);
    assert_eq!(&written[0x1FE..], &boot_code[0x1FE..]);
}

#[test]
fn empty_mbr_then_table_still_reads() {
    let image = single_partition_image();
    let mut disk = RawDisk::open_path(image.path()).unwrap();
    boot::install_mbr(
        &mut disk,
        MbrSource::Loader(MbrLoader::Empty),
        &PayloadStore::default(),
    )
    .unwrap();

    assert_eq!(&disk.read_sector(0).unwrap()[..4], &[0xFA, 0xF4, 0xEB, 0xFD]);
    assert_eq!(table::read_partitions(&mut disk).unwrap().len(), 1);
}

#[test]
fn grub4dos_boot_record_on_formatted_partition() {
    let image = single_partition_image();
    format_partition(image.path());

    let payloads = tempfile::tempdir().unwrap();
    let mut payload = vec![0x90u8; 0x200];
    payload[..3].copy_from_slice(&[0xEB, 0x58, 0x90]);
    payload[0x1FE] = 0x55;
    payload[0x1FF] = 0xAA;
    fs::write(payloads.path().join("pbr-grub4dos-fat16.bin"), &payload).unwrap();
    fs::write(payloads.path().join("pbr-grub4dos-fat32.bin"), &payload).unwrap();
    let store = PayloadStore::new(Some(payloads.path().to_path_buf()));

    let disk = RawDisk::open_path(image.path()).unwrap();
    let mut ctx = DiskContext::open_disk(disk, 1, OpenOptions::default()).unwrap();
    assert!(!ctx.is_locked());

    let fs_kind = probe::probe(ctx.device()).unwrap();
    assert!(fs_kind.is_fat(), "probed {}", fs_kind);
    let bpb = ctx.device().read_sector(0).unwrap();

    let report = boot::install_pbr(ctx.device(), PbrLoader::Grub4Dos, &store).unwrap();
    assert_eq!(report.fs, fs_kind);
    assert_eq!(report.writes.len(), 3);

    let vbr = ctx.device().read_sector(0).unwrap();
    assert_eq!(&vbr[..3], &[0xEB, 0x58, 0x90]);
    assert_eq!(&vbr[3..0x3E], &bpb[3..0x3E]);
    assert_eq!(&vbr[0x1E3..0x1E8], b"GRLDR");
    ctx.close().unwrap();

    // the filesystem still mounts after the boot code went in
    let mut disk = RawDisk::open_path(image.path()).unwrap();
    let record = table::find_partition(&mut disk, 1).unwrap();
    let mut part = PartitionDevice::new(&mut disk, &record).unwrap();
    assert_eq!(probe::probe(&mut part).unwrap(), fs_kind);
}

#[test]
fn missing_payload_writes_nothing() {
    let image = single_partition_image();
    format_partition(image.path());
    let boot_area = |path: &Path| {
        let start = PART_START as usize * 512;
        fs::read(path).unwrap()[start..start + 8 * 512].to_vec()
    };
    let before = boot_area(image.path());

    let disk = RawDisk::open_path(image.path()).unwrap();
    let mut ctx = DiskContext::open_disk(disk, 1, OpenOptions::default()).unwrap();
    let err = boot::install_pbr(ctx.device(), PbrLoader::Nt6, &PayloadStore::default())
        .unwrap_err();
    assert!(matches!(err, DiskError::NotFound(_)), "{}", err);
    ctx.close().unwrap();

    assert_eq!(boot_area(image.path()), before);
}

#[test]
fn extract_copies_image_tree_into_partition() {
    let image = single_partition_image();
    format_partition(image.path());

    // a bare FAT image, no partition table
    let source = NamedTempFile::new().unwrap();
    source.as_file().set_len(8 * 1024 * 1024).unwrap();
    {
        let mut raw = RawDisk::open_path(source.path()).unwrap();
        fatfs::format_volume(SectorStream::new(&mut raw), fatfs::FormatVolumeOptions::new())
            .unwrap();
        let volume = fat::mount(&mut raw).unwrap();
        fat::make_dir(&volume, "boot/grub").unwrap();
        fat::write_file(&volume, "boot/grub/grub.cfg", &mut &b"set timeout=3\n"[..]).unwrap();
        fat::write_file(&volume, "setup.exe", &mut &vec![0xCCu8; 70_000][..]).unwrap();
        volume.unmount().unwrap();
    }

    let mut src_dev = ImageFile::open(source.path()).unwrap();
    let src = fat::mount(&mut src_dev).unwrap();

    let disk = RawDisk::open_path(image.path()).unwrap();
    let mut ctx = DiskContext::open_disk(disk, 1, OpenOptions::default()).unwrap();
    {
        let dst = fat::mount(ctx.device()).unwrap();
        let stats = fat::copy_tree(&src, &dst).unwrap();
        assert_eq!(stats.files, 2);
        assert_eq!(stats.dirs, 2);
        assert_eq!(stats.bytes, 70_014);
        dst.unmount().unwrap();
    }

    let dst = fat::mount(ctx.device()).unwrap();
    let mut cfg = Vec::new();
    fat::read_file(&dst, "/boot/grub/grub.cfg", &mut cfg).unwrap();
    assert_eq!(cfg, b"set timeout=3\n");
    let names: Vec<String> = fat::list_dir(&dst, "/")
        .unwrap()
        .into_iter()
        .map(|e| e.name.to_lowercase())
        .collect();
    assert!(names.contains(&"setup.exe".to_string()));
}

#[test]
fn image_backend_is_read_only() {
    let image = single_partition_image();
    let mut disk = ImageFile::open(image.path()).unwrap();
    assert_eq!(table::read_partitions(&mut disk).unwrap().len(), 1);

    let err = edit::set_active(&mut disk, 1).unwrap_err();
    assert!(matches!(err, DiskError::Unsupported(_)));
}

#[test]
fn remove_and_move_on_partition() {
    let image = single_partition_image();
    format_partition(image.path());

    let disk = RawDisk::open_path(image.path()).unwrap();
    let mut ctx = DiskContext::open_disk(disk, 1, OpenOptions::default()).unwrap();
    {
        let volume = fat::mount(ctx.device()).unwrap();
        fat::make_dir(&volume, "efi/boot").unwrap();
        fat::make_dir(&volume, "old").unwrap();
        fat::write_file(&volume, "efi/boot/bootx64.efi", &mut &[0x4Du8; 1024][..]).unwrap();
        fat::write_file(&volume, "old/stale.cfg", &mut &b"stale"[..]).unwrap();
        fat::write_file(&volume, "menu.lst", &mut &b"title Setup"[..]).unwrap();

        fat::rename(&volume, "menu.lst", "efi/boot").unwrap();
        fat::rename(&volume, "efi/boot/bootx64.efi", "efi/boot/grubx64.efi").unwrap();
        assert_eq!(fat::remove(&volume, "old", true).unwrap(), 2);
        assert!(fat::remove(&volume, "missing.txt", false).is_err());
        volume.unmount().unwrap();
    }
    ctx.close().unwrap();

    let mut disk = RawDisk::open_path(image.path()).unwrap();
    let record = table::find_partition(&mut disk, 1).unwrap();
    let mut part = PartitionDevice::new(&mut disk, &record).unwrap();
    let volume = fat::mount(&mut part).unwrap();
    assert_eq!(sorted_names(&volume, "/"), vec!["efi"]);
    assert_eq!(sorted_names(&volume, "efi/boot"), vec!["grubx64.efi", "menu.lst"]);
    let mut menu = Vec::new();
    fat::read_file(&volume, "efi/boot/menu.lst", &mut menu).unwrap();
    assert_eq!(menu, b"title Setup");
}

#[test]
fn mkfs_then_label_on_partition() {
    let image = single_partition_image();
    let before = fs::read(image.path()).unwrap();

    let disk = RawDisk::open_path(image.path()).unwrap();
    let mut ctx = DiskContext::open_disk(disk, 1, OpenOptions::default()).unwrap();
    let mkfs = fat::MkfsOptions {
        fat_type: Some(fat::FatType::Fat32),
        label: Some("setup".into()),
        ..fat::MkfsOptions::default()
    };
    fat::format(ctx.device(), &mkfs).unwrap();
    assert_eq!(probe::probe(ctx.device()).unwrap(), probe::FsKind::Fat32);
    {
        let volume = fat::mount(ctx.device()).unwrap();
        assert_eq!(fat::label(&volume), "SETUP");
        assert!(fat::list_dir(&volume, "/").unwrap().is_empty());
    }

    fat::set_label(ctx.device(), "Rescue 2").unwrap();
    {
        let volume = fat::mount(ctx.device()).unwrap();
        assert_eq!(fat::label(&volume), "RESCUE 2");
    }
    assert!(matches!(
        fat::set_label(ctx.device(), "much too long"),
        Err(DiskError::InvalidArgument(_))
    ));
    ctx.close().unwrap();

    // the partition table is untouched
    let after = fs::read(image.path()).unwrap();
    assert_eq!(&after[..512], &before[..512]);
    let boot_sector = &after[PART_START as usize * 512..PART_START as usize * 512 + 512];
    assert_eq!(&boot_sector[0x47..0x52], b"RESCUE 2   ");
}

#[test]
fn extract_copies_iso_tree_into_partition() {
    let image = single_partition_image();
    format_partition(image.path());

    let readme: Vec<u8> = (0..5000u32).map(|i| (i % 253) as u8).collect();
    let source = iso_image(&readme, b"set default=0\n");

    let mut src_dev = ImageFile::open(source.path()).unwrap();
    assert!(iso::is_iso9660(&mut src_dev).unwrap());
    let src = ExtractSource::open(&mut src_dev).unwrap();
    assert!(matches!(src, ExtractSource::Iso(_)));

    let disk = RawDisk::open_path(image.path()).unwrap();
    let mut ctx = DiskContext::open_disk(disk, 1, OpenOptions::default()).unwrap();
    {
        let dst = fat::mount(ctx.device()).unwrap();
        let stats = src.copy_into(&dst).unwrap();
        assert_eq!(stats.files, 2);
        assert_eq!(stats.dirs, 1);
        assert_eq!(stats.bytes, 5000 + 14);
        dst.unmount().unwrap();
    }

    let dst = fat::mount(ctx.device()).unwrap();
    assert_eq!(sorted_names(&dst, "/"), vec!["boot", "readme.txt"]);
    let mut copied = Vec::new();
    fat::read_file(&dst, "README.TXT", &mut copied).unwrap();
    assert_eq!(copied, readme);
    let mut cfg = Vec::new();
    fat::read_file(&dst, "boot/grub.cfg", &mut cfg).unwrap();
    assert_eq!(cfg, b"set default=0\n");
}

#[test]
fn fat_image_is_not_taken_for_iso() {
    let source = NamedTempFile::new().unwrap();
    source.as_file().set_len(4 * 1024 * 1024).unwrap();
    {
        let mut raw = RawDisk::open_path(source.path()).unwrap();
        fat::format(&mut raw, &fat::MkfsOptions::default()).unwrap();
    }
    let mut src_dev = ImageFile::open(source.path()).unwrap();
    assert!(!iso::is_iso9660(&mut src_dev).unwrap());
    assert!(matches!(
        ExtractSource::open(&mut src_dev).unwrap(),
        ExtractSource::Fat(_)
    ));
}
