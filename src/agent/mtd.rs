//! MTD device size discovery.
//!
//! Raw MTD character devices stat as zero bytes, so `pull` asks the device
//! for its real size: first the `MEMGETINFO` ioctl, then `/proc/mtd` as a
//! fallback for kernels or permissions that refuse the ioctl.
//!
//! See `<mtd/mtd-abi.h>` for the structures and constants.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use bitflags::bitflags;
use log::{debug, warn};

use super::CommandError;

bitflags! {
    /// MTD capability flags from `mtd_info_user.flags`.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub(crate) struct MtdFlags: u32 {
        /// Device is writeable.
        const WRITEABLE = 0x400;
        /// Single bits can be flipped.
        const BIT_WRITEABLE = 0x800;
        /// No erase necessary.
        const NO_ERASE = 0x1000;
        /// Device is powered up locked.
        const POWERUP_LOCK = 0x2000;
    }
}

/// `struct mtd_info_user` from `<mtd/mtd-abi.h>`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct MtdInfoUser {
    mtd_type: u8,
    flags: u32,
    size: u32,
    erasesize: u32,
    writesize: u32,
    oobsize: u32,
    padding: u64,
}

mod ioctl {
    use super::MtdInfoUser;
    // MEMGETINFO = _IOR('M', 1, struct mtd_info_user)
    nix::ioctl_read!(mem_get_info, b'M', 1, MtdInfoUser);
}

/// True for paths under `/dev/mtd*`.
pub(crate) fn is_mtd_path(path: &Path) -> bool {
    path.to_string_lossy().starts_with("/dev/mtd")
}

/// The device's true size in bytes.
pub(crate) fn device_size(file: &File, path: &Path) -> Result<u64, CommandError> {
    let mut info = MtdInfoUser::default();
    match unsafe { ioctl::mem_get_info(file.as_raw_fd(), &mut info) } {
        Ok(_) => {
            debug!(
                "{}: {} bytes, erase block {}, flags {:?}",
                path.display(),
                info.size,
                info.erasesize,
                MtdFlags::from_bits_truncate(info.flags)
            );
            Ok(u64::from(info.size))
        }
        Err(e) => {
            warn!(
                "{}: MEMGETINFO failed ({e}), consulting /proc/mtd",
                path.display()
            );
            proc_mtd_size(path)
        }
    }
}

fn proc_mtd_size(path: &Path) -> Result<u64, CommandError> {
    let name = device_name(path)
        .ok_or_else(|| CommandError::at(path, "not an mtd device name"))?;
    let table = std::fs::read_to_string("/proc/mtd").map_err(CommandError::from)?;
    parse_proc_mtd(&table, name)
        .ok_or_else(|| CommandError::new(format!("{name}: not present in /proc/mtd")))
}

/// The `mtdN` name a path refers to; read-only aliases (`mtdNro`) map to
/// their base device.
fn device_name(path: &Path) -> Option<&str> {
    let name = path.file_name()?.to_str()?;
    if !name.starts_with("mtd") {
        return None;
    }
    Some(name.strip_suffix("ro").unwrap_or(name))
}

/// Finds `name` in `/proc/mtd` content and returns its size.
///
/// Lines look like `mtd0: 00800000 00020000 "boot"`; the first hex field is
/// the size.
fn parse_proc_mtd(table: &str, name: &str) -> Option<u64> {
    for line in table.lines() {
        let mut fields = line.split_whitespace();
        let dev = fields.next()?.trim_end_matches(':');
        let size_hex = fields.next()?;
        if dev == name {
            return u64::from_str_radix(size_hex, 16).ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "dev:    size   erasesize  name\n\
                         mtd0: 00800000 00020000 \"boot\"\n\
                         mtd1: 03800000 00020000 \"rootfs\"\n\
                         mtd2: 00020000 00020000 \"env\"\n";

    #[test]
    fn parses_sizes_from_proc_mtd() {
        assert_eq!(parse_proc_mtd(TABLE, "mtd0"), Some(0x0080_0000));
        assert_eq!(parse_proc_mtd(TABLE, "mtd1"), Some(0x0380_0000));
        assert_eq!(parse_proc_mtd(TABLE, "mtd7"), None);
    }

    #[test]
    fn device_names_resolve_through_ro_aliases() {
        assert_eq!(device_name(Path::new("/dev/mtd3")), Some("mtd3"));
        assert_eq!(device_name(Path::new("/dev/mtd3ro")), Some("mtd3"));
        assert_eq!(device_name(Path::new("/dev/sda")), None);
    }

    #[test]
    fn mtd_paths_are_recognized() {
        assert!(is_mtd_path(Path::new("/dev/mtd0")));
        assert!(is_mtd_path(Path::new("/dev/mtdblock2")));
        assert!(!is_mtd_path(Path::new("/tmp/mtd0")));
        assert!(!is_mtd_path(Path::new("/dev/sda1")));
    }
}
