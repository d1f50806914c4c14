//! Loop devices left behind by image builds

use std::path::{Path, PathBuf};

/// Marker in backing-file names of images this tool creates.
pub const IMAGE_NAME_MARKER: &str = "sysweaver";

/// An attached loop device and the file behind it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopDevice {
    pub device: PathBuf,
    pub backing_file: PathBuf,
}

impl LoopDevice {
    /// Whether this device belongs to a jail rooted at one of `owned_dirs`
    /// or carries the image name marker.
    #[must_use]
    pub fn is_orphan_of(&self, owned_dirs: &[PathBuf]) -> bool {
        if owned_dirs.iter().any(|dir| self.backing_file.starts_with(dir)) {
            return true;
        }
        self.backing_file
            .file_name()
            .is_some_and(|name| name.to_string_lossy().contains(IMAGE_NAME_MARKER))
    }
}

/// Parse `losetup --list --noheadings --raw --output NAME,BACK-FILE`.
#[must_use]
pub fn parse_losetup_list(output: &str) -> Vec<LoopDevice> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let (device, backing) = line.split_once(char::is_whitespace)?;
            let backing = unescape_raw(backing.trim());
            let backing = backing.strip_suffix(" (deleted)").unwrap_or(&backing);
            if backing.is_empty() {
                return None;
            }
            Some(LoopDevice {
                device: PathBuf::from(device),
                backing_file: PathBuf::from(backing),
            })
        })
        .collect()
}

/// `--raw` output escapes unsafe characters as `\xHH`.
fn unescape_raw(field: &str) -> String {
    let mut out = Vec::with_capacity(field.len());
    let bytes = field.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && bytes.get(i + 1) == Some(&b'x')
            && i + 3 < bytes.len()
            && bytes[i + 2].is_ascii_hexdigit()
            && bytes[i + 3].is_ascii_hexdigit()
        {
            if let Ok(value) = u8::from_str_radix(&field[i + 2..i + 4], 16) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Devices from `devices` that a sweep over `owned_dirs` should detach.
#[must_use]
pub fn orphans<'a>(devices: &'a [LoopDevice], owned_dirs: &[PathBuf]) -> Vec<&'a Path> {
    devices
        .iter()
        .filter(|dev| dev.is_orphan_of(owned_dirs))
        .map(|dev| dev.device.as_path())
        .collect()
}
