//! `/proc/self/mountinfo` parsing

use std::path::{Path, PathBuf};

/// Field index of the mount point.
/// Format: ID PARENT_ID MAJOR:MINOR ROOT MOUNT_POINT OPTIONS ...
const MOUNT_POINT_FIELD: usize = 4;

/// Mount points listed in a mountinfo table, in table order.
#[must_use]
pub fn mount_points(table: &str) -> Vec<PathBuf> {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(MOUNT_POINT_FIELD))
        .map(|field| PathBuf::from(unescape(field)))
        .collect()
}

/// Whether `target` appears as a mount point in `table`.
#[must_use]
pub fn contains(table: &str, target: &Path) -> bool {
    mount_points(table).iter().any(|point| point == target)
}

/// Undo the kernel's octal escaping (`\040` for space, `\011` for tab, ...).
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && is_octal(&bytes[i + 1..i + 4]) {
            let value = (bytes[i + 1] - b'0') * 64 + (bytes[i + 2] - b'0') * 8 + (bytes[i + 3] - b'0');
            out.push(value);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn is_octal(digits: &[u8]) -> bool {
    digits.len() == 3 && digits[0] <= b'3' && digits.iter().all(|d| (b'0'..=b'7').contains(d))
}
