// SPDX-License-Identifier: GPL-3.0-or-later

//! Rendering package listings and cache information.

pub mod json;
pub mod terminal;

const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];

/// Binary-prefixed size, e.g. `3.5 KiB`. Missing files show as `n/a`.
pub fn humanize_size(bytes: Option<u64>) -> String {
    let Some(bytes) = bytes else {
        return "n/a".to_string();
    };
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        let text = format!("{size:.1}");
        let text = text.strip_suffix(".0").unwrap_or(&text);
        format!("{text} {}", UNITS[unit])
    }
}
