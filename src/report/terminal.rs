// SPDX-License-Identifier: GPL-3.0-or-later

use comfy_table::{ContentArrangement, Table};

use super::humanize_size;
use crate::registry::{CacheStatus, Package, Validity};

/// Sort packages alphabetically by display name (case-insensitive), then by
/// import path.
pub fn sort_packages(packages: &mut [Package]) {
    packages.sort_by(|a, b| {
        a.name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then_with(|| a.module_name.cmp(&b.module_name))
    });
}

/// Return a page of items from a slice, plus how many remain.
///
/// A `limit` of 0 means "show all".
pub fn paginate<T>(items: &[T], limit: usize) -> (&[T], usize) {
    if limit == 0 || limit >= items.len() {
        (items, 0)
    } else {
        (&items[..limit], items.len() - limit)
    }
}

fn validity_mark(pkg: &Package) -> &'static str {
    match pkg.validity() {
        Validity::Passing => "ok",
        Validity::Failing => "failing",
        Validity::Unknown => "",
    }
}

pub fn package_table(packages: &[Package]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Name", "Package", "Module", "Version", "Test", "Description"]);
    for pkg in packages {
        let name = if pkg.is_official {
            format!("{} (official)", pkg.name)
        } else {
            pkg.name.clone()
        };
        table.add_row(vec![
            name.as_str(),
            &pkg.project_link,
            &pkg.module_name,
            &pkg.version,
            validity_mark(pkg),
            &pkg.desc,
        ]);
    }
    table
}

/// Print a table of registry packages.
///
/// `limit` controls how many rows to display (0 = all).
pub fn print_packages(packages: &[Package], limit: usize) {
    if packages.is_empty() {
        println!("No packages found.");
        return;
    }

    let (page, remaining) = paginate(packages, limit);
    println!("{}", package_table(page));

    if remaining > 0 {
        println!("\n  ... and {remaining} more packages (use --limit 0 to show all)");
    }
}

pub fn cache_status_table(status: &[CacheStatus]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Module Type", "Current", "Unpublished", "Total"]);

    let current = sum_sizes(status.iter().map(|row| row.current));
    let unpublished = sum_sizes(status.iter().map(|row| row.unpublished));
    for row in status {
        table.add_row(vec![
            capitalize(row.kind.as_str()),
            humanize_size(row.current),
            humanize_size(row.unpublished),
            humanize_size(row.total()),
        ]);
    }
    table.add_row(vec![
        "(Total)".to_string(),
        humanize_size(current),
        humanize_size(unpublished),
        humanize_size(sum_sizes([current, unpublished])),
    ]);
    table
}

/// Sum of the present sizes; `None` when every file is missing.
fn sum_sizes(sizes: impl IntoIterator<Item = Option<u64>>) -> Option<u64> {
    sizes.into_iter().flatten().reduce(u64::saturating_add)
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ModuleKind;

    fn make_pkg(name: &str, module: &str) -> Package {
        Package {
            name: name.to_string(),
            module_name: module.to_string(),
            project_link: module.replace('_', "-"),
            ..Package::default()
        }
    }

    #[test]
    fn sort_alphabetically_case_insensitive() {
        let mut packages = vec![
            make_pkg("zsh status", "nonebot_plugin_zsh"),
            make_pkg("Alarm", "nonebot_plugin_alarm"),
            make_pkg("bilibili", "nonebot_plugin_bili"),
        ];
        sort_packages(&mut packages);
        let names: Vec<_> = packages.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Alarm", "bilibili", "zsh status"]);
    }

    #[test]
    fn sort_same_name_by_module() {
        let mut packages = vec![
            make_pkg("OneBot", "nonebot.adapters.onebot.v12"),
            make_pkg("OneBot", "nonebot.adapters.onebot.v11"),
        ];
        sort_packages(&mut packages);
        assert_eq!(packages[0].module_name, "nonebot.adapters.onebot.v11");
    }

    #[test]
    fn paginate_zero_shows_all() {
        let items = [1, 2, 3];
        assert_eq!(paginate(&items, 0), (&items[..], 0));
        assert_eq!(paginate(&items, 2), (&items[..2], 1));
        assert_eq!(paginate(&items, 5), (&items[..], 0));
    }

    #[test]
    fn package_table_marks_official_and_validity() {
        let mut pkg = make_pkg("Echo", "nonebot_plugin_echo");
        pkg.is_official = true;
        pkg.valid = Some(false);
        let rendered = package_table(&[pkg]).to_string();
        assert!(rendered.contains("Echo (official)"));
        assert!(rendered.contains("failing"));
        assert!(rendered.contains("nonebot-plugin-echo"));
    }

    #[test]
    fn cache_status_has_total_row() {
        let status = [
            CacheStatus {
                kind: ModuleKind::Adapter,
                current: Some(2048),
                unpublished: None,
            },
            CacheStatus {
                kind: ModuleKind::Plugin,
                current: Some(1024),
                unpublished: Some(512),
            },
        ];
        let rendered = cache_status_table(&status).to_string();
        assert!(rendered.contains("Adapter"));
        assert!(rendered.contains("(Total)"));
        assert!(rendered.contains("3.5 KiB"));
        assert!(rendered.contains("n/a"));
    }

    #[test]
    fn empty_catalog_shows_zero_bytes() {
        let status = [CacheStatus {
            kind: ModuleKind::Driver,
            current: Some(0),
            unpublished: None,
        }];
        let rendered = cache_status_table(&status).to_string();
        assert!(rendered.contains("0 B"));
        assert!(rendered.contains("n/a"));
    }
}
