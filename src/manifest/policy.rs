// SPDX-License-Identifier: GPL-3.0-or-later

//! Mapping between the TOML document and the typed configuration.
//!
//! Writes patch the existing document instead of regenerating it: arrays that
//! only gained or lost entries are edited in place, and nodes whose value did
//! not change are left untouched, so hand-written formatting survives.

use toml_edit::{Array, DocumentMut, InlineTable, Item, Table, TableLike, Value};

use super::model::{Buckets, GroupedConfig, LegacyConfig, NoneBotConfig, SimpleInfo};
use crate::error::{CliError, Result};

/// Which on-disk layout the manifest uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// `adapters` and `plugins` are mappings keyed by distribution.
    Grouped,
    /// `adapters` and `plugins` are flat lists.
    Legacy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Mapping,
    List,
    Missing,
    Other,
}

fn shape(item: Option<&Item>) -> Shape {
    match item {
        None => Shape::Missing,
        Some(item) if item.is_none() => Shape::Missing,
        Some(item) if item.is_array() || item.is_array_of_tables() => Shape::List,
        Some(item) if item.is_table_like() => Shape::Mapping,
        Some(_) => Shape::Other,
    }
}

fn invalid(msg: impl Into<String>) -> CliError {
    CliError::ProjectInvalid(msg.into())
}

pub(crate) fn nonebot_table(doc: &DocumentMut) -> Result<Option<&dyn TableLike>> {
    let Some(tool) = doc.get("tool") else {
        return Ok(None);
    };
    let tool = tool
        .as_table_like()
        .ok_or_else(|| invalid("`tool` is not a table"))?;
    match tool.get("nonebot") {
        None => Ok(None),
        Some(item) => item
            .as_table_like()
            .map(Some)
            .ok_or_else(|| invalid("`tool.nonebot` is not a table")),
    }
}

impl Policy {
    /// Inspect `tool.nonebot` and decide which layout it uses.
    ///
    /// A missing key takes the shape of its sibling; a manifest with neither
    /// key is treated as a fresh grouped project.
    pub fn probe(doc: &DocumentMut) -> Result<Policy> {
        let nonebot = nonebot_table(doc)?;
        let adapters = shape(nonebot.and_then(|t| t.get("adapters")));
        let plugins = shape(nonebot.and_then(|t| t.get("plugins")));
        match (adapters, plugins) {
            (Shape::Mapping | Shape::Missing, Shape::Mapping | Shape::Missing) => {
                Ok(Policy::Grouped)
            }
            (Shape::List | Shape::Missing, Shape::List | Shape::Missing) => Ok(Policy::Legacy),
            _ => Err(invalid(
                "`tool.nonebot.adapters` and `tool.nonebot.plugins` must both be tables or both be arrays",
            )),
        }
    }

    pub fn decode(self, doc: &DocumentMut) -> Result<NoneBotConfig> {
        let nonebot = nonebot_table(doc)?;
        let get = |key: &str| nonebot.and_then(|t| t.get(key));

        let plugin_dirs = decode_list(get("plugin_dirs"), "plugin_dirs", decode_string)?;
        let builtin_plugins =
            decode_list(get("builtin_plugins"), "builtin_plugins", decode_string)?;

        Ok(match self {
            Policy::Grouped => NoneBotConfig::Grouped(GroupedConfig {
                adapters: decode_buckets(get("adapters"), "adapters", decode_adapter)?,
                plugins: decode_buckets(get("plugins"), "plugins", decode_string)?,
                plugin_dirs,
                builtin_plugins,
            }),
            Policy::Legacy => NoneBotConfig::Legacy(LegacyConfig {
                adapters: decode_list(get("adapters"), "adapters", decode_adapter)?,
                plugins: decode_list(get("plugins"), "plugins", decode_string)?,
                plugin_dirs,
                builtin_plugins,
            }),
        })
    }
}

pub(crate) fn decode_string(value: &Value) -> Option<String> {
    value.as_str().map(str::to_string)
}

fn decode_adapter(value: &Value) -> Option<SimpleInfo> {
    let table = value.as_inline_table()?;
    adapter_from_table(table)
}

fn adapter_from_table(table: &dyn TableLike) -> Option<SimpleInfo> {
    Some(SimpleInfo {
        name: table.get("name")?.as_str()?.to_string(),
        module_name: table.get("module_name")?.as_str()?.to_string(),
    })
}

pub(crate) fn decode_list<T>(
    item: Option<&Item>,
    key: &str,
    decode: fn(&Value) -> Option<T>,
) -> Result<Vec<T>> {
    let Some(item) = item else {
        return Ok(Vec::new());
    };
    if let Some(array) = item.as_array() {
        return array
            .iter()
            .map(|v| decode(v).ok_or_else(|| invalid(format!("malformed entry in `{key}`"))))
            .collect();
    }
    // `[[tool.nonebot.adapters]]` spelling of the legacy list.
    if let Some(tables) = item.as_array_of_tables() {
        let mut out = Vec::new();
        for table in tables.iter() {
            let value = Value::InlineTable(table.clone().into_inline_table());
            let entry = decode(&value)
                .ok_or_else(|| invalid(format!("malformed entry in `{key}`")))?;
            out.push(entry);
        }
        return Ok(out);
    }
    Err(invalid(format!("`{key}` must be an array")))
}

fn decode_buckets<T>(
    item: Option<&Item>,
    key: &str,
    decode: fn(&Value) -> Option<T>,
) -> Result<Buckets<T>> {
    let Some(item) = item else {
        return Ok(Vec::new());
    };
    let table = item
        .as_table_like()
        .ok_or_else(|| invalid(format!("`{key}` must be a table")))?;
    table
        .iter()
        .map(|(bucket, entries)| {
            let entries = decode_list(Some(entries), &format!("{key}.{bucket}"), decode)?;
            Ok((bucket.to_string(), entries))
        })
        .collect()
}

fn encode_adapter(info: &SimpleInfo) -> Value {
    let mut table = InlineTable::new();
    table.insert("name", Value::from(info.name.as_str()));
    table.insert("module_name", Value::from(info.module_name.as_str()));
    Value::InlineTable(table)
}

pub(crate) fn encode_string(value: &String) -> Value {
    Value::from(value.as_str())
}

/// Get `tool.nonebot` for writing, creating it when absent.
fn nonebot_table_mut(doc: &mut DocumentMut) -> Result<&mut dyn TableLike> {
    let tool = doc.entry("tool").or_insert_with(|| {
        let mut table = Table::new();
        table.set_implicit(true);
        Item::Table(table)
    });
    let tool = tool
        .as_table_like_mut()
        .ok_or_else(|| invalid("`tool` is not a table"))?;
    tool.entry("nonebot")
        .or_insert(Item::Table(Table::new()))
        .as_table_like_mut()
        .ok_or_else(|| invalid("`tool.nonebot` is not a table"))
}

/// Bring `tool.nonebot` in `doc` in line with `config`.
pub fn apply(doc: &mut DocumentMut, config: &NoneBotConfig) -> Result<()> {
    let nonebot = nonebot_table_mut(doc)?;
    let (plugin_dirs, builtin_plugins) = match config {
        NoneBotConfig::Grouped(c) => {
            patch_buckets(nonebot, "adapters", &c.adapters, decode_adapter, encode_adapter);
            patch_buckets(nonebot, "plugins", &c.plugins, decode_string, encode_string);
            (&c.plugin_dirs, &c.builtin_plugins)
        }
        NoneBotConfig::Legacy(c) => {
            patch_list(nonebot, "adapters", &c.adapters, true, decode_adapter, encode_adapter);
            patch_list(nonebot, "plugins", &c.plugins, true, decode_string, encode_string);
            (&c.plugin_dirs, &c.builtin_plugins)
        }
    };
    patch_list(nonebot, "plugin_dirs", plugin_dirs, false, decode_string, encode_string);
    patch_list(
        nonebot,
        "builtin_plugins",
        builtin_plugins,
        false,
        decode_string,
        encode_string,
    );
    Ok(())
}

fn build_array<T>(entries: &[T], encode: fn(&T) -> Value) -> Array {
    let mut array = Array::new();
    for entry in entries {
        array.push(encode(entry));
    }
    array
}

/// Set `table[key]` to the list `new`. An absent key with an empty list is
/// only created when `required`.
pub(crate) fn patch_list<T: PartialEq>(
    table: &mut dyn TableLike,
    key: &str,
    new: &[T],
    required: bool,
    decode: fn(&Value) -> Option<T>,
    encode: fn(&T) -> Value,
) {
    if let Some(array) = table.get_mut(key).and_then(Item::as_array_mut) {
        patch_array(array, new, decode, encode);
        return;
    }
    if table.get(key).is_none() && new.is_empty() && !required {
        return;
    }
    table.insert(key, Item::Value(Value::Array(build_array(new, encode))));
}

fn patch_buckets<T: PartialEq>(
    table: &mut dyn TableLike,
    key: &str,
    new: &Buckets<T>,
    decode: fn(&Value) -> Option<T>,
    encode: fn(&T) -> Value,
) {
    if let Some(map) = table.get_mut(key).and_then(Item::as_table_like_mut) {
        let stale: Vec<String> = map
            .iter()
            .map(|(k, _)| k.to_string())
            .filter(|k| !new.iter().any(|(bucket, _)| bucket == k))
            .collect();
        for k in stale {
            map.remove(&k);
        }
        for (bucket, entries) in new {
            match map.get_mut(bucket).and_then(Item::as_array_mut) {
                Some(array) => patch_array(array, entries, decode, encode),
                None => {
                    map.insert(bucket, Item::Value(Value::Array(build_array(entries, encode))));
                }
            }
        }
        return;
    }

    let mut fresh = Table::new();
    for (bucket, entries) in new {
        fresh.insert(bucket, Item::Value(Value::Array(build_array(entries, encode))));
    }
    table.insert(key, Item::Table(fresh));
}

/// Edit `array` so it holds `new`, touching as little as possible.
pub(crate) fn patch_array<T: PartialEq>(
    array: &mut Array,
    new: &[T],
    decode: fn(&Value) -> Option<T>,
    encode: fn(&T) -> Value,
) {
    let old: Vec<Option<T>> = array.iter().map(decode).collect();
    let is_prefix = old.len() <= new.len()
        && old.iter().zip(new).all(|(o, n)| o.as_ref() == Some(n));

    if is_prefix {
        // Follow the spacing of the existing entries once there is a pattern.
        let prefix = if array.len() >= 2 {
            array.iter().last().and_then(|v| v.decor().prefix().cloned())
        } else {
            None
        };
        for entry in &new[old.len()..] {
            match &prefix {
                Some(prefix) => {
                    let mut value = encode(entry);
                    value.decor_mut().set_prefix(prefix.clone());
                    array.push_formatted(value);
                }
                None => array.push(encode(entry)),
            }
        }
        return;
    }

    if let Some(keep) = subsequence(&old, new) {
        let first_prefix = array
            .get(0)
            .map(|v| v.decor().prefix().cloned().unwrap_or_default());
        for index in (0..old.len()).rev() {
            if !keep[index] {
                array.remove(index);
            }
        }
        if !keep[0]
            && let Some(prefix) = first_prefix
            && let Some(first) = array.get_mut(0)
        {
            first.decor_mut().set_prefix(prefix);
        }
        return;
    }

    array.clear();
    for entry in new {
        array.push(encode(entry));
    }
}

/// Which entries of `old` to keep so that it becomes `new`, if `new` is a
/// subsequence of `old`.
fn subsequence<T: PartialEq>(old: &[Option<T>], new: &[T]) -> Option<Vec<bool>> {
    let mut keep = vec![false; old.len()];
    let mut wanted = new.iter().peekable();
    for (index, entry) in old.iter().enumerate() {
        if let Some(next) = wanted.peek()
            && entry.as_ref() == Some(*next)
        {
            keep[index] = true;
            wanted.next();
        }
    }
    wanted.peek().is_none().then_some(keep)
}
