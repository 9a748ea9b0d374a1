// SPDX-License-Identifier: GPL-3.0-or-later

pub mod config;
pub mod environment;
pub mod error;
pub mod extensions;
pub mod logging;
pub mod manifest;
pub mod meta;
pub mod process;
pub mod project;
pub mod registry;
pub mod reloader;
pub mod report;
pub mod runner;
pub mod signals;
pub mod ttl_cache;
pub mod watcher;
