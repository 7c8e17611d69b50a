// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `ol stats` command - Print the worker's metrics snapshot.
//!
//! With `--watch`, refreshes every two seconds until interrupted.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use super::{get_text, saved_config, CmdResult};

const WATCH_INTERVAL: Duration = Duration::from_secs(2);

pub async fn execute(worker_dir: &Path, watch: bool) -> CmdResult {
    let config = saved_config(worker_dir)?;

    loop {
        let stats: BTreeMap<String, u64> =
            serde_json::from_str(&get_text(&config, "/stats").await?)?;
        print!("{}", render(&stats));

        if !watch {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = tokio::time::sleep(WATCH_INTERVAL) => println!(),
        }
    }
}

fn render(stats: &BTreeMap<String, u64>) -> String {
    let width = stats.keys().map(String::len).max().unwrap_or(0);
    stats
        .iter()
        .map(|(name, value)| format!("{:<width$}  {}\n", name, value, width = width))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_aligns_columns() {
        let mut stats = BTreeMap::new();
        stats.insert("invoke.cnt".to_string(), 12);
        stats.insert("sandbox.reuse.cnt".to_string(), 9);

        assert_eq!(
            render(&stats),
            "invoke.cnt         12\nsandbox.reuse.cnt  9\n"
        );
    }
}
