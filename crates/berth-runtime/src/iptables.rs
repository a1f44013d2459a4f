//! Sweep stale iptables rules left behind for a container.
//!
//! Some CNI plugins skip their `DEL` cleanup when the network namespace is
//! already gone. Every rule that mentions the container id is deleted by
//! turning its `-S` listing (`-A ...`) into a `-D ...` invocation.

use crate::RuntimeError;
use std::process::Command;
use tracing::{debug, warn};

pub const TABLES: &[&str] = &["nat", "filter", "mangle"];

/// Split one `iptables -S` line into arguments, honoring double quotes.
pub fn split_rule(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' if in_quotes => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        args.push(current);
    }
    args
}

/// Deletion argument lists for every appended rule in `listing` mentioning `id`.
pub fn deletion_args(table: &str, listing: &str, id: &str) -> Vec<Vec<String>> {
    listing
        .lines()
        .filter(|line| line.starts_with("-A ") && line.contains(id))
        .map(|line| {
            let mut args = vec!["-t".to_owned(), table.to_owned()];
            let mut rule = split_rule(line);
            rule[0] = "-D".to_owned();
            args.append(&mut rule);
            args
        })
        .collect()
}

pub struct Iptables {
    binary: String,
}

impl Default for Iptables {
    fn default() -> Self {
        Self::new("iptables")
    }
}

impl Iptables {
    pub fn new(binary: &str) -> Self {
        Self {
            binary: binary.to_owned(),
        }
    }

    fn list(&self, table: &str) -> Result<String, RuntimeError> {
        let output = Command::new(&self.binary)
            .args(["-t", table, "-S"])
            .output()
            .map_err(|e| RuntimeError::ExecFailed(format!("failed to run {}: {e}", self.binary)))?;
        if !output.status.success() {
            return Err(RuntimeError::ExecFailed(format!(
                "{} -t {table} -S failed: {}",
                self.binary,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Delete every rule mentioning `id` in the nat, filter and mangle tables.
    /// Returns how many rules were removed.
    pub fn sweep(&self, id: &str) -> Result<usize, RuntimeError> {
        if id.is_empty() {
            return Err(RuntimeError::Invalid("empty container id".to_owned()));
        }
        let mut removed = 0;
        for table in TABLES {
            let listing = self.list(table)?;
            for args in deletion_args(table, &listing, id) {
                let output = Command::new(&self.binary).args(&args).output()?;
                if output.status.success() {
                    debug!("removed stale rule: {}", args.join(" "));
                    removed += 1;
                } else {
                    warn!(
                        "failed to remove rule {}: {}",
                        args.join(" "),
                        String::from_utf8_lossy(&output.stderr).trim()
                    );
                }
            }
        }
        Ok(removed)
    }
}
