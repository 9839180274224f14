//! Scrubbed environments for subprocesses.
//!
//! Children never inherit the full operator environment; they get a safe
//! baseline plus whatever the specific runtime needs.

use std::collections::HashMap;

/// Baseline variables forwarded to every child when present.
const SAFE_KEYS: &[&str] = &[
    "PATH", "HOME", "USER", "SHELL", "TERM", "LANG", "LC_ALL", "PWD", "TMPDIR",
];

/// X11 variables, needed only by interactive children.
const X11_KEYS: &[&str] = &["DISPLAY", "XAUTHORITY"];

/// Build a filtered environment from the current process environment.
pub fn build_safe_env(include_x11: bool) -> HashMap<String, String> {
    let mut env = HashMap::new();
    for key in SAFE_KEYS {
        if let Ok(value) = std::env::var(key) {
            env.insert((*key).to_string(), value);
        }
    }
    if include_x11 {
        for key in X11_KEYS {
            if let Ok(value) = std::env::var(key) {
                env.insert((*key).to_string(), value);
            }
        }
    }
    env
}

/// Environment for the interactive review TUI: safe baseline with X11,
/// plus the agent endpoint and the strict-local sandbox directories.
pub fn build_review_env(
    endpoint: &str,
    skip_start: bool,
    opencode_config_dir: Option<&str>,
    opencode_data_dir: Option<&str>,
) -> HashMap<String, String> {
    let mut env = build_safe_env(true);
    env.insert("OPENCODE_HOST".to_string(), endpoint.to_string());
    if skip_start {
        env.insert("OPENCODE_SKIP_START".to_string(), "true".to_string());
    }
    if let Some(dir) = opencode_config_dir {
        env.insert("OPENCODE_CONFIG_DIR".to_string(), dir.to_string());
    }
    if let Some(dir) = opencode_data_dir {
        env.insert("OPENCODE_DATA_DIR".to_string(), dir.to_string());
    }
    env
}
