//! Translation between the paths the client edits and the paths the runtime
//! loaded, by substituting one root directory for the other.

use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceMap {
    installed_root: Option<String>,
    source_root: Option<String>,
}

/// Canonical textual form of a path: forward slashes, no chunk-name `@`, no
/// leading `./`, no repeated or trailing separators.
pub fn normalize_path(path: &str) -> String {
    let path = path.strip_prefix('@').unwrap_or(path);
    let mut out = String::with_capacity(path.len());
    for ch in path.chars() {
        let ch = if ch == '\\' { '/' } else { ch };
        if ch == '/' && out.ends_with('/') {
            continue;
        }
        out.push(ch);
    }
    while let Some(rest) = out.strip_prefix("./") {
        out = rest.to_owned();
    }
    if out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}

fn strip_root<'a>(path: &'a str, root: &str) -> Option<&'a str> {
    if path == root {
        return Some("");
    }
    let rest = path.strip_prefix(root)?;
    if root.ends_with('/') {
        Some(rest)
    } else {
        rest.strip_prefix('/')
    }
}

fn join(root: &str, rest: &str) -> String {
    if rest.is_empty() {
        root.to_owned()
    } else if root.ends_with('/') {
        format!("{root}{rest}")
    } else {
        format!("{root}/{rest}")
    }
}

impl SourceMap {
    pub fn new(installed_root: Option<&Path>, source_root: Option<&Path>) -> Self {
        let normalize = |root: &Path| normalize_path(&root.to_string_lossy());
        Self {
            installed_root: installed_root.map(normalize),
            source_root: source_root.map(normalize),
        }
    }

    pub fn identity() -> Self {
        Self::default()
    }

    /// Installed path for a client path, or `None` when the client path lies
    /// outside every known root.
    pub fn to_installed(&self, client_path: &str) -> Option<String> {
        let path = normalize_path(client_path);
        match (&self.source_root, &self.installed_root) {
            (Some(source_root), Some(installed_root)) => {
                if let Some(rest) = strip_root(&path, source_root) {
                    return Some(join(installed_root, rest));
                }
                strip_root(&path, installed_root).is_some().then(|| path.clone())
            }
            (Some(root), None) | (None, Some(root)) => {
                strip_root(&path, root).is_some().then(|| path.clone())
            }
            (None, None) => Some(path),
        }
    }

    /// Client path for an installed path. Paths outside the installed root pass through.
    pub fn to_source(&self, installed_path: &str) -> String {
        let path = normalize_path(installed_path);
        match (&self.installed_root, &self.source_root) {
            (Some(installed_root), Some(source_root)) => match strip_root(&path, installed_root) {
                Some(rest) => join(source_root, rest),
                None => path,
            },
            _ => path,
        }
    }
}
