//! Archive member naming.
//!
//! Members are identified by a normalized, slash-separated relative name:
//! surrounding whitespace and leading slashes are stripped and the path is
//! lexically cleaned (`.` segments dropped, `..` folded into its parent). A
//! logical path resolves to up to two candidates, its full normalized form
//! and its bare file name, so `/data/run1/nodes.graph` finds either
//! `data/run1/nodes.graph` or `nodes.graph` in the archive.

use std::path::{Component, Path};

/// Normalizes a member name. Returns an empty string for names that clean
/// away entirely (`""`, `"/"`, `"./"`).
pub fn normalize_entry_name(name: &str) -> String {
    let trimmed = name.trim().trim_start_matches('/');
    let mut segments: Vec<&str> = Vec::new();

    for segment in trimmed.split('/') {
        match segment {
            "" | "." => {}
            ".." => match segments.last() {
                Some(&last) if last != ".." => {
                    segments.pop();
                }
                _ => segments.push(".."),
            },
            other => segments.push(other),
        }
    }

    segments.join("/")
}

/// Candidate member names for a logical path, most specific first.
pub fn entry_candidates(path: &Path) -> Vec<String> {
    let mut candidates = Vec::with_capacity(2);

    let slashed = path
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy()),
            Component::ParentDir => Some("..".into()),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => None,
        })
        .collect::<Vec<_>>()
        .join("/");

    let normalized = normalize_entry_name(&slashed);
    if !normalized.is_empty() {
        candidates.push(normalized);
    }

    if let Some(base) = path.file_name() {
        let base = normalize_entry_name(&base.to_string_lossy());
        if !base.is_empty() && candidates.last() != Some(&base) {
            candidates.push(base);
        }
    }

    candidates
}
