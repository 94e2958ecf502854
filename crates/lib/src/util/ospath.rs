//! Path relationships between local files and container destinations.

use std::path::{Component, Path, PathBuf};

/// If `file` is `dir` or lives under it, the path of `file` relative to `dir`.
///
/// Comparison is by component, so `/app` is not a parent of `/apple`. A file
/// equal to `dir` yields an empty relative path.
pub fn child(dir: &Path, file: &Path) -> Option<PathBuf> {
  file.strip_prefix(dir).ok().map(Path::to_path_buf)
}

pub fn is_child(dir: &Path, file: &Path) -> bool {
  file.starts_with(dir)
}

/// Join a relative local path onto a POSIX container directory.
pub fn join_container_path(base: &str, rel: &Path) -> String {
  let mut out = base.trim_end_matches('/').to_string();
  for component in rel.components() {
    if let Component::Normal(part) = component {
      out.push('/');
      out.push_str(&part.to_string_lossy());
    }
  }
  if out.is_empty() {
    out.push('/');
  }
  out
}

/// Last component of a local path, or the whole path when it has none.
pub fn base_name(path: &Path) -> String {
  path
    .file_name()
    .map(|n| n.to_string_lossy().into_owned())
    .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// Human-readable list of changed files, truncated after a few entries.
pub fn format_file_change_list(files: &[PathBuf]) -> String {
  const MAX_SHOWN: usize = 3;
  let mut shown: Vec<String> = files.iter().take(MAX_SHOWN).map(|f| f.display().to_string()).collect();
  if files.len() > MAX_SHOWN {
    shown.push(format!("... and {} more", files.len() - MAX_SHOWN));
  }
  format!("[{}]", shown.join(", "))
}
