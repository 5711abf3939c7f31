use std::path::{Component, Path, PathBuf};

/// Joins a caller-supplied relative path onto `root`.
///
/// Returns `None` for empty, absolute or parent-escaping paths.
pub fn resolve_destination(root: &Path, relative: &str) -> Option<PathBuf> {
    let relative = Path::new(relative);
    let mut resolved = root.to_path_buf();
    let mut pushed = false;

    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                pushed = true;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    pushed.then_some(resolved)
}
