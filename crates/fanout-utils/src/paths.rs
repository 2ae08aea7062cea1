use std::{io, path::Path};

/// Maps an endpoint description to a single filesystem path component.
///
/// Anything outside `[A-Za-z0-9._-]` becomes `_`, so `10.0.0.1:2004/tcp`
/// and `10.0.0.1:2005/tcp` stay distinct while remaining safe to use as a
/// directory name.
pub fn sanitize_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
            out.push(c);
        } else {
            out.push('_');
        }
    }
    out
}

/// `create_dir_all` that tolerates the directory already existing.
pub fn ensure_dir(path: &Path) -> io::Result<()> {
    match std::fs::create_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}
