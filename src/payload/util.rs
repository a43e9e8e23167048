//! Local path resolution for payload sources and identity files.

use camino::Utf8PathBuf;

/// Resolves `~` and `~/…` against `HOME`; other paths pass through.
///
/// ```
/// # use provisio::payload::resolve_home;
/// assert_eq!(resolve_home("/srv/payload.sh"), "/srv/payload.sh");
/// ```
#[must_use]
pub fn resolve_home(path: &str) -> Utf8PathBuf {
    let home = || std::env::var("HOME").ok().map(Utf8PathBuf::from);
    match path.strip_prefix('~') {
        Some("") => home().unwrap_or_else(|| Utf8PathBuf::from(path)),
        Some(rest) if rest.starts_with('/') => home().map_or_else(
            || Utf8PathBuf::from(path),
            |dir| dir.join(rest.trim_start_matches('/')),
        ),
        _ => Utf8PathBuf::from(path),
    }
}
