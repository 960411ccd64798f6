use std::path::{Path, PathBuf};

/// Environment variable pointing at an explicit Chrome/Chromium binary.
pub const CHROME_BIN_ENV: &str = "CHROME_BIN";

/// Well-known install locations, checked in order.
///
/// The snap wrapper at `/snap/bin/chromium` strips unknown flags and breaks
/// headless mode, so the real binary inside the snap comes first.
const CANDIDATES: &[&str] = &[
    // Snap (Ubuntu default)
    "/snap/chromium/current/usr/lib/chromium-browser/chrome",
    // Flatpak
    "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
    // Common apt / manual installs
    "/usr/bin/google-chrome-stable",
    "/usr/bin/google-chrome",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
];

/// Locate a Chrome/Chromium binary.
///
/// `$CHROME_BIN` wins when it points at an existing file. Returns `None`
/// when nothing is found, leaving the lookup to `chromiumoxide`.
pub fn find_chrome_binary() -> Option<PathBuf> {
    let explicit = std::env::var(CHROME_BIN_ENV).ok();
    find_in(explicit.as_deref(), CANDIDATES.iter().map(Path::new))
}

fn find_in<'a>(
    explicit: Option<&str>,
    candidates: impl IntoIterator<Item = &'a Path>,
) -> Option<PathBuf> {
    if let Some(path) = explicit.map(PathBuf::from) {
        if path.exists() {
            return Some(path);
        }
        tracing::warn!(path = %path.display(), "{CHROME_BIN_ENV} does not exist, ignoring");
    }

    candidates
        .into_iter()
        .find(|p| p.exists())
        .map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_binary_wins() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = dir.path().join("chrome");
        std::fs::write(&explicit, b"").unwrap();
        let fallback = dir.path().join("chromium");
        std::fs::write(&fallback, b"").unwrap();

        let found = find_in(explicit.to_str(), [fallback.as_path()]);
        assert_eq!(found, Some(explicit));
    }

    #[test]
    fn test_missing_explicit_falls_back_to_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let absent = dir.path().join("also-nope");
        let present = dir.path().join("chromium");
        std::fs::write(&present, b"").unwrap();

        let found = find_in(
            missing.to_str(),
            [absent.as_path(), present.as_path()],
        );
        assert_eq!(found, Some(present));
    }

    #[test]
    fn test_nothing_found() {
        let dir = tempfile::tempdir().unwrap();
        let absent = dir.path().join("chrome");
        assert_eq!(find_in(None, [absent.as_path()]), None);
    }
}
