//! Default cookie discovery.
use std::path::PathBuf;

/// Reads the default cookie: the trimmed first line of
/// `$HOME/.erlang.cookie` (`%HOMEDRIVE%%HOMEPATH%` on Windows).
///
/// A missing or unreadable file yields the empty cookie.
pub fn default_cookie() -> String {
    home_dir()
        .map(|home| home.join(".erlang.cookie"))
        .and_then(|path| std::fs::read_to_string(path).ok())
        .and_then(|text| text.lines().next().map(|line| line.trim().to_owned()))
        .unwrap_or_default()
}

#[cfg(windows)]
fn home_dir() -> Option<PathBuf> {
    let drive = std::env::var("HOMEDRIVE").ok()?;
    let path = std::env::var("HOMEPATH").ok()?;
    Some(PathBuf::from(format!("{}{}", drive, path)))
}

#[cfg(not(windows))]
fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_empty_cookie() {
        // With HOME pointing at a fresh directory there is no cookie file.
        let dir = std::env::temp_dir().join("erl_node_cookie_test_missing");
        let _ = std::fs::create_dir_all(&dir);
        let old = std::env::var("HOME").ok();
        std::env::set_var("HOME", &dir);
        assert_eq!(default_cookie(), "");
        if let Some(old) = old {
            std::env::set_var("HOME", old);
        }
    }
}
