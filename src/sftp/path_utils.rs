//! Remote path helpers
//!
//! Remote SFTP paths always use `/` as separator, even when the server runs
//! on Windows.

/// Join remote SFTP path components using `/` separator.
pub fn join_remote_path(base: &str, component: &str) -> String {
    if base.is_empty() {
        component.to_string()
    } else if base.ends_with('/') {
        format!("{}{}", base, component)
    } else {
        format!("{}/{}", base, component)
    }
}

/// Last component of a remote path (`/` for the root)
pub fn remote_file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return if path.starts_with('/') { "/" } else { "" };
    }
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_remote_path() {
        assert_eq!(join_remote_path("/home/user", "file.txt"), "/home/user/file.txt");
        assert_eq!(join_remote_path("/home/user/", "file.txt"), "/home/user/file.txt");
        assert_eq!(join_remote_path("/", "etc"), "/etc");
        assert_eq!(join_remote_path("", "etc"), "etc");
    }

    #[test]
    fn test_remote_file_name() {
        assert_eq!(remote_file_name("/var/log/syslog"), "syslog");
        assert_eq!(remote_file_name("/var/log/"), "log");
        assert_eq!(remote_file_name("notes.md"), "notes.md");
        assert_eq!(remote_file_name("/"), "/");
    }
}
