// Process-wide configuration, parsed once at startup.

use clap::Parser;

pub const DEFAULT_PAGE_SIZE: u64 = 128 * 1024;
pub const DEFAULT_SCROLL_SIZE: u64 = 64 * 1024;

/// Command-line flags for `paguridaed`.
#[derive(Debug, Clone, Parser)]
#[command(name = "paguridaed", about = "collaborative acme-style editor backend")]
pub struct Config {
    /// Port for the HTTP/WebSocket front door.
    #[arg(long, default_value_t = 8000)]
    pub port: u16,

    /// Attach SHA-256 content hashes to update frames (development aid).
    #[arg(long, default_value_t = false)]
    pub verify_content: bool,

    /// Byte window loaded for partial-load views of large files.
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    pub page_size: u64,

    /// Default step for the Next/Prev paging commands.
    #[arg(long, default_value_t = DEFAULT_SCROLL_SIZE)]
    pub scroll_size: u64,

    /// Deadline for subprocesses piping stdout back into a selection.
    #[arg(long, default_value_t = 10)]
    pub command_timeout_seconds: u64,

    /// How long a session with zero clients survives before the purge
    /// loop tears it down.
    #[arg(long, default_value_t = 3600)]
    pub session_purge_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8000,
            verify_content: false,
            page_size: DEFAULT_PAGE_SIZE,
            scroll_size: DEFAULT_SCROLL_SIZE,
            command_timeout_seconds: 10,
            session_purge_seconds: 3600,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_flag_defaults() {
        let parsed = Config::parse_from(["paguridaed"]);
        let defaults = Config::default();
        assert_eq!(parsed.port, defaults.port);
        assert_eq!(parsed.page_size, defaults.page_size);
        assert_eq!(parsed.scroll_size, defaults.scroll_size);
        assert_eq!(parsed.command_timeout_seconds, defaults.command_timeout_seconds);
        assert_eq!(parsed.session_purge_seconds, defaults.session_purge_seconds);
        assert!(!parsed.verify_content);
    }

    #[test]
    fn flags_override_defaults() {
        let parsed = Config::parse_from([
            "paguridaed",
            "--port",
            "9001",
            "--verify-content",
            "--page-size",
            "4096",
            "--scroll-size",
            "1024",
        ]);
        assert_eq!(parsed.port, 9001);
        assert!(parsed.verify_content);
        assert_eq!(parsed.page_size, 4096);
        assert_eq!(parsed.scroll_size, 1024);
    }
}
