//! Global tag set shared by every published point.
//!
//! [`GlobalTags`] is built once at startup from the configured static tags and
//! the local hostname, then handed to the sampler. It is never mutated after
//! construction.

use std::collections::BTreeMap;

/// Ordered string tags (sorted keys keep line protocol and labels stable).
pub type Tags = BTreeMap<String, String>;

/// Tag key carrying the local hostname.
pub const HOSTNAME_TAG: &str = "hostname";

/// Hostname used when the system call and environment both come up empty.
const UNKNOWN_HOSTNAME: &str = "unknown";

/// Process-wide deployment metadata merged into every record's tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalTags {
    hostname: String,
    static_tags: Tags,
}

impl GlobalTags {
    /// Create a tag set with an explicit hostname.
    pub fn new(hostname: impl Into<String>, static_tags: Tags) -> Self {
        Self {
            hostname: hostname.into(),
            static_tags,
        }
    }

    /// Create a tag set using the detected local hostname.
    pub fn detect(static_tags: Tags) -> Self {
        Self::new(local_hostname(), static_tags)
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn static_tags(&self) -> &Tags {
        &self.static_tags
    }

    /// Merge record-specific tags with the global set.
    ///
    /// Precedence is hostname < record tags < static tags, so a configured
    /// static tag always wins over a record tag of the same key.
    pub fn apply(&self, record_tags: Tags) -> Tags {
        let mut merged = Tags::new();
        merged.insert(HOSTNAME_TAG.to_string(), self.hostname.clone());
        merged.extend(record_tags);
        merged.extend(
            self.static_tags
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        merged
    }
}

/// Resolve the local machine hostname.
///
/// Uses `gethostname(2)` on unix and falls back to the `HOSTNAME` or
/// `COMPUTERNAME` environment variables.
pub fn local_hostname() -> String {
    #[cfg(unix)]
    {
        let mut buf = vec![0_u8; 256];
        // SAFETY: `buf` is valid for writes of `buf.len()` bytes.
        let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
        if rc == 0 {
            let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            if let Ok(name) = std::str::from_utf8(&buf[..end]) {
                if !name.is_empty() {
                    return name.to_owned();
                }
            }
        } else {
            tracing::debug!(error = %std::io::Error::last_os_error(), "gethostname failed");
        }
    }

    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| UNKNOWN_HOSTNAME.to_string())
}
