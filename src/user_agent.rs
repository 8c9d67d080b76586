//! User-Agent string sent with every transfer request.

/// Product token; the crate version is appended.
const PRODUCT: &str = "download-manager";

/// Default User-Agent for download requests (identifies the tool).
#[must_use]
pub(crate) fn default_download_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("{PRODUCT}/{version}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_agent_carries_version() {
        let ua = default_download_user_agent();
        assert_eq!(
            ua.strip_prefix("download-manager/"),
            Some(env!("CARGO_PKG_VERSION")),
            "{ua}"
        );
    }
}
