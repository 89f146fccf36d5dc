use std::time::Duration;

use reqwest::redirect;

use crate::config::Config;

/// Timeouts for remote fetches.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DownloadTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// Global timeout for one download.
    pub max_download: Duration,
}

impl DownloadTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect: config.connect_timeout,
            max_download: config.max_download_timeout,
        }
    }
}

impl Default for DownloadTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            max_download: Duration::from_secs(60),
        }
    }
}

/// Creates a [`reqwest::Client`] with the provided timeouts and `User-Agent`.
///
/// A zero timeout disables that timeout. Redirects are followed up to a limit of 5 hops,
/// which is plenty for CDN setups.
pub fn create_client(
    timeouts: &DownloadTimeouts,
    user_agent: &str,
) -> reqwest::Result<reqwest::Client> {
    let mut builder = reqwest::ClientBuilder::new()
        .gzip(true)
        .pool_idle_timeout(Duration::from_secs(30))
        .user_agent(user_agent)
        .redirect(redirect::Policy::limited(5));

    if !timeouts.connect.is_zero() {
        builder = builder.connect_timeout(timeouts.connect);
    }
    if !timeouts.max_download.is_zero() {
        builder = builder.timeout(timeouts.max_download);
    }

    builder.build()
}
