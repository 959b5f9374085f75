//! Download-and-cache for remote cubes.
//!
//! A URL is fetched once into the cache directory and served from disk
//! afterwards. If the primary transfer fails, the same resource is retried
//! over plain HTTP (for `https://` URLs) and then from any configured
//! mirrors before the fetch gives up.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{CubeError, Result, Stage};

/// Remote fetch configuration.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Directory holding cached downloads. Created on demand.
    pub cache_dir: PathBuf,
    /// Overall timeout for one transfer attempt (connect + read).
    pub timeout: Duration,
    /// Retry `https://` URLs over plain `http://` after a failure. Default true.
    pub plain_http_fallback: bool,
    /// Extra base URLs tried last; the resource file name is appended to each.
    pub mirrors: Vec<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("specube-cache"),
            timeout: Duration::from_secs(60),
            plain_http_fallback: true,
            mirrors: Vec::new(),
        }
    }
}

/// File name under which a URL is cached: the last path segment, prefixed with
/// a sanitized form of the host and path so different URLs never collide.
pub fn cache_file_name(url: &str) -> String {
    let without_scheme = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    let without_query = without_scheme.split(['?', '#']).next().unwrap_or(without_scheme);
    without_query
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

fn resource_name(url: &str) -> &str {
    url.split(['?', '#'])
        .next()
        .unwrap_or(url)
        .rsplit('/')
        .next()
        .unwrap_or(url)
}

/// Ordered list of URLs to try for one resource.
fn candidate_urls(url: &str, config: &FetchConfig) -> Vec<String> {
    let mut urls = vec![url.to_string()];
    if config.plain_http_fallback {
        if let Some(rest) = url.strip_prefix("https://") {
            urls.push(format!("http://{rest}"));
        }
    }
    let name = resource_name(url);
    for mirror in &config.mirrors {
        urls.push(format!("{}/{}", mirror.trim_end_matches('/'), name));
    }
    urls
}

/// Return a local path for `url`, downloading it into the cache on a miss.
pub fn fetch(url: &str, config: &FetchConfig) -> Result<PathBuf> {
    let target = config.cache_dir.join(cache_file_name(url));
    if target.exists() {
        debug!("Cache hit for {} -> {}", url, target.display());
        return Ok(target);
    }

    fs::create_dir_all(&config.cache_dir).map_err(|e| {
        CubeError::io(
            Stage::Fetch,
            format!("cannot create cache dir {}", config.cache_dir.display()),
            e,
        )
    })?;

    let agent: ureq::Agent = ureq::Agent::config_builder()
        .timeout_global(Some(config.timeout))
        .build()
        .into();

    let mut failures = Vec::new();
    for candidate in candidate_urls(url, config) {
        info!("Downloading {} ...", candidate);
        match download(&agent, &candidate, &target) {
            Ok(bytes) => {
                info!("Downloaded {} bytes from {} -> {}", bytes, candidate, target.display());
                return Ok(target);
            }
            Err(e) => {
                warn!("Download of {} failed: {}", candidate, e);
                failures.push(format!("{candidate}: {e}"));
            }
        }
    }

    Err(CubeError::io_msg(
        Stage::Fetch,
        format!("all sources failed for {url}: [{}]", failures.join("; ")),
    ))
}

fn download(agent: &ureq::Agent, url: &str, target: &Path) -> std::result::Result<u64, String> {
    let resp = agent.get(url).call().map_err(|e| e.to_string())?;
    let mut reader = resp.into_body().into_reader();

    // Write to a side file first so a broken transfer never poisons the cache.
    let partial = target.with_extension("part");
    let mut file = fs::File::create(&partial).map_err(|e| e.to_string())?;
    let copied = std::io::copy(&mut reader, &mut file);
    let result = copied
        .and_then(|n| file.flush().map(|_| n))
        .and_then(|n| fs::rename(&partial, target).map(|_| n));
    if result.is_err() {
        let _ = fs::remove_file(&partial);
    }
    result.map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidates_include_plain_http_and_mirrors() {
        let config = FetchConfig {
            mirrors: vec!["http://mirror.example.org/data/".into()],
            ..Default::default()
        };
        let urls = candidate_urls("https://example.org/cubes/co21.fits?raw=1", &config);
        assert_eq!(
            urls,
            vec![
                "https://example.org/cubes/co21.fits?raw=1".to_string(),
                "http://example.org/cubes/co21.fits?raw=1".to_string(),
                "http://mirror.example.org/data/co21.fits".to_string(),
            ]
        );
    }

    #[test]
    fn test_cache_hit_skips_network() {
        let dir = tempfile::tempdir().unwrap();
        let config = FetchConfig {
            cache_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let url = "https://unreachable.invalid/cube.fits";
        let cached = dir.path().join(cache_file_name(url));
        std::fs::write(&cached, b"cached").unwrap();
        assert_eq!(fetch(url, &config).unwrap(), cached);
    }

    #[test]
    fn test_unreachable_fails_with_io_after_fallbacks() {
        let dir = tempfile::tempdir().unwrap();
        let config = FetchConfig {
            cache_dir: dir.path().to_path_buf(),
            timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let err = fetch("http://127.0.0.1:9/missing.fits", &config).unwrap_err();
        assert!(matches!(err, CubeError::Io { stage: Stage::Fetch, .. }), "{err}");
        assert!(!dir.path().join(cache_file_name("http://127.0.0.1:9/missing.fits")).exists());
    }
}
