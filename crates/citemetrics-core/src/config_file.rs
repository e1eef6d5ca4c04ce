use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Config;
use crate::error::CoreError;

const DAY_SECS: u64 = 24 * 60 * 60;

/// On-disk TOML configuration structure.
/// All fields are optional so partial configs work (merge with defaults).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    pub storage: Option<StorageConfig>,
    pub cache: Option<CacheConfig>,
    pub run: Option<RunConfig>,
    pub retry: Option<RetryConfig>,
    pub throttle: Option<ThrottleConfig>,
    pub proxy: Option<ProxyConfig>,
    pub services: Option<ServicesConfig>,
    pub gate: Option<GateConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: Option<String>,
    pub cache_dir: Option<String>,
    pub profiles_dir: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub http_ttl_days: Option<u64>,
    pub metrics_ttl_days: Option<u64>,
    pub revalidate_after_days: Option<u64>,
    pub recheck_denied: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub fresh_data_seconds: Option<u64>,
    pub coauthor_delay_secs: Option<f64>,
    pub publication_delay_secs: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: Option<u32>,
    pub base_delay_secs: Option<f64>,
    pub captcha_max_retries: Option<u32>,
    pub captcha_backoff_unit_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    pub default_spacing_secs: Option<f64>,
    pub api_spacing_secs: Option<f64>,
    pub api_domains: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub tor_proxy: Option<String>,
    pub tor_repeats: Option<usize>,
    pub socks5_proxies: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServicesConfig {
    pub browser_render_url: Option<String>,
    pub searxng_url: Option<String>,
    pub crossref_mailto: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    pub allowed_surnames: Option<Vec<String>>,
}

/// Platform config directory path: `<config_dir>/citemetrics/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("citemetrics").join("config.toml"))
}

/// Load config by cascading CWD `.citemetrics.toml` over platform config.
/// CWD values override platform values.
pub fn load_config() -> ConfigFile {
    let platform = config_path().and_then(|p| load_from_path(&p));
    let cwd = load_from_path(Path::new(".citemetrics.toml"));

    match (platform, cwd) {
        (None, None) => ConfigFile::default(),
        (Some(p), None) => p,
        (None, Some(c)) => c,
        (Some(p), Some(c)) => merge(p, c),
    }
}

/// Load a config from a specific path. Returns `None` if the file doesn't
/// exist or can't be parsed.
pub fn load_from_path(path: &Path) -> Option<ConfigFile> {
    let content = std::fs::read_to_string(path).ok()?;
    match toml::from_str(&content) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unparsable config file");
            None
        }
    }
}

/// The file at `explicit` when given, else the platform/CWD cascade.
/// An explicit file that is missing or unparsable is an error.
pub fn load(explicit: Option<&Path>) -> Result<ConfigFile, CoreError> {
    let Some(path) = explicit else {
        return Ok(load_config());
    };
    let content = std::fs::read_to_string(path)
        .map_err(|e| CoreError::Config(format!("{}: {e}", path.display())))?;
    toml::from_str(&content).map_err(|e| CoreError::Config(format!("{}: {e}", path.display())))
}

/// Overlay's field if set, else base's.
fn pick<S, T: Clone>(base: &Option<S>, overlay: &Option<S>, field: impl Fn(&S) -> Option<T>) -> Option<T> {
    overlay
        .as_ref()
        .and_then(&field)
        .or_else(|| base.as_ref().and_then(&field))
}

/// Merge two configs: `overlay` values take precedence over `base`.
pub fn merge(base: ConfigFile, overlay: ConfigFile) -> ConfigFile {
    let (b, o) = (&base, &overlay);
    ConfigFile {
        storage: Some(StorageConfig {
            data_dir: pick(&b.storage, &o.storage, |s| s.data_dir.clone()),
            cache_dir: pick(&b.storage, &o.storage, |s| s.cache_dir.clone()),
            profiles_dir: pick(&b.storage, &o.storage, |s| s.profiles_dir.clone()),
        }),
        cache: Some(CacheConfig {
            http_ttl_days: pick(&b.cache, &o.cache, |c| c.http_ttl_days),
            metrics_ttl_days: pick(&b.cache, &o.cache, |c| c.metrics_ttl_days),
            revalidate_after_days: pick(&b.cache, &o.cache, |c| c.revalidate_after_days),
            recheck_denied: pick(&b.cache, &o.cache, |c| c.recheck_denied),
        }),
        run: Some(RunConfig {
            fresh_data_seconds: pick(&b.run, &o.run, |r| r.fresh_data_seconds),
            coauthor_delay_secs: pick(&b.run, &o.run, |r| r.coauthor_delay_secs),
            publication_delay_secs: pick(&b.run, &o.run, |r| r.publication_delay_secs),
        }),
        retry: Some(RetryConfig {
            max_retries: pick(&b.retry, &o.retry, |r| r.max_retries),
            base_delay_secs: pick(&b.retry, &o.retry, |r| r.base_delay_secs),
            captcha_max_retries: pick(&b.retry, &o.retry, |r| r.captcha_max_retries),
            captcha_backoff_unit_secs: pick(&b.retry, &o.retry, |r| r.captcha_backoff_unit_secs),
        }),
        throttle: Some(ThrottleConfig {
            default_spacing_secs: pick(&b.throttle, &o.throttle, |t| t.default_spacing_secs),
            api_spacing_secs: pick(&b.throttle, &o.throttle, |t| t.api_spacing_secs),
            api_domains: pick(&b.throttle, &o.throttle, |t| t.api_domains.clone()),
        }),
        proxy: Some(ProxyConfig {
            tor_proxy: pick(&b.proxy, &o.proxy, |p| p.tor_proxy.clone()),
            tor_repeats: pick(&b.proxy, &o.proxy, |p| p.tor_repeats),
            socks5_proxies: pick(&b.proxy, &o.proxy, |p| p.socks5_proxies.clone()),
        }),
        services: Some(ServicesConfig {
            browser_render_url: pick(&b.services, &o.services, |s| s.browser_render_url.clone()),
            searxng_url: pick(&b.services, &o.services, |s| s.searxng_url.clone()),
            crossref_mailto: pick(&b.services, &o.services, |s| s.crossref_mailto.clone()),
        }),
        gate: Some(GateConfig {
            allowed_surnames: pick(&b.gate, &o.gate, |g| g.allowed_surnames.clone()),
        }),
    }
}

/// Seconds as a `Duration`; negative or non-finite values are rejected.
fn secs(value: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(value).ok()
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Apply every field set in `file` to `config`.
pub fn apply_file(config: &mut Config, file: &ConfigFile) {
    if let Some(storage) = &file.storage {
        if let Some(v) = &storage.data_dir {
            config.data_dir = PathBuf::from(v);
        }
        if let Some(v) = &storage.cache_dir {
            config.cache_dir = PathBuf::from(v);
        }
        if let Some(v) = &storage.profiles_dir {
            config.profiles_dir = PathBuf::from(v);
        }
    }
    if let Some(cache) = &file.cache {
        if let Some(days) = cache.http_ttl_days {
            config.http_ttl = Duration::from_secs(days * DAY_SECS);
        }
        if let Some(days) = cache.metrics_ttl_days {
            config.metrics_ttl = Duration::from_secs(days * DAY_SECS);
        }
        if let Some(days) = cache.revalidate_after_days {
            config.revalidate_after = Duration::from_secs(days * DAY_SECS);
        }
        if let Some(v) = cache.recheck_denied {
            config.recheck_denied = v;
        }
    }
    if let Some(run) = &file.run {
        if let Some(v) = run.fresh_data_seconds {
            config.fresh_data = Duration::from_secs(v);
        }
        if let Some(d) = run.coauthor_delay_secs.and_then(secs) {
            config.coauthor_delay = d;
        }
        if let Some(d) = run.publication_delay_secs.and_then(secs) {
            config.publication_delay = d;
        }
    }
    if let Some(retry) = &file.retry {
        if let Some(v) = retry.max_retries {
            config.retry.max_retries = v.max(1);
        }
        if let Some(d) = retry.base_delay_secs.and_then(secs) {
            config.retry.base_delay = d;
        }
        if let Some(v) = retry.captcha_max_retries {
            config.captcha.max_retries = v;
        }
        if let Some(v) = retry.captcha_backoff_unit_secs {
            config.captcha.unit = Duration::from_secs(v);
        }
    }
    if let Some(throttle) = &file.throttle {
        if let Some(d) = throttle.default_spacing_secs.and_then(secs) {
            config.default_spacing = d;
        }
        if let Some(d) = throttle.api_spacing_secs.and_then(secs) {
            config.api_spacing = d;
        }
        if let Some(v) = &throttle.api_domains {
            config.api_domains = v.clone();
        }
    }
    if let Some(proxy) = &file.proxy {
        if let Some(v) = &proxy.tor_proxy {
            config.tor_proxy = non_empty(v);
        }
        if let Some(v) = proxy.tor_repeats {
            config.tor_repeats = v;
        }
        if let Some(v) = &proxy.socks5_proxies {
            config.socks5_proxies = non_empty(v);
        }
    }
    if let Some(services) = &file.services {
        if let Some(v) = &services.browser_render_url {
            config.browser_render_url = non_empty(v);
        }
        if let Some(v) = &services.searxng_url {
            config.searxng_url = non_empty(v);
        }
        if let Some(v) = &services.crossref_mailto {
            config.crossref_mailto = non_empty(v);
        }
    }
    if let Some(v) = file.gate.as_ref().and_then(|g| g.allowed_surnames.as_ref()) {
        config.allowed_surnames = v.clone();
    }
}

/// Apply environment overrides. `lookup` is `std::env::var(..).ok()` in
/// production. Unparsable values are logged and ignored.
pub fn apply_env(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    let number = |name: &str| -> Option<f64> {
        let raw = lookup(name)?;
        match raw.trim().parse::<f64>() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(var = name, value = %raw, "ignoring non-numeric environment value");
                None
            }
        }
    };

    if let Some(v) = lookup("SCHOLAR_DATA_DIR").as_deref().and_then(non_empty) {
        config.data_dir = PathBuf::from(v);
    }
    if let Some(v) = lookup("CACHE_DIR").as_deref().and_then(non_empty) {
        config.cache_dir = PathBuf::from(v);
    }
    if let Some(v) = lookup("PROFILES_DIR").as_deref().and_then(non_empty) {
        config.profiles_dir = PathBuf::from(v);
    }
    if let Some(d) = number("CACHE_EXPIRE_SECONDS").and_then(secs) {
        config.http_ttl = d;
    }
    if let Some(d) = number("FRESH_DATA_SECONDS").and_then(secs) {
        config.fresh_data = d;
    }
    if let Some(v) = number("MAX_RETRIES").filter(|v| *v >= 1.0) {
        config.retry.max_retries = v as u32;
    }
    if let Some(d) = number("RETRY_BASE_DELAY").and_then(secs) {
        config.retry.base_delay = d;
    }
    if let Some(d) = number("COAUTHOR_DELAY").and_then(secs) {
        config.coauthor_delay = d;
    }
    if let Some(d) = number("PUBLICATION_DELAY").and_then(secs) {
        config.publication_delay = d;
    }
    // Set-but-empty disables these.
    if let Some(v) = lookup("TOR_PROXY") {
        config.tor_proxy = non_empty(&v);
    }
    if let Some(v) = lookup("SOCKS5_PROXIES") {
        config.socks5_proxies = non_empty(&v);
    }
    if let Some(v) = lookup("HERO_SCRAPER_URL") {
        config.browser_render_url = non_empty(&v);
    }
    if let Some(v) = lookup("SEARXNG_URL") {
        config.searxng_url = non_empty(&v);
    }
    if let Some(v) = lookup("CROSSREF_MAILTO") {
        config.crossref_mailto = non_empty(&v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn sections_round_trip_toml() {
        let config = ConfigFile {
            storage: Some(StorageConfig {
                cache_dir: Some("/tmp/cm-cache".to_string()),
                ..Default::default()
            }),
            gate: Some(GateConfig {
                allowed_surnames: Some(vec!["Rummer".into(), "Munday".into()]),
            }),
            ..Default::default()
        };
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: ConfigFile = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn absent_fields_deserialize_as_none() {
        let toml_str = "[proxy]\ntor_proxy = \"127.0.0.1:8118\"\n";
        let parsed: ConfigFile = toml::from_str(toml_str).unwrap();
        let proxy = parsed.proxy.unwrap();
        assert_eq!(proxy.tor_proxy.as_deref(), Some("127.0.0.1:8118"));
        assert!(proxy.tor_repeats.is_none());
        assert!(parsed.cache.is_none());
    }

    // ── merge ──────────────────────────────────────────────────────────

    #[test]
    fn merge_overlay_wins_field_wise() {
        let base: ConfigFile = toml::from_str(
            "[storage]\ndata_dir = \"/base/data\"\ncache_dir = \"/base/cache\"\n[run]\ncoauthor_delay_secs = 4.0\n",
        )
        .unwrap();
        let overlay: ConfigFile = toml::from_str("[storage]\ncache_dir = \"/overlay/cache\"\n").unwrap();

        let merged = merge(base, overlay);
        let storage = merged.storage.unwrap();
        assert_eq!(storage.data_dir.as_deref(), Some("/base/data"));
        assert_eq!(storage.cache_dir.as_deref(), Some("/overlay/cache"));
        assert_eq!(merged.run.unwrap().coauthor_delay_secs, Some(4.0));
    }

    #[test]
    fn explicit_file_must_exist_and_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("citemetrics.toml");
        assert!(matches!(load(Some(&path)), Err(CoreError::Config(_))));
        std::fs::write(&path, "[gate]\nallowed_surnames = [\"Wu\"]\n").unwrap();
        let file = load(Some(&path)).unwrap();
        assert_eq!(file.gate.unwrap().allowed_surnames, Some(vec!["Wu".to_string()]));
    }

    #[test]
    fn load_from_missing_or_broken_path() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_from_path(&dir.path().join("absent.toml")).is_none());
        let broken = dir.path().join("broken.toml");
        std::fs::write(&broken, "[storage\n").unwrap();
        assert!(load_from_path(&broken).is_none());
    }

    // ── applying ───────────────────────────────────────────────────────

    #[test]
    fn file_values_apply_to_config() {
        let file: ConfigFile = toml::from_str(
            r#"
            [cache]
            metrics_ttl_days = 7
            recheck_denied = false
            [throttle]
            default_spacing_secs = 0.5
            [proxy]
            tor_proxy = ""
            [gate]
            allowed_surnames = ["Munday"]
            "#,
        )
        .unwrap();
        let mut config = Config {
            tor_proxy: Some("127.0.0.1:8118".into()),
            ..Config::default()
        };
        apply_file(&mut config, &file);
        assert_eq!(config.metrics_ttl, Duration::from_secs(7 * DAY_SECS));
        assert!(!config.recheck_denied);
        assert_eq!(config.default_spacing, Duration::from_millis(500));
        assert_eq!(config.tor_proxy, None);
        assert_eq!(config.allowed_surnames, vec!["Munday".to_string()]);
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("SCHOLAR_DATA_DIR", "/data/scholar"),
            ("CACHE_EXPIRE_SECONDS", "3600"),
            ("COAUTHOR_DELAY", "0.25"),
            ("MAX_RETRIES", "five"),
            ("HERO_SCRAPER_URL", ""),
            ("SOCKS5_PROXIES", "10.0.0.1:1080|u|p"),
        ]);
        let mut config = Config::default();
        let retries = config.retry.max_retries;
        apply_env(&mut config, |name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.data_dir, PathBuf::from("/data/scholar"));
        assert_eq!(config.http_ttl, Duration::from_secs(3600));
        assert_eq!(config.coauthor_delay, Duration::from_millis(250));
        assert_eq!(config.retry.max_retries, retries);
        assert_eq!(config.browser_render_url, None);
        assert_eq!(config.socks5_proxies.as_deref(), Some("10.0.0.1:1080|u|p"));
    }
}
