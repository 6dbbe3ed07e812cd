use anyhow::{Context, Result, anyhow};
use std::{
    fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/newtube-api-env";
pub const DEFAULT_DATABASE_PATH: &str = "/var/lib/newtube/videos.db";
pub const DEFAULT_API_PORT: u16 = 8080;
pub const DEFAULT_API_HOST: &str = "127.0.0.1";
pub const DEFAULT_MAX_UPLOAD_MB: u64 = 512;

/// Every key the service understands. Used both for the config file and for
/// process environment overrides.
const KEYS: &[&str] = &[
    "DATABASE_PATH",
    "API_HOST",
    "API_PORT",
    "SPOOL_DIR",
    "MAX_UPLOAD_MB",
    "CLOUDINARY_CLOUD_NAME",
    "CLOUDINARY_API_KEY",
    "CLOUDINARY_API_SECRET",
    "CLOUDINARY_FOLDER",
];

/// Raw, partially filled configuration as read from the env file.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub database_path: Option<PathBuf>,
    pub api_host: Option<String>,
    pub api_port: Option<u16>,
    pub spool_dir: Option<PathBuf>,
    pub max_upload_mb: Option<u64>,
    pub cloudinary_cloud_name: Option<String>,
    pub cloudinary_api_key: Option<String>,
    pub cloudinary_api_secret: Option<String>,
    pub cloudinary_folder: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CloudinarySettings {
    pub cloud_name: String,
    pub api_key: String,
    pub api_secret: String,
    pub folder: Option<String>,
}

/// Fully resolved settings the backend runs with.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_path: PathBuf,
    pub api_host: String,
    pub api_port: u16,
    pub spool_dir: PathBuf,
    pub max_upload_bytes: usize,
    pub cloudinary: CloudinarySettings,
}

impl EnvConfig {
    /// Applies one `KEY=value` pair. `origin` only feeds error messages.
    fn set(&mut self, key: &str, value: &str, origin: &str) -> Result<()> {
        if value.is_empty() {
            return Ok(());
        }
        match key {
            "DATABASE_PATH" => self.database_path = Some(PathBuf::from(value)),
            "API_HOST" => self.api_host = Some(value.to_string()),
            "API_PORT" => {
                let port: u16 = value
                    .parse()
                    .with_context(|| format!("Parsing API_PORT from {origin}"))?;
                self.api_port = Some(port);
            }
            "SPOOL_DIR" => self.spool_dir = Some(PathBuf::from(value)),
            "MAX_UPLOAD_MB" => {
                let mb: u64 = value
                    .parse()
                    .with_context(|| format!("Parsing MAX_UPLOAD_MB from {origin}"))?;
                self.max_upload_mb = Some(mb);
            }
            "CLOUDINARY_CLOUD_NAME" => self.cloudinary_cloud_name = Some(value.to_string()),
            "CLOUDINARY_API_KEY" => self.cloudinary_api_key = Some(value.to_string()),
            "CLOUDINARY_API_SECRET" => self.cloudinary_api_secret = Some(value.to_string()),
            "CLOUDINARY_FOLDER" => self.cloudinary_folder = Some(value.to_string()),
            _ => {}
        }
        Ok(())
    }

    /// Overlays values found through `lookup` (normally `std::env::var`).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        for key in KEYS {
            if let Some(value) = lookup(key) {
                self.set(key, value.trim(), "the environment")?;
            }
        }
        Ok(())
    }

    pub fn into_settings(self) -> Result<Settings> {
        let cloud_name = self
            .cloudinary_cloud_name
            .ok_or_else(|| anyhow!("CLOUDINARY_CLOUD_NAME not set"))?;
        let api_key = self
            .cloudinary_api_key
            .ok_or_else(|| anyhow!("CLOUDINARY_API_KEY not set"))?;
        let api_secret = self
            .cloudinary_api_secret
            .ok_or_else(|| anyhow!("CLOUDINARY_API_SECRET not set"))?;
        let max_upload_mb = self.max_upload_mb.unwrap_or(DEFAULT_MAX_UPLOAD_MB);
        let max_upload_bytes = usize::try_from(max_upload_mb.saturating_mul(1024 * 1024))
            .context("MAX_UPLOAD_MB does not fit in memory limits")?;

        Ok(Settings {
            database_path: self
                .database_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_PATH)),
            api_host: self
                .api_host
                .unwrap_or_else(|| DEFAULT_API_HOST.to_string()),
            api_port: self.api_port.unwrap_or(DEFAULT_API_PORT),
            spool_dir: self.spool_dir.unwrap_or_else(std::env::temp_dir),
            max_upload_bytes,
            cloudinary: CloudinarySettings {
                cloud_name,
                api_key,
                api_secret,
                folder: self.cloudinary_folder,
            },
        })
    }
}

pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let origin = path.display().to_string();
    let mut cfg = EnvConfig::default();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, value_raw)) = trimmed.split_once('=') {
            let value = value_raw.trim().trim_matches('"');
            cfg.set(key.trim(), value, &origin)?;
        }
    }
    Ok(Some(cfg))
}

/// Reads the config file (if any) and overlays the process environment.
pub fn load_settings_from(path: impl AsRef<Path>) -> Result<Settings> {
    let path = path.as_ref();
    let mut cfg = read_env_config(path)?.unwrap_or_default();
    cfg.apply_env(|key| std::env::var(key).ok())?;
    cfg.into_settings()
        .with_context(|| format!("Resolving settings (config file {})", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    const CREDS: &str = "CLOUDINARY_CLOUD_NAME=\"demo\"\nCLOUDINARY_API_KEY=\"123\"\nCLOUDINARY_API_SECRET=\"s3cr3t\"\n";

    #[test]
    fn read_env_config_extracts_port() {
        let cfg = make_config("API_PORT=\"4242\"\n# comment\n");
        let parsed = read_env_config(cfg.path()).unwrap().unwrap();
        assert_eq!(parsed.api_port, Some(4242));
    }

    #[test]
    fn read_env_config_rejects_bad_port() {
        let cfg = make_config("API_PORT=\"not-a-port\"\n");
        let err = read_env_config(cfg.path()).unwrap_err();
        assert!(err.to_string().contains("API_PORT"));
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let parsed = read_env_config(&dir.path().join("absent")).unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn settings_fall_back_to_defaults() {
        let cfg = make_config(CREDS);
        let settings = read_env_config(cfg.path())
            .unwrap()
            .unwrap()
            .into_settings()
            .unwrap();
        assert_eq!(settings.api_port, DEFAULT_API_PORT);
        assert_eq!(settings.api_host, DEFAULT_API_HOST);
        assert_eq!(settings.database_path, PathBuf::from(DEFAULT_DATABASE_PATH));
        assert_eq!(
            settings.max_upload_bytes,
            (DEFAULT_MAX_UPLOAD_MB * 1024 * 1024) as usize
        );
        assert_eq!(settings.cloudinary.cloud_name, "demo");
        assert!(settings.cloudinary.folder.is_none());
    }

    #[test]
    fn settings_require_media_credentials() {
        let cfg = make_config("API_HOST=0.0.0.0\n");
        let err = read_env_config(cfg.path())
            .unwrap()
            .unwrap()
            .into_settings()
            .unwrap_err();
        assert!(err.to_string().contains("CLOUDINARY_CLOUD_NAME"));
    }

    #[test]
    fn environment_overrides_file_values() {
        let cfg = make_config(&format!("{CREDS}API_HOST=\"0.0.0.0\"\nAPI_PORT=9000\n"));
        let mut parsed = read_env_config(cfg.path()).unwrap().unwrap();
        let env: HashMap<&str, &str> = [("API_PORT", "9100"), ("CLOUDINARY_FOLDER", "videos")]
            .into_iter()
            .collect();
        parsed
            .apply_env(|key| env.get(key).map(|value| value.to_string()))
            .unwrap();
        let settings = parsed.into_settings().unwrap();
        assert_eq!(settings.api_host, "0.0.0.0");
        assert_eq!(settings.api_port, 9100);
        assert_eq!(settings.cloudinary.folder.as_deref(), Some("videos"));
    }
}
