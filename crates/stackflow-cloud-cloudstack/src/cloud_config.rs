//! cloud-config reader
//!
//! Reads the CloudStack credentials from an INI file with a `[Global]`
//! section and renders the matching `cmk` configuration.

use crate::error::{CloudStackError, Result};
use std::path::{Path, PathBuf};

const GLOBAL_SECTION: &str = "Global";
const CMK_PROFILE: &str = "stackflow";

/// CloudStack API endpoint and credentials
#[derive(Clone, PartialEq, Eq)]
pub struct CloudConfig {
    pub api_url: String,
    pub api_key: String,
    pub secret_key: String,
    pub verify_ssl: bool,
}

impl std::fmt::Debug for CloudConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudConfig")
            .field("api_url", &self.api_url)
            .field("api_key", &"***")
            .field("secret_key", &"***")
            .field("verify_ssl", &self.verify_ssl)
            .finish()
    }
}

impl CloudConfig {
    /// Load from a cloud-config INI file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CloudStackError::CloudConfig(format!(
                "file not found: {}",
                path.display()
            )));
        }

        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Ini))
            .build()?;

        // section names may come back lowercased
        let section = settings
            .get_table(GLOBAL_SECTION)
            .or_else(|_| settings.get_table(&GLOBAL_SECTION.to_lowercase()))
            .map_err(|_| CloudStackError::SectionNotFound(GLOBAL_SECTION.to_string()))?;

        Self::from_section(section)
    }

    fn from_section(section: config::Map<String, config::Value>) -> Result<Self> {
        let get = |key: &str| -> Result<String> {
            section
                .get(key)
                .cloned()
                .ok_or_else(|| {
                    CloudStackError::CloudConfig(format!("{} is required in [{}]", key, GLOBAL_SECTION))
                })?
                .into_string()
                .map_err(CloudStackError::from)
        };

        let verify_ssl = match section.get("verify-ssl") {
            Some(v) => v.clone().into_bool()?,
            None => true,
        };

        Ok(Self {
            api_url: get("api-url")?,
            api_key: get("api-key")?,
            secret_key: get("secret-key")?,
            verify_ssl,
        })
    }

    /// Render the cmk configuration for this endpoint
    pub fn to_cmk_config(&self, timeout_secs: u64) -> String {
        format!(
            "[core]\n\
             prompt = stackflow\n\
             asyncblock = true\n\
             timeout = {timeout}\n\
             output = json\n\
             verifycert = {verify}\n\
             profile = {profile}\n\
             \n\
             [{profile}]\n\
             url = {url}\n\
             apikey = {api_key}\n\
             secretkey = {secret_key}\n\
             timeout = {timeout}\n\
             output = json\n\
             verifycert = {verify}\n",
            timeout = timeout_secs,
            verify = self.verify_ssl,
            profile = CMK_PROFILE,
            url = self.api_url,
            api_key = self.api_key,
            secret_key = self.secret_key,
        )
    }

    /// Write the cmk configuration into `dir` and return its path
    pub async fn write_cmk_config(&self, dir: &Path, timeout_secs: u64) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join("cmk.ini");
        tokio::fs::write(&path, self.to_cmk_config(timeout_secs)).await?;
        tracing::debug!("Wrote cmk config: {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(dir: &Path, content: &str) -> PathBuf {
        let path = dir.join("cloud-config");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_load_global_section() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            "[Global]\n\
             api-url = https://cloud.example.com/client/api\n\
             api-key = key-123\n\
             secret-key = secret-456\n\
             verify-ssl = false\n",
        );

        let config = CloudConfig::load(&path).unwrap();
        assert_eq!(config.api_url, "https://cloud.example.com/client/api");
        assert_eq!(config.api_key, "key-123");
        assert_eq!(config.secret_key, "secret-456");
        assert!(!config.verify_ssl);
    }

    #[test]
    fn test_verify_ssl_defaults_to_true() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            "[Global]\napi-url = https://c\napi-key = k\nsecret-key = s\n",
        );
        assert!(CloudConfig::load(&path).unwrap().verify_ssl);
    }

    #[test]
    fn test_missing_global_section() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "[Other]\napi-url = https://c\n");

        let err = CloudConfig::load(&path).unwrap_err();
        assert_eq!(err.to_string(), "section Global not found");
    }

    #[test]
    fn test_missing_key() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "[Global]\napi-url = https://c\n");

        let err = CloudConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("api-key"));
    }

    #[test]
    fn test_debug_hides_secrets() {
        let config = CloudConfig {
            api_url: "https://c".into(),
            api_key: "key-123".into(),
            secret_key: "secret-456".into(),
            verify_ssl: true,
        };
        let debug = format!("{:?}", config);
        assert!(!debug.contains("key-123"));
        assert!(!debug.contains("secret-456"));
    }

    #[tokio::test]
    async fn test_write_cmk_config() {
        let dir = tempdir().unwrap();
        let config = CloudConfig {
            api_url: "https://c/client/api".into(),
            api_key: "k".into(),
            secret_key: "s".into(),
            verify_ssl: true,
        };

        let path = config.write_cmk_config(dir.path(), 60).await.unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("profile = stackflow"));
        assert!(content.contains("url = https://c/client/api"));
        assert!(content.contains("timeout = 60"));
    }
}
