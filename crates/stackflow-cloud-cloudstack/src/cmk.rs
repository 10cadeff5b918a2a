//! cmk CLI wrapper
//!
//! Wraps CloudMonkey (`cmk`) for CloudStack API calls. Every call runs
//! `cmk -c <config> -o json <verb> <noun> key=value...` and is bounded by
//! the configured request timeout.

use crate::error::{CloudStackError, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// cmk CLI wrapper
#[derive(Debug, Clone)]
pub struct Cmk {
    binary: String,
    config_path: PathBuf,
    timeout: Duration,
}

impl Cmk {
    pub fn new(binary: impl Into<String>, config_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            config_path: config_path.into(),
            timeout,
        }
    }

    /// Check if cmk is installed
    pub async fn check_installed(&self) -> Result<()> {
        let which = Command::new("which").arg(&self.binary).output().await?;
        if !which.status.success() {
            return Err(CloudStackError::CmkNotFound);
        }
        Ok(())
    }

    /// Run a cmk command and return the parsed JSON response
    ///
    /// An empty response (e.g. from a list with no matches) is `Value::Null`.
    pub async fn run(&self, verb: &str, noun: &str, params: &[(&str, String)]) -> Result<Value> {
        let args = build_args(params);

        let mut cmd = Command::new(&self.binary);
        cmd.arg("-c")
            .arg(&self.config_path)
            .arg("-o")
            .arg("json")
            .arg(verb)
            .arg(noun)
            .args(&args);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        tracing::debug!("Running: {} {} {} {}", self.binary, verb, noun, redact(&args).join(" "));

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| CloudStackError::Timeout(self.timeout.as_secs()))??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // cmk writes API errors to stdout
            let message = [stderr.trim(), stdout.trim()]
                .into_iter()
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(": ");
            return Err(CloudStackError::CommandFailed(message));
        }

        parse_response(&stdout)
    }

    /// Run a list command and deserialize the entries under `key`
    pub async fn list<T: DeserializeOwned>(
        &self,
        noun: &str,
        key: &str,
        params: &[(&str, String)],
    ) -> Result<Vec<T>> {
        let response = self.run("list", noun, params).await?;
        list_entries(&response, key)
    }
}

fn build_args(params: &[(&str, String)]) -> Vec<String> {
    params
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| format!("{}={}", k, v))
        .collect()
}

fn redact(args: &[String]) -> Vec<String> {
    args.iter()
        .map(|a| match a.split_once('=') {
            Some((k, _)) if k.contains("key") && !k.starts_with("tags[") => format!("{}=***", k),
            _ => a.clone(),
        })
        .collect()
}

fn parse_response(stdout: &str) -> Result<Value> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(trimmed)?)
}

/// Entries of a list response, `[]` when the key is absent
pub fn list_entries<T: DeserializeOwned>(response: &Value, key: &str) -> Result<Vec<T>> {
    match response.get(key) {
        Some(entries) => Ok(serde_json::from_value(entries.clone())?),
        None => Ok(Vec::new()),
    }
}

/// Entity of a create/associate response
///
/// Async jobs wrap the entity in `jobresult`.
pub fn entity<T: DeserializeOwned>(response: &Value, key: &str) -> Result<T> {
    let value = response
        .get(key)
        .or_else(|| response.get("jobresult").and_then(|j| j.get(key)))
        .ok_or_else(|| {
            CloudStackError::UnexpectedResponse(format!("missing '{}' in response", key))
        })?;
    Ok(serde_json::from_value(value.clone())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Item {
        id: String,
    }

    #[test]
    fn test_build_args_skips_empty() {
        let args = build_args(&[
            ("name", "net-a".to_string()),
            ("account", String::new()),
            ("domainid", "d-1".to_string()),
        ]);
        assert_eq!(args, vec!["name=net-a", "domainid=d-1"]);
    }

    #[test]
    fn test_redact_hides_keys() {
        let args = vec!["apikey=abc".to_string(), "tags[0].key=owner".to_string()];
        assert_eq!(redact(&args), vec!["apikey=***", "tags[0].key=owner"]);
    }

    #[test]
    fn test_parse_empty_response() {
        assert_eq!(parse_response("  \n").unwrap(), Value::Null);
    }

    #[test]
    fn test_list_entries() {
        let response = json!({"count": 2, "network": [{"id": "a"}, {"id": "b"}]});
        let items: Vec<Item> = list_entries(&response, "network").unwrap();
        assert_eq!(items.len(), 2);

        let none: Vec<Item> = list_entries(&Value::Null, "network").unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_entity_direct_and_jobresult() {
        let direct = json!({"network": {"id": "net-1"}});
        assert_eq!(entity::<Item>(&direct, "network").unwrap().id, "net-1");

        let job = json!({"jobid": "j-1", "jobresult": {"affinitygroup": {"id": "ag-1"}}});
        assert_eq!(entity::<Item>(&job, "affinitygroup").unwrap().id, "ag-1");

        assert!(matches!(
            entity::<Item>(&json!({}), "network"),
            Err(CloudStackError::UnexpectedResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_binary_is_io_error() {
        let cmk = Cmk::new(
            "/nonexistent/cmk",
            "/tmp/cmk.ini",
            Duration::from_secs(5),
        );
        assert!(matches!(
            cmk.run("list", "zones", &[]).await,
            Err(CloudStackError::IoError(_))
        ));
    }
}
