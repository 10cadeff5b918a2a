pub mod error;
pub mod settings;

pub use error::*;
pub use settings::Settings;

use std::path::PathBuf;

const APP_DIR: &str = "stackflow";

/// StackFlowの設定ディレクトリを取得（なければ作成）
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join(APP_DIR);

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

/// プロジェクトのstack.kdlファイルを探す
///
/// 以下の優先順位で検索:
/// 1. 環境変数 STACK_CONFIG_PATH (直接パス指定)
/// 2. カレントディレクトリ: stack.local.kdl, .stack.local.kdl, stack.kdl, .stack.kdl
/// 3. ./.stackflow/ ディレクトリ内: 同様の順序
/// 4. ~/.config/stackflow/stack.kdl (グローバル設定)
pub fn find_stack_file() -> Result<PathBuf> {
    if let Ok(config_path) = std::env::var("STACK_CONFIG_PATH") {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
        tracing::warn!("STACK_CONFIG_PATH が存在しません: {}", path.display());
    }

    let current_dir = std::env::current_dir()?;
    let candidates = ["stack.local.kdl", ".stack.local.kdl", "stack.kdl", ".stack.kdl"];

    for filename in &candidates {
        let path = current_dir.join(filename);
        if path.exists() {
            return Ok(path);
        }
    }

    let project_dir = current_dir.join(".stackflow");
    if project_dir.is_dir() {
        for filename in &candidates {
            let path = project_dir.join(filename);
            if path.exists() {
                return Ok(path);
            }
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global_config = config_dir.join(APP_DIR).join("stack.kdl");
        if global_config.exists() {
            return Ok(global_config);
        }
    }

    Err(ConfigError::StackFileNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    struct CwdGuard(PathBuf);

    impl CwdGuard {
        fn enter(dir: &std::path::Path) -> Self {
            let original = std::env::current_dir().unwrap();
            std::env::set_current_dir(dir).unwrap();
            Self(original)
        }
    }

    impl Drop for CwdGuard {
        fn drop(&mut self) {
            let _ = std::env::set_current_dir(&self.0);
        }
    }

    #[test]
    fn test_get_config_dir() {
        let config_dir = get_config_dir().unwrap();
        assert!(config_dir.ends_with("stackflow"));
        assert!(config_dir.exists());
    }

    #[test]
    #[serial]
    fn test_local_file_wins() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join("stack.kdl"), "// shared").unwrap();
        fs::write(temp_dir.path().join("stack.local.kdl"), "// local").unwrap();
        let _cwd = CwdGuard::enter(temp_dir.path());

        assert!(find_stack_file().unwrap().ends_with("stack.local.kdl"));
    }

    #[test]
    #[serial]
    fn test_hidden_local_beats_visible() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join(".stack.local.kdl"), "// hidden").unwrap();
        fs::write(temp_dir.path().join("stack.kdl"), "// visible").unwrap();
        let _cwd = CwdGuard::enter(temp_dir.path());

        assert!(find_stack_file().unwrap().ends_with(".stack.local.kdl"));
    }

    #[test]
    #[serial]
    fn test_project_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let project_dir = temp_dir.path().join(".stackflow");
        fs::create_dir(&project_dir).unwrap();
        fs::write(project_dir.join("stack.kdl"), "// in project dir").unwrap();
        let _cwd = CwdGuard::enter(temp_dir.path());

        assert!(find_stack_file().unwrap().ends_with(".stackflow/stack.kdl"));
    }

    #[test]
    #[serial]
    fn test_env_var_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("custom.kdl");
        fs::write(&config_path, "// custom").unwrap();

        unsafe {
            std::env::set_var("STACK_CONFIG_PATH", config_path.to_str().unwrap());
        }
        let result = find_stack_file();
        unsafe {
            std::env::remove_var("STACK_CONFIG_PATH");
        }

        assert_eq!(result.unwrap(), config_path);
    }

    #[test]
    #[serial]
    fn test_not_found() {
        let temp_dir = tempfile::tempdir().unwrap();
        let _cwd = CwdGuard::enter(temp_dir.path());

        // グローバル設定が存在する環境では見つかってしまう
        let global = dirs::config_dir().map(|d| d.join(APP_DIR).join("stack.kdl"));
        if global.is_some_and(|p| p.exists()) {
            return;
        }

        assert!(matches!(
            find_stack_file(),
            Err(ConfigError::StackFileNotFound)
        ));
    }
}
