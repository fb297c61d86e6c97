//! `shroud serve`: run the proxy until interrupted.

use shroud_backend::PgPoolFactory;
use shroud_core::ProxyConfig;
use shroud_proxy::Server;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Read the proxy settings file, with `config_dir` overriding the directory
/// it names.
pub fn load_settings(path: &Path, config_dir: Option<PathBuf>) -> anyhow::Result<ProxyConfig> {
    let mut settings = ProxyConfig::from_file(path)
        .map_err(|e| anyhow::anyhow!("cannot load {}: {e}", path.display()))?;
    if let Some(dir) = config_dir {
        settings.config_dir = dir;
    }
    Ok(settings)
}

pub async fn serve(settings: ProxyConfig) -> anyhow::Result<()> {
    tracing::info!(
        listen_addr = %settings.listen_addr,
        config_dir = %settings.config_dir.display(),
        "Starting Shroud"
    );

    let server = Server::bootstrap(settings, Arc::new(PgPoolFactory)).await?;
    let generation = server.manager().current();
    for namespace in generation.namespaces.iter() {
        tracing::info!(
            namespace = %namespace.name(),
            port = namespace.port(),
            databases = namespace.allowed_dbs().count(),
            "Namespace loaded"
        );
    }
    drop(generation);

    Arc::new(server).run().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_relative_config_dir_follows_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shroud.yaml");
        fs::write(&path, "config_dir: conf\nlisten_addr: 127.0.0.1\n").unwrap();

        let settings = load_settings(&path, None).unwrap();
        assert_eq!(settings.config_dir, dir.path().join("conf"));
        assert_eq!(settings.listen_addr, "127.0.0.1");

        let settings = load_settings(&path, Some(PathBuf::from("/etc/shroud"))).unwrap();
        assert_eq!(settings.config_dir, PathBuf::from("/etc/shroud"));
    }

    #[test]
    fn test_missing_settings_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_settings(&dir.path().join("absent.yaml"), None).is_err());
    }
}
