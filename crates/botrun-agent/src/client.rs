use std::path::PathBuf;

use crate::settings::Settings;

/// Supplies the leading part of every launch command: the runtime and the
/// installed client.
pub trait ClientLauncher: Send + Sync {
    fn command_prefix(&self) -> anyhow::Result<Vec<String>>;
}

/// Starts an installed client jar with a Java runtime.
#[derive(Debug, Clone)]
pub struct JarClient {
    java: String,
    jar: PathBuf,
}

impl JarClient {
    pub fn new(java: impl Into<String>, jar: impl Into<PathBuf>) -> Self {
        Self {
            java: java.into(),
            jar: jar.into(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.java.clone(), settings.client_jar.clone())
    }

    /// The prefix without checking that the client is installed.
    pub fn prefix_unchecked(&self) -> Vec<String> {
        vec![
            self.java.clone(),
            "-jar".to_string(),
            self.jar.display().to_string(),
        ]
    }
}

impl ClientLauncher for JarClient {
    fn command_prefix(&self) -> anyhow::Result<Vec<String>> {
        if !self.jar.is_file() {
            anyhow::bail!(
                "no client installed at {} (set BOTRUN_CLIENT_JAR)",
                self.jar.display()
            );
        }
        Ok(self.prefix_unchecked())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_jar_is_reported() {
        let c = JarClient::new("java", "/nonexistent/client.jar");
        let err = c.command_prefix().unwrap_err();
        assert!(err.to_string().contains("no client installed"));
    }

    #[test]
    fn installed_jar_yields_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let jar = dir.path().join("client.jar");
        std::fs::write(&jar, b"PK").unwrap();
        let c = JarClient::new("/opt/jdk/bin/java", &jar);
        assert_eq!(
            c.command_prefix().unwrap(),
            vec![
                "/opt/jdk/bin/java".to_string(),
                "-jar".to_string(),
                jar.display().to_string()
            ]
        );
    }
}
