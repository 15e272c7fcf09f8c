//! Configuration scaffolding for `relaybot init`.
//!
//! Initializes `~/.relaybot/` from repository templates without overwriting
//! existing local files.

use anyhow::Result;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct InitReport {
    pub root: PathBuf,
    pub created: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
struct TemplateFile {
    relative_path: &'static str,
    contents: &'static str,
}

const TEMPLATE_FILES: &[TemplateFile] = &[
    TemplateFile {
        relative_path: "config.toml",
        contents: include_str!("../../config-templates/config.toml"),
    },
    TemplateFile {
        relative_path: ".env.example",
        contents: include_str!("../../config-templates/env.example"),
    },
];

pub async fn initialize_default() -> Result<InitReport> {
    let config_path = crate::config::default_config_path();
    let root = config_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid default config path: {}", config_path.display()))?
        .to_path_buf();
    initialize_at_root(&root).await
}

pub async fn initialize_at_root(root: &Path) -> Result<InitReport> {
    tokio::fs::create_dir_all(root)
        .await
        .map_err(|e| anyhow::anyhow!("create config root {}: {e}", root.display()))?;

    let mut report = InitReport {
        root: root.to_path_buf(),
        created: Vec::new(),
        skipped: Vec::new(),
    };

    for template in TEMPLATE_FILES {
        let target = root.join(template.relative_path);
        match tokio::fs::metadata(&target).await {
            Ok(_) => {
                report.skipped.push(target);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::write(&target, template.contents)
                    .await
                    .map_err(|e| {
                        anyhow::anyhow!("write config template {}: {e}", target.display())
                    })?;
                report.created.push(target);
            }
            Err(err) => {
                return Err(anyhow::anyhow!(
                    "inspect config path {}: {err}",
                    target.display()
                ));
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::{TEMPLATE_FILES, initialize_at_root};
    use crate::config::RelayConfig;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn temp_root(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("relaybot-init-{name}-{}", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn init_is_idempotent_and_never_overwrites() {
        let root = temp_root("idempotent");
        let first = initialize_at_root(&root)
            .await
            .expect("first init succeeds");
        assert_eq!(first.created.len(), TEMPLATE_FILES.len());
        for template in TEMPLATE_FILES {
            assert!(root.join(template.relative_path).exists());
        }

        std::fs::write(root.join("config.toml"), "# edited\n").expect("edit");
        let second = initialize_at_root(&root)
            .await
            .expect("second init succeeds");
        assert!(second.created.is_empty());
        assert_eq!(second.skipped.len(), TEMPLATE_FILES.len());
        let kept = std::fs::read_to_string(root.join("config.toml")).expect("read");
        assert_eq!(kept, "# edited\n");

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn shipped_config_template_is_valid() {
        let cfg = RelayConfig::parse(TEMPLATE_FILES[0].contents).expect("template parses");
        cfg.validate().expect("template validates");
        assert!(!cfg.channels.telegram.enabled);
    }
}
