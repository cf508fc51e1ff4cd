//! Mount planning for sandboxed executions.

use std::path::{Component, Path, PathBuf};

use crate::storage::AdditionalMount;

use super::RunnerError;

/// Where the group's working folder appears inside the sandbox.
pub const GROUP_MOUNT: &str = "/workspace/group";
/// Where the group's IPC namespace appears inside the sandbox.
pub const IPC_MOUNT: &str = "/workspace/ipc";
/// Where the secrets document appears when delivered as a file.
pub const SECRETS_MOUNT: &str = "/workspace/secrets.json";
/// Parent of per-group extra mounts.
pub const EXTRA_MOUNT_ROOT: &str = "/workspace/extra";

/// One bind mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub readonly: bool,
}

impl Mount {
    /// `-v` argument for container engines.
    pub fn volume_arg(&self) -> String {
        let suffix = if self.readonly { ":ro" } else { "" };
        format!("{}:{}{suffix}", self.host.display(), self.container)
    }
}

/// Mounts for one execution, in a stable order.
pub fn plan_mounts(
    group_dir: &Path,
    ipc_dir: &Path,
    secrets_file: Option<&Path>,
    extra: &[AdditionalMount],
) -> Result<Vec<Mount>, RunnerError> {
    let mut mounts = vec![
        Mount {
            host: group_dir.to_path_buf(),
            container: GROUP_MOUNT.to_string(),
            readonly: false,
        },
        Mount {
            host: ipc_dir.to_path_buf(),
            container: IPC_MOUNT.to_string(),
            readonly: false,
        },
    ];

    for mount in extra {
        let relative = validate_container_path(&mount.container_path)?;
        if !mount.host_path.is_absolute() {
            return Err(RunnerError::InvalidMount(format!(
                "host path '{}' must be absolute",
                mount.host_path.display()
            )));
        }
        if !mount.host_path.exists() {
            return Err(RunnerError::InvalidMount(format!(
                "host path '{}' does not exist",
                mount.host_path.display()
            )));
        }
        mounts.push(Mount {
            host: mount.host_path.clone(),
            container: format!("{EXTRA_MOUNT_ROOT}/{relative}"),
            readonly: mount.readonly,
        });
    }

    if let Some(path) = secrets_file {
        mounts.push(Mount {
            host: path.to_path_buf(),
            container: SECRETS_MOUNT.to_string(),
            readonly: true,
        });
    }

    Ok(mounts)
}

/// Extra mounts must stay under [`EXTRA_MOUNT_ROOT`].
fn validate_container_path(path: &str) -> Result<String, RunnerError> {
    let candidate = Path::new(path);
    let ok = !path.is_empty()
        && candidate
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !ok || path.contains(':') {
        return Err(RunnerError::InvalidMount(format!(
            "container path '{path}' must be a plain relative path"
        )));
    }
    Ok(path.trim_end_matches('/').to_string())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn base_mounts_come_first() {
        let mounts = plan_mounts(Path::new("/g"), Path::new("/i"), None, &[]).unwrap();
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].volume_arg(), "/g:/workspace/group");
        assert_eq!(mounts[1].volume_arg(), "/i:/workspace/ipc");
    }

    #[test]
    fn secrets_are_mounted_read_only() {
        let mounts = plan_mounts(
            Path::new("/g"),
            Path::new("/i"),
            Some(Path::new("/run/s.json")),
            &[],
        )
        .unwrap();
        assert_eq!(
            mounts.last().unwrap().volume_arg(),
            "/run/s.json:/workspace/secrets.json:ro"
        );
    }

    #[test]
    fn extra_mounts_are_confined() {
        let dir = tempfile::TempDir::new().unwrap();
        let good = AdditionalMount {
            host_path: dir.path().to_path_buf(),
            container_path: "docs".to_string(),
            readonly: true,
        };
        let mounts = plan_mounts(Path::new("/g"), Path::new("/i"), None, &[good.clone()]).unwrap();
        assert_eq!(mounts[2].container, "/workspace/extra/docs");
        assert!(mounts[2].readonly);

        for bad in ["../etc", "/etc", "", "a:b"] {
            let mount = AdditionalMount {
                container_path: bad.to_string(),
                ..good.clone()
            };
            assert!(
                matches!(
                    plan_mounts(Path::new("/g"), Path::new("/i"), None, &[mount]),
                    Err(RunnerError::InvalidMount(_))
                ),
                "{bad} accepted"
            );
        }
    }

    #[test]
    fn missing_host_path_is_rejected() {
        let mount = AdditionalMount {
            host_path: "/definitely/not/here".into(),
            container_path: "x".to_string(),
            readonly: false,
        };
        assert!(plan_mounts(Path::new("/g"), Path::new("/i"), None, &[mount]).is_err());
    }
}
