//! Runtime path resolution: a single workdir for whatever on-disk state this process keeps
//! (none currently, but e.g. a DNS forwarder cache or cert material would land here). No
//! middleware-dir concept — there's no wasm middleware chain in this design.

use std::path::{Component, Path, PathBuf};

use anyhow::Context;
use directories::ProjectDirs;

#[derive(Debug, Clone)]
pub struct RuntimePaths {
    pub workdir: PathBuf,
}

pub fn resolve_runtime_paths(workdir: Option<PathBuf>) -> anyhow::Result<RuntimePaths> {
    Ok(RuntimePaths { workdir: resolve_workdir(workdir)? })
}

fn resolve_workdir(flag_or_env: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    let mut wd = match flag_or_env {
        Some(p) => {
            if p.as_os_str().is_empty() {
                anyhow::bail!("workdir: empty path");
            }
            if p.is_relative() {
                std::env::current_dir().context("workdir: resolve cwd")?.join(p)
            } else {
                p
            }
        }
        None => default_workdir()?,
    };

    wd = normalize_path(wd);
    if wd.as_os_str().is_empty() {
        anyhow::bail!("workdir: empty path");
    }
    Ok(wd)
}

fn default_workdir() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/var/lib/eldatun"));
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("dev", "eldatun", "eldatun").context("workdir: resolve user data dir")?;
        Ok(proj.data_local_dir().to_path_buf())
    }
}

fn normalize_path(p: PathBuf) -> PathBuf {
    let mut out = PathBuf::new();
    for c in p.components() {
        if matches!(c, Component::CurDir) {
            continue;
        }
        out.push(c.as_os_str());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_workdir_is_joined_with_cwd() {
        let wd = resolve_workdir(Some(PathBuf::from("./state"))).expect("resolve");
        assert!(wd.ends_with("state"));
        assert!(wd.is_absolute());
    }

    #[test]
    fn absolute_workdir_passes_through_normalized() {
        let wd = resolve_workdir(Some(PathBuf::from("/tmp/./eldatun"))).expect("resolve");
        assert_eq!(wd, PathBuf::from("/tmp/eldatun"));
    }
}
