//! Server binary resolution.
//!
//! Probe order: the spec's environment-variable override, a project-local
//! install (walking from the project root upward), the `PATH`, and finally
//! the spec's on-demand npm install fallback.

use std::env;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use lsp_mux::registry::{BinarySpec, InstallSpec, ServerSpec};

pub async fn resolve_binary(spec: &ServerSpec, project_root: &Path) -> anyhow::Result<PathBuf> {
    let binary = &spec.binary;

    if let Ok(path) = env::var(binary.env_var) {
        let path = PathBuf::from(path);
        anyhow::ensure!(
            path.is_file(),
            "{} points at `{}` which is not a file",
            binary.env_var,
            path.display()
        );
        debug!(env = binary.env_var, path = %path.display(), "Using environment override");
        return Ok(path);
    }

    if let Some(path) = probe_project_tree(binary, project_root) {
        debug!(path = %path.display(), "Using project-local binary");
        return Ok(path);
    }

    for candidate in binary.candidates {
        if let Some(path) = find_in_path(candidate) {
            debug!(path = %path.display(), "Using binary from PATH");
            return Ok(path);
        }
    }

    if let Some(install) = &binary.install {
        return install_fallback(spec.name, install).await;
    }

    anyhow::bail!(
        "couldn't locate a binary for `{}` (candidates: {:?}); set {} to override",
        spec.name,
        binary.candidates,
        binary.env_var,
    )
}

/// Walks from the project root upward, probing the spec's local install
/// directory in each ancestor.
fn probe_project_tree(binary: &BinarySpec, project_root: &Path) -> Option<PathBuf> {
    let probe = binary.local_probe?;

    let mut dir = Some(project_root);
    while let Some(current) = dir {
        for candidate in binary.candidates {
            let path = current.join(probe).join(candidate);
            if is_executable(&path) {
                return Some(path);
            }
        }
        dir = current.parent();
    }
    None
}

fn find_in_path(candidate: &str) -> Option<PathBuf> {
    let path_var = env::var_os("PATH")?;
    env::split_paths(&path_var)
        .map(|dir| dir.join(candidate))
        .find(|path| is_executable(path))
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        path.metadata()
            .map(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

/// Installs the server package into the per-user data directory, once, and
/// reuses it afterwards.
async fn install_fallback(server: &str, install: &InstallSpec) -> anyhow::Result<PathBuf> {
    let data_dir = dirs_next::data_dir().context("couldn't determine the data directory")?;
    let prefix = data_dir.join("lspmux").join("install").join(server);
    let bin = prefix.join("node_modules").join(".bin").join(install.bin);

    if is_executable(&bin) {
        debug!(path = %bin.display(), "Reusing previously installed binary");
        return Ok(bin);
    }

    info!(package = install.package, "Installing server on demand");
    tokio::fs::create_dir_all(&prefix)
        .await
        .with_context(|| format!("couldn't create `{}`", prefix.display()))?;

    let status = tokio::process::Command::new("npm")
        .arg("install")
        .arg("--prefix")
        .arg(&prefix)
        .arg(install.package)
        .status()
        .await
        .context("failed to run npm install")?;
    anyhow::ensure!(status.success(), "npm install of `{}` failed", install.package);
    anyhow::ensure!(
        is_executable(&bin),
        "npm install of `{}` did not produce `{}`",
        install.package,
        bin.display(),
    );

    Ok(bin)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;
    use lsp_mux::registry::DiagnosticsMode;
    use std::fs;

    fn test_spec(env_var: &'static str, candidates: &'static [&'static str]) -> ServerSpec {
        ServerSpec {
            name: "testsrv",
            aliases: &[],
            binary: BinarySpec {
                env_var,
                candidates,
                local_probe: Some("node_modules/.bin"),
                install: None,
            },
            args: &[],
            diagnostics: DiagnosticsMode::Passthrough,
            prepare_initialize: None,
        }
    }

    #[cfg(unix)]
    fn make_executable(path: &Path) {
        use std::os::unix::fs::PermissionsExt as _;
        fs::write(path, "#!/bin/sh\n").unwrap();
        let mut perms = fs::metadata(path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).unwrap();
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn env_override_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let fake = tmp.path().join("fake-server");
        make_executable(&fake);

        // SAFETY: test-local variable name, no reader outside this test.
        unsafe { env::set_var("LSPMUX_TEST_RESOLVE_OVERRIDE", &fake) };

        let spec = test_spec("LSPMUX_TEST_RESOLVE_OVERRIDE", &["missing-everywhere"]);
        let found = resolve_binary(&spec, tmp.path()).await.unwrap();
        assert_eq!(found, fake);
    }

    #[tokio::test]
    async fn env_override_must_point_at_a_file() {
        // SAFETY: test-local variable name, no reader outside this test.
        unsafe { env::set_var("LSPMUX_TEST_RESOLVE_DANGLING", "/does/not/exist") };

        let spec = test_spec("LSPMUX_TEST_RESOLVE_DANGLING", &["missing-everywhere"]);
        let error = resolve_binary(&spec, Path::new("/tmp")).await.unwrap_err();
        assert!(error.to_string().contains("LSPMUX_TEST_RESOLVE_DANGLING"));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn project_local_install_is_found_in_ancestors() {
        let tmp = tempfile::tempdir().unwrap();
        let bin_dir = tmp.path().join("node_modules/.bin");
        fs::create_dir_all(&bin_dir).unwrap();
        make_executable(&bin_dir.join("testsrv-bin"));

        // Resolve from a nested workspace member: the walk goes upward.
        let nested = tmp.path().join("packages/app");
        fs::create_dir_all(&nested).unwrap();

        let spec = test_spec("LSPMUX_TEST_RESOLVE_UNSET_1", &["testsrv-bin"]);
        let found = resolve_binary(&spec, &nested).await.unwrap();
        assert_eq!(found, bin_dir.join("testsrv-bin"));
    }

    #[tokio::test]
    async fn unresolvable_binary_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = test_spec("LSPMUX_TEST_RESOLVE_UNSET_2", &["definitely-not-installed-anywhere-x"]);
        let error = resolve_binary(&spec, tmp.path()).await.unwrap_err();
        assert!(error.to_string().contains("testsrv"));
    }
}
