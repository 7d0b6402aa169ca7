//! Applies a rendered configuration document to the live proxy
//!
//! Each apply runs validate -> stage -> activate -> signal. The document is
//! staged next to the active file and activated with a single atomic rename,
//! so concurrent readers never observe a half-written document. If the
//! reload signal fails or times out, the prior document is restored the same
//! way and the proxy keeps serving its last-known-good configuration.

use crate::error::{Error, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Default bound on the reload signal
const DEFAULT_RELOAD_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of a successful apply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The document was activated and the proxy reloaded
    Applied,
    /// The active document was already byte-identical; nothing was touched
    Unchanged,
}

/// Reconciles the proxy's on-disk configuration with a desired document.
///
/// Never mutates the route set itself; callers re-apply freely because an
/// unchanged document short-circuits before the reload signal.
pub struct ProxyReconciler {
    config_path: PathBuf,
    reload_cmd: String,
    check_cmd: Option<String>,
    reload_timeout: Duration,
}

impl ProxyReconciler {
    pub fn new(config_path: impl Into<PathBuf>, reload_cmd: &str) -> Self {
        Self {
            config_path: config_path.into(),
            reload_cmd: reload_cmd.to_string(),
            check_cmd: None,
            reload_timeout: DEFAULT_RELOAD_TIMEOUT,
        }
    }

    /// External syntax check run against the staged file before activation,
    /// e.g. `nginx -t -c {}`. `{}` is replaced with the staged path; without
    /// a placeholder the path is appended as the last argument.
    pub fn with_check_cmd(mut self, cmd: &str) -> Self {
        self.check_cmd = Some(cmd.to_string());
        self
    }

    pub fn with_reload_timeout(mut self, timeout: Duration) -> Self {
        self.reload_timeout = timeout;
        self
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Make the live proxy match `document`. On any failure the active file
    /// is left holding the previous document.
    pub async fn apply(&self, document: &str) -> Result<ApplyOutcome> {
        validate_document(document)?;

        let prior = match std::fs::read(&self.config_path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        if prior.as_deref() == Some(document.as_bytes()) {
            debug!(path = %self.config_path.display(), "Config unchanged, skipping reload");
            return Ok(ApplyOutcome::Unchanged);
        }

        // Stage in the active file's directory so the rename below cannot
        // cross filesystems.
        let staged = self.stage(document)?;

        if let Some(check_cmd) = &self.check_cmd {
            let cmdline = substitute_path(check_cmd, staged.path());
            debug!(cmd = %cmdline, "Checking staged config");
            if let Err(reason) = self.run_command(&cmdline).await {
                // `staged` drops here and removes the temp file.
                return Err(Error::ConfigValidation(reason));
            }
        }

        staged
            .persist(&self.config_path)
            .map_err(|e| Error::Io(e.error))?;
        debug!(path = %self.config_path.display(), "Config activated");

        if let Err(reason) = self.run_command(&self.reload_cmd).await {
            warn!(error = %reason, "Reload failed, restoring previous config");
            self.restore(prior);
            return Err(Error::ReloadFailed(reason));
        }

        info!(
            path = %self.config_path.display(),
            bytes = document.len(),
            "Proxy config applied and reloaded"
        );
        Ok(ApplyOutcome::Applied)
    }

    /// Write the document to a temp file next to the active config
    fn stage(&self, document: &str) -> Result<NamedTempFile> {
        let dir = self
            .config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let mut staged = tempfile::Builder::new()
            .prefix(".portgate-staged-")
            .tempfile_in(dir)?;
        staged.write_all(document.as_bytes())?;
        staged.flush()?;
        Ok(staged)
    }

    /// Put the prior document back after a failed reload. Best effort: a
    /// restore failure is logged, the reload error still surfaces.
    fn restore(&self, prior: Option<Vec<u8>>) {
        let result = match prior {
            Some(bytes) => self.stage_bytes_and_persist(&bytes),
            None => match std::fs::remove_file(&self.config_path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            },
        };

        match result {
            Ok(()) => info!(path = %self.config_path.display(), "Previous config restored"),
            Err(e) => error!(
                path = %self.config_path.display(),
                error = %e,
                "Failed to restore previous config"
            ),
        }
    }

    fn stage_bytes_and_persist(&self, bytes: &[u8]) -> Result<()> {
        let dir = self
            .config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let mut staged = tempfile::Builder::new()
            .prefix(".portgate-restore-")
            .tempfile_in(dir)?;
        staged.write_all(bytes)?;
        staged.flush()?;
        staged
            .persist(&self.config_path)
            .map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// Run a command line under the reload timeout. Returns a human-readable
    /// reason on any failure (spawn error, nonzero exit, timeout).
    async fn run_command(&self, cmdline: &str) -> std::result::Result<(), String> {
        let words = shell_words::split(cmdline)
            .map_err(|e| format!("invalid command line '{}': {}", cmdline, e))?;
        let (program, args) = words
            .split_first()
            .ok_or_else(|| "empty command line".to_string())?;

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to spawn '{}': {}", program, e))?;

        let output = tokio::time::timeout(self.reload_timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                format!(
                    "'{}' timed out after {:?}",
                    cmdline, self.reload_timeout
                )
            })?
            .map_err(|e| format!("failed to run '{}': {}", cmdline, e))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!(
                "'{}' exited with {}: {}",
                cmdline,
                output.status,
                stderr.trim()
            ))
        }
    }
}

/// Structural check of a rendered document: balanced braces and one listen
/// directive per server block. Runs on every apply, before any configured
/// external check command.
pub fn validate_document(document: &str) -> Result<()> {
    if document.trim().is_empty() {
        return Err(Error::ConfigValidation("document is empty".to_string()));
    }

    let mut depth: i32 = 0;
    for (lineno, line) in document.lines().enumerate() {
        for ch in line.chars() {
            match ch {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth < 0 {
                        return Err(Error::ConfigValidation(format!(
                            "unbalanced '}}' at line {}",
                            lineno + 1
                        )));
                    }
                }
                _ => {}
            }
        }
    }
    if depth != 0 {
        return Err(Error::ConfigValidation(format!(
            "{} unclosed block(s)",
            depth
        )));
    }

    let servers = document.matches("server {").count();
    let listens = document
        .lines()
        .filter(|l| l.trim_start().starts_with("listen "))
        .count();
    if servers != listens {
        return Err(Error::ConfigValidation(format!(
            "{} server block(s) but {} listen directive(s)",
            servers, listens
        )));
    }

    Ok(())
}

fn substitute_path(cmdline: &str, path: &Path) -> String {
    if cmdline.contains("{}") {
        cmdline.replace("{}", &path.display().to_string())
    } else {
        format!("{} {}", cmdline, path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC_A: &str = "# test\nserver {\n    listen 30000;\n}\n";
    const DOC_B: &str = "# test\nserver {\n    listen 30001;\n}\n";

    fn reconciler_in(dir: &Path, reload_cmd: &str) -> ProxyReconciler {
        ProxyReconciler::new(dir.join("portgate.conf"), reload_cmd)
    }

    #[tokio::test]
    async fn test_apply_writes_document() {
        let dir = tempfile::tempdir().unwrap();
        let rec = reconciler_in(dir.path(), "/bin/true");

        let outcome = rec.apply(DOC_A).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(std::fs::read_to_string(rec.config_path()).unwrap(), DOC_A);

        // No staging residue left behind.
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with(".portgate-")
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_unchanged_document_skips_reload() {
        let dir = tempfile::tempdir().unwrap();
        let rec = reconciler_in(dir.path(), "/bin/true");
        rec.apply(DOC_A).await.unwrap();

        // A failing reload command proves the signal is never sent.
        let rec = reconciler_in(dir.path(), "/bin/false");
        let outcome = rec.apply(DOC_A).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_validation_failure_leaves_active_config_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let rec = reconciler_in(dir.path(), "/bin/true");
        rec.apply(DOC_A).await.unwrap();

        let err = rec.apply("server {\n    listen 1;\n").await.unwrap_err();
        assert!(matches!(err, Error::ConfigValidation(_)));
        assert_eq!(std::fs::read_to_string(rec.config_path()).unwrap(), DOC_A);
    }

    #[tokio::test]
    async fn test_check_cmd_failure_aborts_before_activation() {
        let dir = tempfile::tempdir().unwrap();
        let rec = reconciler_in(dir.path(), "/bin/true").with_check_cmd("/bin/false");

        let err = rec.apply(DOC_A).await.unwrap_err();
        assert!(matches!(err, Error::ConfigValidation(_)));
        assert!(!rec.config_path().exists());
    }

    #[tokio::test]
    async fn test_check_cmd_sees_staged_file() {
        let dir = tempfile::tempdir().unwrap();
        let rec = reconciler_in(dir.path(), "/bin/true").with_check_cmd("test -s {}");

        rec.apply(DOC_A).await.unwrap();
        assert_eq!(std::fs::read_to_string(rec.config_path()).unwrap(), DOC_A);
    }

    #[tokio::test]
    async fn test_reload_failure_restores_prior_config() {
        let dir = tempfile::tempdir().unwrap();
        let rec = reconciler_in(dir.path(), "/bin/true");
        rec.apply(DOC_A).await.unwrap();

        let rec = reconciler_in(dir.path(), "/bin/false");
        let err = rec.apply(DOC_B).await.unwrap_err();
        assert!(matches!(err, Error::ReloadFailed(_)));
        assert_eq!(std::fs::read_to_string(rec.config_path()).unwrap(), DOC_A);
    }

    #[tokio::test]
    async fn test_reload_failure_with_no_prior_config_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let rec = reconciler_in(dir.path(), "/bin/false");

        let err = rec.apply(DOC_A).await.unwrap_err();
        assert!(matches!(err, Error::ReloadFailed(_)));
        assert!(!rec.config_path().exists());
    }

    #[tokio::test]
    async fn test_reload_timeout_is_treated_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let rec = reconciler_in(dir.path(), "/bin/sleep 5")
            .with_reload_timeout(Duration::from_millis(100));
        let rec2 = reconciler_in(dir.path(), "/bin/true");
        rec2.apply(DOC_A).await.unwrap();

        let start = std::time::Instant::now();
        let err = rec.apply(DOC_B).await.unwrap_err();
        assert!(matches!(err, Error::ReloadFailed(_)));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(std::fs::read_to_string(rec.config_path()).unwrap(), DOC_A);
    }

    #[test]
    fn test_validate_document_rejects_structural_errors() {
        assert!(validate_document("").is_err());
        assert!(validate_document("server {\n    listen 1;\n").is_err());
        assert!(validate_document("server }\n").is_err());
        assert!(validate_document("server {\n}\n").is_err());
        assert!(validate_document(DOC_A).is_ok());
    }

    #[test]
    fn test_substitute_path_placeholder_and_append() {
        let path = Path::new("/tmp/x.conf");
        assert_eq!(
            substitute_path("nginx -t -c {}", path),
            "nginx -t -c /tmp/x.conf"
        );
        assert_eq!(substitute_path("/bin/true", path), "/bin/true /tmp/x.conf");
    }
}
