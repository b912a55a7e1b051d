//! Adapter around the buildah executable.
//!
//! Every operation shells out to buildah, captures combined stdout/stderr
//! into a single buffer and races completion against a configurable
//! deadline. The buildah process is killed when the deadline passes; the
//! partial capture is kept for diagnostics.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// Errors produced by buildah invocations.
#[derive(Debug, Error)]
pub enum Error {
    /// The process outlived its deadline and was killed. The captured
    /// partial output is carried along for diagnostics.
    #[error("command timed out after {timeout:?}")]
    Timeout { timeout: Duration, output: String },

    /// The process ran to completion with a non-zero exit status.
    #[error("command {command:?} failed ({status}): {output}")]
    Failed {
        command: String,
        status: ExitStatus,
        output: String,
    },

    /// The process could not be spawned or awaited.
    #[error("can't run {command:?}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The registry auth file could not be materialized.
    #[error("can't create registry auth file")]
    AuthFile(#[source] std::io::Error),
}

/// A client for one buildah installation. Stateless aside from its
/// configuration; clones share nothing but that configuration.
#[derive(Clone, Debug)]
pub struct Client {
    /// Name used to prefix on-disk artifacts (registry auth files).
    pub driver_name: String,
    /// Path to the buildah binary.
    pub exec_path: PathBuf,
    /// Arguments inserted before every operation's own arguments.
    pub args: Vec<String>,
    /// Deadline for stage-in/stage-out operations. Zero disables it.
    pub timeout: Duration,
    /// Deadline for garbage collection, typically much larger.
    pub gc_timeout: Duration,
}

impl Client {
    /// Returns whether a buildah container with the given name exists.
    pub async fn container_exists(&self, name: &str) -> Result<bool, Error> {
        let filter = format!("name={}", name);
        let output = self
            .run(
                &[
                    "containers",
                    "--format",
                    "{{.ContainerName}}",
                    "--noheading",
                    "--filter",
                    &filter,
                ],
                self.timeout,
            )
            .await?;
        Ok(output.starts_with(name))
    }

    /// Creates a working container from an image, pulling it unconditionally.
    pub async fn from(
        &self,
        name: &str,
        image: &str,
        docker_config_json: Option<&str>,
        tls_verify: bool,
    ) -> Result<(), Error> {
        let mut args = vec![
            "from".to_owned(),
            "--name".to_owned(),
            name.to_owned(),
            "--pull-always".to_owned(),
        ];
        if !tls_verify {
            args.push("--tls-verify=false".to_owned());
        }
        // Hold the auth file guard across the call; dropping it removes the
        // file whether or not buildah succeeded.
        let auth_file = self.write_auth_file(name, docker_config_json)?;
        if let Some(file) = &auth_file {
            args.push("--authfile".to_owned());
            args.push(file.path().to_string_lossy().into_owned());
        }
        args.push(image.to_owned());

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&args, self.timeout).await?;
        Ok(())
    }

    /// Mounts the container's root filesystem and returns the mount point
    /// buildah reports, trimmed of trailing whitespace.
    pub async fn mount(&self, name: &str) -> Result<PathBuf, Error> {
        let output = self.run(&["mount", name], self.timeout).await?;
        Ok(PathBuf::from(output.trim_end()))
    }

    /// Commits the container to an image in docker format.
    pub async fn commit(&self, name: &str, image: &str, squash: bool) -> Result<(), Error> {
        let mut args = vec!["commit", "--format", "docker"];
        if squash {
            args.push("--squash");
        }
        args.push(name);
        args.push(image);
        self.run(&args, self.timeout).await?;
        Ok(())
    }

    /// Unmounts the container's root filesystem.
    pub async fn umount(&self, name: &str) -> Result<(), Error> {
        self.run(&["umount", name], self.timeout).await?;
        Ok(())
    }

    /// Pushes an image to its registry, with the same credential handling
    /// as [`Client::from`].
    pub async fn push(
        &self,
        name: &str,
        image: &str,
        docker_config_json: Option<&str>,
        tls_verify: bool,
    ) -> Result<(), Error> {
        let mut args = vec!["push".to_owned()];
        if !tls_verify {
            args.push("--tls-verify=false".to_owned());
        }
        let auth_file = self.write_auth_file(name, docker_config_json)?;
        if let Some(file) = &auth_file {
            args.push("--authfile".to_owned());
            args.push(file.path().to_string_lossy().into_owned());
        }
        args.push(image.to_owned());

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&args, self.timeout).await?;
        Ok(())
    }

    /// Removes the working container.
    pub async fn delete(&self, name: &str) -> Result<(), Error> {
        self.run(&["delete", name], self.timeout).await?;
        Ok(())
    }

    /// Runs one garbage collection pass (`rmi -p`) under the GC deadline.
    /// Failures are logged and swallowed; collection must never take its
    /// caller down.
    pub async fn gc_once(&self) {
        info!("collecting buildah garbage");
        if let Err(error) = self.run(&["rmi", "-p"], self.gc_timeout).await {
            error!(%error, "buildah garbage collection failed");
        }
        info!("done collecting buildah garbage");
    }

    /// Writes the docker config JSON verbatim into a temp file with mode
    /// 0700 and returns the guard keeping it alive. `None` when no
    /// credentials were supplied.
    fn write_auth_file(
        &self,
        name: &str,
        docker_config_json: Option<&str>,
    ) -> Result<Option<NamedTempFile>, Error> {
        let config = match docker_config_json {
            Some(config) => config,
            None => return Ok(None),
        };
        let mut file = tempfile::Builder::new()
            .prefix(&format!("{}-{}-", self.driver_name, name))
            .tempfile()
            .map_err(Error::AuthFile)?;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o700))
            .map_err(Error::AuthFile)?;
        file.write_all(config.as_bytes()).map_err(Error::AuthFile)?;
        file.flush().map_err(Error::AuthFile)?;
        Ok(Some(file))
    }

    async fn run(&self, args: &[&str], timeout: Duration) -> Result<String, Error> {
        let command = self.render_command(args);
        let mut child = Command::new(&self.exec_path)
            .args(&self.args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::Io {
                command: command.clone(),
                source,
            })?;

        // Drain both pipes as the process runs so that a killed process
        // still leaves its partial output behind.
        let capture = Arc::new(Mutex::new(Vec::new()));
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_task = tokio::spawn(drain(stdout, capture.clone()));
        let err_task = tokio::spawn(drain(stderr, capture.clone()));

        let status = if timeout.is_zero() {
            child.wait().await.map_err(|source| Error::Io {
                command: command.clone(),
                source,
            })?
        } else {
            match tokio::time::timeout(timeout, child.wait()).await {
                Ok(waited) => waited.map_err(|source| Error::Io {
                    command: command.clone(),
                    source,
                })?,
                Err(_) => {
                    let _ = child.kill().await;
                    // Orphaned grandchildren may still hold the pipes open,
                    // so don't wait for EOF; whatever was drained so far is
                    // the capture.
                    out_task.abort();
                    err_task.abort();
                    let output = read_capture(&capture).await;
                    error!(command = %command, ?timeout, output = %output, "command timed out");
                    return Err(Error::Timeout { timeout, output });
                }
            }
        };
        let _ = tokio::join!(out_task, err_task);
        let output = read_capture(&capture).await;

        if !status.success() {
            error!(command = %command, %status, output = %output, "command failed");
            return Err(Error::Failed {
                command,
                status,
                output,
            });
        }
        debug!(command = %command, output = %output, "command succeeded");
        Ok(output)
    }

    fn render_command(&self, args: &[&str]) -> String {
        let mut rendered = self.exec_path.to_string_lossy().into_owned();
        for arg in self.args.iter().map(String::as_str).chain(args.iter().copied()) {
            rendered.push(' ');
            rendered.push_str(arg);
        }
        rendered
    }
}

async fn drain(pipe: Option<impl AsyncRead + Unpin>, capture: Arc<Mutex<Vec<u8>>>) {
    let mut pipe = match pipe {
        Some(pipe) => pipe,
        None => return,
    };
    let mut chunk = [0u8; 4096];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => capture.lock().await.extend_from_slice(&chunk[..n]),
        }
    }
}

async fn read_capture(capture: &Arc<Mutex<Vec<u8>>>) -> String {
    let buffer = capture.lock().await;
    String::from_utf8_lossy(&buffer).into_owned()
}
