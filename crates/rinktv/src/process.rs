use std::{
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    process::Command,
};

use crate::error::{RinkError, RinkResult};

/// An external program invocation with explicit arguments, environment,
/// working directory and timeout.
///
/// Arguments are passed as a list and never go through a shell.
#[derive(Debug, Clone)]
pub struct ExternalCommand {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    current_dir: Option<PathBuf>,
    timeout: Duration,
}

#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Combined output for diagnostics.
    pub fn diagnostics(&self) -> String {
        let mut output = self.stdout.trim_end().to_string();
        if !self.stderr.trim().is_empty() {
            if !output.is_empty() {
                output.push('\n');
            }
            output.push_str(self.stderr.trim_end());
        }
        output
    }
}

impl ExternalCommand {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
            timeout: Duration::from_secs(5 * 60),
        }
    }

    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_owned()));
        self
    }

    pub fn env<K: AsRef<OsStr>, V: AsRef<OsStr>>(mut self, key: K, value: V) -> Self {
        self.envs
            .push((key.as_ref().to_owned(), value.as_ref().to_owned()));
        self
    }

    pub fn current_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.current_dir = Some(dir.as_ref().to_owned());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .unwrap_or(self.program.as_os_str())
            .to_string_lossy()
            .into_owned()
    }

    /// Printable command line, quoted the way a shell would need it.
    pub fn display(&self) -> String {
        let parts: Vec<String> = std::iter::once(self.program.as_os_str())
            .chain(self.args.iter().map(OsString::as_os_str))
            .map(|s| s.to_string_lossy().into_owned())
            .collect();
        shlex::try_join(parts.iter().map(String::as_str)).unwrap_or_else(|_| parts.join(" "))
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        command
    }

    fn spawn_error(&self, error: std::io::Error) -> RinkError {
        RinkError::ExternalProgram {
            program: self.program_name(),
            reason: "failed to start".to_string(),
            output: error.to_string(),
        }
    }

    fn timeout_error(&self, output: String) -> RinkError {
        RinkError::ExternalProgram {
            program: self.program_name(),
            reason: format!("timed out after {}s", self.timeout.as_secs()),
            output,
        }
    }

    /// Run to completion and capture output. A non-zero exit is not an error here.
    pub async fn output(&self) -> RinkResult<ProcessOutput> {
        tracing::debug!("Running {}", self.display());
        let child = self.command().spawn().map_err(|e| self.spawn_error(e))?;

        // dropping the future on timeout drops the child, which kills it
        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output?;
                Ok(ProcessOutput {
                    status: output.status,
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                })
            }
            Err(_) => Err(self.timeout_error(String::new())),
        }
    }

    /// Run to completion, failing with [RinkError::ExternalProgram] on a non-zero exit.
    pub async fn run_checked(&self) -> RinkResult<ProcessOutput> {
        let output = self.output().await?;
        if !output.success() {
            return Err(RinkError::ExternalProgram {
                program: self.program_name(),
                reason: format!("exited with {}", output.status),
                output: output.diagnostics(),
            });
        }
        Ok(output)
    }

    /// Run to completion, handing every stdout line to `on_line` as soon as it arrives.
    pub async fn run_streaming<F>(&self, mut on_line: F) -> RinkResult<ProcessOutput>
    where
        F: FnMut(&str) + Send,
    {
        tracing::debug!("Running {}", self.display());
        let mut child = self.command().spawn().map_err(|e| self.spawn_error(e))?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let mut captured = String::new();
        let run = async {
            let read_stdout = async {
                if let Some(stdout) = stdout {
                    let mut lines = BufReader::new(stdout).lines();
                    while let Some(line) = lines.next_line().await? {
                        on_line(&line);
                        captured.push_str(&line);
                        captured.push('\n');
                    }
                }
                Ok::<_, std::io::Error>(())
            };
            let read_stderr = async {
                let mut buf = String::new();
                if let Some(mut stderr) = stderr {
                    stderr.read_to_string(&mut buf).await?;
                }
                Ok::<_, std::io::Error>(buf)
            };
            let (out, err) = tokio::join!(read_stdout, read_stderr);
            out?;
            let stderr = err?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, stderr))
        };

        let result = tokio::time::timeout(self.timeout, run).await;
        match result {
            Ok(result) => {
                let (status, stderr) = result?;
                Ok(ProcessOutput {
                    status,
                    stdout: captured,
                    stderr,
                })
            }
            Err(_) => {
                if let Err(e) = child.kill().await {
                    tracing::warn!("Failed to kill {}: {e}", self.program_name());
                }
                Err(self.timeout_error(captured))
            }
        }
    }
}
