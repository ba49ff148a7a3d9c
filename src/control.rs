use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info};

use crate::config::{Config, Controller};

/// What the daemon needs from whatever runs the service.
pub trait ProcessControl {
    fn pull_image(&self, image: &str) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn start(&self) -> Result<()>;

    /// Stop, refresh and recreate the service.
    fn restart(&self) -> Result<()> {
        self.stop()?;
        self.start()
    }

    fn current_running_version(&self) -> Result<Option<String>>;
}

pub fn from_config(config: &Config) -> Box<dyn ProcessControl> {
    match config.target.controller {
        Controller::None => Box::new(NoopControl),
        Controller::Compose => Box::new(ComposeControl::new(
            config.target.docker_bin.clone(),
            config.compose_file(),
            Some(config.env_file()),
            Duration::from_secs(config.target.command_timeout_secs.max(1)),
        )),
    }
}

/// For offline or test installs where nothing has to be started or stopped.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopControl;

impl ProcessControl for NoopControl {
    fn pull_image(&self, image: &str) -> Result<()> {
        debug!(image = %image, "no process controller configured, skipping pull");
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn current_running_version(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Drives a compose stack through the docker CLI.
#[derive(Debug, Clone)]
pub struct ComposeControl {
    docker_bin: String,
    compose_file: PathBuf,
    env_file: Option<PathBuf>,
    timeout: Duration,
}

impl ComposeControl {
    pub fn new(
        docker_bin: String,
        compose_file: PathBuf,
        env_file: Option<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            docker_bin,
            compose_file,
            env_file,
            timeout,
        }
    }

    fn compose_args(&self, tail: &[&str]) -> Vec<String> {
        let mut args = vec![
            "compose".to_string(),
            "-f".to_string(),
            self.compose_file.display().to_string(),
        ];
        if let Some(env_file) = self.env_file.as_ref().filter(|path| path.is_file()) {
            args.push("--env-file".to_string());
            args.push(env_file.display().to_string());
        }
        args.extend(tail.iter().map(|arg| arg.to_string()));
        args
    }

    fn working_dir(&self) -> Option<&Path> {
        self.compose_file.parent().filter(|dir| dir.is_dir())
    }

    fn run_checked(&self, args: &[String]) -> Result<CommandOutput> {
        let output = run_command(&self.docker_bin, args, self.working_dir(), self.timeout)?;
        if !output.success {
            return Err(anyhow!(
                "'{} {}' failed (exit {:?}{}): {}",
                self.docker_bin,
                args.join(" "),
                output.exit_code,
                if output.timed_out { ", timed out" } else { "" },
                output.stderr
            ));
        }
        Ok(output)
    }
}

impl ProcessControl for ComposeControl {
    fn pull_image(&self, image: &str) -> Result<()> {
        info!(image = %image, "pulling image");
        self.run_checked(&["pull".to_string(), image.to_string()])?;
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if !self.compose_file.is_file() {
            debug!(compose_file = %self.compose_file.display(), "compose file missing, nothing to stop");
            return Ok(());
        }
        info!("stopping service stack");
        self.run_checked(&self.compose_args(&["down"]))?;
        Ok(())
    }

    fn start(&self) -> Result<()> {
        info!("starting service stack");
        self.run_checked(&self.compose_args(&["up", "-d"]))?;
        Ok(())
    }

    fn restart(&self) -> Result<()> {
        self.stop()?;
        self.run_checked(&self.compose_args(&["pull"]))?;
        self.start()
    }

    fn current_running_version(&self) -> Result<Option<String>> {
        let output = self.run_checked(&self.compose_args(&["ps", "--format", "{{.Image}}"]))?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .and_then(image_tag))
    }
}

/// `registry/app:1.2.3` -> `1.2.3`. A port in the registry host is not a tag.
pub fn image_tag(image: &str) -> Option<String> {
    let without_digest = image.split('@').next().unwrap_or(image);
    let (name, tag) = without_digest.rsplit_once(':')?;
    if tag.contains('/') || name.is_empty() || tag.is_empty() {
        return None;
    }
    Some(tag.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub timed_out: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Runs a command to completion, killing it once `timeout` has elapsed.
pub fn run_command(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    timeout: Duration,
) -> Result<CommandOutput> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }
    debug!(program = %program, args = ?args, "running command");
    let mut child = command
        .spawn()
        .with_context(|| format!("failed running '{}' with args {:?}", program, args))?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let started = Instant::now();
    let (status, timed_out) = loop {
        if let Some(status) = child
            .try_wait()
            .with_context(|| format!("failed checking command {}", program))?
        {
            break (Some(status), false);
        }
        if started.elapsed() >= timeout {
            kill_quietly(&mut child);
            break (None, true);
        }
        thread::sleep(Duration::from_millis(50));
    };

    let stdout = join_output(stdout);
    let mut stderr = join_output(stderr);
    if timed_out {
        let timeout_msg = format!(
            "command timed out after {} seconds and was killed",
            timeout.as_secs()
        );
        stderr = if stderr.trim().is_empty() {
            timeout_msg
        } else {
            format!("{} | {}", timeout_msg, stderr.trim())
        };
    }

    Ok(CommandOutput {
        success: status.is_some_and(|status| status.success()),
        timed_out,
        exit_code: status.and_then(|status| status.code()),
        stdout,
        stderr: summarize_log(&stderr),
    })
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).to_string()
        })
    })
}

fn join_output(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

fn kill_quietly(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn summarize_log(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.chars().count() <= 500 {
        return trimmed.to_string();
    }
    let prefix = trimmed.chars().take(500).collect::<String>();
    format!("{}...", prefix)
}
