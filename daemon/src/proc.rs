use nix::sys::signal::{self, Signal};
use nix::unistd::{self, Pid};
use pkgbuilderd_common::errors::*;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time;

/// Grace period between SIGTERM and SIGKILL once a command timed out.
const KILL_GRACE: Duration = Duration::from_secs(10);

pub struct Options {
    pub timeout: Duration,
    pub cwd: Option<PathBuf>,
    /// Fed to the command and closed, keeps secrets off the command line.
    pub stdin: Option<Vec<u8>>,
    pub envs: HashMap<String, String>,
}

impl Options {
    pub fn new(timeout: Duration) -> Options {
        Options {
            timeout,
            cwd: None,
            stdin: None,
            envs: HashMap::new(),
        }
    }

    pub fn cwd<P: Into<PathBuf>>(mut self, cwd: P) -> Options {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn stdin<B: Into<Vec<u8>>>(mut self, stdin: B) -> Options {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Options {
        self.envs.insert(key.into(), value.into());
        self
    }

    fn command<I, S>(&self, bin: &Path, args: I) -> Command
        where I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(bin);
        cmd.args(args)
            .envs(&self.envs)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(match self.stdin {
                Some(_) => Stdio::piped(),
                None => Stdio::null(),
            });
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        // own process group, a timeout takes down everything it spawned
        unsafe {
            cmd.pre_exec(|| {
                unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::from)
            });
        }
        cmd
    }
}

fn signal_group(child: &Child, sig: Signal) {
    if let Some(pid) = child.id() {
        debug!("Sending {} to process group {}", sig, pid);
        if let Err(err) = signal::killpg(Pid::from_raw(pid as i32), sig) {
            warn!("Failed to send {} to process group {}: {}", sig, pid, err);
        }
    }
}

async fn terminate(child: &mut Child) -> Result<()> {
    signal_group(child, Signal::SIGTERM);
    if time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        warn!("Process did not exit {}s after SIGTERM", KILL_GRACE.as_secs());
        signal_group(child, Signal::SIGKILL);
        child.wait().await?;
    }
    Ok(())
}

/// Run a command to completion and return whether it succeeded, along with
/// stdout followed by stderr.
///
/// A command that exceeds its timeout is killed and reported as failed,
/// with whatever it printed so far.
pub async fn run_capture<I, S>(bin: &Path, args: I, opts: Options) -> Result<(bool, String)>
    where I: IntoIterator<Item = S> + fmt::Debug,
    S: AsRef<OsStr>,
{
    debug!("Running {:?} {:?}", bin, args);
    let mut child = opts.command(bin, args).spawn()
        .with_context(|| anyhow!("Failed to spawn {:?}", bin))?;

    let stdin = child.stdin.take();
    let mut stdout = child.stdout.take()
        .context("Child has no stdout")?;
    let mut stderr = child.stderr.take()
        .context("Child has no stderr")?;

    let mut out = Vec::new();
    let mut err = Vec::new();
    let finished = {
        let feed = async {
            if let (Some(mut pipe), Some(input)) = (stdin, opts.stdin.as_deref()) {
                pipe.write_all(input).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let collect = async {
            let (fed, o, e) = tokio::join!(
                feed,
                stdout.read_to_end(&mut out),
                stderr.read_to_end(&mut err),
            );
            fed?;
            o?;
            e?;
            child.wait().await
        };
        time::timeout(opts.timeout, collect).await
    };

    let success = match finished {
        Ok(status) => {
            let status = status?;
            debug!("{:?} exited with {}", bin, status);
            status.success()
        }
        Err(_) => {
            warn!("{:?} timed out after {}s, killing", bin, opts.timeout.as_secs());
            terminate(&mut child).await?;
            err.extend(format!("\n\nKilled after timeout of {}s\n", opts.timeout.as_secs()).as_bytes());
            false
        }
    };

    out.extend(err);
    Ok((success, String::from_utf8_lossy(&out).into_owned()))
}
