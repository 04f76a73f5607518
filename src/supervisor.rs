//! Child-process supervisor: atomic start/stop, argv templating from the
//! current network configuration, output tailing, and restart-on-death.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SupervisorConfig;
use crate::netprobe::{NetCfg, NetworkProbe};

/// Fixed grace period between `SIGTERM` and `SIGKILL`. Not configurable,
/// matching the one-size grace period the system this replaces always used.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Fixed backoff between a child dying (or failing to launch) and the next
/// launch attempt. A crude bound on restart storms; not configurable.
const RESTART_DELAY: Duration = Duration::from_secs(1);

const ENV_STUN_URL: &str = "LIVE777_STUN_URL";
const ENV_VIDEO_SOURCE: &str = "LIVE777_VIDEO_SOURCE";
const ENV_AUDIO_SOURCE: &str = "LIVE777_AUDIO_SOURCE";
const VIDEO_SOURCE: &str = "kvmd::ustreamer::h264";
const AUDIO_SOURCE: &str = "hw:tc358743,0";

/// Everything needed to signal and reap one child epoch without sharing
/// ownership of its `tokio::process::Child` with the task that tails it.
struct ChildHandle {
    task: JoinHandle<()>,
    cancel: CancellationToken,
    pid: Arc<Mutex<Option<u32>>>,
}

/// Keeps at most one child process alive, restarting it whenever the
/// network configuration it was launched with goes stale.
///
/// Start/stop are serialized through one `tokio::sync::Mutex` (fair,
/// FIFO-queueing) so no two start/stop calls ever interleave on the same
/// supervisor instance.
pub struct Supervisor {
    config: SupervisorConfig,
    argv_template: Vec<String>,
    child: Mutex<Option<ChildHandle>>,
}

impl Supervisor {
    /// Builds the effective argv template once: the removal list is
    /// applied, then the append list, both exactly once - re-rendering
    /// later with a different `NetCfg` never redoes this step.
    pub fn new(config: SupervisorConfig) -> Self {
        let mut template: Vec<String> = config
            .argv_template
            .iter()
            .filter(|tok| !config.argv_remove.contains(tok))
            .cloned()
            .collect();
        template.extend(config.argv_append.iter().cloned());
        Self {
            config,
            argv_template: template,
            child: Mutex::new(None),
        }
    }

    /// Runs the outer probe/compare/start-or-stop loop until `shutdown`
    /// fires. Always stops the child before returning.
    pub async fn run(&self, mut probe: NetworkProbe, shutdown: CancellationToken) {
        tracing::info!("Starting Live777 Runner ...");
        let mut previous: Option<NetCfg> = None;
        let mut first_iteration = true;

        loop {
            let cfg = if first_iteration {
                tracing::info!("Probing the network first time ...");
                first_iteration = false;
                probe.probe().await
            } else {
                self.probe_with_retry(&mut probe).await
            };

            self.apply_if_changed(cfg, &mut previous).await;

            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.stop().await;
                    tracing::info!("Bye-bye");
                    return;
                }
                _ = tokio::time::sleep(self.config.check_interval()) => {}
            }
        }
    }

    /// Compares `cfg` against `previous` and, on any difference, stops the
    /// running child and - unless the new configuration has an empty
    /// `src_ip` - starts a replacement. Leaves the child alone when `cfg`
    /// is unchanged. Factored out of `run()` so the restart/stop decision
    /// is directly testable without a real probe loop.
    async fn apply_if_changed(&self, cfg: NetCfg, previous: &mut Option<NetCfg>) {
        if previous.as_ref() == Some(&cfg) {
            return;
        }
        tracing::info!("Got new {cfg:?}");
        if cfg.src_ip.is_empty() {
            tracing::warn!("Empty src_ip; stopping Live777 ...");
            self.stop().await;
        } else {
            self.stop().await;
            tracing::info!("Starting Live777 ...");
            self.start(&cfg).await;
        }
        *previous = Some(cfg);
    }

    /// One attempt on the very first call; afterwards up to
    /// `check_retries` attempts, stopping as soon as a probe comes back
    /// with a non-empty `ext_ip`.
    async fn probe_with_retry(&self, probe: &mut NetworkProbe) -> NetCfg {
        let mut cfg = probe.probe().await;
        let mut attempts = 1;
        while cfg.ext_ip.is_empty() && attempts < self.config.check_retries.max(1) {
            tokio::time::sleep(self.config.check_retries_delay()).await;
            cfg = probe.probe().await;
            attempts += 1;
        }
        if attempts > 1 && !cfg.ext_ip.is_empty() {
            tracing::info!("I'm fine, continue working ...");
        }
        cfg
    }

    async fn start(&self, cfg: &NetCfg) {
        let mut guard = self.child.lock().await;
        debug_assert!(guard.is_none(), "start() called while a child is already tracked");
        if guard.is_some() {
            return;
        }

        let mut argv = Vec::with_capacity(self.argv_template.len() + 1);
        argv.push(self.config.bin.clone());
        argv.extend(self.render_argv(cfg));
        let env = render_env(cfg);

        let cancel = CancellationToken::new();
        let pid = Arc::new(Mutex::new(None));
        let task = tokio::spawn(run_child_epoch(argv, env, cancel.clone(), pid.clone()));

        *guard = Some(ChildHandle { task, cancel, pid });
    }

    /// Cancels the supervisory task, awaits it, then unconditionally
    /// kills and reaps whatever pid it last published. A second `stop()`
    /// queued behind an in-flight one finds nothing to do and returns
    /// immediately - a no-op, not a re-entrant cancel.
    async fn stop(&self) {
        let mut guard = self.child.lock().await;
        let Some(handle) = guard.take() else {
            return;
        };
        drop(guard);

        handle.cancel.cancel();
        let _ = handle.task.await;

        let residual_pid = *handle.pid.lock().await;
        if let Some(pid) = residual_pid {
            kill_and_reap(pid, KILL_GRACE).await;
        }
    }

    /// Renders `{name}`-style placeholders in the effective argv template
    /// (`nat_type`, `src_ip`, `ext_ip`, `stun_host`, `stun_ip`, `stun_port`,
    /// plus the synthetic `o_stun_server`) against one `NetCfg`.
    fn render_argv(&self, cfg: &NetCfg) -> Vec<String> {
        let o_stun_server = if cfg.ext_ip.is_empty() {
            String::new()
        } else {
            format!("--stun-server={}:{}", cfg.stun_ip, cfg.stun_port)
        };
        let placeholders: HashMap<&str, String> = HashMap::from([
            ("nat_type", cfg.nat_type.label().to_string()),
            ("src_ip", cfg.src_ip.clone()),
            ("ext_ip", cfg.ext_ip.clone()),
            ("stun_host", cfg.stun_host.clone()),
            ("stun_ip", cfg.stun_ip.clone()),
            ("stun_port", cfg.stun_port.to_string()),
            ("o_stun_server", o_stun_server),
        ]);

        let drop_o_stun_server = cfg.ext_ip.is_empty();
        self.argv_template
            .iter()
            .filter(|tok| !(drop_o_stun_server && tok.as_str() == "{o_stun_server}"))
            .map(|tok| {
                let mut rendered = tok.clone();
                for (key, value) in &placeholders {
                    rendered = rendered.replace(&format!("{{{key}}}"), value);
                }
                rendered
            })
            .collect()
    }
}

fn render_env(cfg: &NetCfg) -> Vec<(String, String)> {
    vec![
        (ENV_STUN_URL.to_string(), format!("stun:{}:{}", cfg.stun_host, cfg.stun_port)),
        (ENV_VIDEO_SOURCE.to_string(), VIDEO_SOURCE.to_string()),
        (ENV_AUDIO_SOURCE.to_string(), AUDIO_SOURCE.to_string()),
    ]
}

/// Per-child-epoch task: launches, tails stdout/stderr into the logger,
/// and restarts on unexpected death - forever, until cancelled. This is
/// the one task the outer supervisor reaches through to cancel, matching
/// the teacher's own `run`/`run_loop` split but collapsed into a single
/// `JoinHandle` so there's exactly one cancellation point.
async fn run_child_epoch(
    argv: Vec<String>,
    env: Vec<(String, String)>,
    cancel: CancellationToken,
    pid_slot: Arc<Mutex<Option<u32>>>,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.env_clear();
        for (key, value) in &env {
            cmd.env(key, value);
        }
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // Left at its default (false): the pid-slot protocol, not Drop, owns
        // killing this process once this task's local `child` goes away.
        cmd.kill_on_drop(false);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                tracing::error!("failed to launch child: {err:#}");
                tokio::time::sleep(RESTART_DELAY).await;
                continue;
            }
        };

        let pid = child.id();
        *pid_slot.lock().await = pid;
        tracing::info!(?pid, ?argv, "Starting Live777 ...");

        let mut stdout_lines = child.stdout.take().map(|s| BufReader::new(s).lines());
        let mut stderr_lines = child.stderr.take().map(|s| BufReader::new(s).lines());

        let exit_status = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // Cancellation wins over any in-flight output line or exit;
                    // leave the pid published for stop()'s unconditional kill+reap.
                    return;
                }
                status = child.wait() => {
                    break Some(status);
                }
                line = next_line(&mut stdout_lines) => {
                    if let Some(line) = line {
                        tracing::info!("{line}");
                    }
                }
                line = next_line(&mut stderr_lines) => {
                    if let Some(line) = line {
                        tracing::warn!("{line}");
                    }
                }
            }
        };

        *pid_slot.lock().await = None;
        match exit_status {
            Some(Ok(status)) => tracing::warn!(%status, "Live777 unexpectedly died"),
            Some(Err(err)) => tracing::warn!("error waiting on child: {err:#}"),
            None => unreachable!("loop only breaks with Some(status)"),
        }
        tokio::time::sleep(RESTART_DELAY).await;
    }
}

/// Reads the next line from a tailed output stream, or waits forever once
/// the stream is exhausted/broken - avoids busy-looping a `select!` branch
/// on a pipe that has already hit EOF.
async fn next_line<R: AsyncRead + Unpin>(lines: &mut Option<Lines<BufReader<R>>>) -> Option<String> {
    let Some(l) = lines.as_mut() else {
        return std::future::pending().await;
    };
    match l.next_line().await {
        Ok(Some(line)) => Some(line),
        Ok(None) => {
            *lines = None;
            None
        }
        Err(err) => {
            tracing::debug!("error reading child output: {err}");
            *lines = None;
            None
        }
    }
}

/// `SIGTERM`, poll for exit up to `grace`, `SIGKILL` if still alive, then
/// an unconditional blocking reap so no zombie is left behind regardless
/// of which signal actually stopped the process. Treats "no such process"
/// as already-handled rather than an error, matching the bare-pid kill
/// pattern this is grounded on.
async fn kill_and_reap(pid: u32, grace: Duration) {
    let target = Pid::from_raw(pid as i32);

    if let Err(err) = kill(target, Signal::SIGTERM) {
        if err != Errno::ESRCH {
            tracing::warn!(pid, "SIGTERM failed: {err}");
        }
    }

    let deadline = tokio::time::Instant::now() + grace;
    loop {
        match waitpid(target, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                if tokio::time::Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Ok(_) => return,
            Err(Errno::ECHILD) => return,
            Err(err) => {
                tracing::warn!(pid, "waitpid failed: {err}");
                return;
            }
        }
    }

    if let Err(err) = kill(target, Signal::SIGKILL) {
        if err != Errno::ESRCH {
            tracing::warn!(pid, "SIGKILL failed: {err}");
        }
    }
    let _ = tokio::task::spawn_blocking(move || waitpid(target, None)).await;
}
