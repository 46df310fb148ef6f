//! Runs a child process under a swapped identity.
//!
//! Signals received by this process are relayed to the child for as long as it
//! runs, and its termination is turned into an exit status for the caller.

use std::io;
use std::process::{ExitStatus, Stdio};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Pending signals buffered between arrival and relay.
pub const SIGNAL_QUEUE_CAPACITY: usize = 128;

/// Signals relayed to the child. SIGCHLD reports our own child and KILL/STOP can't be caught.
pub const FORWARDED_SIGNALS: &[Signal] = &[
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTERM,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGWINCH,
    Signal::SIGALRM,
    Signal::SIGCONT,
    Signal::SIGTSTP,
];

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("exited on start: {0}")]
    Launch(io::Error),
    #[error("subscribing to signals: {0}")]
    Subscribe(io::Error),
    #[error("reverting identity: {0:#}")]
    Revert(anyhow::Error),
}

/// How the child ended, as seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Success,
    Exited(i32),
    /// Terminated by the given signal number.
    Signaled(i32),
    /// Waiting failed, or the status carried neither a code nor a signal.
    Unknown,
}

impl ExitOutcome {
    pub fn from_status(status: ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        match (status.code(), status.signal()) {
            (Some(0), _) => ExitOutcome::Success,
            (Some(code), _) => ExitOutcome::Exited(code),
            (None, Some(signo)) => ExitOutcome::Signaled(signo),
            (None, None) => ExitOutcome::Unknown,
        }
    }

    /// Status to exit with. Signals follow the shell convention of 128 + signal number.
    pub fn exit_code(self) -> i32 {
        match self {
            ExitOutcome::Success => 0,
            ExitOutcome::Exited(code) => code,
            ExitOutcome::Signaled(signo) => 128 + signo,
            ExitOutcome::Unknown => 1,
        }
    }

    pub fn is_success(self) -> bool {
        self == ExitOutcome::Success
    }
}

/// When the identity is switched back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RevertPoint {
    /// Once the child has terminated.
    #[default]
    OnExit,
    /// As soon as the child has started.
    AfterStart,
}

/// Delivers a signal to a process.
pub trait SignalForwarder {
    fn forward(&mut self, pid: u32, signal: Signal) -> io::Result<()>;
}

/// Forwards with kill(2).
#[derive(Debug, Default)]
pub struct KillForwarder;

impl SignalForwarder for KillForwarder {
    fn forward(&mut self, pid: u32, signal: Signal) -> io::Result<()> {
        kill(Pid::from_raw(pid as i32), signal).map_err(io::Error::from)
    }
}

/// Incoming signals, in arrival order. Dropping it stops listening.
pub struct SignalSubscription {
    rx: mpsc::Receiver<Signal>,
    listeners: Vec<JoinHandle<()>>,
}

impl SignalSubscription {
    /// Start listening for every signal in [`FORWARDED_SIGNALS`]. Must be called inside a runtime.
    pub fn subscribe() -> io::Result<Self> {
        let (tx, rx) = mpsc::channel(SIGNAL_QUEUE_CAPACITY);
        Self::listen(FORWARDED_SIGNALS, &tx, rx)
    }

    fn listen(
        signals: &[Signal],
        tx: &mpsc::Sender<Signal>,
        rx: mpsc::Receiver<Signal>,
    ) -> io::Result<Self> {
        // Built up in place so a failed registration drops (and aborts) the listeners already started
        let mut subscription = Self {
            rx,
            listeners: Vec::with_capacity(signals.len()),
        };
        for &sig in signals {
            let mut stream = signal(SignalKind::from_raw(sig as i32))?;
            let tx = tx.clone();
            subscription.listeners.push(tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    match tx.try_send(sig) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            log::debug!("Signal queue full, dropping {}", sig);
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => return,
                    }
                }
            }));
        }
        Ok(subscription)
    }

    #[cfg(test)]
    fn from_receiver(rx: mpsc::Receiver<Signal>) -> Self {
        Self {
            rx,
            listeners: Vec::new(),
        }
    }

    async fn recv(&mut self) -> Option<Signal> {
        self.rx.recv().await
    }
}

impl Drop for SignalSubscription {
    fn drop(&mut self) {
        for listener in &self.listeners {
            listener.abort();
        }
    }
}

/// Runs one child at a time, relaying signals with `F`.
pub struct Supervisor<F = KillForwarder> {
    forwarder: F,
    revert_point: RevertPoint,
}

impl Supervisor<KillForwarder> {
    pub fn new() -> Self {
        Self::with_forwarder(KillForwarder)
    }
}

impl Default for Supervisor<KillForwarder> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: SignalForwarder> Supervisor<F> {
    pub fn with_forwarder(forwarder: F) -> Self {
        Self {
            forwarder,
            revert_point: RevertPoint::default(),
        }
    }

    pub fn revert_point(mut self, revert_point: RevertPoint) -> Self {
        self.revert_point = revert_point;
        self
    }

    /// Start `command` with inherited stdio, relay OS signals to it until it exits and
    /// report how it ended. `revert` runs exactly once on every path, including a failed start.
    pub async fn run<R>(&mut self, command: Command, revert: R) -> Result<ExitOutcome, SupervisorError>
    where
        R: FnOnce() -> anyhow::Result<()>,
    {
        let mut revert = Some(revert);
        // Subscribe before the start attempt so nothing arriving in between is lost
        let signals = match SignalSubscription::subscribe() {
            Ok(signals) => signals,
            Err(err) => {
                take_and_revert(&mut revert)?;
                return Err(SupervisorError::Subscribe(err));
            }
        };
        self.supervise(command, signals, revert).await
    }

    /// Like [`Supervisor::run`], with signals taken from `signals`.
    pub async fn run_with_signals<R>(
        &mut self,
        command: Command,
        signals: SignalSubscription,
        revert: R,
    ) -> Result<ExitOutcome, SupervisorError>
    where
        R: FnOnce() -> anyhow::Result<()>,
    {
        self.supervise(command, signals, Some(revert)).await
    }

    async fn supervise<R>(
        &mut self,
        mut command: Command,
        mut signals: SignalSubscription,
        mut revert: Option<R>,
    ) -> Result<ExitOutcome, SupervisorError>
    where
        R: FnOnce() -> anyhow::Result<()>,
    {
        let program = command.as_std().get_program().to_string_lossy().into_owned();
        command
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                drop(signals);
                log::debug!("Failed to start {}: {}", program, err);
                take_and_revert(&mut revert)?;
                return Err(SupervisorError::Launch(err));
            }
        };
        log::info!("Started {} (pid {})", program, child.id().unwrap_or_default());

        // A failed early revert is reported once the child is done, not by abandoning it
        let early_revert = match self.revert_point {
            RevertPoint::AfterStart => take_and_revert(&mut revert),
            RevertPoint::OnExit => Ok(()),
        };
        if let Err(SupervisorError::Revert(err)) = &early_revert {
            log::error!("Reverting identity failed, waiting for {} anyway: {:#}", program, err);
        }

        let waited = relay_until_exit(&mut child, &mut signals, &mut self.forwarder).await;
        drop(signals);

        let reverted = take_and_revert(&mut revert);
        early_revert?;
        reverted?;

        match waited {
            Ok(status) => {
                let outcome = ExitOutcome::from_status(status);
                if outcome.is_success() {
                    log::info!("{} finished", program);
                } else {
                    log::info!("{} exited: {:?}", program, outcome);
                }
                Ok(outcome)
            }
            Err(err) => {
                log::error!("Waiting for {} failed: {}", program, err);
                Ok(ExitOutcome::Unknown)
            }
        }
    }
}

/// Relay signals to `child` until it terminates. Termination wins over pending signals,
/// so nothing is forwarded once the exit has been observed.
async fn relay_until_exit<F: SignalForwarder>(
    child: &mut Child,
    signals: &mut SignalSubscription,
    forwarder: &mut F,
) -> io::Result<ExitStatus> {
    let Some(pid) = child.id() else {
        return child.wait().await;
    };
    loop {
        tokio::select! {
            biased;
            status = child.wait() => return status,
            Some(sig) = signals.recv() => {
                if let Some(status) = child.try_wait()? {
                    log::debug!("Dropping {} for exited child {}", sig, pid);
                    return Ok(status);
                }
                log::debug!("Forwarding {} to {}", sig, pid);
                // The child may exit between the check and the kill, so this is only a warning
                if let Err(err) = forwarder.forward(pid, sig) {
                    log::warn!("Failed to forward {} to {}: {}", sig, pid, err);
                }
            }
        }
    }
}

fn take_and_revert<R>(revert: &mut Option<R>) -> Result<(), SupervisorError>
where
    R: FnOnce() -> anyhow::Result<()>,
{
    match revert.take() {
        Some(revert) => revert().map_err(SupervisorError::Revert),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<(u32, Signal)>>>);

    impl Recorder {
        fn signals(&self) -> Vec<Signal> {
            self.0.lock().unwrap().iter().map(|(_, s)| *s).collect()
        }
    }

    impl SignalForwarder for Recorder {
        fn forward(&mut self, pid: u32, signal: Signal) -> io::Result<()> {
            self.0.lock().unwrap().push((pid, signal));
            Ok(())
        }
    }

    fn sh(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    }

    fn queued(signals: &[Signal]) -> (mpsc::Sender<Signal>, SignalSubscription) {
        let (tx, rx) = mpsc::channel(SIGNAL_QUEUE_CAPACITY);
        for &signal in signals {
            tx.try_send(signal).unwrap();
        }
        (tx, SignalSubscription::from_receiver(rx))
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExitOutcome::Success.exit_code(), 0);
        assert_eq!(ExitOutcome::Exited(37).exit_code(), 37);
        assert_eq!(ExitOutcome::Signaled(15).exit_code(), 143);
        assert_eq!(ExitOutcome::Unknown.exit_code(), 1);
        assert!(ExitOutcome::Success.is_success());
        assert!(!ExitOutcome::Signaled(9).is_success());
    }

    #[tokio::test]
    async fn test_exit_code_propagated_and_reverted_once() {
        let calls = AtomicUsize::new(0);
        let (_tx, signals) = queued(&[]);
        let outcome = Supervisor::with_forwarder(Recorder::default())
            .run_with_signals(sh("exit 37"), signals, || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(outcome, ExitOutcome::Exited(37));
        assert_eq!(outcome.exit_code(), 37);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_success() {
        let (_tx, signals) = queued(&[]);
        let outcome = Supervisor::with_forwarder(Recorder::default())
            .run_with_signals(sh("true"), signals, || Ok(()))
            .await
            .unwrap();
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_killed_by_signal() {
        let (_tx, signals) = queued(&[]);
        let outcome = Supervisor::with_forwarder(Recorder::default())
            .run_with_signals(sh("kill -TERM $$"), signals, || Ok(()))
            .await
            .unwrap();
        assert_eq!(outcome, ExitOutcome::Signaled(Signal::SIGTERM as i32));
        assert_eq!(outcome.exit_code(), 128 + Signal::SIGTERM as i32);
    }

    #[tokio::test]
    async fn test_launch_failure_reverts_once() {
        let calls = AtomicUsize::new(0);
        let (_tx, signals) = queued(&[]);
        let err = Supervisor::with_forwarder(Recorder::default())
            .run_with_signals(Command::new("/nonexistent/ssh-swap-test-binary"), signals, || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Launch(_)));
        assert!(err.to_string().starts_with("exited on start: "));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_revert_is_fatal() {
        let (_tx, signals) = queued(&[]);
        let err = Supervisor::with_forwarder(Recorder::default())
            .run_with_signals(Command::new("/nonexistent/ssh-swap-test-binary"), signals, || {
                anyhow::bail!("config is read-only")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Revert(_)));
        assert_eq!(
            format!("{:#}", anyhow::Error::from(err)),
            "reverting identity: config is read-only"
        );

        let (_tx, signals) = queued(&[]);
        let err = Supervisor::with_forwarder(Recorder::default())
            .run_with_signals(sh("exit 0"), signals, || anyhow::bail!("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Revert(_)));
    }

    #[tokio::test]
    async fn test_failed_subscribe_stops_started_listeners() {
        let (tx, rx) = mpsc::channel(SIGNAL_QUEUE_CAPACITY);
        // SIGKILL can't be caught, so registration fails after SIGUSR1 is already listening
        let result = SignalSubscription::listen(&[Signal::SIGUSR1, Signal::SIGKILL], &tx, rx);
        assert!(result.is_err());
        for _ in 0..10 {
            if tx.strong_count() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(tx.strong_count(), 1);
    }

    #[tokio::test]
    async fn test_revert_after_start_runs_once() {
        let calls = AtomicUsize::new(0);
        let (_tx, signals) = queued(&[]);
        let outcome = Supervisor::with_forwarder(Recorder::default())
            .revert_point(RevertPoint::AfterStart)
            .run_with_signals(sh("exit 3"), signals, || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(outcome, ExitOutcome::Exited(3));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_signals_forwarded_in_order() {
        let recorder = Recorder::default();
        let (_tx, signals) = queued(&[Signal::SIGUSR1, Signal::SIGUSR2, Signal::SIGHUP]);
        let outcome = Supervisor::with_forwarder(recorder.clone())
            .run_with_signals(sh("sleep 0.3"), signals, || Ok(()))
            .await
            .unwrap();
        assert!(outcome.is_success());
        assert_eq!(
            recorder.signals(),
            vec![Signal::SIGUSR1, Signal::SIGUSR2, Signal::SIGHUP]
        );
    }

    #[tokio::test]
    async fn test_nothing_forwarded_after_exit() {
        let mut recorder = Recorder::default();
        let mut child = sh("exit 5").spawn().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let (_tx, mut signals) = queued(&[Signal::SIGINT, Signal::SIGTERM]);

        let status = relay_until_exit(&mut child, &mut signals, &mut recorder).await.unwrap();

        assert_eq!(status.code(), Some(5));
        assert!(recorder.signals().is_empty());
    }

    #[tokio::test]
    async fn test_kill_forwarder_reaches_child() {
        let (_tx, signals) = queued(&[Signal::SIGTERM]);
        let outcome = Supervisor::new()
            .run_with_signals(sh("exec sleep 5"), signals, || Ok(()))
            .await
            .unwrap();
        assert_eq!(outcome, ExitOutcome::Signaled(Signal::SIGTERM as i32));
    }

    #[tokio::test]
    async fn test_forwarding_error_is_not_fatal() {
        struct Failing;
        impl SignalForwarder for Failing {
            fn forward(&mut self, _pid: u32, _signal: Signal) -> io::Result<()> {
                Err(io::Error::from_raw_os_error(3))
            }
        }
        let (_tx, signals) = queued(&[Signal::SIGUSR1]);
        let outcome = Supervisor::with_forwarder(Failing)
            .run_with_signals(sh("sleep 0.1; exit 2"), signals, || Ok(()))
            .await
            .unwrap();
        assert_eq!(outcome, ExitOutcome::Exited(2));
    }
}
