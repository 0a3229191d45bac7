use tokio::sync::mpsc;

/// The two shutdown-relevant signal classes a supervisor process consumes.
///
/// The classes arrive on independent channels so that the worker's graceful
/// and forced watchers can each race on their own stream, and so that tests
/// can stand in for the operating system through [`Signals::manual`].
pub(crate) struct Signals {
    pub hangup: mpsc::UnboundedReceiver<()>,
    pub terminate: mpsc::UnboundedReceiver<()>,
}

/// Test-side injector for [`Signals::manual`].
#[derive(Clone)]
pub(crate) struct SignalSender {
    hangup: mpsc::UnboundedSender<()>,
    terminate: mpsc::UnboundedSender<()>,
}

impl SignalSender {
    pub fn hangup(&self) {
        let _ = self.hangup.send(());
    }

    pub fn terminate(&self) {
        let _ = self.terminate.send(());
    }
}

impl Signals {
    /// A signal pair fed by hand instead of by the kernel.
    pub fn manual() -> (Self, SignalSender) {
        let (hangup_tx, hangup) = mpsc::unbounded_channel();
        let (terminate_tx, terminate) = mpsc::unbounded_channel();
        (
            Self { hangup, terminate },
            SignalSender {
                hangup: hangup_tx,
                terminate: terminate_tx,
            },
        )
    }

    /// Wires the process signal handlers into a signal pair: SIGHUP feeds
    /// the hangup channel, SIGINT and SIGTERM both feed the terminate
    /// channel. The forwarders run until their channel has no receiver
    /// left.
    #[cfg(unix)]
    pub fn os() -> eyre::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        let (signals, sender) = Self::manual();

        let mut hangup = signal(SignalKind::hangup())?;
        let forward = sender.clone();
        tokio::spawn(async move {
            while hangup.recv().await.is_some() {
                forward.hangup();
            }
        });

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = interrupt.recv() => {
                        if received.is_none() {
                            break;
                        }
                        sender.terminate();
                    }
                    received = terminate.recv() => {
                        if received.is_none() {
                            break;
                        }
                        sender.terminate();
                    }
                }
            }
        });

        Ok(signals)
    }

    /// Without unix signals the only deliverable event is the interrupt
    /// key, and single-process mode treats it as a request to drain.
    #[cfg(not(unix))]
    pub fn os() -> eyre::Result<Self> {
        let (signals, sender) = Self::manual();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                sender.hangup();
            }
        });
        Ok(signals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manual_injection_reaches_both_channels() {
        let (mut signals, sender) = Signals::manual();

        sender.hangup();
        sender.terminate();
        sender.terminate();

        assert_eq!(signals.hangup.recv().await, Some(()));
        assert_eq!(signals.terminate.recv().await, Some(()));
        assert_eq!(signals.terminate.recv().await, Some(()));
    }

    #[tokio::test]
    async fn dropping_the_sender_closes_the_streams() {
        let (mut signals, sender) = Signals::manual();
        drop(sender);
        assert_eq!(signals.hangup.recv().await, None);
        assert_eq!(signals.terminate.recv().await, None);
    }
}
