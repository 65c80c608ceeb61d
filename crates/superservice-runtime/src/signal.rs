//! Termination signal handling

use crate::loopback::SelfChannel;
use crate::supervisor::MountTask;
use std::future::Future;
use superservice_core::{Error, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Wait for interrupt, hang-up, terminate or quit and return the signal name
pub async fn wait_for_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut hangup = signal(SignalKind::hangup())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let mut quit = signal(SignalKind::quit())?;

        let name = tokio::select! {
            _ = interrupt.recv() => "interrupt",
            _ = hangup.recv() => "hangup",
            _ = terminate.recv() => "terminated",
            _ = quit.recv() => "quit",
        };
        Ok(name)
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok("interrupt")
    }
}

/// Stops the service when a termination signal arrives.
///
/// On a signal the RPC server is told to stop gracefully and the self
/// channel is closed before the signal is reported as the terminal error.
pub(crate) fn signal_task(rpc_stop: CancellationToken, loopback: SelfChannel) -> MountTask {
    signal_task_with(wait_for_signal(), rpc_stop, loopback)
}

/// [`signal_task`] driven by `signal` instead of the process signals
pub(crate) fn signal_task_with<F>(signal: F, rpc_stop: CancellationToken, loopback: SelfChannel) -> MountTask
where
    F: Future<Output = Result<&'static str>> + Send + 'static,
{
    MountTask::new("signal", move |token: CancellationToken, _| async move {
        tokio::select! {
            signal = signal => {
                let signal = signal?;
                info!(signal = %signal, "Graceful stopping server");
                loopback.close();
                rpc_stop.cancel();
                info!("Graceful stopped server successfully");
                Err(Error::Signal(signal.to_string()))
            }
            _ = token.cancelled() => Ok(()),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::Supervisor;
    use std::time::Duration;

    #[tokio::test]
    async fn test_signal_task_exits_on_cancel() {
        let rpc_stop = CancellationToken::new();
        let supervision = Supervisor::new()
            .grace_period(Duration::from_secs(1))
            .task(signal_task(rpc_stop.clone(), SelfChannel::default()))
            .task(MountTask::new("short", |_, _| async { Ok(()) }))
            .run("127.0.0.1:0".parse().unwrap())
            .await;

        assert_eq!(supervision.terminal_task.as_deref(), Some("short"));
        assert!(supervision.forced.is_empty());
        assert!(!rpc_stop.is_cancelled());
    }

    #[tokio::test]
    async fn test_signal_stops_service() {
        let rpc_stop = CancellationToken::new();
        let loopback = SelfChannel::dial("127.0.0.1:50051".parse().unwrap()).unwrap();
        let signal = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok("terminated")
        };

        let supervision = Supervisor::new()
            .grace_period(Duration::from_secs(1))
            .task(signal_task_with(signal, rpc_stop.clone(), loopback.clone()))
            .task(MountTask::new("grpc", |token: CancellationToken, _| async move {
                token.cancelled().await;
                Ok(())
            }))
            .run("127.0.0.1:0".parse().unwrap())
            .await;

        assert_eq!(supervision.terminal_task.as_deref(), Some("signal"));
        assert!(matches!(supervision.result, Err(Error::Signal(ref name)) if name == "terminated"));
        assert!(supervision.forced.is_empty());
        assert!(rpc_stop.is_cancelled());
        assert!(loopback.get().is_none());
    }

    #[test]
    fn test_signal_error_message() {
        assert_eq!(
            Error::Signal("terminated".to_string()).to_string(),
            "Signal: terminated"
        );
    }
}
