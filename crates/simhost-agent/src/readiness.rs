use std::time::Duration;

use tokio::process::Child;
use tokio_util::sync::CancellationToken;

use crate::proc_table;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Timeout,
    /// The launched child exited and nothing matching the signature is left.
    Exited(String),
    Cancelled,
}

/// One TCP connect to `127.0.0.1:port`; no bytes are exchanged.
pub async fn probe_local_port(port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, tokio::net::TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

fn describe_exit(status: std::process::ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return format!("killed by signal {sig}");
        }
    }
    status.to_string()
}

pub struct ReadinessProbe<'a> {
    pub signature: &'a str,
    pub port: Option<u16>,
    pub timeout: Duration,
    pub interval: Duration,
}

impl ReadinessProbe<'_> {
    pub async fn wait(
        &self,
        mut child: Option<&mut Child>,
        cancel: &CancellationToken,
    ) -> Readiness {
        let deadline = tokio::time::Instant::now() + self.timeout;
        let connect_timeout = self.interval.clamp(Duration::from_millis(100), CONNECT_TIMEOUT);
        let mut exit: Option<String> = None;

        loop {
            if exit.is_none()
                && let Some(c) = child.as_deref_mut()
            {
                match c.try_wait() {
                    Ok(Some(status)) => exit = Some(describe_exit(status)),
                    Ok(None) => {}
                    Err(e) => tracing::debug!(error = %e, "try_wait on launched child failed"),
                }
            }

            let alive = !proc_table::find_matching(self.signature).is_empty();
            if alive {
                match self.port {
                    None => return Readiness::Ready,
                    Some(port) => {
                        if probe_local_port(port, connect_timeout).await {
                            return Readiness::Ready;
                        }
                    }
                }
            } else if let Some(status) = exit.take() {
                return Readiness::Exited(status);
            }

            if tokio::time::Instant::now() >= deadline {
                return Readiness::Timeout;
            }

            tokio::select! {
                _ = cancel.cancelled() => return Readiness::Cancelled,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}
