use anyhow::Context;
use bq_queue::server::{Queue, QueueConfig};
use bq_utils::exit::ExitCode;
use signal_hook::{
    consts::TERM_SIGNALS,
    iterator::{Handle, Signals},
};

/// Starts a queue in the current process, serving until a termination signal arrives.
pub async fn start_queue_forever(config: QueueConfig) -> anyhow::Result<ExitCode> {
    let mut queue = Queue::start(config)
        .await
        .context("failed to start queue")?;
    let server_addr = queue.server_addr();

    tracing::info!(%server_addr, "queue active");
    println!("Run the following to start workers and attach to the queue:");
    println!("\tbq work --queue-addr={server_addr}");
    println!("Run the following to submit a job:");
    println!("\tbq submit --queue-addr={server_addr} --tests <tests.json>");

    wait_for_termination().await?;

    queue.shutdown().await?;
    tracing::info!("queue shutdown");
    Ok(ExitCode::SUCCESS)
}

/// Unblocks the signal-waiting thread when the waiting future is dropped.
struct CloseOnDrop(Handle);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Resolves once the process receives a termination signal.
pub async fn wait_for_termination() -> anyhow::Result<()> {
    let mut term_signals = Signals::new(TERM_SIGNALS)?;
    let _close = CloseOnDrop(term_signals.handle());
    let signal = tokio::task::spawn_blocking(move || term_signals.forever().next()).await?;
    tracing::debug!(?signal, "received termination signal");
    Ok(())
}
