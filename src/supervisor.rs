//! Supervision of the long-running actors of the process
//!
//! Every actor is a `(run, interrupt)` pair. All runs start together; as soon as
//! any of them returns, every interrupt is invoked and the supervisor waits for
//! all runs to finish. The first run's outcome is the outcome of the process.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

pub type RunFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Asks a running actor to stop. Must not block.
pub type Interrupt = Box<dyn FnOnce() + Send>;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("{name} failed: {source:#}")]
    Failed {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{name} panicked")]
    Panicked { name: String },
}

struct Actor {
    name: String,
    run: RunFuture,
    interrupt: Interrupt,
}

/// Runs actors as one unit with first-exit-stops-all semantics
#[derive(Default)]
pub struct Supervisor {
    actors: Vec<Actor>,
}

enum Exit {
    Finished(anyhow::Result<()>),
    Panicked,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an actor. `interrupt` is called at most once.
    pub fn add<F, I>(&mut self, name: impl Into<String>, run: F, interrupt: I)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
        I: FnOnce() + Send + 'static,
    {
        self.actors.push(Actor {
            name: name.into(),
            run: Box::pin(run),
            interrupt: Box::new(interrupt),
        });
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    /// Run every actor until the first one exits, then stop the rest.
    ///
    /// Returns the outcome of the first actor to exit.
    pub async fn run(self) -> Result<(), SupervisorError> {
        if self.actors.is_empty() {
            return Ok(());
        }

        let mut set = JoinSet::new();
        let mut interrupts = Vec::with_capacity(self.actors.len());

        for actor in self.actors {
            let name = actor.name;
            interrupts.push((name.clone(), actor.interrupt));

            let run = actor.run;
            set.spawn(async move {
                let exit = match AssertUnwindSafe(run).catch_unwind().await {
                    Ok(result) => Exit::Finished(result),
                    Err(_) => Exit::Panicked,
                };
                (name, exit)
            });
        }

        let first = match set.join_next().await {
            Some(Ok((name, exit))) => outcome(name, exit),
            Some(Err(e)) => Err(SupervisorError::Panicked {
                name: format!("task ({})", e),
            }),
            None => Ok(()),
        };

        match &first {
            Ok(()) => info!("Actor exited, stopping all actors"),
            Err(e) => error!(error = %e, "Actor failed, stopping all actors"),
        }

        for (name, interrupt) in interrupts {
            debug!(actor = %name, "Interrupting actor");
            interrupt();
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((name, exit)) => match outcome(name.clone(), exit) {
                    Ok(()) => debug!(actor = %name, "Actor stopped"),
                    Err(e) => error!(error = %e, "Actor stopped with error"),
                },
                Err(e) => error!(error = %e, "Actor task failed"),
            }
        }

        info!("All actors stopped");
        first
    }
}

fn outcome(name: String, exit: Exit) -> Result<(), SupervisorError> {
    match exit {
        Exit::Finished(Ok(())) => {
            info!(actor = %name, "Actor finished");
            Ok(())
        }
        Exit::Finished(Err(source)) => Err(SupervisorError::Failed { name, source }),
        Exit::Panicked => Err(SupervisorError::Panicked { name }),
    }
}

/// Actor that completes on SIGINT or SIGTERM
pub fn signal_watcher() -> (RunFuture, Interrupt) {
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let run: RunFuture = Box::pin(async move {
        tokio::select! {
            signal = wait_for_signal() => {
                let name = signal?;
                info!(signal = name, "Received shutdown signal");
            }
            _ = stop_rx => {
                debug!("Signal watcher interrupted");
            }
        }
        anyhow::Ok(())
    });

    let interrupt: Interrupt = Box::new(move || {
        let _ = stop_tx.send(());
    });

    (run, interrupt)
}

#[cfg(unix)]
async fn wait_for_signal() -> anyhow::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.map_err(|e| anyhow::anyhow!("Failed to listen for SIGINT: {}", e))?;
            Ok("SIGINT")
        }
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> anyhow::Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to listen for Ctrl+C: {}", e))?;
    Ok("Ctrl+C")
}
