//! Saga-style execution of multi-step remote operations.
//!
//! A [`Transaction`] runs a body that registers [`Step`]s one by one. When
//! anything fails, the steps that completed are rolled back in reverse order,
//! then every registered step is cleaned up, also in reverse order.

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::Instrument;

use crate::client::ProtocolClient;
use crate::error::StepFailure;

/// One remote side effect plus its compensation.
#[async_trait]
pub trait Step<C: Send>: Send {
    /// Name used in logs and in [`StepFailure`]. Defaults to the type name.
    fn name(&self) -> &str {
        let full = std::any::type_name::<Self>();
        let base = full.split('<').next().unwrap_or(full);
        base.rsplit("::").next().unwrap_or(base)
    }

    async fn perform(&mut self, client: &ProtocolClient, ctx: &mut C) -> anyhow::Result<()>;

    /// Undoes a successful `perform`. Only called when a later step or the
    /// body failed.
    async fn rollback(&mut self, _client: &ProtocolClient, _ctx: &mut C) -> anyhow::Result<()> {
        Ok(())
    }

    /// Releases local resources. Runs for every registered step.
    async fn cleanup(&mut self, _client: &ProtocolClient, _ctx: &mut C) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionOptions {
    /// When false, a failure is returned inside [`TransactionOutcome`]
    /// instead of as `Err`.
    pub raise_on_error: bool,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            raise_on_error: true,
        }
    }
}

impl TransactionOptions {
    pub fn non_throwing() -> Self {
        Self {
            raise_on_error: false,
        }
    }
}

/// Final context of a transaction, plus the failure in non-throwing mode.
#[derive(Debug)]
pub struct TransactionOutcome<C> {
    pub context: C,
    pub error: Option<StepFailure>,
}

impl<C> TransactionOutcome<C> {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_result(self) -> Result<C, StepFailure> {
        match self.error {
            Some(failure) => Err(failure),
            None => Ok(self.context),
        }
    }
}

struct Registered<C: Send> {
    step: Box<dyn Step<C>>,
    name: String,
    completed: bool,
}

pub struct Transaction<'c, C: Send> {
    name: String,
    client: &'c ProtocolClient,
    context: C,
    steps: Vec<Registered<C>>,
    failed_step: Option<String>,
}

impl<'c, C: Send + 'static> Transaction<'c, C> {
    /// Runs `body` and settles the transaction.
    ///
    /// On success every step is cleaned up and the final context returned.
    /// On failure completed steps are rolled back, every registered step is
    /// cleaned up, and the original error is returned as a [`StepFailure`]
    /// (or embedded in the outcome when `raise_on_error` is false).
    /// Rollback and cleanup failures are logged only.
    pub async fn perform<F>(
        name: &str,
        client: &'c ProtocolClient,
        context: C,
        options: TransactionOptions,
        body: F,
    ) -> Result<TransactionOutcome<C>, StepFailure>
    where
        F: for<'t> FnOnce(&'t mut Transaction<'c, C>) -> BoxFuture<'t, anyhow::Result<()>>,
    {
        let span = tracing::info_span!("transaction", name = %name);
        async move {
            let mut tx = Transaction {
                name: name.to_string(),
                client,
                context,
                steps: Vec::new(),
                failed_step: None,
            };
            tracing::debug!("Starting");

            let failure = match body(&mut tx).await {
                Ok(()) => None,
                Err(e) => {
                    let failure = StepFailure::new(&tx.name, tx.failed_step.take(), e);
                    tracing::error!("{}", failure);
                    tx.rollback().await;
                    Some(failure)
                }
            };
            tx.cleanup().await;

            match failure {
                None => {
                    tracing::info!("Completed {} step(s)", tx.steps.len());
                    Ok(TransactionOutcome {
                        context: tx.context,
                        error: None,
                    })
                }
                Some(failure) if options.raise_on_error => Err(failure),
                Some(failure) => Ok(TransactionOutcome {
                    context: tx.context,
                    error: Some(failure),
                }),
            }
        }
        .instrument(span)
        .await
    }

    /// Shorthand for [`perform`](Self::perform) that raises and returns the
    /// final context.
    pub async fn run<F>(
        name: &str,
        client: &'c ProtocolClient,
        context: C,
        body: F,
    ) -> Result<C, StepFailure>
    where
        F: for<'t> FnOnce(&'t mut Transaction<'c, C>) -> BoxFuture<'t, anyhow::Result<()>>,
    {
        Self::perform(name, client, context, TransactionOptions::default(), body)
            .await?
            .into_result()
    }

    /// Registers `step`, then performs it.
    ///
    /// The step is registered before `perform` runs so it is cleaned up even
    /// when `perform` fails; it is rolled back only if `perform` succeeded.
    pub async fn next<S>(&mut self, step: S) -> anyhow::Result<()>
    where
        S: Step<C> + 'static,
    {
        let name = step.name().to_string();
        self.failed_step = None;
        self.steps.push(Registered {
            step: Box::new(step),
            name: name.clone(),
            completed: false,
        });
        let index = self.steps.len() - 1;

        tracing::info!("Performing {}", name);
        let entry = &mut self.steps[index];
        match entry.step.perform(self.client, &mut self.context).await {
            Ok(()) => {
                entry.completed = true;
                tracing::debug!("{} done", name);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("{} failed: {:#}", name, e);
                self.failed_step = Some(name);
                Err(e)
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &'c ProtocolClient {
        self.client
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut C {
        &mut self.context
    }

    async fn rollback(&mut self) {
        for entry in self.steps.iter_mut().rev().filter(|e| e.completed) {
            tracing::info!("Rolling back {}", entry.name);
            if let Err(e) = entry.step.rollback(self.client, &mut self.context).await {
                tracing::error!("Rollback of {} failed: {:#}", entry.name, e);
            }
        }
    }

    async fn cleanup(&mut self) {
        for entry in self.steps.iter_mut().rev() {
            tracing::debug!("Cleaning up {}", entry.name);
            if let Err(e) = entry.step.cleanup(self.client, &mut self.context).await {
                tracing::error!("Cleanup of {} failed: {:#}", entry.name, e);
            }
        }
    }
}
