//! The plan execution engine.
//!
//! Runs an [`ExecutionPlan`]: first the memory transfers, grouped by
//! descending priority and awaited as a batch, then every execution
//! level in order, dispatching each node to its assigned device's
//! stream and awaiting level completion.
//!
//! An error from one node does not cancel siblings already dispatched
//! in the same level; the engine waits the level out, surfaces the
//! first error and logs the count of discarded ones. Across levels the
//! first error terminates the plan. Cancellation is observed between
//! levels and aborts cleanly after the in-flight level finishes.

use std::collections::HashMap;
use std::sync::Arc;

use futures::executor::block_on;
use futures::future::join_all;

use crate::driver::DeviceId;
use crate::error::{Error, Result as UclResult};
use crate::r#async::CancelToken;
use crate::sched::{ExecutionPlan, SchedulingError, Transfer};
use crate::standard::{Event, Stream};

/// Work shared by every transfer submission.
pub type TransferFn = Arc<dyn Fn(&Transfer) -> UclResult<()> + Send + Sync>;

/// Runtime bindings a plan executes against: one stream per assigned
/// device, plus the transfer executor.
pub struct ExecBindings {
    streams: HashMap<DeviceId, Stream>,
    transfer: Option<TransferFn>,
}

impl ExecBindings {
    pub fn new(streams: HashMap<DeviceId, Stream>) -> ExecBindings {
        ExecBindings {
            streams,
            transfer: None,
        }
    }

    /// Installs the transfer executor. Without one, planned transfers
    /// complete as no-ops (useful when data is staged up front).
    pub fn with_transfer(
        mut self,
        f: impl Fn(&Transfer) -> UclResult<()> + Send + Sync + 'static,
    ) -> ExecBindings {
        self.transfer = Some(Arc::new(f));
        self
    }

    fn stream_for(&self, device: DeviceId) -> UclResult<&Stream> {
        self.streams.get(&device).ok_or_else(|| {
            SchedulingError::InconsistentPlan {
                detail: format!("no stream bound for {}", device),
            }
            .into()
        })
    }
}

/// Outcome summary of a completed plan.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecReport {
    pub transfers_run: usize,
    pub levels_run: usize,
    pub nodes_run: usize,
}

/// Executes plans against bound streams.
#[derive(Debug, Default)]
pub struct ExecutionEngine;

impl ExecutionEngine {
    pub fn new() -> ExecutionEngine {
        ExecutionEngine
    }

    /// Runs `plan` to completion, cancellation or first error.
    pub fn execute(
        &self,
        plan: &ExecutionPlan,
        bindings: &ExecBindings,
        token: &CancelToken,
    ) -> UclResult<ExecReport> {
        let mut report = ExecReport::default();

        self.issue_transfers(plan, bindings, token, &mut report)?;

        for (level_idx, level) in plan.levels.iter().enumerate() {
            // Cancellation is observed at level boundaries only; work
            // already dispatched runs to completion.
            token.checkpoint()?;

            let mut events: Vec<(usize, Event)> = Vec::with_capacity(level.len());
            for &node in level {
                let device = plan.assignment[node];
                let stream = bindings.stream_for(device)?;
                let action = plan.graph.node(node).action.clone();
                let event = stream.submit(move || match action {
                    Some(action) => action(),
                    None => Ok(()),
                })?;
                events.push((node, event));
            }

            let outcomes: Vec<UclResult<()>> = block_on(join_all(
                events.iter().map(|(_, event)| event.completion()),
            ));

            let mut first_error: Option<Error> = None;
            let mut discarded = 0usize;
            for ((node, _), outcome) in events.iter().zip(outcomes) {
                match outcome {
                    Ok(()) => report.nodes_run += 1,
                    Err(err) => {
                        if first_error.is_none() {
                            log::warn!("level {}: node {} failed: {}", level_idx, node, err);
                            first_error = Some(err);
                        } else {
                            discarded += 1;
                        }
                    }
                }
            }
            if let Some(err) = first_error {
                if discarded > 0 {
                    log::warn!(
                        "level {}: discarded {} further error(s) after the first",
                        level_idx,
                        discarded
                    );
                }
                // Terminating the plan; downstream levels never start
                // and their bound streams hold no work from it.
                return Err(err);
            }
            report.levels_run += 1;
        }
        Ok(report)
    }

    /// Issues all planned transfers grouped by descending priority and
    /// waits for the whole batch. Transfers within one band overlap.
    fn issue_transfers(
        &self,
        plan: &ExecutionPlan,
        bindings: &ExecBindings,
        token: &CancelToken,
        report: &mut ExecReport,
    ) -> UclResult<()> {
        if plan.transfers.is_empty() {
            return Ok(());
        }
        // The transfer plan is already sorted by descending priority.
        let mut band_start = 0usize;
        while band_start < plan.transfers.len() {
            token.checkpoint()?;
            let priority = plan.transfers[band_start].priority;
            let band_end = plan.transfers[band_start..]
                .iter()
                .position(|t| t.priority != priority)
                .map(|p| band_start + p)
                .unwrap_or(plan.transfers.len());

            let mut events = Vec::with_capacity(band_end - band_start);
            for transfer in &plan.transfers[band_start..band_end] {
                let stream = bindings.stream_for(transfer.dst_device)?;
                let transfer = *transfer;
                let run = bindings.transfer.clone();
                let event = stream.submit(move || match run {
                    Some(run) => run(&transfer),
                    None => Ok(()),
                })?;
                events.push(event);
            }
            for event in events {
                event.wait_for()?;
                report.transfers_run += 1;
            }
            band_start = band_end;
        }
        Ok(())
    }
}
