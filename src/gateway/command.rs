use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::event_sourcing::{
    command_name, AggregateStore, Command, Database, EventInfo, EventStore, ExecutionContext, Metadata, Snapshot,
};
use crate::metrics::Metrics;
use crate::wiring::HandlerRegistry;

use super::locks::CriticalSections;

// ============================================================================
// Command Gateway - Load, Dispatch, Apply, Persist, Commit
// ============================================================================
//
// Per command:
//   1. refuse if the caller's context already has a unit of work
//   2. read the target id (no id = no side effects at all)
//   3. enter the id's critical section
//   4. open a unit of work
//   5. load the aggregate (absent is fine for a creation command)
//   6. dispatch to the command handler
//   7. no events: commit and return
//   8. first events of a new aggregate: insert an empty row to get its id
//   9. per event, in order: state handler, domain handlers, append
//  10. save the final state with a compare-and-swap on the loaded sequence
//  11. commit
//
// Any failure in 4-10 rolls the unit of work back before the error reaches
// the caller. The critical section is released on every path (it is a guard).
// There is no automatic retry: on Conflict the caller resubmits.
//
// ============================================================================

/// One event a command produced, as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendedEvent {
    pub type_name: &'static str,
    pub global_sequence: i64,
}

/// What a successful command left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReceipt {
    pub business_id: Uuid,
    /// `None` only when a creation command produced no events.
    pub aggregate_global_id: Option<i64>,
    pub event_sequence: i64,
    pub events: Vec<AppendedEvent>,
}

pub struct CommandGateway {
    database: Database,
    registry: Arc<HandlerRegistry>,
    aggregates: AggregateStore,
    events: EventStore,
    sections: CriticalSections,
    metrics: Arc<Metrics>,
}

impl CommandGateway {
    pub fn new(database: Database, registry: Arc<HandlerRegistry>, metrics: Arc<Metrics>) -> Self {
        Self {
            database,
            registry,
            aggregates: AggregateStore::new(),
            events: EventStore::new(),
            sections: CriticalSections::new(),
            metrics,
        }
    }

    /// Sends a command from a fresh context with no metadata.
    pub async fn send<C: Command>(&self, command: C) -> Result<CommandReceipt> {
        self.send_with(&self.database.context(), command, Metadata::empty())
            .await
    }

    /// Sends a command from the caller's context, attaching `metadata` to
    /// every event it produces.
    pub async fn send_with<C: Command>(
        &self,
        ctx: &ExecutionContext,
        command: C,
        metadata: Metadata,
    ) -> Result<CommandReceipt> {
        let command_name = command_name::<C>();
        let started = Instant::now();

        let result = self.run(ctx, command, &metadata).await;

        let outcome = match &result {
            Ok(receipt) => {
                for event in &receipt.events {
                    self.metrics.record_event_appended(event.type_name);
                }
                "ok"
            }
            Err(e) => e.kind(),
        };
        self.metrics
            .record_command(command_name, started.elapsed().as_secs_f64(), outcome);
        self.metrics.set_critical_sections(self.sections.len());

        result
    }

    /// Ids with a command in flight or queued.
    pub fn critical_sections(&self) -> &CriticalSections {
        &self.sections
    }

    async fn run<C: Command>(
        &self,
        ctx: &ExecutionContext,
        command: C,
        metadata: &Metadata,
    ) -> Result<CommandReceipt> {
        let command_name = command_name::<C>();

        if ctx.is_active().await {
            return Err(Error::UnitOfWorkActive);
        }

        let business_id = command
            .target_aggregate_id()
            .ok_or(Error::NoTargetIdentifier(command_name))?;

        let _section = self.sections.enter(business_id).await;
        self.metrics.set_critical_sections(self.sections.len());

        ctx.acquire().await?;

        match self.process(ctx, business_id, command, metadata).await {
            Ok(receipt) => {
                ctx.commit().await?;
                tracing::info!(
                    command = command_name,
                    business_id = %business_id,
                    events = receipt.events.len(),
                    event_sequence = receipt.event_sequence,
                    "✅ Command processed"
                );
                Ok(receipt)
            }
            Err(e) => {
                if let Err(rollback_error) = ctx.rollback().await {
                    tracing::error!(
                        command = command_name,
                        business_id = %business_id,
                        error = %rollback_error,
                        "Rollback failed"
                    );
                }
                match &e {
                    Error::Conflict { .. } => tracing::warn!(
                        command = command_name,
                        business_id = %business_id,
                        error = %e,
                        "Command lost an optimistic concurrency race"
                    ),
                    _ => tracing::warn!(
                        command = command_name,
                        business_id = %business_id,
                        error = %e,
                        "Command failed, unit of work rolled back"
                    ),
                }
                Err(e)
            }
        }
    }

    async fn process<C: Command>(
        &self,
        ctx: &ExecutionContext,
        business_id: Uuid,
        command: C,
        metadata: &Metadata,
    ) -> Result<CommandReceipt> {
        let mut snapshot = match self.aggregates.load::<C::Aggregate>(ctx, business_id).await {
            Ok(snapshot) => snapshot,
            Err(Error::NotFound { .. }) => Snapshot::new(business_id),
            Err(e) => return Err(e),
        };

        let handler_ctx = self.registry.context().with_execution(ctx);

        let (mut state, events) =
            self.registry
                .dispatch_command(snapshot.current_state.take(), command, &handler_ctx)?;

        if events.is_empty() {
            tracing::debug!(business_id = %business_id, "Command produced no events");
            return Ok(CommandReceipt {
                business_id,
                aggregate_global_id: snapshot.global_id,
                event_sequence: snapshot.event_sequence,
                events: Vec::new(),
            });
        }

        // Events reference the aggregate row, so a new aggregate needs one now.
        let global_id = match snapshot.global_id {
            Some(global_id) => global_id,
            None => {
                let global_id = self.aggregates.save(ctx, &snapshot).await?;
                snapshot.global_id = Some(global_id);
                global_id
            }
        };

        let mut appended = Vec::with_capacity(events.len());
        for event in events.into_events() {
            self.registry.dispatch_state_handler(&mut state, event.as_ref())?;

            let info = EventInfo {
                type_name: event.type_name().to_string(),
                aggregate_global_id: global_id,
                global_sequence: None,
                metadata: metadata.clone(),
            };
            self.registry
                .dispatch_domain_handlers(event.as_ref(), &handler_ctx.with_event(&info))
                .await?;

            let global_sequence = self
                .events
                .append(ctx, global_id, event.as_ref(), metadata)
                .await?;
            appended.push(AppendedEvent {
                type_name: event.type_name(),
                global_sequence,
            });
        }

        if let Some(last) = appended.last() {
            snapshot.advance_to(last.global_sequence);
        }
        snapshot.current_state = Some(state);
        self.aggregates.save(ctx, &snapshot).await?;

        Ok(CommandReceipt {
            business_id,
            aggregate_global_id: Some(global_id),
            event_sequence: snapshot.event_sequence,
            events: appended,
        })
    }
}

impl std::fmt::Debug for CommandGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandGateway")
            .field("sections", &self.sections)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
