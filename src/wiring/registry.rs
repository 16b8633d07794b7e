use futures_util::future::BoxFuture;
use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::event_sourcing::{
    command_name, deserialize, Aggregate, AnyEvent, Command, Event, EventBuffer,
};

use super::dependency::{DependencyRegister, HandlerContext, HandlerScope};
use super::handler::{CreationHandler, EventHandler, MutationHandler, QueryHandler};

// ============================================================================
// Handler Registry - Startup-Validated Dispatch Table
// ============================================================================
//
// Built once by HandlerRegistryBuilder, then immutable and shared (Arc).
//
//   command type            -> exactly one creation or mutation handler
//   (aggregate, event) type -> exactly one state handler
//   event type              -> ordered domain-event handlers
//   processing group        -> worker count + ordered stream-event handlers
//   query key               -> exactly one query handler
//
// Every registration is checked immediately: duplicates and ambiguous primary
// inputs are Definition errors, side inputs that cannot be resolved are
// UnsatisfiedDependency errors. Nothing is discovered lazily.
//
// ============================================================================

/// Upper bound on polling workers per processing group.
pub const MAX_WORKERS: usize = 25;

type CreationFn<C> = Box<
    dyn Fn(C, &mut EventBuffer, &HandlerContext<'_>) -> Result<<C as Command>::Aggregate>
        + Send
        + Sync,
>;

type MutationFn<C> = Box<
    dyn Fn(&mut <C as Command>::Aggregate, C, &mut EventBuffer, &HandlerContext<'_>) -> Result<()>
        + Send
        + Sync,
>;

enum CommandEntry<C: Command> {
    Creation(CreationFn<C>),
    Mutation(MutationFn<C>),
}

type StateFn = Box<dyn Fn(&mut dyn Any, &dyn AnyEvent) -> Result<()> + Send + Sync>;

type ErasedEventFn = Arc<
    dyn Fn(&dyn AnyEvent, &HandlerContext<'_>) -> Result<BoxFuture<'static, anyhow::Result<()>>>
        + Send
        + Sync,
>;

type ErasedQueryFn = Box<
    dyn Fn(
            Box<dyn Any + Send>,
            &HandlerContext<'_>,
        ) -> Result<BoxFuture<'static, anyhow::Result<Box<dyn Any + Send>>>>
        + Send
        + Sync,
>;

struct QueryEntry {
    input: TypeId,
    output: TypeId,
    input_name: &'static str,
    output_name: &'static str,
    handler: ErasedQueryFn,
}

#[derive(Clone, Copy)]
struct EventDecoder {
    type_id: TypeId,
    decode: fn(&str) -> Result<Box<dyn AnyEvent>>,
}

fn decode_event<E: Event>(payload: &str) -> Result<Box<dyn AnyEvent>> {
    Ok(Box::new(deserialize::<E>(E::TYPE_NAME, payload)?))
}

/// A named set of stream handlers consumed by `workers` parallel pollers.
pub struct ProcessingGroup {
    name: String,
    workers: usize,
    declared: bool,
    handlers: HashMap<&'static str, Vec<ErasedEventFn>>,
}

impl ProcessingGroup {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn handles(&self, type_name: &str) -> bool {
        self.handlers.contains_key(type_name)
    }
}

impl std::fmt::Debug for ProcessingGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessingGroup")
            .field("name", &self.name)
            .field("workers", &self.workers)
            .field("event_types", &self.handlers.len())
            .finish()
    }
}

fn erase_event_handler<E, Args, H>(handler: H) -> ErasedEventFn
where
    E: Event,
    H: EventHandler<E, Args>,
{
    Arc::new(move |event: &dyn AnyEvent, ctx: &HandlerContext<'_>| {
        let event = event.as_any().downcast_ref::<E>().ok_or_else(|| {
            Error::Definition(format!(
                "event {} dispatched to a handler for {}",
                event.type_name(),
                E::TYPE_NAME
            ))
        })?;
        handler.call(event.clone(), ctx)
    })
}

fn validate_workers(group: &str, workers: usize) -> Result<()> {
    if workers == 0 || workers > MAX_WORKERS {
        return Err(Error::Definition(format!(
            "processing group {group} asks for {workers} workers, allowed range is 1..={MAX_WORKERS}"
        )));
    }
    Ok(())
}

// ============================================================================
// Builder
// ============================================================================

pub struct HandlerRegistryBuilder {
    register: DependencyRegister,
    commands: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    command_names: HashMap<TypeId, &'static str>,
    state_handlers: HashMap<(TypeId, TypeId), StateFn>,
    domain_handlers: HashMap<TypeId, Vec<ErasedEventFn>>,
    groups: BTreeMap<String, ProcessingGroup>,
    queries: HashMap<String, QueryEntry>,
    decoders: HashMap<&'static str, EventDecoder>,
}

impl HandlerRegistryBuilder {
    /// Starts a registry over a fully populated dependency register.
    pub fn new(register: DependencyRegister) -> Self {
        Self {
            register,
            commands: HashMap::new(),
            command_names: HashMap::new(),
            state_handlers: HashMap::new(),
            domain_handlers: HashMap::new(),
            groups: BTreeMap::new(),
            queries: HashMap::new(),
            decoders: HashMap::new(),
        }
    }

    /// The primary input must not be resolvable as a side input, otherwise
    /// the handler has no unambiguous primary parameter.
    fn check_primary<P: 'static>(&self, role: &str) -> Result<()> {
        if self.register.contains::<P>() {
            return Err(Error::Definition(format!(
                "{role} handler for {} has no unambiguous primary parameter: the type is also a registered dependency",
                std::any::type_name::<P>()
            )));
        }
        Ok(())
    }

    fn check_command_slot<C: Command>(&self) -> Result<()> {
        if let Some(existing) = self.command_names.get(&TypeId::of::<C>()) {
            return Err(Error::Definition(format!(
                "command {existing} already has a handler"
            )));
        }
        self.check_primary::<C>("command")
    }

    fn insert_command<C: Command>(&mut self, entry: CommandEntry<C>) {
        let name = std::any::type_name::<C>();
        self.commands.insert(TypeId::of::<C>(), Box::new(entry));
        self.command_names.insert(TypeId::of::<C>(), name);
        tracing::debug!(command = name, "Registered command handler");
    }

    fn add_decoder<E: Event>(&mut self) -> Result<()> {
        let decoder = EventDecoder {
            type_id: TypeId::of::<E>(),
            decode: decode_event::<E>,
        };
        match self.decoders.get(E::TYPE_NAME) {
            Some(existing) if existing.type_id != decoder.type_id => Err(Error::Definition(format!(
                "event type name {} is used by two different types",
                E::TYPE_NAME
            ))),
            Some(_) => Ok(()),
            None => {
                self.decoders.insert(E::TYPE_NAME, decoder);
                Ok(())
            }
        }
    }

    /// Registers the handler for a command that creates its aggregate.
    pub fn on_creation<C, Args, H>(&mut self, handler: H) -> Result<&mut Self>
    where
        C: Command,
        H: CreationHandler<C, Args>,
    {
        self.check_command_slot::<C>()?;
        H::verify(&self.register)?;

        let entry = CommandEntry::<C>::Creation(Box::new(
            move |command: C, events: &mut EventBuffer, ctx: &HandlerContext<'_>| {
                handler.call(command, events, ctx)
            },
        ));
        self.insert_command(entry);
        Ok(self)
    }

    /// Registers the handler for a command against an existing aggregate.
    pub fn on_command<C, Args, H>(&mut self, handler: H) -> Result<&mut Self>
    where
        C: Command,
        H: MutationHandler<C, Args>,
    {
        self.check_command_slot::<C>()?;
        H::verify(&self.register)?;

        let entry = CommandEntry::<C>::Mutation(Box::new(
            move |state: &mut C::Aggregate, command: C, events: &mut EventBuffer, ctx: &HandlerContext<'_>| {
                handler.call(state, command, events, ctx)
            },
        ));
        self.insert_command(entry);
        Ok(self)
    }

    /// Registers how `E` changes the state of `A`.
    pub fn on_state<A, E, F>(&mut self, handler: F) -> Result<&mut Self>
    where
        A: Aggregate,
        E: Event,
        F: Fn(&mut A, &E) + Send + Sync + 'static,
    {
        let key = (TypeId::of::<A>(), TypeId::of::<E>());
        if self.state_handlers.contains_key(&key) {
            return Err(Error::Definition(format!(
                "{} already has a state handler for {}",
                A::TYPE_NAME,
                E::TYPE_NAME
            )));
        }
        self.add_decoder::<E>()?;

        let erased: StateFn = Box::new(move |state: &mut dyn Any, event: &dyn AnyEvent| {
            let state = state.downcast_mut::<A>().ok_or_else(|| {
                Error::Definition(format!("state handler for {} got another aggregate", A::TYPE_NAME))
            })?;
            let event = event.as_any().downcast_ref::<E>().ok_or_else(|| {
                Error::Definition(format!("state handler for {} got another event", E::TYPE_NAME))
            })?;
            handler(state, event);
            Ok(())
        });
        self.state_handlers.insert(key, erased);
        tracing::debug!(aggregate = A::TYPE_NAME, event = E::TYPE_NAME, "Registered state handler");
        Ok(self)
    }

    /// Adds a handler that runs synchronously inside the command's unit of work.
    pub fn on_domain_event<E, Args, H>(&mut self, handler: H) -> Result<&mut Self>
    where
        E: Event,
        H: EventHandler<E, Args>,
    {
        self.check_primary::<E>("domain event")?;
        H::verify(&self.register, HandlerScope::DomainEvent)?;
        self.add_decoder::<E>()?;

        let handlers = self.domain_handlers.entry(TypeId::of::<E>()).or_default();
        handlers.push(erase_event_handler(handler));
        tracing::debug!(
            event = E::TYPE_NAME,
            position = handlers.len(),
            "Registered domain event handler"
        );
        Ok(self)
    }

    /// Declares a processing group and its number of polling workers.
    pub fn processing_group(&mut self, name: &str, workers: usize) -> Result<&mut Self> {
        validate_workers(name, workers)?;
        let group = self.group_entry(name);
        if group.declared {
            return Err(Error::Definition(format!(
                "processing group {name} is declared twice"
            )));
        }
        group.workers = workers;
        group.declared = true;
        tracing::debug!(group = name, workers, "Declared processing group");
        Ok(self)
    }

    fn group_entry(&mut self, name: &str) -> &mut ProcessingGroup {
        self.groups
            .entry(name.to_string())
            .or_insert_with(|| ProcessingGroup {
                name: name.to_string(),
                workers: 1,
                declared: false,
                handlers: HashMap::new(),
            })
    }

    /// Adds a stream handler to a processing group. Undeclared groups get one
    /// worker.
    pub fn on_stream_event<E, Args, H>(&mut self, group: &str, handler: H) -> Result<&mut Self>
    where
        E: Event,
        H: EventHandler<E, Args>,
    {
        self.check_primary::<E>("stream event")?;
        H::verify(&self.register, HandlerScope::StreamEvent)?;
        self.add_decoder::<E>()?;

        self.group_entry(group)
            .handlers
            .entry(E::TYPE_NAME)
            .or_default()
            .push(erase_event_handler(handler));

        tracing::debug!(group, event = E::TYPE_NAME, "Registered stream event handler");
        Ok(self)
    }

    /// Registers the single handler for a query key.
    pub fn on_query<I, O, Args, H>(&mut self, key: &str, handler: H) -> Result<&mut Self>
    where
        I: Send + 'static,
        O: Send + 'static,
        H: QueryHandler<I, O, Args>,
    {
        if self.queries.contains_key(key) {
            return Err(Error::Definition(format!("query {key} already has a handler")));
        }
        self.check_primary::<I>("query")?;
        H::verify(&self.register)?;

        let erased: ErasedQueryFn = Box::new(move |input: Box<dyn Any + Send>, ctx: &HandlerContext<'_>| {
            let input = input.downcast::<I>().map_err(|_| {
                Error::Definition(format!("query input is not {}", std::any::type_name::<I>()))
            })?;
            let future = handler.call(*input, ctx)?;
            let erased: BoxFuture<'static, anyhow::Result<Box<dyn Any + Send>>> = Box::pin(async move {
                let output: Box<dyn Any + Send> = Box::new(future.await?);
                anyhow::Ok(output)
            });
            Ok(erased)
        });

        self.queries.insert(
            key.to_string(),
            QueryEntry {
                input: TypeId::of::<I>(),
                output: TypeId::of::<O>(),
                input_name: std::any::type_name::<I>(),
                output_name: std::any::type_name::<O>(),
                handler: erased,
            },
        );
        tracing::debug!(query = key, "Registered query handler");
        Ok(self)
    }

    pub fn build(self) -> HandlerRegistry {
        tracing::info!(
            commands = self.commands.len(),
            state_handlers = self.state_handlers.len(),
            domain_event_types = self.domain_handlers.len(),
            processing_groups = self.groups.len(),
            queries = self.queries.len(),
            "📋 Handler registry built"
        );

        HandlerRegistry {
            register: self.register,
            commands: self.commands,
            state_handlers: self.state_handlers,
            domain_handlers: self.domain_handlers,
            groups: self.groups,
            queries: self.queries,
            decoders: self.decoders,
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

pub struct HandlerRegistry {
    register: DependencyRegister,
    commands: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    state_handlers: HashMap<(TypeId, TypeId), StateFn>,
    domain_handlers: HashMap<TypeId, Vec<ErasedEventFn>>,
    groups: BTreeMap<String, ProcessingGroup>,
    queries: HashMap<String, QueryEntry>,
    decoders: HashMap<&'static str, EventDecoder>,
}

impl HandlerRegistry {
    pub fn builder(register: DependencyRegister) -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::new(register)
    }

    /// A dispatch context carrying only the dependency register.
    pub fn context(&self) -> HandlerContext<'_> {
        HandlerContext::new(&self.register)
    }

    /// Runs the command's handler against the existing state, if any.
    ///
    /// Returns the new state and the events the handler applied, in order.
    pub fn dispatch_command<C: Command>(
        &self,
        state: Option<C::Aggregate>,
        command: C,
        ctx: &HandlerContext<'_>,
    ) -> Result<(C::Aggregate, EventBuffer)> {
        let name = command_name::<C>();
        let entry = self
            .commands
            .get(&TypeId::of::<C>())
            .ok_or_else(|| Error::CommandHandlerNotFound(name.to_string()))?
            .downcast_ref::<CommandEntry<C>>()
            .ok_or_else(|| Error::Definition(format!("command entry for {name} has the wrong type")))?;

        let business_id: Uuid = command
            .target_aggregate_id()
            .ok_or(Error::NoTargetIdentifier(name))?;
        let mut events = EventBuffer::new();

        let state = match (entry, state) {
            (CommandEntry::Creation(_), Some(_)) => {
                return Err(Error::AggregateAlreadyExists(business_id));
            }
            (CommandEntry::Mutation(_), None) => {
                return Err(Error::AggregateNotFound(business_id));
            }
            (CommandEntry::Creation(handler), None) => handler(command, &mut events, ctx)?,
            (CommandEntry::Mutation(handler), Some(mut state)) => {
                handler(&mut state, command, &mut events, ctx)?;
                state
            }
        };

        Ok((state, events))
    }

    /// Applies one event to the aggregate state in place.
    pub fn dispatch_state_handler<A: Aggregate>(&self, state: &mut A, event: &dyn AnyEvent) -> Result<()> {
        let handler = self
            .state_handlers
            .get(&(TypeId::of::<A>(), event.event_type_id()))
            .ok_or_else(|| {
                Error::CommandHandlerNotFound(format!(
                    "state handler for {} on {}",
                    event.type_name(),
                    A::TYPE_NAME
                ))
            })?;
        handler(state as &mut dyn Any, event)
    }

    /// Runs every domain-event handler for the event, in registration order.
    /// The first failure stops the chain.
    pub async fn dispatch_domain_handlers(&self, event: &dyn AnyEvent, ctx: &HandlerContext<'_>) -> Result<()> {
        let Some(handlers) = self.domain_handlers.get(&event.event_type_id()) else {
            return Ok(());
        };

        for handler in handlers {
            handler(event, ctx)?.await.map_err(Error::Handler)?;
        }
        Ok(())
    }

    /// Runs every stream handler of `group` for the event, in registration order.
    pub async fn dispatch_stream_handlers(
        &self,
        group: &str,
        event: &dyn AnyEvent,
        ctx: &HandlerContext<'_>,
    ) -> Result<()> {
        let Some(handlers) = self
            .groups
            .get(group)
            .and_then(|g| g.handlers.get(event.type_name()))
        else {
            return Ok(());
        };

        for handler in handlers {
            handler(event, ctx)?.await.map_err(Error::Handler)?;
        }
        Ok(())
    }

    /// Decodes a stored payload into the event type registered under `type_name`.
    ///
    /// `None` if no handler of any kind knows the type name.
    pub fn decode_event(&self, type_name: &str, payload: &str) -> Result<Option<Box<dyn AnyEvent>>> {
        match self.decoders.get(type_name) {
            Some(decoder) => (decoder.decode)(payload).map(Some),
            None => Ok(None),
        }
    }

    pub async fn dispatch_query<I, O>(&self, key: &str, input: I, ctx: &HandlerContext<'_>) -> Result<O>
    where
        I: Send + 'static,
        O: Send + 'static,
    {
        let entry = self
            .queries
            .get(key)
            .ok_or_else(|| Error::QueryHandlerNotFound(key.to_string()))?;

        if entry.input != TypeId::of::<I>() || entry.output != TypeId::of::<O>() {
            return Err(Error::Definition(format!(
                "query {key} maps {} to {}, not {} to {}",
                entry.input_name,
                entry.output_name,
                std::any::type_name::<I>(),
                std::any::type_name::<O>()
            )));
        }

        let output = (entry.handler)(Box::new(input), ctx)?
            .await
            .map_err(Error::Handler)?;
        output
            .downcast::<O>()
            .map(|o| *o)
            .map_err(|_| Error::Definition(format!("query {key} returned an unexpected type")))
    }

    pub fn processing_groups(&self) -> impl Iterator<Item = &ProcessingGroup> {
        self.groups.values()
    }

    pub fn processing_group(&self, name: &str) -> Option<&ProcessingGroup> {
        self.groups.get(name)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("commands", &self.commands.len())
            .field("state_handlers", &self.state_handlers.len())
            .field("domain_event_types", &self.domain_handlers.len())
            .field("groups", &self.groups)
            .field("queries", &self.queries.len())
            .finish()
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
