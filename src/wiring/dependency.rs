use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::event_sourcing::{EventInfo, ExecutionContext, StatelessView};

// ============================================================================
// Dependency Register - Side Inputs for Handlers
// ============================================================================
//
// A handler's first parameter is its primary input (the command, event or
// query being dispatched). Every other parameter is a side input, resolved
// through FromContext:
//
//   Dep<T>            - a shared value from the register, looked up by type
//   ExecutionContext  - the command's unit-of-work scope (command and
//                       domain-event handlers only)
//   StatelessView     - auto-commit read access (query and stream handlers
//                       only; inside a command it would need a second
//                       connection while the unit of work holds one)
//   EventInfo         - metadata about the event being handled
//
// The register is filled before any handler is registered and frozen when
// the registry is built. Lookups are by nominal type only.
//
// ============================================================================

/// Process-wide map from type to shared instance.
#[derive(Default)]
pub struct DependencyRegister {
    entries: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl DependencyRegister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) -> &mut Self {
        self.insert_arc(Arc::new(value))
    }

    pub fn insert_arc<T: Send + Sync + 'static>(&mut self, value: Arc<T>) -> &mut Self {
        tracing::debug!(dependency = std::any::type_name::<T>(), "Registered dependency");
        self.entries.insert(TypeId::of::<T>(), value);
        self
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|value| value.clone().downcast::<T>().ok())
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.contains_id(TypeId::of::<T>())
    }

    pub fn contains_id(&self, type_id: TypeId) -> bool {
        self.entries.contains_key(&type_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for DependencyRegister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyRegister")
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// A registered dependency, injected into a handler by type.
#[derive(Debug)]
pub struct Dep<T: ?Sized>(pub Arc<T>);

impl<T: ?Sized> Clone for Dep<T> {
    fn clone(&self) -> Self {
        Dep(self.0.clone())
    }
}

impl<T: ?Sized> Deref for Dep<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

/// Which kind of handler a side input is being resolved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerScope {
    Command,
    DomainEvent,
    StreamEvent,
    Query,
}

/// Everything a side input can be resolved from during one dispatch.
#[derive(Clone, Copy)]
pub struct HandlerContext<'a> {
    register: &'a DependencyRegister,
    execution: Option<&'a ExecutionContext>,
    stateless: Option<&'a StatelessView>,
    event: Option<&'a EventInfo>,
}

impl<'a> HandlerContext<'a> {
    pub fn new(register: &'a DependencyRegister) -> Self {
        Self {
            register,
            execution: None,
            stateless: None,
            event: None,
        }
    }

    pub fn with_execution(mut self, execution: &'a ExecutionContext) -> Self {
        self.execution = Some(execution);
        self
    }

    pub fn with_stateless(mut self, stateless: &'a StatelessView) -> Self {
        self.stateless = Some(stateless);
        self
    }

    pub fn with_event(mut self, event: &'a EventInfo) -> Self {
        self.event = Some(event);
        self
    }

    pub fn register(&self) -> &'a DependencyRegister {
        self.register
    }
}

/// A handler parameter that is not the primary input.
pub trait FromContext: Sized + Send + 'static {
    /// Checked once, at registration time.
    fn verify(register: &DependencyRegister, scope: HandlerScope) -> Result<()>;

    fn from_context(ctx: &HandlerContext<'_>) -> Result<Self>;
}

impl<T: Send + Sync + 'static> FromContext for Dep<T> {
    fn verify(register: &DependencyRegister, _scope: HandlerScope) -> Result<()> {
        if register.contains::<T>() {
            Ok(())
        } else {
            Err(Error::UnsatisfiedDependency(
                std::any::type_name::<T>().to_string(),
            ))
        }
    }

    fn from_context(ctx: &HandlerContext<'_>) -> Result<Self> {
        ctx.register
            .get::<T>()
            .map(Dep)
            .ok_or_else(|| Error::UnsatisfiedDependency(std::any::type_name::<T>().to_string()))
    }
}

impl FromContext for ExecutionContext {
    fn verify(_register: &DependencyRegister, scope: HandlerScope) -> Result<()> {
        match scope {
            HandlerScope::Command | HandlerScope::DomainEvent => Ok(()),
            _ => Err(Error::UnsatisfiedDependency(format!(
                "ExecutionContext is not available to {scope:?} handlers"
            ))),
        }
    }

    fn from_context(ctx: &HandlerContext<'_>) -> Result<Self> {
        ctx.execution
            .cloned()
            .ok_or_else(|| Error::UnsatisfiedDependency("ExecutionContext".to_string()))
    }
}

impl FromContext for StatelessView {
    fn verify(_register: &DependencyRegister, scope: HandlerScope) -> Result<()> {
        match scope {
            HandlerScope::Query | HandlerScope::StreamEvent => Ok(()),
            _ => Err(Error::UnsatisfiedDependency(format!(
                "StatelessView is not available to {scope:?} handlers, use ExecutionContext"
            ))),
        }
    }

    fn from_context(ctx: &HandlerContext<'_>) -> Result<Self> {
        ctx.stateless
            .cloned()
            .ok_or_else(|| Error::UnsatisfiedDependency("StatelessView".to_string()))
    }
}

impl FromContext for EventInfo {
    fn verify(_register: &DependencyRegister, scope: HandlerScope) -> Result<()> {
        match scope {
            HandlerScope::DomainEvent | HandlerScope::StreamEvent => Ok(()),
            _ => Err(Error::UnsatisfiedDependency(format!(
                "EventInfo is not available to {scope:?} handlers"
            ))),
        }
    }

    fn from_context(ctx: &HandlerContext<'_>) -> Result<Self> {
        ctx.event
            .cloned()
            .ok_or_else(|| Error::UnsatisfiedDependency("EventInfo".to_string()))
    }
}
