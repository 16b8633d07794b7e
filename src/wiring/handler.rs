use futures_util::future::BoxFuture;
use std::future::Future;

use crate::error::{Error, Result};
use crate::event_sourcing::{Command, Event, EventBuffer};

use super::dependency::{DependencyRegister, FromContext, HandlerContext, HandlerScope};

// ============================================================================
// Handler Signatures
// ============================================================================
//
// Handlers are plain functions or closures. The primary input comes first,
// followed by up to four side inputs implementing FromContext:
//
//   creation:  fn(C, &mut EventBuffer, ..) -> anyhow::Result<C::Aggregate>
//   mutation:  fn(&mut C::Aggregate, C, &mut EventBuffer, ..) -> anyhow::Result<()>
//   event:     async fn(E, ..) -> anyhow::Result<()>
//   query:     async fn(I, ..) -> anyhow::Result<O>
//
// The traits below are implemented for every such arity by macro. The `Args`
// type parameter only exists to keep those impls apart.
//
// ============================================================================

/// Handler for a command that creates its aggregate.
pub trait CreationHandler<C: Command, Args>: Send + Sync + 'static {
    fn verify(register: &DependencyRegister) -> Result<()>;

    fn call(&self, command: C, events: &mut EventBuffer, ctx: &HandlerContext<'_>)
        -> Result<C::Aggregate>;
}

/// Handler for a command against an existing aggregate.
pub trait MutationHandler<C: Command, Args>: Send + Sync + 'static {
    fn verify(register: &DependencyRegister) -> Result<()>;

    fn call(
        &self,
        state: &mut C::Aggregate,
        command: C,
        events: &mut EventBuffer,
        ctx: &HandlerContext<'_>,
    ) -> Result<()>;
}

/// Handler for a domain or stream event.
pub trait EventHandler<E: Event, Args>: Send + Sync + 'static {
    fn verify(register: &DependencyRegister, scope: HandlerScope) -> Result<()>;

    fn call(&self, event: E, ctx: &HandlerContext<'_>)
        -> Result<BoxFuture<'static, anyhow::Result<()>>>;
}

pub trait QueryHandler<I, O, Args>: Send + Sync + 'static {
    fn verify(register: &DependencyRegister) -> Result<()>;

    fn call(&self, input: I, ctx: &HandlerContext<'_>)
        -> Result<BoxFuture<'static, anyhow::Result<O>>>;
}

macro_rules! impl_handlers {
    ($($T:ident),*) => {
        impl<C, F, $($T,)*> CreationHandler<C, ($($T,)*)> for F
        where
            C: Command,
            F: Fn(C, &mut EventBuffer, $($T),*) -> anyhow::Result<C::Aggregate> + Send + Sync + 'static,
            $($T: FromContext,)*
        {
            #[allow(unused_variables)]
            fn verify(register: &DependencyRegister) -> Result<()> {
                $(<$T as FromContext>::verify(register, HandlerScope::Command)?;)*
                Ok(())
            }

            #[allow(non_snake_case, unused_variables)]
            fn call(
                &self,
                command: C,
                events: &mut EventBuffer,
                ctx: &HandlerContext<'_>,
            ) -> Result<C::Aggregate> {
                $(let $T = <$T as FromContext>::from_context(ctx)?;)*
                (self)(command, events, $($T),*).map_err(Error::Handler)
            }
        }

        impl<C, F, $($T,)*> MutationHandler<C, ($($T,)*)> for F
        where
            C: Command,
            F: Fn(&mut C::Aggregate, C, &mut EventBuffer, $($T),*) -> anyhow::Result<()>
                + Send
                + Sync
                + 'static,
            $($T: FromContext,)*
        {
            #[allow(unused_variables)]
            fn verify(register: &DependencyRegister) -> Result<()> {
                $(<$T as FromContext>::verify(register, HandlerScope::Command)?;)*
                Ok(())
            }

            #[allow(non_snake_case, unused_variables)]
            fn call(
                &self,
                state: &mut C::Aggregate,
                command: C,
                events: &mut EventBuffer,
                ctx: &HandlerContext<'_>,
            ) -> Result<()> {
                $(let $T = <$T as FromContext>::from_context(ctx)?;)*
                (self)(state, command, events, $($T),*).map_err(Error::Handler)
            }
        }

        impl<E, F, Fut, $($T,)*> EventHandler<E, ($($T,)*)> for F
        where
            E: Event,
            F: Fn(E, $($T),*) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
            $($T: FromContext,)*
        {
            #[allow(unused_variables)]
            fn verify(register: &DependencyRegister, scope: HandlerScope) -> Result<()> {
                $(<$T as FromContext>::verify(register, scope)?;)*
                Ok(())
            }

            #[allow(non_snake_case, unused_variables)]
            fn call(
                &self,
                event: E,
                ctx: &HandlerContext<'_>,
            ) -> Result<BoxFuture<'static, anyhow::Result<()>>> {
                $(let $T = <$T as FromContext>::from_context(ctx)?;)*
                Ok(Box::pin((self)(event, $($T),*)))
            }
        }

        impl<I, O, F, Fut, $($T,)*> QueryHandler<I, O, ($($T,)*)> for F
        where
            I: Send + 'static,
            O: Send + 'static,
            F: Fn(I, $($T),*) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
            $($T: FromContext,)*
        {
            #[allow(unused_variables)]
            fn verify(register: &DependencyRegister) -> Result<()> {
                $(<$T as FromContext>::verify(register, HandlerScope::Query)?;)*
                Ok(())
            }

            #[allow(non_snake_case, unused_variables)]
            fn call(
                &self,
                input: I,
                ctx: &HandlerContext<'_>,
            ) -> Result<BoxFuture<'static, anyhow::Result<O>>> {
                $(let $T = <$T as FromContext>::from_context(ctx)?;)*
                Ok(Box::pin((self)(input, $($T),*)))
            }
        }
    };
}

impl_handlers!();
impl_handlers!(T1);
impl_handlers!(T1, T2);
impl_handlers!(T1, T2, T3);
impl_handlers!(T1, T2, T3, T4);
