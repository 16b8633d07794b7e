use std::sync::Arc;

use crate::error::Result;
use crate::event_sourcing::StatelessView;
use crate::wiring::HandlerRegistry;

// ============================================================================
// Query Gateway
// ============================================================================
//
// Stateless passthrough to the registry. No unit of work is opened here;
// handlers that need the database ask for a StatelessView.
//
// ============================================================================

#[derive(Clone)]
pub struct QueryGateway {
    registry: Arc<HandlerRegistry>,
    view: StatelessView,
}

impl QueryGateway {
    pub fn new(registry: Arc<HandlerRegistry>, view: StatelessView) -> Self {
        Self { registry, view }
    }

    pub async fn query<I, O>(&self, key: &str, input: I) -> Result<O>
    where
        I: Send + 'static,
        O: Send + 'static,
    {
        tracing::debug!(query = key, "Dispatching query");
        let ctx = self.registry.context().with_stateless(&self.view);
        self.registry.dispatch_query(key, input, &ctx).await
    }
}

impl std::fmt::Debug for QueryGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryGateway").finish_non_exhaustive()
    }
}
