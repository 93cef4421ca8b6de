//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor.
//! It carries the connection manager plus the two collaborator seams the
//! transport consumes: the schema executor and the identity resolver.
//! Clone is required by Axum — all inner fields are Arc-wrapped or Copy.

use std::sync::Arc;

use crate::config::Config;
use crate::manager::ConnectionManager;
use crate::schema::{IdentityResolver, SchemaExecutor};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub manager: Arc<ConnectionManager>,
    pub executor: Arc<dyn SchemaExecutor>,
    pub resolver: Arc<dyn IdentityResolver>,
}

impl AppState {
    #[must_use]
    pub fn new(
        config: Config,
        executor: Arc<dyn SchemaExecutor>,
        resolver: Arc<dyn IdentityResolver>,
    ) -> Self {
        Self { config, manager: Arc::new(ConnectionManager::new()), executor, resolver }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================

#[cfg(test)]
pub mod test_helpers {
    use super::*;
    use crate::schema::test_doubles::ScriptedExecutor;
    use crate::schema::AnonymousResolver;

    /// App state with the scripted executor and anonymous resolver.
    #[must_use]
    pub fn test_app_state(config: Config) -> AppState {
        AppState::new(config, Arc::new(ScriptedExecutor), Arc::new(AnonymousResolver))
    }

    /// App state with explicit collaborators.
    #[must_use]
    pub fn test_app_state_with(
        config: Config,
        executor: Arc<dyn SchemaExecutor>,
        resolver: Arc<dyn IdentityResolver>,
    ) -> AppState {
        AppState::new(config, executor, resolver)
    }
}
