//! Hooks that plug geolocation into a [`Pipeline`].

use std::sync::Arc;

use log::trace;

use crate::config::{ModuleConfig, ScopeConfig};
use crate::error::Result;
use crate::extract::extract;
use crate::mmdb::DatabaseRegistry;
use crate::pipeline::{Disposition, HookOrder, Phase, Pipeline, Request};

/// Hook name used for ordering constraints.
pub const HOOK_NAME: &str = "maxminddb";

/// Stages that read the bound variables and must therefore run after us.
pub const RUNS_BEFORE: &[&str] = &["setenvif", "rewrite"];

/// Loaded configuration plus opened databases, shared by both hooks.
#[derive(Debug)]
pub struct GeoIpModule {
    config: Arc<ModuleConfig>,
    databases: Arc<DatabaseRegistry>,
}

impl GeoIpModule {
    pub fn new(config: Arc<ModuleConfig>, databases: Arc<DatabaseRegistry>) -> Self {
        Self { config, databases }
    }

    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    pub fn databases(&self) -> &DatabaseRegistry {
        &self.databases
    }

    /// Early stage: only the server scope is known.
    pub fn post_read_request(&self, request: &mut Request) -> Result<Disposition> {
        let server = self.config.server_for(request.host.as_deref());
        if !server.scope.enabled {
            return Ok(Disposition::Declined);
        }
        self.bind(&server.scope, request);
        Ok(Disposition::Handled)
    }

    /// Directory-aware stage: an enabled directory scope overrides the server.
    pub fn header_parser(&self, request: &mut Request) -> Result<Disposition> {
        let scopes = self.config.scopes_for(
            request.host.as_deref(),
            &request.uri,
            request.filename.as_deref(),
        );
        let Some(scope) = scopes.resolve() else {
            return Ok(Disposition::Declined);
        };
        self.bind(scope, request);
        Ok(Disposition::Handled)
    }

    fn bind(&self, scope: &ScopeConfig, request: &mut Request) {
        let db = scope.active_database().and_then(|path| self.databases.get(path));
        let vars = extract(scope, request.client_ip(), db.as_deref());
        trace!("{} variables for {}", vars.len(), request.client_ip());
        request.vars.apply(vars);
    }

    /// Register both hooks, ordered before the stages that consume them.
    pub fn register(self: Arc<Self>, pipeline: &mut Pipeline) {
        let module = Arc::clone(&self);
        pipeline.register(
            Phase::PostReadRequest,
            HOOK_NAME,
            HookOrder::before(RUNS_BEFORE.iter().copied()),
            move |req: &mut Request| module.post_read_request(req),
        );
        pipeline.register(
            Phase::HeaderParser,
            HOOK_NAME,
            HookOrder::before(RUNS_BEFORE.iter().copied()),
            move |req: &mut Request| self.header_parser(req),
        );
    }
}
