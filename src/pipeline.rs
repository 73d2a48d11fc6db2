//! A minimal request pipeline: phases, ordered hooks and request variables.
//!
//! Modules register hooks into a [`Phase`] with a [`HookOrder`] naming hooks
//! they must run before or after. [`Pipeline::process`] runs the phases in
//! order; within a phase every hook runs unless one returns an error.

use std::fmt;
use std::sync::Arc;

use camino::Utf8PathBuf;
use log::trace;
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::error::{Error, Result};
use crate::extract::OutputVariable;

/// Request variables, kept in insertion order. Setting an existing name
/// replaces its value in place. Serializes as a map.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VarTable {
    entries: Vec<(String, String)>,
}

impl VarTable {
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, v)) => *v = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Apply extracted variables in order.
    pub fn apply(&mut self, vars: impl IntoIterator<Item = OutputVariable>) {
        for var in vars {
            self.set(var.name, var.value);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

impl Serialize for VarTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// One inbound request as seen by the hooks.
#[derive(Clone, Debug, Default)]
pub struct Request {
    /// Address of the connected peer.
    pub peer_ip: String,
    /// Address of the user agent when a front module (for example one that
    /// trusts `X-Forwarded-For`) has determined it.
    pub useragent_ip: Option<String>,
    /// `Host` header.
    pub host: Option<String>,
    /// Request URI path.
    pub uri: String,
    /// Filesystem path the URI maps to, if any.
    pub filename: Option<Utf8PathBuf>,
    /// Variables bound for later stages.
    pub vars: VarTable,
}

impl Request {
    pub fn new(peer_ip: impl Into<String>, uri: impl Into<String>) -> Self {
        Request {
            peer_ip: peer_ip.into(),
            uri: uri.into(),
            ..Default::default()
        }
    }

    /// The client address used for geolocation.
    pub fn client_ip(&self) -> &str {
        self.useragent_ip.as_deref().unwrap_or(&self.peer_ip)
    }
}

/// Insertion points, in the order they run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Right after the request line and headers are parsed. No directory
    /// configuration is known yet.
    PostReadRequest,
    /// During access-control resolution, once directory configuration is known.
    HeaderParser,
}

impl Phase {
    pub const ALL: [Phase; 2] = [Phase::PostReadRequest, Phase::HeaderParser];
}

/// What a hook did with a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    Handled,
    /// The hook did not apply to this request.
    Declined,
}

pub type HookFn = dyn Fn(&mut Request) -> Result<Disposition> + Send + Sync;

/// Names of hooks this hook must run before or after within its phase.
/// Names that are not registered are ignored.
#[derive(Clone, Debug, Default)]
pub struct HookOrder {
    pub before: Vec<String>,
    pub after: Vec<String>,
}

impl HookOrder {
    pub fn before<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        HookOrder {
            before: names.into_iter().map(Into::into).collect(),
            after: Vec::new(),
        }
    }

    pub fn after<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        HookOrder {
            before: Vec::new(),
            after: names.into_iter().map(Into::into).collect(),
        }
    }
}

struct Hook {
    name: String,
    phase: Phase,
    order: HookOrder,
    run: Arc<HookFn>,
}

/// Registered hooks, sorted per phase on [`Pipeline::build`].
///
/// Registering a hook invalidates the order; running an unbuilt pipeline is
/// an [`Error::PipelineNotBuilt`].
#[derive(Default)]
pub struct Pipeline {
    hooks: Vec<Hook>,
    sorted: Option<Vec<(Phase, Vec<usize>)>>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for (phase, order) in self.sorted.iter().flatten() {
            for &i in order {
                list.entry(&(phase, &self.hooks[i].name));
            }
        }
        list.finish()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook. Call [`Pipeline::build`] once all hooks are in.
    pub fn register<F>(&mut self, phase: Phase, name: impl Into<String>, order: HookOrder, run: F)
    where
        F: Fn(&mut Request) -> Result<Disposition> + Send + Sync + 'static,
    {
        self.hooks.push(Hook {
            name: name.into(),
            phase,
            order,
            run: Arc::new(run),
        });
        self.sorted = None;
    }

    /// Resolve ordering constraints. Hooks without a constraint between them
    /// keep registration order.
    pub fn build(&mut self) -> Result<()> {
        let mut sorted = Vec::with_capacity(Phase::ALL.len());
        for phase in Phase::ALL {
            sorted.push((phase, self.sort_phase(phase)?));
        }
        self.sorted = Some(sorted);
        Ok(())
    }

    fn sort_phase(&self, phase: Phase) -> Result<Vec<usize>> {
        let members: Vec<usize> = (0..self.hooks.len())
            .filter(|&i| self.hooks[i].phase == phase)
            .collect();
        let position = |name: &str| members.iter().position(|&i| self.hooks[i].name == name);

        // edges[a] holds the members that must run after member a
        let mut edges = vec![Vec::new(); members.len()];
        let mut incoming = vec![0usize; members.len()];
        for (a, &i) in members.iter().enumerate() {
            let order = &self.hooks[i].order;
            for b in order.before.iter().filter_map(|n| position(n)) {
                edges[a].push(b);
                incoming[b] += 1;
            }
            for b in order.after.iter().filter_map(|n| position(n)) {
                edges[b].push(a);
                incoming[a] += 1;
            }
        }

        let mut done = vec![false; members.len()];
        let mut out = Vec::with_capacity(members.len());
        while out.len() < members.len() {
            // lowest registration index among ready hooks
            let Some(next) = (0..members.len()).find(|&m| !done[m] && incoming[m] == 0) else {
                let hooks = (0..members.len())
                    .filter(|&m| !done[m])
                    .map(|m| self.hooks[members[m]].name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(Error::HookCycle { phase, hooks });
            };
            done[next] = true;
            for &b in &edges[next] {
                incoming[b] -= 1;
            }
            out.push(members[next]);
        }
        Ok(out)
    }

    pub fn is_built(&self) -> bool {
        self.sorted.is_some()
    }

    /// Hook names of a phase in run order. Empty until built.
    pub fn hook_names(&self, phase: Phase) -> Vec<&str> {
        self.sorted
            .iter()
            .flatten()
            .filter(|(p, _)| *p == phase)
            .flat_map(|(_, order)| order.iter().map(|&i| self.hooks[i].name.as_str()))
            .collect()
    }

    /// Run every hook of one phase.
    pub fn run_phase(&self, phase: Phase, request: &mut Request) -> Result<()> {
        let sorted = self.sorted.as_ref().ok_or(Error::PipelineNotBuilt)?;
        for (p, order) in sorted {
            if *p != phase {
                continue;
            }
            for &i in order {
                let hook = &self.hooks[i];
                let disposition = (hook.run)(request)?;
                trace!("{phase:?} {} -> {disposition:?}", hook.name);
            }
        }
        Ok(())
    }

    /// Run all phases for a request.
    pub fn process(&self, request: &mut Request) -> Result<()> {
        for phase in Phase::ALL {
            self.run_phase(phase, request)?;
        }
        Ok(())
    }
}
