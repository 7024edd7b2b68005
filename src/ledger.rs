//! Per-server bookkeeping.

use std::net::SocketAddr;

use rustc_hash::FxHashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ServerEntry {
    /// Connections the server is still trusted with. Zero means unreachable.
    pub budget: usize,
    /// REFUSED answers tolerated before zone transfers are no longer tried.
    pub refusals_left: usize,
    /// Slots currently associated with the server, connecting or connected.
    pub active: usize,
    /// Zone transfers in progress.
    pub transfers: usize,
    /// Questions, queued or in flight, addressed to the server.
    pub refs: usize,
}

impl ServerEntry {
    fn new(full_budget: usize) -> Self {
        Self {
            budget: full_budget,
            refusals_left: full_budget,
            active: 0,
            transfers: 0,
            refs: 0,
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.budget > 0
    }

    pub fn transfers_allowed(&self) -> bool {
        self.refusals_left > 0
    }
}

pub(crate) struct Ledger {
    entries: FxHashMap<SocketAddr, ServerEntry>,
    full_budget: usize,
}

impl Ledger {
    pub fn new(full_budget: usize) -> Self {
        Self {
            entries: FxHashMap::default(),
            full_budget,
        }
    }

    pub fn get(&self, server: SocketAddr) -> Option<&ServerEntry> {
        self.entries.get(&server)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SocketAddr, &ServerEntry)> {
        self.entries.iter()
    }

    fn entry(&mut self, server: SocketAddr) -> &mut ServerEntry {
        let full = self.full_budget;
        self.entries
            .entry(server)
            .or_insert_with(|| ServerEntry::new(full))
    }

    pub fn is_reachable(&self, server: SocketAddr) -> bool {
        self.get(server).is_none_or(ServerEntry::is_reachable)
    }

    pub fn transfers_allowed(&self, server: SocketAddr) -> bool {
        self.get(server).is_none_or(ServerEntry::transfers_allowed)
    }

    pub fn active(&self, server: SocketAddr) -> usize {
        self.get(server).map_or(0, |e| e.active)
    }

    pub fn transfers(&self, server: SocketAddr) -> usize {
        self.get(server).map_or(0, |e| e.transfers)
    }

    pub fn total_active(&self) -> usize {
        self.entries.values().map(|e| e.active).sum()
    }

    /// Connections the server may hold right now.
    pub fn capacity(&self, server: SocketAddr, per_server_cap: usize) -> usize {
        self.get(server)
            .map_or(self.full_budget, |e| e.budget)
            .min(per_server_cap)
    }

    pub fn reference(&mut self, server: SocketAddr) {
        self.entry(server).refs += 1;
    }

    pub fn release(&mut self, server: SocketAddr) {
        if let Some(entry) = self.entries.get_mut(&server) {
            entry.refs = entry.refs.saturating_sub(1);
        }
        self.collect(server);
    }

    pub fn connect(&mut self, server: SocketAddr) {
        self.entry(server).active += 1;
    }

    pub fn disconnect(&mut self, server: SocketAddr) {
        if let Some(entry) = self.entries.get_mut(&server) {
            entry.active = entry.active.saturating_sub(1);
        }
        self.collect(server);
    }

    pub fn begin_transfer(&mut self, server: SocketAddr) {
        self.entry(server).transfers += 1;
    }

    pub fn end_transfer(&mut self, server: SocketAddr) {
        if let Some(entry) = self.entries.get_mut(&server) {
            entry.transfers = entry.transfers.saturating_sub(1);
        }
    }

    /// Charge a failure to the server. Returns the remaining budget.
    pub fn record_failure(&mut self, server: SocketAddr) -> usize {
        let entry = self.entry(server);
        entry.budget = entry.budget.saturating_sub(1);
        entry.budget
    }

    /// Charge a REFUSED answer. Returns the refusals left.
    pub fn record_refusal(&mut self, server: SocketAddr) -> usize {
        let entry = self.entry(server);
        entry.refusals_left = entry.refusals_left.saturating_sub(1);
        entry.refusals_left
    }

    /// A valid answer restores the connection budget.
    pub fn record_answer(&mut self, server: SocketAddr) {
        let full = self.full_budget;
        self.entry(server).budget = full;
    }

    /// Explicit retry: forget past failures and refusals.
    pub fn retry(&mut self, server: SocketAddr) {
        if let Some(entry) = self.entries.get_mut(&server) {
            entry.budget = self.full_budget;
            entry.refusals_left = self.full_budget;
        }
        self.collect(server);
    }

    /// Healthy entries move to the new budget; degraded ones keep what
    /// they have left, capped at the new budget.
    pub fn set_full_budget(&mut self, full_budget: usize) {
        let old = std::mem::replace(&mut self.full_budget, full_budget);
        let rescale = |left: usize| if left == old { full_budget } else { left.min(full_budget) };
        for entry in self.entries.values_mut() {
            entry.budget = rescale(entry.budget);
            entry.refusals_left = rescale(entry.refusals_left);
        }
        let servers: Vec<SocketAddr> = self.entries.keys().copied().collect();
        for server in servers {
            self.collect(server);
        }
    }

    /// Drop an entry nothing depends on. Degraded servers are kept so
    /// they stay skipped until retried.
    fn collect(&mut self, server: SocketAddr) {
        let full = self.full_budget;
        if let Some(entry) = self.entries.get(&server) {
            if entry.refs == 0
                && entry.active == 0
                && entry.transfers == 0
                && entry.budget == full
                && entry.refusals_left == full
            {
                self.entries.remove(&server);
            }
        }
    }
}
