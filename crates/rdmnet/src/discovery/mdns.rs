// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! mDNS implementation of the [`DiscoveryAgent`] seam.
//!
//! All daemon interaction happens on one dedicated discovery thread: the
//! public methods enqueue commands and return immediately, and resolved
//! entries are published through mutex-protected lists the reactor thread
//! snapshots. A one-shot channel acts as the startup barrier so `start`
//! can report whether the initial browse began.
//!
//! Daemon failure after startup enters a reconnect cycle (exponential
//! backoff, 1 s to 60 s); registrations are replayed once the daemon is
//! back, and consumers simply see empty lists until then.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddrV4};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::Mutex;

use super::txt::{parse_controller, parse_distributor, TxtRecord};
use super::{
    scoped_service_type, DiscoveryAgent, DEFAULT_SCOPE, E133_CONTROLLER_SERVICE,
    E133_DISTRIBUTOR_SERVICE, MANUFACTURER_KEY, MODEL_KEY, PRIORITY_KEY, SCOPE_KEY,
    TXT_VERSION_KEY, UID_KEY,
};
use crate::core::entry::{ControllerEntry, DistributorEntry};
use crate::rt::ReactorHandle;
use crate::transport::connector::BackoffPolicy;
use crate::{Error, Result};

const ALL_TXT_KEYS: [&str; 7] = [
    TXT_VERSION_KEY,
    super::E133_VERSION_KEY,
    PRIORITY_KEY,
    SCOPE_KEY,
    UID_KEY,
    MODEL_KEY,
    MANUFACTURER_KEY,
];

/// How long the discovery thread sleeps waiting for commands between
/// browse-event sweeps.
const COMMAND_POLL: Duration = Duration::from_millis(20);

/// Bounded attempts at renaming around a service-name collision.
const MAX_RENAME_ATTEMPTS: u32 = 10;

// ============================================================================
// Cross-thread state
// ============================================================================

#[derive(Default)]
struct SharedLists {
    controllers: Mutex<Vec<ControllerEntry>>,
    distributors: Mutex<Vec<DistributorEntry>>,
}

enum Command {
    SetScope {
        scope: String,
        /// Entries evicted from the shared lists on the caller's thread;
        /// shipped here so their teardown happens on the discovery thread.
        orphans: (Vec<ControllerEntry>, Vec<DistributorEntry>),
    },
    RegisterController(ControllerEntry),
    RegisterDistributor(DistributorEntry),
    Deregister(SocketAddrV4),
    Shutdown,
}

// ============================================================================
// Public agent
// ============================================================================

/// Production [`DiscoveryAgent`] over an mDNS daemon.
pub struct MdnsDiscoveryAgent {
    scope: String,
    shared: Arc<SharedLists>,
    notify: Option<ReactorHandle>,
    cmd_tx: Option<Sender<Command>>,
    thread: Option<JoinHandle<()>>,
}

impl MdnsDiscoveryAgent {
    /// `notify`, when provided, is woken whenever the entry lists change.
    pub fn new(scope: &str, notify: Option<ReactorHandle>) -> Self {
        let scope = if scope.is_empty() {
            DEFAULT_SCOPE.to_string()
        } else {
            scope.to_string()
        };
        Self {
            scope,
            shared: Arc::new(SharedLists::default()),
            notify,
            cmd_tx: None,
            thread: None,
        }
    }
}

impl DiscoveryAgent for MdnsDiscoveryAgent {
    fn start(&mut self) -> Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }

        let (cmd_tx, cmd_rx) = channel();
        let (ready_tx, ready_rx) = channel::<std::result::Result<(), String>>();
        let shared = Arc::clone(&self.shared);
        let notify = self.notify.clone();
        let scope = self.scope.clone();

        let thread = std::thread::Builder::new()
            .name("rdmnet-discovery".to_string())
            .spawn(move || {
                DiscoveryThread::new(scope, shared, notify, cmd_rx).run(ready_tx);
            })
            .map_err(|e| Error::Discovery(format!("failed to spawn discovery thread: {}", e)))?;
        self.thread = Some(thread);
        self.cmd_tx = Some(cmd_tx);

        // Startup barrier: wait for the first browse op to begin.
        match ready_rx.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => {
                self.stop();
                Err(Error::Discovery(message))
            }
            Err(_) => {
                self.stop();
                Err(Error::Discovery("discovery thread died on startup".into()))
            }
        }
    }

    fn stop(&mut self) {
        if let Some(tx) = self.cmd_tx.take() {
            let _ = tx.send(Command::Shutdown);
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("discovery thread panicked during shutdown");
            }
        }
    }

    fn set_scope(&mut self, scope: &str) {
        if scope == self.scope {
            return;
        }
        self.scope = scope.to_string();

        // Evict everything resolved under the old scope right now; the
        // discovery thread frees the orphans and re-browses.
        let orphaned_controllers: Vec<ControllerEntry> =
            std::mem::take(&mut *self.shared.controllers.lock());
        let orphaned_distributors: Vec<DistributorEntry> =
            std::mem::take(&mut *self.shared.distributors.lock());

        if let Some(tx) = &self.cmd_tx {
            let _ = tx.send(Command::SetScope {
                scope: self.scope.clone(),
                orphans: (orphaned_controllers, orphaned_distributors),
            });
        }
    }

    fn list_controllers(&self, out: &mut Vec<ControllerEntry>) {
        out.extend(self.shared.controllers.lock().iter().cloned());
    }

    fn list_distributors(&self, out: &mut Vec<DistributorEntry>) {
        out.extend(self.shared.distributors.lock().iter().cloned());
    }

    fn register_controller(&mut self, entry: ControllerEntry) {
        if let Some(tx) = &self.cmd_tx {
            let _ = tx.send(Command::RegisterController(entry));
        }
    }

    fn register_distributor(&mut self, entry: DistributorEntry) {
        if let Some(tx) = &self.cmd_tx {
            let _ = tx.send(Command::RegisterDistributor(entry));
        }
    }

    fn deregister(&mut self, address: SocketAddrV4) {
        if let Some(tx) = &self.cmd_tx {
            let _ = tx.send(Command::Deregister(address));
        }
    }
}

impl Drop for MdnsDiscoveryAgent {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Registration records
// ============================================================================

#[derive(Clone, Debug)]
enum RegisteredEntry {
    Controller(ControllerEntry),
    Distributor(DistributorEntry),
}

impl RegisteredEntry {
    fn txt(&self) -> TxtRecord {
        match self {
            RegisteredEntry::Controller(e) => TxtRecord::for_controller(e),
            RegisteredEntry::Distributor(e) => TxtRecord::for_distributor(e),
        }
    }

    fn scope(&self) -> &str {
        match self {
            RegisteredEntry::Controller(e) => &e.scope,
            RegisteredEntry::Distributor(e) => &e.scope,
        }
    }

    fn service_type(&self) -> String {
        match self {
            RegisteredEntry::Controller(e) => {
                scoped_service_type(E133_CONTROLLER_SERVICE, &e.scope)
            }
            RegisteredEntry::Distributor(e) => {
                scoped_service_type(E133_DISTRIBUTOR_SERVICE, &e.scope)
            }
        }
    }

    fn requested_name(&self) -> String {
        match self {
            RegisteredEntry::Controller(e) => e.effective_service_name(),
            RegisteredEntry::Distributor(e) => e.effective_service_name(),
        }
    }

    fn address(&self) -> SocketAddrV4 {
        match self {
            RegisteredEntry::Controller(e) => e.address,
            RegisteredEntry::Distributor(e) => e.address,
        }
    }
}

/// One live DNS-SD registration.
struct RegistrationRecord {
    entry: RegisteredEntry,
    txt: TxtRecord,
    scope_at_registration: String,
    fullname: String,
}

/// Deterministic alternate name after `n` collisions: `base (n+1)`.
fn alternate_name(base: &str, collisions: u32) -> String {
    if collisions == 0 {
        base.to_string()
    } else {
        format!("{} ({})", base, collisions + 1)
    }
}

// ============================================================================
// The discovery thread
// ============================================================================

struct DiscoveryThread {
    scope: String,
    shared: Arc<SharedLists>,
    notify: Option<ReactorHandle>,
    cmd_rx: Receiver<Command>,

    daemon: Option<ServiceDaemon>,
    controller_rx: Option<mdns_sd::Receiver<ServiceEvent>>,
    distributor_rx: Option<mdns_sd::Receiver<ServiceEvent>>,

    registrations: HashMap<SocketAddrV4, RegistrationRecord>,

    reconnect_backoff: BackoffPolicy,
    reconnect_failures: u32,
    next_reconnect: Option<Instant>,
}

impl DiscoveryThread {
    fn new(
        scope: String,
        shared: Arc<SharedLists>,
        notify: Option<ReactorHandle>,
        cmd_rx: Receiver<Command>,
    ) -> Self {
        Self {
            scope,
            shared,
            notify,
            cmd_rx,
            daemon: None,
            controller_rx: None,
            distributor_rx: None,
            registrations: HashMap::new(),
            reconnect_backoff: BackoffPolicy::exponential(
                Duration::from_secs(1),
                Duration::from_secs(60),
            ),
            reconnect_failures: 0,
            next_reconnect: None,
        }
    }

    fn run(mut self, ready_tx: Sender<std::result::Result<(), String>>) {
        info!("starting discovery thread");
        let startup = self.ensure_daemon();
        let _ = ready_tx.send(startup.map_err(|e| {
            warn!("discovery startup failed: {}", e);
            e
        }));

        loop {
            match self.cmd_rx.recv_timeout(COMMAND_POLL) {
                Ok(Command::Shutdown) => break,
                Ok(command) => self.handle_command(command),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            }

            // Drain any further queued commands before touching the daemon.
            loop {
                match self.cmd_rx.try_recv() {
                    Ok(Command::Shutdown) => {
                        self.shutdown();
                        return;
                    }
                    Ok(command) => self.handle_command(command),
                    Err(_) => break,
                }
            }

            if self.daemon.is_none() {
                if let Some(when) = self.next_reconnect {
                    if Instant::now() >= when {
                        if let Err(e) = self.ensure_daemon() {
                            debug!("daemon reconnect failed: {}", e);
                        }
                    }
                }
            }

            self.drain_browse_events();
        }

        self.shutdown();
        info!("done with discovery thread");
    }

    fn shutdown(&mut self) {
        if let Some(daemon) = self.daemon.take() {
            for record in self.registrations.values() {
                let _ = daemon.unregister(&record.fullname);
            }
            let _ = daemon.shutdown();
        }
        self.registrations.clear();
        self.controller_rx = None;
        self.distributor_rx = None;
    }

    /// Create the daemon and browse ops if they are missing; replay
    /// registrations after a reconnect.
    fn ensure_daemon(&mut self) -> std::result::Result<(), String> {
        if self.daemon.is_some() {
            return Ok(());
        }

        let attempt = || -> std::result::Result<
            (ServiceDaemon, mdns_sd::Receiver<ServiceEvent>, mdns_sd::Receiver<ServiceEvent>),
            String,
        > {
            let daemon = ServiceDaemon::new().map_err(|e| e.to_string())?;
            let controller_type = scoped_service_type(E133_CONTROLLER_SERVICE, &self.scope);
            let distributor_type = scoped_service_type(E133_DISTRIBUTOR_SERVICE, &self.scope);
            info!("starting browse op {}", controller_type);
            let controller_rx = daemon.browse(&controller_type).map_err(|e| e.to_string())?;
            let distributor_rx = daemon.browse(&distributor_type).map_err(|e| e.to_string())?;
            Ok((daemon, controller_rx, distributor_rx))
        };

        match attempt() {
            Ok((daemon, controller_rx, distributor_rx)) => {
                self.daemon = Some(daemon);
                self.controller_rx = Some(controller_rx);
                self.distributor_rx = Some(distributor_rx);
                self.reconnect_failures = 0;
                self.next_reconnect = None;

                let records: Vec<RegisteredEntry> = self
                    .registrations
                    .drain()
                    .map(|(_, r)| r.entry)
                    .collect();
                for entry in records {
                    self.register(entry);
                }
                Ok(())
            }
            Err(message) => {
                self.reconnect_failures = self.reconnect_failures.saturating_add(1);
                let delay = self.reconnect_backoff.delay(self.reconnect_failures);
                info!("re-creating mDNS daemon in {:?}: {}", delay, message);
                self.next_reconnect = Some(Instant::now() + delay);
                Err(message)
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::SetScope { scope, orphans } => {
                // Orphans were already hidden from consumers; they die here.
                drop(orphans);
                self.change_scope(scope);
            }
            Command::RegisterController(entry) => {
                self.register(RegisteredEntry::Controller(entry))
            }
            Command::RegisterDistributor(entry) => {
                self.register(RegisteredEntry::Distributor(entry))
            }
            Command::Deregister(address) => self.deregister(address),
            Command::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    fn change_scope(&mut self, scope: String) {
        if let Some(daemon) = &self.daemon {
            let _ = daemon.stop_browse(&scoped_service_type(E133_CONTROLLER_SERVICE, &self.scope));
            let _ = daemon.stop_browse(&scoped_service_type(E133_DISTRIBUTOR_SERVICE, &self.scope));
        }
        self.scope = scope;
        self.controller_rx = None;
        self.distributor_rx = None;

        if let Some(daemon) = &self.daemon {
            let controller_type = scoped_service_type(E133_CONTROLLER_SERVICE, &self.scope);
            let distributor_type = scoped_service_type(E133_DISTRIBUTOR_SERVICE, &self.scope);
            info!("starting browse op {}", controller_type);
            match daemon.browse(&controller_type) {
                Ok(rx) => self.controller_rx = Some(rx),
                Err(e) => warn!("browse for {} failed: {}", controller_type, e),
            }
            match daemon.browse(&distributor_type) {
                Ok(rx) => self.distributor_rx = Some(rx),
                Err(e) => warn!("browse for {} failed: {}", distributor_type, e),
            }
        }
    }

    // ========================================================================
    // Registration
    // ========================================================================

    fn register(&mut self, entry: RegisteredEntry) {
        let address = entry.address();
        let txt = entry.txt();

        if let Some(record) = self.registrations.get(&address) {
            if record.txt == txt && record.scope_at_registration == entry.scope() {
                // Same payload, same scope: at most one DNS-SD update.
                return;
            }
            info!("updating registration for {}", address);
            self.cancel_registration(address);
        }

        let Some(daemon) = &self.daemon else {
            // Remember the intent; replayed when the daemon returns.
            self.registrations.insert(
                address,
                RegistrationRecord {
                    txt,
                    scope_at_registration: entry.scope().to_string(),
                    fullname: String::new(),
                    entry,
                },
            );
            return;
        };

        let service_type = entry.service_type();
        let base_name = entry.requested_name();
        let host = format!("rdmnet-{}.local.", address.port());
        let properties = txt.to_map();

        let mut registered: Option<String> = None;
        for collisions in 0..MAX_RENAME_ATTEMPTS {
            let name = alternate_name(&base_name, collisions);
            let info = match build_service_info(&service_type, &name, &host, address, &properties) {
                Ok(info) => info,
                Err(e) => {
                    warn!("cannot build service info for {}: {}", address, e);
                    return;
                }
            };
            let fullname = info.get_fullname().to_string();
            match daemon.register(info) {
                Ok(()) => {
                    info!("adding {} : {}:{}", name, service_type, address.port());
                    registered = Some(fullname);
                    break;
                }
                Err(e) => {
                    warn!("register of {} returned {}, renaming", name, e);
                }
            }
        }

        let Some(fullname) = registered else {
            warn!("giving up registering {} after repeated collisions", address);
            return;
        };

        self.registrations.insert(
            address,
            RegistrationRecord {
                txt,
                scope_at_registration: entry.scope().to_string(),
                fullname,
                entry,
            },
        );
    }

    fn cancel_registration(&mut self, address: SocketAddrV4) {
        if let Some(record) = self.registrations.remove(&address) {
            if !record.fullname.is_empty() {
                if let Some(daemon) = &self.daemon {
                    let _ = daemon.unregister(&record.fullname);
                }
            }
        }
    }

    fn deregister(&mut self, address: SocketAddrV4) {
        self.cancel_registration(address);
    }

    // ========================================================================
    // Browse results
    // ========================================================================

    fn drain_browse_events(&mut self) {
        let mut changed = false;
        while let Some(event) = self.controller_rx.as_ref().and_then(|rx| rx.try_recv().ok()) {
            changed |= self.handle_controller_event(event);
        }
        while let Some(event) = self
            .distributor_rx
            .as_ref()
            .and_then(|rx| rx.try_recv().ok())
        {
            changed |= self.handle_distributor_event(event);
        }
        if changed {
            if let Some(notify) = &self.notify {
                notify.wake();
            }
        }
    }

    fn handle_controller_event(&mut self, event: ServiceEvent) -> bool {
        match event {
            ServiceEvent::ServiceResolved(info) => {
                let Some((name, address, props)) = resolve_parts(&info) else {
                    return false;
                };
                let Some(entry) = parse_controller(&props, &name, address) else {
                    return false;
                };
                if entry.scope != self.scope {
                    debug!("ignoring {} from scope {}", name, entry.scope);
                    return false;
                }
                let mut controllers = self.shared.controllers.lock();
                match controllers
                    .iter_mut()
                    .find(|e| e.effective_service_name() == name)
                {
                    Some(existing) => {
                        if *existing == entry {
                            return false;
                        }
                        existing.update_from(&entry);
                    }
                    None => {
                        info!("added controller {}", entry);
                        controllers.push(entry);
                    }
                }
                true
            }
            ServiceEvent::ServiceRemoved(_, fullname) => {
                let name = instance_from_fullname(&fullname);
                let mut controllers = self.shared.controllers.lock();
                let before = controllers.len();
                controllers.retain(|e| e.effective_service_name() != name);
                if controllers.len() != before {
                    info!("removed controller {}", name);
                    return true;
                }
                false
            }
            other => {
                debug!("controller browse event: {:?}", other);
                false
            }
        }
    }

    fn handle_distributor_event(&mut self, event: ServiceEvent) -> bool {
        match event {
            ServiceEvent::ServiceResolved(info) => {
                let Some((name, address, props)) = resolve_parts(&info) else {
                    return false;
                };
                let Some(entry) = parse_distributor(&props, &name, address) else {
                    return false;
                };
                if entry.scope != self.scope {
                    return false;
                }
                let mut distributors = self.shared.distributors.lock();
                match distributors
                    .iter_mut()
                    .find(|e| e.effective_service_name() == name)
                {
                    Some(existing) => {
                        if *existing == entry {
                            return false;
                        }
                        *existing = entry;
                    }
                    None => {
                        info!("added distributor {}", entry);
                        distributors.push(entry);
                    }
                }
                true
            }
            ServiceEvent::ServiceRemoved(_, fullname) => {
                let name = instance_from_fullname(&fullname);
                let mut distributors = self.shared.distributors.lock();
                let before = distributors.len();
                distributors.retain(|e| e.effective_service_name() != name);
                distributors.len() != before
            }
            other => {
                debug!("distributor browse event: {:?}", other);
                false
            }
        }
    }
}

// ============================================================================
// mdns-sd adapters
// ============================================================================

fn build_service_info(
    service_type: &str,
    name: &str,
    host: &str,
    address: SocketAddrV4,
    properties: &HashMap<String, String>,
) -> std::result::Result<ServiceInfo, String> {
    if address.ip().is_unspecified() {
        ServiceInfo::new(service_type, name, host, "", address.port(), properties.clone())
            .map(|info| info.enable_addr_auto())
            .map_err(|e| e.to_string())
    } else {
        ServiceInfo::new(
            service_type,
            name,
            host,
            IpAddr::V4(*address.ip()),
            address.port(),
            properties.clone(),
        )
        .map_err(|e| e.to_string())
    }
}

/// Instance name, IPv4 address and TXT map of a resolved service.
///
/// Entries that resolved without an A record are not ready yet.
fn resolve_parts(info: &ServiceInfo) -> Option<(String, SocketAddrV4, HashMap<String, String>)> {
    let ip = info.get_addresses().iter().find_map(|addr| match addr {
        IpAddr::V4(v4) => Some(*v4),
        IpAddr::V6(_) => None,
    })?;
    let address = SocketAddrV4::new(ip, info.get_port());
    let name = instance_from_fullname(info.get_fullname());

    let mut props = HashMap::new();
    for key in ALL_TXT_KEYS {
        if let Some(value) = info.get_property_val_str(key) {
            props.insert(key.to_string(), value.to_string());
        }
    }
    Some((name, address, props))
}

/// Strip the service type from a fullname, leaving the instance name.
fn instance_from_fullname(fullname: &str) -> String {
    match fullname.find("._") {
        Some(split) => fullname[..split].to_string(),
        None => fullname.to_string(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alternate_name_sequence() {
        assert_eq!(alternate_name("RDMnet Controller 5569", 0), "RDMnet Controller 5569");
        assert_eq!(
            alternate_name("RDMnet Controller 5569", 1),
            "RDMnet Controller 5569 (2)"
        );
        assert_eq!(
            alternate_name("RDMnet Controller 5569", 2),
            "RDMnet Controller 5569 (3)"
        );
    }

    #[test]
    fn test_instance_from_fullname() {
        assert_eq!(
            instance_from_fullname("RDMnet Controller 5569._draft-e133-cntrl._tcp.local."),
            "RDMnet Controller 5569"
        );
        assert_eq!(instance_from_fullname("oddball"), "oddball");
    }

    #[test]
    fn test_set_scope_purges_lists_before_thread_runs() {
        // No started thread: the eviction is purely the caller's side.
        let mut agent = MdnsDiscoveryAgent::new("default", None);
        agent.shared.controllers.lock().push(ControllerEntry {
            scope: "default".into(),
            ..ControllerEntry::default()
        });

        agent.set_scope("group-a");

        let mut out = Vec::new();
        agent.list_controllers(&mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_set_scope_same_scope_is_noop() {
        let mut agent = MdnsDiscoveryAgent::new("default", None);
        agent.shared.controllers.lock().push(ControllerEntry {
            scope: "default".into(),
            ..ControllerEntry::default()
        });

        agent.set_scope("default");

        let mut out = Vec::new();
        agent.list_controllers(&mut out);
        assert_eq!(out.len(), 1);
    }
}
