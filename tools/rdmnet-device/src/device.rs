// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The device node loop: one reactor, one connector, one controller
//! agent, and a discovery source for candidates.

use std::net::SocketAddrV4;
use std::time::Duration;

use log::info;

use rdmnet::acn::codec::{Cid, MessageBuilder};
use rdmnet::agent::{AgentAction, CandidateController, ControllerAgent};
use rdmnet::config::AgentConfig;
use rdmnet::core::uid::RdmUid;
use rdmnet::discovery::{DiscoveryAgent, MdnsDiscoveryAgent, StaticDiscoveryAgent};
use rdmnet::rt::{Reactor, ReactorEvent, TimerId};
use rdmnet::transport::connector::TcpConnector;
use rdmnet::Result;

pub struct DeviceOptions {
    pub uid: RdmUid,
    pub udp_endpoint: SocketAddrV4,
    pub scope: String,
    /// If set, overrides DNS-SD and specifies the controller to connect to.
    pub static_controller: Option<SocketAddrV4>,
    pub discovery_startup_delay: Duration,
    pub terminate_after: Option<Duration>,
}

pub struct Device {
    reactor: Reactor,
    connector: TcpConnector,
    agent: ControllerAgent,
    discovery: Box<dyn DiscoveryAgent>,
    options: DeviceOptions,

    startup_timer: Option<TimerId>,
    terminate_timer: Option<TimerId>,
}

impl Device {
    pub fn new(options: DeviceOptions) -> Result<Self> {
        let reactor = Reactor::new()?;
        let builder = MessageBuilder::new(Cid::generate(), "E1.33 Device");
        let config = AgentConfig::default();

        let discovery: Box<dyn DiscoveryAgent> = match options.static_controller {
            Some(address) => Box::new(StaticDiscoveryAgent::with_controller(address, 100)),
            None => Box::new(MdnsDiscoveryAgent::new(
                &options.scope,
                Some(reactor.handle()),
            )),
        };

        Ok(Self {
            connector: TcpConnector::new(config.connect_timeout),
            agent: ControllerAgent::new(options.uid, options.udp_endpoint, builder, config),
            discovery,
            reactor,
            options,
            startup_timer: None,
            terminate_timer: None,
        })
    }

    pub fn run(&mut self) -> Result<()> {
        self.discovery.start()?;

        // Give DNS-SD a moment to populate before the first selection;
        // with a pinned controller there is nothing to wait for.
        if self.options.static_controller.is_some() {
            self.select_controller();
        } else {
            self.startup_timer = Some(
                self.reactor
                    .schedule_once(self.options.discovery_startup_delay),
            );
        }

        if let Some(after) = self.options.terminate_after {
            self.terminate_timer = Some(self.reactor.schedule_once(after));
        }

        info!("device {} starting", self.options.uid);
        let mut events = Vec::new();
        while self.reactor.running() {
            self.reactor.poll(&mut events, None)?;
            for event in events.drain(..) {
                self.dispatch(event);
            }
        }

        self.agent.stop(&mut self.connector, &mut self.reactor);
        self.discovery.stop();
        Ok(())
    }

    fn dispatch(&mut self, event: ReactorEvent) {
        let action = match event {
            ReactorEvent::Readable(token) | ReactorEvent::Writable(token) => {
                if self.connector.owns_token(token) {
                    match self.connector.handle_event(token, &mut self.reactor) {
                        Some(result) => self.agent.on_connect_result(result, &mut self.reactor),
                        None => AgentAction::Continue,
                    }
                } else if self.agent.owns_token(token) {
                    if matches!(event, ReactorEvent::Readable(_)) {
                        self.agent.on_readable(&mut self.reactor)
                    } else {
                        self.agent.on_writable(&mut self.reactor);
                        AgentAction::Continue
                    }
                } else {
                    AgentAction::Continue
                }
            }
            ReactorEvent::Timer(id) => self.dispatch_timer(id),
        };

        if action == AgentAction::NeedCandidates {
            self.select_controller();
        }
    }

    fn dispatch_timer(&mut self, id: TimerId) -> AgentAction {
        if self.startup_timer == Some(id) {
            self.startup_timer = None;
            return AgentAction::NeedCandidates;
        }
        if self.terminate_timer == Some(id) {
            info!("terminate-after expired, shutting down");
            self.reactor.terminate();
            return AgentAction::Continue;
        }
        if self.connector.owns_timer(id) {
            return match self.connector.handle_timer(id, &mut self.reactor) {
                Some(result) => self.agent.on_connect_result(result, &mut self.reactor),
                None => AgentAction::Continue,
            };
        }
        self.agent.handle_timer(id, &mut self.reactor)
    }

    /// Fetch the candidate list and let the agent pick.
    fn select_controller(&mut self) {
        let mut entries = Vec::new();
        self.discovery.list_controllers(&mut entries);
        let candidates: Vec<CandidateController> = entries
            .iter()
            .map(|entry| CandidateController {
                address: entry.address,
                priority: entry.priority,
            })
            .collect();
        self.agent
            .attempt_connection(&candidates, &mut self.connector, &mut self.reactor);
    }
}
