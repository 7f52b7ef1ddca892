//! Drone unit lifecycle.
//!
//! A unit cycles `Idle -> EnRoute -> DroppingAgent -> {Complete | Refilling}`,
//! with `Refilling -> {EnRoute | Idle}` and `Complete -> Idle`. A fire
//! carrying the fault marker sends the unit to `Faulted`, where it hands the
//! fire back and stays until told to clear.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::SimConfig;
use crate::dispatcher::DispatcherClient;
use crate::error::{DispatchError, TransportError};
use crate::events::{EventCode, EventRecord, EventSink};
use crate::protocol::UnitReply;
use crate::transport::{self, Address, Mailbox};
use crate::types::{FireEvent, Point, UnitId};
use crate::zones::ZoneTable;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitPhase {
    Idle,
    EnRoute,
    DroppingAgent,
    Refilling,
    Complete,
    Faulted,
}

impl fmt::Display for UnitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            UnitPhase::Idle => "IDLE",
            UnitPhase::EnRoute => "EN_ROUTE",
            UnitPhase::DroppingAgent => "DROPPING_AGENT",
            UnitPhase::Refilling => "REFILLING",
            UnitPhase::Complete => "COMPLETE",
            UnitPhase::Faulted => "FAULTED",
        };
        f.write_str(label)
    }
}

/// Operator commands delivered outside the dispatch protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitControl {
    ClearFault,
    Shutdown,
}

/// Litres to drop: `min(agent, remaining)`, never negative.
pub fn discharge_amount(agent: i64, remaining: i64) -> i64 {
    agent.min(remaining).max(0)
}

enum Flow {
    Continue,
    Stop,
}

pub struct Unit {
    id: UnitId,
    capacity: i64,
    agent: i64,
    position: Point,
    base: Point,
    task: Option<FireEvent>,
    phase: UnitPhase,
    /// The dispatcher already counts this unit as idle.
    announced: bool,
    config: SimConfig,
    zones: Arc<ZoneTable>,
    dispatcher: DispatcherClient,
    address: Address<UnitReply>,
    mailbox: Mailbox<UnitReply>,
    control_address: Address<UnitControl>,
    control: Mailbox<UnitControl>,
    sink: Arc<dyn EventSink>,
}

impl Unit {
    /// A full unit parked at base.
    pub fn new(
        id: UnitId,
        config: &SimConfig,
        zones: Arc<ZoneTable>,
        dispatcher: DispatcherClient,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let (address, mailbox) = transport::channel();
        let (control_address, control) = transport::channel();
        Self {
            id,
            capacity: config.agent_capacity,
            agent: config.agent_capacity,
            position: config.base_position(),
            base: config.base_position(),
            task: None,
            phase: UnitPhase::Idle,
            announced: false,
            config: config.clone(),
            zones,
            dispatcher,
            address,
            mailbox,
            control_address,
            control,
            sink,
        }
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    pub fn phase(&self) -> UnitPhase {
        self.phase
    }

    pub fn agent(&self) -> i64 {
        self.agent
    }

    pub fn position(&self) -> Point {
        self.position
    }

    pub fn task(&self) -> Option<&FireEvent> {
        self.task.as_ref()
    }

    /// Where the dispatcher delivers assignments and acks.
    pub fn address(&self) -> Address<UnitReply> {
        self.address.clone()
    }

    pub fn control_address(&self) -> Address<UnitControl> {
        self.control_address.clone()
    }

    fn entity(&self) -> String {
        format!("drone-{}", self.id)
    }

    /// Run the current phase once and move to the next one.
    pub fn step(&mut self) -> Result<UnitPhase, DispatchError> {
        let next = match self.phase {
            UnitPhase::Idle => self.idle()?,
            UnitPhase::EnRoute => self.en_route()?,
            UnitPhase::DroppingAgent => self.drop_agent()?,
            UnitPhase::Refilling => self.refill(),
            UnitPhase::Complete => self.complete()?,
            UnitPhase::Faulted => UnitPhase::Faulted,
        };
        if next != self.phase {
            tracing::debug!(unit = self.id, from = %self.phase, to = %next, "transition");
        }
        self.phase = next;
        Ok(next)
    }

    /// Drive the state machine until shut down or the dispatcher goes away.
    pub fn run(mut self) -> Result<(), DispatchError> {
        tracing::info!(unit = self.id, agent = self.agent, "unit online");
        loop {
            if let Flow::Stop = self.check_control()? {
                break;
            }
            if let Err(err) = self.step() {
                tracing::error!(unit = self.id, error = %err, "unit stopped");
                return Err(err);
            }
        }
        tracing::info!(unit = self.id, "unit shut down");
        Ok(())
    }

    /// Spawn [`Unit::run`] on a thread named `unit-{id}`.
    pub fn spawn(self) -> io::Result<UnitHandle> {
        let id = self.id;
        let control = self.control_address();
        let thread = thread::Builder::new()
            .name(format!("unit-{id}"))
            .spawn(move || self.run())?;
        Ok(UnitHandle {
            id,
            control,
            thread,
        })
    }

    /// Faulted units park here until an operator command arrives.
    fn check_control(&mut self) -> Result<Flow, DispatchError> {
        let command = if self.phase == UnitPhase::Faulted {
            self.control.recv_timeout(self.config.poll_interval())?
        } else {
            self.control.try_recv()?
        };
        match command {
            Some(UnitControl::Shutdown) => Ok(Flow::Stop),
            Some(UnitControl::ClearFault) if self.phase == UnitPhase::Faulted => {
                tracing::info!(unit = self.id, "fault cleared");
                self.phase = UnitPhase::Idle;
                self.announced = false;
                Ok(Flow::Continue)
            }
            _ => Ok(Flow::Continue),
        }
    }

    fn idle(&mut self) -> Result<UnitPhase, DispatchError> {
        if self.agent <= 0 {
            return Ok(UnitPhase::Refilling);
        }
        if self.task.is_some() {
            // Assigned while we were still waiting for a completion ack.
            self.announced = false;
            return Ok(UnitPhase::EnRoute);
        }
        if !self.announced {
            self.dispatcher.announce_idle(self.id, &self.address)?;
            self.announced = true;
        }
        match self.mailbox.recv_timeout(self.config.poll_interval())? {
            Some(UnitReply::Assigned(task)) => {
                tracing::info!(unit = self.id, fire = %task, "received assignment");
                self.task = Some(task);
                self.announced = false;
                Ok(UnitPhase::EnRoute)
            }
            Some(UnitReply::CompletionAck { task_id }) => {
                tracing::debug!(unit = self.id, fire = task_id, "stray completion ack");
                Ok(UnitPhase::Idle)
            }
            None => Ok(UnitPhase::Idle),
        }
    }

    fn en_route(&mut self) -> Result<UnitPhase, DispatchError> {
        let Some(zone_id) = self.task.as_ref().map(|task| task.zone_id) else {
            return Ok(UnitPhase::Idle);
        };
        let Some(zone) = self.zones.lookup(zone_id) else {
            tracing::error!(unit = self.id, zone = zone_id, "no such zone; abandoning fire");
            return self.abandon();
        };
        let target = zone.centroid();
        self.fly_to(target, format!("to zone {zone_id}"));
        Ok(UnitPhase::DroppingAgent)
    }

    fn drop_agent(&mut self) -> Result<UnitPhase, DispatchError> {
        let Some(task) = self.task.as_mut() else {
            return Ok(UnitPhase::Idle);
        };
        if task.has_fault() {
            tracing::warn!(unit = self.id, fire = task.id, "fault while dropping agent");
            return self.abandon();
        }
        let amount = discharge_amount(self.agent, task.remaining_demand());
        self.agent -= amount;
        task.extinguish(amount);
        let (task_id, remaining, satisfied) = (task.id, task.remaining_demand(), task.is_satisfied());
        tracing::info!(
            unit = self.id,
            fire = task_id,
            dropped = amount,
            agent = self.agent,
            remaining,
            "dropped agent"
        );
        self.sink.record(EventRecord::new(
            self.entity(),
            EventCode::AgentDropped,
            amount as f64,
            format!("fire {task_id} remaining {remaining}"),
        ));
        if satisfied {
            Ok(UnitPhase::Complete)
        } else if self.agent == 0 {
            Ok(UnitPhase::Refilling)
        } else {
            Ok(UnitPhase::DroppingAgent)
        }
    }

    fn refill(&mut self) -> UnitPhase {
        let base = self.base;
        self.fly_to(base, "to base".to_string());
        self.agent = self.capacity;
        tracing::info!(unit = self.id, agent = self.agent, "refilled");
        self.sink.record(EventRecord::new(
            self.entity(),
            EventCode::UnitRefilled,
            self.agent as f64,
            "",
        ));
        match &self.task {
            Some(task) if !task.is_satisfied() => UnitPhase::EnRoute,
            _ => UnitPhase::Idle,
        }
    }

    fn complete(&mut self) -> Result<UnitPhase, DispatchError> {
        let Some(task) = self.task.take() else {
            return Ok(UnitPhase::Idle);
        };
        self.dispatcher
            .report_complete(self.id, task.id, &self.address)?;
        let timeout = self.dispatcher.reply_timeout();
        loop {
            match self.mailbox.recv_timeout(timeout)? {
                Some(UnitReply::CompletionAck { task_id }) if task_id == task.id => break,
                Some(UnitReply::CompletionAck { task_id }) => {
                    tracing::debug!(unit = self.id, fire = task_id, "ack for another fire");
                }
                Some(UnitReply::Assigned(next)) => {
                    tracing::warn!(unit = self.id, fire = next.id, "assignment before completion ack");
                    self.task = Some(next);
                }
                None => return Err(TransportError::Timeout(timeout).into()),
            }
        }
        tracing::info!(unit = self.id, fire = task.id, "fire out; acknowledged");
        // The dispatcher marks us idle when it handles the completion.
        self.announced = true;
        Ok(UnitPhase::Idle)
    }

    /// Hand the current fire back untouched and go to `Faulted`.
    fn abandon(&mut self) -> Result<UnitPhase, DispatchError> {
        if let Some(task) = self.task.take() {
            self.dispatcher.report_fault(self.id, task)?;
        }
        Ok(UnitPhase::Faulted)
    }

    fn fly_to(&mut self, target: Point, detail: String) {
        let distance = self.position.distance_to(target);
        if distance <= 0.0 {
            return;
        }
        let travel = self.config.travel_time(distance);
        if travel > Duration::ZERO {
            thread::sleep(travel);
        }
        self.position = target;
        self.sink.record(EventRecord::new(
            self.entity(),
            EventCode::UnitTravel,
            distance,
            detail,
        ));
    }
}

/// Control side of a spawned unit.
pub struct UnitHandle {
    id: UnitId,
    control: Address<UnitControl>,
    thread: thread::JoinHandle<Result<(), DispatchError>>,
}

impl UnitHandle {
    pub fn id(&self) -> UnitId {
        self.id
    }

    /// Return a faulted unit to service. Ignored by healthy units.
    pub fn clear_fault(&self) -> Result<(), TransportError> {
        self.control.send(UnitControl::ClearFault)
    }

    pub fn shutdown(&self) -> Result<(), TransportError> {
        self.control.send(UnitControl::Shutdown)
    }

    /// Wait for the unit thread; `Err` if it panicked.
    pub fn join(self) -> thread::Result<Result<(), DispatchError>> {
        self.thread.join()
    }
}
