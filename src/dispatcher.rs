//! Central coordinator: queues reported fires, pairs them with idle units
//! and relays completion and fault outcomes.
//!
//! Threads owned by a running dispatcher:
//! - `dispatcher`: receives messages, admits new fires and hands everything
//!   else to a worker pool.
//! - `dispatcher-matcher`: waits for an idle unit, then for the most urgent
//!   fire, and sends the assignment.
//! - `dispatch-N`: unit message handlers. Each unit's messages land on one
//!   lane and are handled in the order they were sent.
//! - `confirm-N`: completion queries, which wait until the fire is out.
//!
//! Nothing but the matcher and the query workers ever waits on a full or
//! empty queue. A fire or completion record that finds its queue full is
//! parked and retried by the receive loop on its next turn.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::bounded_buffer::BoundedBuffer;
use crate::config::SimConfig;
use crate::error::DispatchError;
use crate::events::{EventCode, EventRecord, EventSink};
use crate::protocol::{CompletionRecord, IncidentReply, Message, UnitReply};
use crate::registry::{UnitRegistry, UnitState, UnitSummary};
use crate::task_queue::TaskQueue;
use crate::transport::{self, Address, Mailbox};
use crate::types::{FireEvent, TaskId, UnitId};
use crate::worker_pool::{Job, WorkerPool};
use crate::zones::ZoneTable;

const ENTITY: &str = "dispatcher";

struct Shared {
    pending: TaskQueue,
    completions: BoundedBuffer<CompletionRecord>,
    /// Fires handed back by faulted or unreachable units while `pending`
    /// was full. They go back in ahead of newly reported fires.
    returned: Mutex<VecDeque<FireEvent>>,
    /// Completion records that found `completions` full.
    unfiled: Mutex<VecDeque<CompletionRecord>>,
    registry: UnitRegistry,
    zones: Arc<ZoneTable>,
    sink: Arc<dyn EventSink>,
    poll: Duration,
}

/// A reported fire waiting for room in the pending queue. The reporter
/// gets its acknowledgment once the fire is queued.
struct Admission {
    task: FireEvent,
    reply: Address<IncidentReply>,
}

/// A running dispatcher. Dropping it without [`Dispatcher::shutdown`]
/// leaves its threads running until the process exits.
pub struct Dispatcher {
    shared: Arc<Shared>,
    address: Address<Message>,
    stop: Arc<AtomicBool>,
    reply_timeout: Duration,
    receiver: thread::JoinHandle<Vec<FireEvent>>,
    matcher: thread::JoinHandle<()>,
}

impl Dispatcher {
    /// Spawn the receive loop, the matcher and both worker pools.
    pub fn start(
        config: &SimConfig,
        zones: Arc<ZoneTable>,
        sink: Arc<dyn EventSink>,
    ) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            pending: TaskQueue::new(config.buffer_capacity),
            completions: BoundedBuffer::new(config.buffer_capacity),
            returned: Mutex::new(VecDeque::new()),
            unfiled: Mutex::new(VecDeque::new()),
            registry: UnitRegistry::new(),
            zones,
            sink,
            poll: config.poll_interval(),
        });
        let (address, mailbox) = transport::channel();
        let stop = Arc::new(AtomicBool::new(false));

        let handlers = WorkerPool::keyed("dispatch", config.handler_workers, config.buffer_capacity)?;
        let queries = WorkerPool::new("confirm", config.query_workers, config.buffer_capacity)?;

        let receiver = {
            let shared = Arc::clone(&shared);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("dispatcher".to_string())
                .spawn(move || receive_loop(shared, mailbox, stop, handlers, queries))?
        };
        let matcher = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("dispatcher-matcher".to_string())
                .spawn(move || matcher_loop(shared))?
        };

        tracing::info!(
            capacity = config.buffer_capacity,
            handler_workers = config.handler_workers,
            query_workers = config.query_workers,
            "dispatcher started"
        );
        Ok(Self {
            shared,
            address,
            stop,
            reply_timeout: config.reply_timeout(),
            receiver,
            matcher,
        })
    }

    /// Handle for units and incident sources.
    pub fn client(&self) -> DispatcherClient {
        DispatcherClient {
            address: self.address.clone(),
            reply_timeout: self.reply_timeout,
        }
    }

    pub fn zones(&self) -> Arc<ZoneTable> {
        Arc::clone(&self.shared.zones)
    }

    pub fn registry_snapshot(&self) -> Vec<UnitSummary> {
        self.shared.registry.snapshot()
    }

    /// Pending fire ids in dispatch order.
    pub fn pending_order(&self) -> Vec<TaskId> {
        self.shared.pending.dispatch_order()
    }

    pub fn pending_len(&self) -> usize {
        self.shared.pending.len()
    }

    /// Completion records not yet claimed by a query.
    pub fn unclaimed_completions(&self) -> usize {
        self.shared.completions.len() + self.shared.lock_unfiled().len()
    }

    /// Close every queue, stop receiving and join all dispatcher threads.
    /// Returns fires that were still waiting for a unit.
    pub fn shutdown(self) -> Vec<FireEvent> {
        self.stop.store(true, Ordering::SeqCst);
        self.shared.registry.close();
        self.shared.completions.close();
        self.shared.pending.close();
        let mut leftover = match self.receiver.join() {
            Ok(held) => held,
            Err(_) => {
                tracing::error!("dispatcher receive thread panicked");
                Vec::new()
            }
        };
        if self.matcher.join().is_err() {
            tracing::error!("dispatcher matcher thread panicked");
        }
        leftover.extend(std::iter::from_fn(|| self.shared.pending.try_pop()));
        leftover.extend(self.shared.lock_returned().drain(..));
        let unclaimed =
            self.shared.completions.drain().len() + self.shared.lock_unfiled().drain(..).count();
        if unclaimed > 0 {
            tracing::debug!(unclaimed, "discarding unclaimed completion records");
        }
        tracing::info!(leftover = leftover.len(), "dispatcher stopped");
        leftover
    }
}

/// Returns the fires still waiting for admission when the loop stops.
fn receive_loop(
    shared: Arc<Shared>,
    mailbox: Mailbox<Message>,
    stop: Arc<AtomicBool>,
    handlers: WorkerPool,
    queries: WorkerPool,
) -> Vec<FireEvent> {
    // Reported fires the pending queue had no room for, oldest first.
    let mut admissions: VecDeque<Admission> = VecDeque::new();
    // Queries the confirm pool had no room for.
    let mut deferred: VecDeque<Job> = VecDeque::new();
    while !stop.load(Ordering::SeqCst) {
        shared.file_completions();
        shared.requeue_returned();
        shared.admit(&mut admissions);
        while let Some(job) = deferred.pop_front() {
            if let Err(job) = queries.try_execute(job) {
                deferred.push_front(job);
                break;
            }
        }
        let message = match mailbox.recv_timeout(shared.poll) {
            Ok(Some(message)) => message,
            Ok(None) => continue,
            Err(_) => break,
        };
        tracing::debug!(kind = message.kind().as_str(), ?message, "received");
        let handler = Arc::clone(&shared);
        match message {
            Message::Idle { unit, address } => {
                handlers.execute_keyed(unit, move || handler.on_idle(unit, address));
            }
            Message::Complete {
                unit,
                task_id,
                address,
            } => {
                handlers.execute_keyed(unit, move || handler.on_complete(unit, task_id, address));
            }
            Message::Fault { unit, task } => {
                handlers.execute_keyed(unit, move || handler.on_fault(unit, task));
            }
            Message::NewTask { task, reply } => {
                if let Some(admission) = shared.on_new_task(task, reply) {
                    admissions.push_back(admission);
                    shared.admit(&mut admissions);
                    if !admissions.is_empty() {
                        tracing::debug!(held = admissions.len(), "pending queue full; holding fire");
                    }
                }
            }
            Message::ConfirmQuery { task_id, reply } => {
                let job: Job = Box::new(move || handler.on_confirm_query(task_id, reply));
                if !deferred.is_empty() {
                    deferred.push_back(job);
                } else if let Err(job) = queries.try_execute(job) {
                    tracing::debug!(backlog = deferred.len() + 1, "confirm pool full; deferring query");
                    deferred.push_back(job);
                }
            }
            Message::Unrecognized { detail } => {
                handlers.execute(move || handler.on_unrecognized(detail));
            }
        }
    }
    if !deferred.is_empty() {
        tracing::debug!(dropped = deferred.len(), "dropping deferred queries");
    }
    // Dropping the jobs and admissions drops their reply addresses, which
    // releases whoever is waiting on them.
    drop(deferred);
    handlers.shutdown();
    queries.shutdown();
    admissions.into_iter().map(|admission| admission.task).collect()
}

fn matcher_loop(shared: Arc<Shared>) {
    loop {
        let Some(reservation) = shared.registry.acquire_idle() else {
            break;
        };
        let Some(task) = shared.pending.pop_blocking_or_closed() else {
            shared.registry.release(reservation.unit_id);
            break;
        };
        let unit = reservation.unit_id;
        shared.registry.set_current_task(unit, Some(task.id));
        tracing::info!(unit, fire = task.id, severity = %task.severity, "assigning fire");
        shared.sink.record(EventRecord::new(
            ENTITY,
            EventCode::FireAssigned,
            task.id as f64,
            format!("unit {unit}"),
        ));
        let retry = task.clone();
        if reservation.address.send(UnitReply::Assigned(task)).is_err() {
            tracing::warn!(unit, fire = retry.id, "unit unreachable; requeueing fire");
            shared.registry.set_state(unit, UnitState::Faulted);
            shared.return_fire(retry);
        }
    }
    tracing::debug!("matcher stopped");
}

impl Shared {
    fn lock_returned(&self) -> MutexGuard<'_, VecDeque<FireEvent>> {
        self.returned.lock().expect("returned fires mutex poisoned")
    }

    fn lock_unfiled(&self) -> MutexGuard<'_, VecDeque<CompletionRecord>> {
        self.unfiled.lock().expect("unfiled records mutex poisoned")
    }

    /// Put a fire back in the pending queue, or park it if there is no room.
    fn return_fire(&self, task: FireEvent) {
        self.lock_returned().push_back(task);
        self.requeue_returned();
    }

    fn requeue_returned(&self) {
        loop {
            let Some(task) = self.lock_returned().pop_front() else {
                break;
            };
            if let Err(task) = self.pending.try_push(task) {
                self.lock_returned().push_front(task);
                break;
            }
        }
    }

    fn file_completion(&self, record: CompletionRecord) {
        self.lock_unfiled().push_back(record);
        self.file_completions();
    }

    fn file_completions(&self) {
        loop {
            let Some(record) = self.lock_unfiled().pop_front() else {
                break;
            };
            if let Err(record) = self.completions.try_push(record) {
                self.lock_unfiled().push_front(record);
                break;
            }
        }
    }

    fn take_unfiled(&self, task_id: TaskId) -> Option<CompletionRecord> {
        let mut unfiled = self.lock_unfiled();
        let index = unfiled.iter().position(|record| record.task_id == task_id)?;
        unfiled.remove(index)
    }

    /// Queue held fires in arrival order until the pending queue is full.
    fn admit(&self, admissions: &mut VecDeque<Admission>) {
        while let Some(Admission { task, reply }) = admissions.pop_front() {
            let (task_id, severity) = (task.id, task.severity);
            if let Err(task) = self.pending.try_push(task) {
                admissions.push_front(Admission { task, reply });
                break;
            }
            self.sink.record(EventRecord::new(
                ENTITY,
                EventCode::FireQueued,
                severity.demand() as f64,
                format!("fire {task_id} severity {severity}"),
            ));
            tracing::info!(fire = task_id, %severity, "fire queued");
            if reply.send(IncidentReply::Accepted { task_id }).is_err() {
                tracing::debug!(fire = task_id, "incident source left before ack");
            }
        }
    }

    fn on_idle(&self, unit: UnitId, address: Address<UnitReply>) {
        if self.registry.mark_idle(unit, address) {
            tracing::info!(unit, "registered unit");
        } else {
            tracing::debug!(unit, "unit idle");
        }
    }

    fn on_complete(&self, unit: UnitId, task_id: TaskId, address: Address<UnitReply>) {
        self.registry
            .ensure_registered(unit, &address, UnitState::Complete);
        self.registry.set_state(unit, UnitState::Complete);
        self.sink.record(EventRecord::new(
            format!("fire-{task_id}"),
            EventCode::FireExtinguished,
            task_id as f64,
            format!("unit {unit}"),
        ));
        self.file_completion(CompletionRecord {
            task_id,
            unit_id: unit,
        });
        // Ack before releasing the unit so the ack reaches its mailbox ahead
        // of any new assignment.
        if address
            .send(UnitReply::CompletionAck { task_id })
            .is_err()
        {
            tracing::warn!(unit, fire = task_id, "unit gone before completion ack");
        }
        self.registry.set_state(unit, UnitState::Idle);
        tracing::info!(unit, fire = task_id, "fire extinguished");
    }

    fn on_fault(&self, unit: UnitId, mut task: FireEvent) {
        if !self.registry.set_state(unit, UnitState::Faulted) {
            tracing::warn!(unit, "fault from unregistered unit");
        }
        self.sink.record(EventRecord::new(
            format!("drone-{unit}"),
            EventCode::UnitFaulted,
            task.id as f64,
            task.to_string(),
        ));
        task.clear_fault();
        let task_id = task.id;
        self.sink.record(EventRecord::new(
            ENTITY,
            EventCode::FireRequeued,
            task_id as f64,
            format!("from unit {unit}"),
        ));
        self.return_fire(task);
        tracing::warn!(unit, fire = task_id, "unit faulted; fire requeued");
        if self.registry.healthy_count() == 0 {
            tracing::warn!(
                fire = task_id,
                "no healthy units left; fire waits until a unit is cleared"
            );
        }
    }

    /// Reject fires in unknown zones; everything else waits for admission.
    fn on_new_task(&self, task: FireEvent, reply: Address<IncidentReply>) -> Option<Admission> {
        if self.zones.lookup(task.zone_id).is_some() {
            return Some(Admission { task, reply });
        }
        let (task_id, zone) = (task.id, task.zone_id);
        tracing::warn!(fire = task_id, zone, "rejecting fire in unknown zone");
        let rejected = IncidentReply::Rejected {
            task_id,
            reason: format!("unknown zone {zone}"),
        };
        if reply.send(rejected).is_err() {
            tracing::debug!(fire = task_id, "incident source left before rejection");
        }
        None
    }

    /// Wait until the record for `task_id` shows up. Parked records are
    /// checked on every turn so a full completion buffer cannot hide one.
    fn on_confirm_query(&self, task_id: TaskId, reply: Address<IncidentReply>) {
        let record = loop {
            if let Some(record) = self.take_unfiled(task_id) {
                break record;
            }
            if let Some(record) = self
                .completions
                .remove_matching_timeout(|record| record.task_id == task_id, self.poll)
            {
                break record;
            }
            if self.completions.is_closed() {
                tracing::debug!(fire = task_id, "completion query cancelled");
                return;
            }
        };
        if reply.send(IncidentReply::Extinguished(record)).is_err() {
            tracing::debug!(fire = task_id, "incident source left before confirmation");
        }
    }

    fn on_unrecognized(&self, detail: String) {
        tracing::warn!(%detail, "dropping unrecognized message");
        self.sink.record(EventRecord::new(
            ENTITY,
            EventCode::MessageDropped,
            0.0,
            detail,
        ));
    }
}

/// Cloneable handle used to talk to a running dispatcher.
#[derive(Clone, Debug)]
pub struct DispatcherClient {
    address: Address<Message>,
    reply_timeout: Duration,
}

impl DispatcherClient {
    /// Wrap a raw dispatcher address; `reply_timeout` bounds acknowledgments.
    pub fn new(address: Address<Message>, reply_timeout: Duration) -> Self {
        Self {
            address,
            reply_timeout,
        }
    }

    /// Report a fire and wait until the dispatcher has queued it. While
    /// the pending queue is full this keeps waiting.
    pub fn submit(&self, task: FireEvent) -> Result<TaskId, DispatchError> {
        let zone = task.zone_id;
        let reply = transport::request(&self.address, |reply| Message::NewTask { task, reply }, None)?;
        match reply {
            IncidentReply::Accepted { task_id } => Ok(task_id),
            IncidentReply::Rejected { .. } => Err(DispatchError::UnknownZone(zone)),
            other => Err(DispatchError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    /// Block until the fire `task_id` has been put out.
    pub fn completion_for(&self, task_id: TaskId) -> Result<CompletionRecord, DispatchError> {
        let reply = transport::request(
            &self.address,
            |reply| Message::ConfirmQuery { task_id, reply },
            None,
        )
        .map_err(|_| DispatchError::Closed)?;
        match reply {
            IncidentReply::Extinguished(record) => Ok(record),
            other => Err(DispatchError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    pub fn announce_idle(&self, unit: UnitId, address: &Address<UnitReply>) -> Result<(), DispatchError> {
        self.send(Message::Idle {
            unit,
            address: address.clone(),
        })
    }

    /// Report completion; the acknowledgment arrives on `address`.
    pub fn report_complete(
        &self,
        unit: UnitId,
        task_id: TaskId,
        address: &Address<UnitReply>,
    ) -> Result<(), DispatchError> {
        self.send(Message::Complete {
            unit,
            task_id,
            address: address.clone(),
        })
    }

    pub fn report_fault(&self, unit: UnitId, task: FireEvent) -> Result<(), DispatchError> {
        self.send(Message::Fault { unit, task })
    }

    pub fn send(&self, message: Message) -> Result<(), DispatchError> {
        Ok(self.address.send(message)?)
    }

    pub fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }
}
