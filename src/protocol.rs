//! Messages exchanged with the dispatcher.

use std::fmt;

use crate::transport::Address;
use crate::types::{FireEvent, TaskId, UnitId};

/// Everything the dispatcher can receive.
pub enum Message {
    /// A unit is ready for work; assignments go to `address`.
    Idle {
        unit: UnitId,
        address: Address<UnitReply>,
    },
    /// A unit put a fire out.
    Complete {
        unit: UnitId,
        task_id: TaskId,
        address: Address<UnitReply>,
    },
    /// A unit failed mid-service and hands the fire back.
    Fault { unit: UnitId, task: FireEvent },
    /// The incident source reports a new fire.
    NewTask {
        task: FireEvent,
        reply: Address<IncidentReply>,
    },
    /// The incident source asks whether a fire is out yet.
    ConfirmQuery {
        task_id: TaskId,
        reply: Address<IncidentReply>,
    },
    /// Something the transport could not make sense of.
    Unrecognized { detail: String },
}

impl Message {
    /// Stable label for logs.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Idle { .. } => MessageKind::UnitIdle,
            Message::Complete { .. } => MessageKind::UnitComplete,
            Message::Fault { .. } => MessageKind::UnitFault,
            Message::NewTask { .. } => MessageKind::NewTask,
            Message::ConfirmQuery { .. } => MessageKind::CompletionQuery,
            Message::Unrecognized { .. } => MessageKind::Unrecognized,
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Idle { unit, .. } => write!(f, "Idle(unit={unit})"),
            Message::Complete { unit, task_id, .. } => {
                write!(f, "Complete(unit={unit}, fire={task_id})")
            }
            Message::Fault { unit, task } => write!(f, "Fault(unit={unit}, fire={})", task.id),
            Message::NewTask { task, .. } => write!(f, "NewTask({task})"),
            Message::ConfirmQuery { task_id, .. } => write!(f, "ConfirmQuery(fire={task_id})"),
            Message::Unrecognized { detail } => write!(f, "Unrecognized({detail:?})"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    UnitIdle,
    UnitComplete,
    UnitFault,
    NewTask,
    CompletionQuery,
    Unrecognized,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::UnitIdle => "unit_idle",
            MessageKind::UnitComplete => "unit_complete",
            MessageKind::UnitFault => "unit_fault",
            MessageKind::NewTask => "new_task",
            MessageKind::CompletionQuery => "completion_query",
            MessageKind::Unrecognized => "unrecognized",
        }
    }
}

/// Sent by the dispatcher to a unit's mailbox.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitReply {
    Assigned(FireEvent),
    CompletionAck { task_id: TaskId },
}

/// Proof that a fire was put out, handed back to the incident source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionRecord {
    pub task_id: TaskId,
    pub unit_id: UnitId,
}

/// Sent by the dispatcher to the incident source.
#[derive(Debug, Clone, PartialEq)]
pub enum IncidentReply {
    /// The fire is queued; not yet serviced.
    Accepted { task_id: TaskId },
    /// The fire names a zone the dispatcher does not know.
    Rejected { task_id: TaskId, reason: String },
    Extinguished(CompletionRecord),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::channel;
    use crate::types::Severity;

    #[test]
    fn every_variant_has_a_kind() {
        let (unit_address, _unit_mailbox) = channel::<UnitReply>();
        let (reply, _inbox) = channel::<IncidentReply>();
        let fire = FireEvent::new(4, "t", 1, "FIRE_DETECTED", Severity::Low);
        let messages = [
            Message::Idle {
                unit: 1,
                address: unit_address.clone(),
            },
            Message::Complete {
                unit: 1,
                task_id: 4,
                address: unit_address,
            },
            Message::Fault {
                unit: 1,
                task: fire.clone(),
            },
            Message::NewTask {
                task: fire,
                reply: reply.clone(),
            },
            Message::ConfirmQuery { task_id: 4, reply },
            Message::Unrecognized {
                detail: "garbage".to_string(),
            },
        ];
        let kinds: Vec<&str> = messages.iter().map(|m| m.kind().as_str()).collect();
        assert_eq!(
            kinds,
            vec![
                "unit_idle",
                "unit_complete",
                "unit_fault",
                "new_task",
                "completion_query",
                "unrecognized"
            ]
        );
    }

    #[test]
    fn debug_output_names_the_fire() {
        let fire = FireEvent::new(12, "t", 3, "FIRE_DETECTED", Severity::High);
        let message = Message::Fault { unit: 2, task: fire };
        assert_eq!(format!("{message:?}"), "Fault(unit=2, fire=12)");
    }
}
