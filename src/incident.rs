//! Incident ingestion.
//!
//! Records are CSV lines `time,zone_id,event_type,severity[,fault]`. An
//! optional header row is skipped, and fires are numbered from 1 in file
//! order.

use std::path::Path;
use std::sync::Arc;
use std::thread;

use crate::dispatcher::DispatcherClient;
use crate::error::{DispatchError, IncidentError};
use crate::events::{EventCode, EventRecord, EventSink};
use crate::protocol::CompletionRecord;
use crate::types::{FireEvent, Severity, TaskId};

const ENTITY: &str = "incidents";

fn parse_fault(label: &str) -> bool {
    !matches!(
        label.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "false" | "no" | "none"
    )
}

fn parse_line(line_no: usize, line: &str, id: TaskId) -> Result<FireEvent, IncidentError> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if !(4..=5).contains(&fields.len()) {
        return Err(IncidentError::Parse {
            line: line_no,
            reason: format!("expected 4 or 5 fields, found {}", fields.len()),
        });
    }
    let zone_id = fields[1].parse().map_err(|_| IncidentError::Parse {
        line: line_no,
        reason: format!("invalid zone id {:?}", fields[1]),
    })?;
    let fault = fields.get(4).is_some_and(|label| parse_fault(label));
    Ok(FireEvent::new(id, fields[0], zone_id, fields[2], Severity::parse(fields[3])).with_fault(fault))
}

/// Parse incident records; blank lines are ignored.
pub fn parse_incidents(content: &str) -> Result<Vec<FireEvent>, IncidentError> {
    let mut fires = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let line_no = index + 1;
        if line.trim().is_empty() {
            continue;
        }
        let is_header = line_no == 1
            && line
                .split(',')
                .nth(1)
                .is_some_and(|field| field.trim().parse::<u64>().is_err());
        if is_header {
            continue;
        }
        let id = fires.len() as TaskId + 1;
        fires.push(parse_line(line_no, line, id)?);
    }
    Ok(fires)
}

pub fn load_incidents(path: &Path) -> Result<Vec<FireEvent>, IncidentError> {
    let content = std::fs::read_to_string(path).map_err(|source| IncidentError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_incidents(&content)
}

/// How one reported fire ended.
#[derive(Debug)]
pub struct IncidentOutcome {
    pub task_id: TaskId,
    pub result: Result<CompletionRecord, DispatchError>,
}

/// Reports fires to the dispatcher and waits for each to be put out.
pub struct IncidentSource {
    client: DispatcherClient,
    sink: Arc<dyn EventSink>,
}

impl IncidentSource {
    pub fn new(client: DispatcherClient, sink: Arc<dyn EventSink>) -> Self {
        Self { client, sink }
    }

    /// Submit `fire`, then wait for its completion on a thread named
    /// `incident-{id}`. Submission happens on the caller's thread so the
    /// dispatcher sees fires in report order.
    pub fn report(
        &self,
        fire: FireEvent,
    ) -> Result<thread::JoinHandle<Result<CompletionRecord, DispatchError>>, DispatchError> {
        let detail = format!("zone {} severity {}", fire.zone_id, fire.severity);
        let demand = fire.remaining_demand();
        let task_id = self.client.submit(fire)?;
        tracing::info!(fire = task_id, %detail, "fire reported");
        self.sink.record(EventRecord::new(
            ENTITY,
            EventCode::FireReported,
            demand as f64,
            format!("fire {task_id} {detail}"),
        ));

        let client = self.client.clone();
        thread::Builder::new()
            .name(format!("incident-{task_id}"))
            .spawn(move || {
                let record = client.completion_for(task_id)?;
                tracing::info!(fire = task_id, unit = record.unit_id, "fire confirmed out");
                Ok(record)
            })
            .map_err(|err| {
                tracing::error!(fire = task_id, error = %err, "could not spawn incident thread");
                DispatchError::UnexpectedReply(format!("spawn failed: {err}"))
            })
    }

    /// Report every fire in order, then wait for all of them.
    pub fn run_all(&self, fires: Vec<FireEvent>) -> Vec<IncidentOutcome> {
        let mut waiting = Vec::with_capacity(fires.len());
        let mut outcomes = Vec::new();
        for fire in fires {
            let task_id = fire.id;
            match self.report(fire) {
                Ok(handle) => waiting.push((task_id, handle)),
                Err(err) => {
                    tracing::warn!(fire = task_id, error = %err, "fire not accepted");
                    outcomes.push(IncidentOutcome {
                        task_id,
                        result: Err(err),
                    });
                }
            }
        }
        for (task_id, handle) in waiting {
            let result = match handle.join() {
                Ok(result) => result,
                Err(_) => Err(DispatchError::UnexpectedReply(
                    "incident thread panicked".to_string(),
                )),
            };
            if let Err(err) = &result {
                tracing::warn!(fire = task_id, error = %err, "incident ended without confirmation");
            }
            outcomes.push(IncidentOutcome { task_id, result });
        }
        outcomes.sort_by_key(|outcome| outcome.task_id);
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemorySink;
    use crate::protocol::{IncidentReply, Message};
    use crate::transport::{self, Mailbox};
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn parses_records_and_skips_header() {
        let content = "Time,Zone ID,Event type,Severity\n\
                       14:03:15,3,FIRE_DETECTED,High\n\
                       \n\
                       14:10:00,7,DRONE_REQUEST,moderate,true\n";
        let fires = parse_incidents(content).expect("parse");
        assert_eq!(fires.len(), 2);
        assert_eq!(fires[0].id, 1);
        assert_eq!(fires[0].time, "14:03:15");
        assert_eq!(fires[0].zone_id, 3);
        assert_eq!(fires[0].severity, Severity::High);
        assert!(!fires[0].has_fault());
        assert_eq!(fires[1].id, 2);
        assert_eq!(fires[1].event_type, "DRONE_REQUEST");
        assert_eq!(fires[1].remaining_demand(), 20);
        assert!(fires[1].has_fault());
    }

    #[test]
    fn unknown_severity_has_no_demand() {
        let fires = parse_incidents("t,1,FIRE_DETECTED,Extreme").expect("parse");
        assert_eq!(fires[0].severity, Severity::Unknown);
        assert!(fires[0].is_satisfied());
    }

    #[test]
    fn fault_column_accepts_common_spellings() {
        assert!(parse_fault("TRUE"));
        assert!(parse_fault("NOZZLE_JAM"));
        assert!(!parse_fault("false"));
        assert!(!parse_fault(" 0 "));
        assert!(!parse_fault("none"));
    }

    #[test]
    fn bad_zone_names_the_line() {
        let err = parse_incidents("t,1,FIRE,Low\nt,x,FIRE,Low\n").unwrap_err();
        assert_eq!(err.to_string(), "line 2: invalid zone id \"x\"");
        let err = parse_incidents("t,1,FIRE").unwrap_err();
        assert!(matches!(err, IncidentError::Parse { line: 1, .. }));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "t,1,FIRE_DETECTED,Low").expect("write");
        writeln!(file, "t,2,FIRE_DETECTED,High,1").expect("write");
        let fires = load_incidents(file.path()).expect("load");
        assert_eq!(fires.iter().map(|f| f.zone_id).collect::<Vec<_>>(), vec![1, 2]);

        let err = load_incidents(Path::new("/nonexistent/incidents.csv")).unwrap_err();
        assert!(matches!(err, IncidentError::Io { .. }));
    }

    /// Accepts every fire and answers each confirmation immediately.
    fn fake_dispatcher(inbox: Mailbox<Message>) -> thread::JoinHandle<Vec<TaskId>> {
        thread::spawn(move || {
            let mut submitted = Vec::new();
            while let Ok(message) = inbox.recv() {
                match message {
                    Message::NewTask { task, reply } => {
                        submitted.push(task.id);
                        let _ = reply.send(IncidentReply::Accepted { task_id: task.id });
                    }
                    Message::ConfirmQuery { task_id, reply } => {
                        let _ = reply.send(IncidentReply::Extinguished(CompletionRecord {
                            task_id,
                            unit_id: 9,
                        }));
                    }
                    _ => {}
                }
            }
            submitted
        })
    }

    #[test]
    fn source_reports_in_order_and_collects_outcomes() {
        let (address, inbox) = transport::channel();
        let server = fake_dispatcher(inbox);
        let sink = Arc::new(MemorySink::new());
        let source = IncidentSource::new(
            DispatcherClient::new(address, Duration::from_secs(1)),
            sink.clone(),
        );
        let fires = parse_incidents("t,1,F,Low\nt,1,F,High\nt,2,F,Moderate\n").expect("parse");
        let outcomes = source.run_all(fires);
        drop(source);
        assert_eq!(server.join().expect("server"), vec![1, 2, 3]);

        assert_eq!(outcomes.len(), 3);
        for (outcome, id) in outcomes.iter().zip(1..) {
            assert_eq!(outcome.task_id, id);
            let record = outcome.result.as_ref().expect("confirmed");
            assert_eq!(record.unit_id, 9);
        }
        assert_eq!(sink.count(EventCode::FireReported), 3);
        assert_eq!(sink.total(EventCode::FireReported), 60.0);
    }

    #[test]
    fn unreachable_dispatcher_yields_failed_outcomes() {
        let (address, inbox) = transport::channel::<Message>();
        drop(inbox);
        let source = IncidentSource::new(
            DispatcherClient::new(address, Duration::from_millis(100)),
            Arc::new(MemorySink::new()),
        );
        let fires = parse_incidents("t,1,F,Low").expect("parse");
        let outcomes = source.run_all(fires);
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(
            outcomes[0].result,
            Err(DispatchError::Transport(_))
        ));
    }
}
