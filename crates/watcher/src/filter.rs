#![forbid(unsafe_code)]

//! User filters: a last look at every enriched event before it is written.
//!
//! Filters see the persisted [`EventRecord`] and answer with a
//! [`FilterAction`]. The core never trusts them with liveness: every call runs
//! through a [`TimedFilter`], and a filter that errors, panics or misses its
//! deadline is treated as having answered `pass`.

use crate::domain::EventRecord;
use crate::error::Error;
use flume::{RecvTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// What to do with an event. On the wire:
/// `{"action":"pass"}`, `{"action":"drop"}`,
/// `{"action":"annotate","annotations":{..}}`, `{"action":"enrich","extra":{..}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum FilterAction {
    Pass,
    Drop,
    Annotate {
        #[serde(default)]
        annotations: Map<String, Value>,
    },
    Enrich {
        #[serde(default)]
        extra: Map<String, Value>,
    },
}

impl FilterAction {
    /// Parse one wire action. Anything unrecognized is a filter error.
    pub fn from_json(text: &str) -> Result<Self, Error> {
        serde_json::from_str(text)
            .map_err(|err| Error::Callback(format!("invalid filter action {text:?}: {err}")))
    }
}

pub trait EventFilter: Send + Sync {
    fn apply(&self, event: &EventRecord) -> Result<FilterAction, Error>;
}

impl<F> EventFilter for F
where
    F: Fn(&EventRecord) -> Result<FilterAction, Error> + Send + Sync,
{
    fn apply(&self, event: &EventRecord) -> Result<FilterAction, Error> {
        self(event)
    }
}

/// Lets everything through.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassFilter;

impl EventFilter for PassFilter {
    fn apply(&self, _event: &EventRecord) -> Result<FilterAction, Error> {
        Ok(FilterAction::Pass)
    }
}

/// Logs a one-line summary of each event and lets it through.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingFilter;

impl EventFilter for LoggingFilter {
    fn apply(&self, event: &EventRecord) -> Result<FilterAction, Error> {
        info!(
            event = %event.event_id,
            variable = %event.variable_name,
            function = %event.function,
            deltas = event.deltas.len(),
            "mutation"
        );
        Ok(FilterAction::Pass)
    }
}

/// Keeps events for which the predicate holds and drops the rest.
pub struct PredicateFilter<F> {
    predicate: F,
}

impl<F> PredicateFilter<F>
where
    F: Fn(&EventRecord) -> bool + Send + Sync,
{
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> EventFilter for PredicateFilter<F>
where
    F: Fn(&EventRecord) -> bool + Send + Sync,
{
    fn apply(&self, event: &EventRecord) -> Result<FilterAction, Error> {
        Ok(if (self.predicate)(event) {
            FilterAction::Pass
        } else {
            FilterAction::Drop
        })
    }
}

type Reply = Sender<Result<FilterAction, Error>>;

/// Runs a filter on its own thread and waits at most `timeout` per event.
///
/// A call that overruns keeps running in the background; its late answer is
/// discarded. At most one request waits behind the running call; while that
/// slot is taken, further events time out without being handed over.
#[derive(Debug)]
pub struct TimedFilter {
    requests: Sender<(EventRecord, Reply)>,
    timeout: Duration,
}

impl TimedFilter {
    pub fn spawn(
        filter: Arc<dyn EventFilter>,
        timeout: Duration,
        name: String,
    ) -> std::io::Result<Self> {
        let (requests, incoming) = flume::bounded::<(EventRecord, Reply)>(1);
        std::thread::Builder::new().name(name).spawn(move || {
            for (record, reply) in incoming.iter() {
                let result = catch_unwind(AssertUnwindSafe(|| filter.apply(&record)))
                    .unwrap_or_else(|_| Err(Error::Callback("filter panicked".into())));
                let _ = reply.send(result);
            }
        })?;
        Ok(Self { requests, timeout })
    }

    pub fn apply(&self, record: EventRecord) -> Result<FilterAction, Error> {
        let (reply, answer) = flume::bounded(1);
        match self.requests.try_send((record, reply)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("filter still busy, passing event");
                return Err(Error::CallbackTimeout(self.timeout));
            }
            Err(TrySendError::Disconnected(_)) => {
                return Err(Error::Callback("filter thread is gone".into()));
            }
        }
        match answer.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!(timeout = ?self.timeout, "filter timed out, passing event");
                Err(Error::CallbackTimeout(self.timeout))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::Callback("filter thread is gone".into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EnrichedEvent, EventId, RegionId, Symbol};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn record(deltas: usize) -> EventRecord {
        EnrichedEvent {
            id: EventId(3),
            timestamp_ns: 1,
            symbol: Symbol::unknown(),
            thread_id: None,
            deltas: (0..deltas)
                .map(|offset| crate::domain::ByteDelta {
                    offset,
                    before: 0,
                    after: 1,
                })
                .collect(),
            region_id: RegionId::from("var-1"),
            region_name: "x".into(),
            sql_context: None,
            scope: None,
            annotations: Map::new(),
        }
        .record()
    }

    #[test]
    fn wire_format() {
        assert_eq!(
            FilterAction::from_json(r#"{"action":"pass"}"#).unwrap(),
            FilterAction::Pass
        );
        assert_eq!(
            FilterAction::from_json(r#"{"action":"annotate","annotations":{"k":1}}"#).unwrap(),
            FilterAction::Annotate {
                annotations: Map::from_iter([("k".into(), json!(1))])
            }
        );
        assert_eq!(
            serde_json::to_value(FilterAction::Enrich {
                extra: Map::from_iter([("team".into(), json!("db"))])
            })
            .unwrap(),
            json!({"action": "enrich", "extra": {"team": "db"}})
        );
        assert!(matches!(
            FilterAction::from_json(r#"{"action":"explode"}"#),
            Err(Error::Callback(_))
        ));
    }

    #[test]
    fn predicate_filter_drops_rejected_events() {
        let filter = PredicateFilter::new(|r: &EventRecord| r.deltas.len() <= 5);
        assert_eq!(filter.apply(&record(3)).unwrap(), FilterAction::Pass);
        assert_eq!(filter.apply(&record(8)).unwrap(), FilterAction::Drop);
    }

    #[test]
    fn logging_filter_passes_everything() {
        assert_eq!(LoggingFilter.apply(&record(2)).unwrap(), FilterAction::Pass);
        assert_eq!(PassFilter.apply(&record(9)).unwrap(), FilterAction::Pass);
    }

    #[test]
    fn timed_filter_returns_answer_in_time() {
        let timed =
            TimedFilter::spawn(Arc::new(PassFilter), Duration::from_secs(1), "f".into()).unwrap();
        assert_eq!(timed.apply(record(1)).unwrap(), FilterAction::Pass);
    }

    #[test]
    fn timed_filter_gives_up_on_slow_filters() {
        let slow = |_: &EventRecord| -> Result<FilterAction, Error> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(FilterAction::Drop)
        };
        let timed =
            TimedFilter::spawn(Arc::new(slow), Duration::from_millis(20), "slow".into()).unwrap();
        assert!(matches!(
            timed.apply(record(1)),
            Err(Error::CallbackTimeout(_))
        ));
    }

    #[test]
    fn hung_filter_does_not_accumulate_requests() {
        let (gate_tx, gate_rx) = flume::bounded::<()>(0);
        let hung = move |_: &EventRecord| -> Result<FilterAction, Error> {
            let _ = gate_rx.recv();
            Ok(FilterAction::Pass)
        };
        let timed =
            TimedFilter::spawn(Arc::new(hung), Duration::from_millis(1), "hung".into()).unwrap();
        for _ in 0..500 {
            assert!(matches!(
                timed.apply(record(1)),
                Err(Error::CallbackTimeout(_))
            ));
        }
        assert!(timed.requests.len() <= 1);

        drop(gate_tx);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !timed.requests.is_empty() {
            assert!(std::time::Instant::now() < deadline, "filter never recovered");
            std::thread::sleep(Duration::from_millis(1));
        }
        let timed = TimedFilter {
            timeout: Duration::from_secs(1),
            ..timed
        };
        assert_eq!(timed.apply(record(1)).unwrap(), FilterAction::Pass);
    }

    #[test]
    fn panicking_filter_is_an_error_not_a_crash() {
        let bad = |_: &EventRecord| -> Result<FilterAction, Error> { panic!("boom") };
        let timed =
            TimedFilter::spawn(Arc::new(bad), Duration::from_secs(1), "bad".into()).unwrap();
        assert!(matches!(timed.apply(record(1)), Err(Error::Callback(_))));
        // The filter thread survives the panic.
        assert!(matches!(timed.apply(record(1)), Err(Error::Callback(_))));
    }
}
