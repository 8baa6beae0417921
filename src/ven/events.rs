//! Event lifecycle state machine.
//!
//! Inbound `oadrDistributeEvent` content flows through
//! [`EventEngine::create_or_update`]; time-driven transitions happen in
//! [`EventEngine::process`], called once per tick. All state lives in the
//! store; the engine itself only carries policy and the randomization RNG.

use chrono::{DateTime, TimeDelta, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::OadrError;
use crate::payload::{EiEventData, OadrEvent};
use crate::store::{Event, EventStatus, OptType, ResponseRequired, StoreError, VenStore};

/// An event whose state just changed in a way the VTN must hear about
/// via `oadrCreatedEvent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventAck {
    pub event_id: String,
}

/// Applies event semantics on top of a [`VenStore`].
pub struct EventEngine {
    opt_default_decision: OptType,
    opt_timeout_secs: u64,
    rng: StdRng,
}

impl EventEngine {
    pub fn new(opt_default_decision: OptType, opt_timeout_secs: u64, seed: u64) -> Self {
        Self {
            opt_default_decision,
            opt_timeout_secs,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Ingests one `oadrEvent`, creating or updating the local record.
    ///
    /// Modification numbers order payloads per event: a stale number is
    /// rejected with code 450, an equal number is redelivery and leaves
    /// the record untouched, a greater number applies the new content.
    pub fn create_or_update<S: VenStore>(
        &mut self,
        store: &mut S,
        oadr_event: &OadrEvent,
        request_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Event, OadrError> {
        let data = &oadr_event.event;
        match store.event(&data.event_id) {
            None => self.create(store, data, oadr_event.response_required, request_id, now),
            Some(existing) => {
                if data.modification_number < existing.modification_number {
                    return Err(OadrError::out_of_sequence(format!(
                        "event {}: modification number {} is older than stored {}",
                        data.event_id, data.modification_number, existing.modification_number
                    )));
                }
                if data.modification_number == existing.modification_number {
                    tracing::debug!(event_id = %data.event_id, "redelivered event, no change");
                    return Ok(existing);
                }
                self.update(store, existing, data, oadr_event.response_required, request_id)
            }
        }
    }

    fn create<S: VenStore>(
        &mut self,
        store: &mut S,
        data: &EiEventData,
        response_required: ResponseRequired,
        request_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Event, OadrError> {
        let start_offset = self.draw_start_offset(data.start_after);
        let (start_time, end_time) = event_times(data.official_start, data.duration, start_offset);
        let mut event = Event {
            event_id: data.event_id.clone(),
            request_id: request_id.map(str::to_string),
            status: data.status,
            opt_type: OptType::None,
            response_required,
            priority: data.priority,
            modification_number: data.modification_number,
            official_start: data.official_start,
            duration: data.duration,
            start_after: data.start_after,
            start_offset,
            start_time,
            end_time,
            created: now,
            signals: data.signals.clone(),
            test_event: data.test_event,
        };
        if event.status == EventStatus::Cancelled {
            // Arrived already cancelled; record it for the history.
            cancel(&mut event, response_required);
        }
        tracing::info!(event_id = %event.event_id, start = %event.start_time, "new event");
        store.insert_event(event.clone())?;
        Ok(event)
    }

    fn update<S: VenStore>(
        &mut self,
        store: &mut S,
        mut event: Event,
        data: &EiEventData,
        response_required: ResponseRequired,
        request_id: Option<&str>,
    ) -> Result<Event, OadrError> {
        let was_cancelled = event.status == EventStatus::Cancelled;
        let timing_changed = event.official_start != data.official_start
            || event.duration != data.duration
            || event.start_after != data.start_after;

        event.modification_number = data.modification_number;
        event.request_id = request_id.map(str::to_string);
        event.response_required = response_required;
        event.priority = data.priority;
        event.signals = data.signals.clone();
        event.test_event = data.test_event;

        if timing_changed {
            // A new randomization window invalidates the drawn offset.
            if event.start_after != data.start_after {
                event.start_offset = self.draw_start_offset(data.start_after);
            }
            event.official_start = data.official_start;
            event.duration = data.duration;
            event.start_after = data.start_after;
            let (start_time, end_time) =
                event_times(event.official_start, event.duration, event.start_offset);
            event.start_time = start_time;
            event.end_time = end_time;
        }

        if data.status == EventStatus::Cancelled && !was_cancelled {
            cancel(&mut event, response_required);
        } else if was_cancelled && data.status != EventStatus::Cancelled {
            // The VTN revived a cancelled event; adopt its declared state.
            tracing::info!(event_id = %event.event_id, status = ?data.status, "event uncancelled");
            event.status = data.status;
        }

        store.update_event(&event)?;
        Ok(event)
    }

    /// Cancels every non-terminal event absent from `known_event_ids`.
    ///
    /// An `oadrDistributeEvent` carries the VTN's full picture, so an
    /// event it omits no longer exists there. No acknowledgment is owed
    /// for these.
    pub fn implied_cancel<S: VenStore>(
        &mut self,
        store: &mut S,
        known_event_ids: &[String],
    ) -> Result<Vec<String>, OadrError> {
        let orphans = store.events_where(&|e: &Event| {
            e.is_active_or_pending() && !known_event_ids.contains(&e.event_id)
        });
        let mut cancelled = Vec::new();
        for mut event in orphans {
            tracing::info!(event_id = %event.event_id, "event dropped by VTN, cancelling");
            cancel(&mut event, ResponseRequired::Never);
            store.update_event(&event)?;
            cancelled.push(event.event_id);
        }
        Ok(cancelled)
    }

    /// Runs the time-driven transitions for every non-terminal event.
    ///
    /// Order per event: complete it when its end has passed, otherwise
    /// force the default opt decision once the decision window has
    /// elapsed, then activate it when its randomized start has arrived.
    /// Returns the events whose opt decision was just forced.
    pub fn process<S: VenStore>(
        &mut self,
        store: &mut S,
        now: DateTime<Utc>,
    ) -> Result<Vec<EventAck>, OadrError> {
        let mut acks = Vec::new();
        for mut event in self.active_or_pending(store) {
            if event.end_time.is_some_and(|end| now > end) {
                tracing::info!(event_id = %event.event_id, "event complete");
                event.status = EventStatus::Completed;
                store.update_event(&event)?;
                continue;
            }

            if event.opt_type == OptType::None && self.decision_window_elapsed(&event, now) {
                tracing::info!(
                    event_id = %event.event_id,
                    decision = ?self.opt_default_decision,
                    "forcing default opt decision"
                );
                event.opt_type = self.opt_default_decision;
                store.update_event(&event)?;
                // Broadcast events (`oadrResponseRequired = never`) must
                // not be acknowledged.
                if event.response_required == ResponseRequired::Always {
                    acks.push(EventAck {
                        event_id: event.event_id.clone(),
                    });
                }
            }

            if event.status != EventStatus::Active
                && event.opt_type == OptType::OptIn
                && now >= event.start_time
            {
                tracing::info!(event_id = %event.event_id, "event active");
                event.status = EventStatus::Active;
                store.update_event(&event)?;
            }
        }
        Ok(acks)
    }

    fn decision_window_elapsed(&self, event: &Event, now: DateTime<Utc>) -> bool {
        self.opt_timeout_secs == 0
            || now >= event.created + TimeDelta::seconds(self.opt_timeout_secs as i64)
    }

    /// Non-terminal events, most pressing first: active opted-in events,
    /// then near, far, and unresponded ones; ties break on start time.
    pub fn active_or_pending<S: VenStore>(&self, store: &S) -> Vec<Event> {
        let mut events = store.events_where(&Event::is_active_or_pending);
        events.sort_by(|a, b| urgency(a).cmp(&urgency(b)).then(a.start_time.cmp(&b.start_time)));
        events
    }

    /// Sets an event's status directly, e.g. from a host-side decision.
    pub fn set_status<S: VenStore>(
        &self,
        store: &mut S,
        event_id: &str,
        status: EventStatus,
    ) -> Result<(), OadrError> {
        let mut event = store.event(event_id).ok_or_else(|| StoreError::NotFound {
            kind: "event",
            id: event_id.to_string(),
        })?;
        if status == EventStatus::Active && event.opt_type != OptType::OptIn {
            return Err(OadrError::InvalidStatus(format!(
                "event {event_id} cannot go active without an optIn decision"
            )));
        }
        event.status = status;
        store.update_event(&event)?;
        Ok(())
    }
}

/// Cancellation transition. An acknowledged cancel also opts in, which
/// tells the VTN the VEN accepts the cancellation.
fn cancel(event: &mut Event, response_required: ResponseRequired) {
    event.status = EventStatus::Cancelled;
    if response_required != ResponseRequired::Never {
        event.opt_type = OptType::OptIn;
    }
}

/// Effective start and end. The end is absent exactly when the declared
/// duration is zero: such an event runs until cancelled.
fn event_times(
    official_start: DateTime<Utc>,
    duration: TimeDelta,
    start_offset: TimeDelta,
) -> (DateTime<Utc>, Option<DateTime<Utc>>) {
    let start_time = official_start + start_offset;
    let end_time = (duration > TimeDelta::zero()).then(|| start_time + duration);
    (start_time, end_time)
}

fn urgency(event: &Event) -> u8 {
    match event.status {
        EventStatus::Active if event.opt_type != OptType::OptOut => 0,
        EventStatus::Near => 1,
        EventStatus::Far => 2,
        EventStatus::Unresponded => 3,
        _ => 4,
    }
}

impl EventEngine {
    fn draw_start_offset(&mut self, start_after: TimeDelta) -> TimeDelta {
        if start_after <= TimeDelta::zero() {
            return TimeDelta::zero();
        }
        let fraction: f64 = self.rng.random_range(0.0..=1.0);
        let millis = (start_after.num_milliseconds() as f64 * fraction).round() as i64;
        TimeDelta::milliseconds(millis)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeDelta, Utc};

    use super::{EventEngine, cancel};
    use crate::error::{OadrError, ResponseCode};
    use crate::payload::{EiEventData, OadrEvent};
    use crate::store::{EventStatus, MemoryStore, OptType, ResponseRequired, VenStore};

    fn engine() -> EventEngine {
        EventEngine::new(OptType::OptIn, 30 * 60, 42)
    }

    fn base_time() -> DateTime<Utc> {
        "2024-06-01T12:00:00Z".parse().expect("timestamp should parse")
    }

    fn oadr_event(event_id: &str, modification_number: u32) -> OadrEvent {
        OadrEvent {
            event: EiEventData {
                event_id: event_id.to_string(),
                modification_number,
                priority: 1,
                status: EventStatus::Far,
                official_start: base_time() + TimeDelta::hours(1),
                duration: TimeDelta::minutes(30),
                start_after: TimeDelta::zero(),
                signals: serde_json::json!([{ "signalName": "simple", "value": 1.0 }]),
                test_event: false,
                targets: Vec::new(),
            },
            response_required: ResponseRequired::Always,
        }
    }

    #[test]
    fn new_event_adopts_the_declared_status_with_no_decision() {
        let mut engine = engine();
        let mut store = MemoryStore::new();

        let event = engine
            .create_or_update(&mut store, &oadr_event("evt-1", 0), Some("req-1"), base_time())
            .expect("create should succeed");

        assert_eq!(event.status, EventStatus::Far);
        assert_eq!(event.opt_type, OptType::None);
        assert_eq!(event.request_id.as_deref(), Some("req-1"));
        assert_eq!(event.start_time, event.official_start);
        assert_eq!(event.end_time, Some(event.start_time + TimeDelta::minutes(30)));
    }

    #[test]
    fn start_offset_stays_within_the_randomization_window() {
        let mut engine = engine();
        let mut store = MemoryStore::new();
        let mut oadr = oadr_event("evt-1", 0);
        oadr.event.start_after = TimeDelta::minutes(10);

        let event = engine
            .create_or_update(&mut store, &oadr, None, base_time())
            .expect("create should succeed");

        assert!(event.start_offset >= TimeDelta::zero());
        assert!(event.start_offset <= TimeDelta::minutes(10));
        assert_eq!(event.start_time, event.official_start + event.start_offset);
    }

    #[test]
    fn zero_duration_means_no_end_time() {
        let mut engine = engine();
        let mut store = MemoryStore::new();
        let mut oadr = oadr_event("evt-1", 0);
        oadr.event.duration = TimeDelta::zero();

        let event = engine
            .create_or_update(&mut store, &oadr, None, base_time())
            .expect("create should succeed");
        assert!(event.end_time.is_none());
    }

    #[test]
    fn stale_modification_number_is_out_of_sequence() {
        let mut engine = engine();
        let mut store = MemoryStore::new();
        engine
            .create_or_update(&mut store, &oadr_event("evt-1", 3), None, base_time())
            .expect("create should succeed");

        let err = engine
            .create_or_update(&mut store, &oadr_event("evt-1", 2), None, base_time())
            .expect_err("stale update must fail");
        let (code, _) = err.vtn_response().expect("interface error");
        assert_eq!(code, ResponseCode::OUT_OF_SEQUENCE);
    }

    #[test]
    fn redelivery_with_equal_modification_number_changes_nothing() {
        let mut engine = engine();
        let mut store = MemoryStore::new();
        engine
            .create_or_update(&mut store, &oadr_event("evt-1", 1), None, base_time())
            .expect("create should succeed");
        engine
            .set_status(&mut store, "evt-1", EventStatus::Near)
            .expect("set_status should succeed");

        let event = engine
            .create_or_update(&mut store, &oadr_event("evt-1", 1), None, base_time())
            .expect("redelivery should succeed");
        assert_eq!(event.status, EventStatus::Near);
    }

    #[test]
    fn update_without_timing_change_keeps_the_schedule() {
        let mut engine = engine();
        let mut store = MemoryStore::new();
        let mut oadr = oadr_event("evt-1", 0);
        oadr.event.start_after = TimeDelta::minutes(10);
        let created = engine
            .create_or_update(&mut store, &oadr, None, base_time())
            .expect("create should succeed");

        oadr.event.modification_number = 1;
        oadr.event.priority = 7;
        let updated = engine
            .create_or_update(&mut store, &oadr, None, base_time())
            .expect("update should succeed");

        assert_eq!(updated.priority, 7);
        assert_eq!(updated.start_offset, created.start_offset);
        assert_eq!(updated.start_time, created.start_time);
    }

    #[test]
    fn changed_randomization_window_redraws_the_offset() {
        let mut engine = engine();
        let mut store = MemoryStore::new();
        let mut oadr = oadr_event("evt-1", 0);
        oadr.event.start_after = TimeDelta::minutes(10);
        engine
            .create_or_update(&mut store, &oadr, None, base_time())
            .expect("create should succeed");

        oadr.event.modification_number = 1;
        oadr.event.start_after = TimeDelta::minutes(1);
        let updated = engine
            .create_or_update(&mut store, &oadr, None, base_time())
            .expect("update should succeed");

        assert!(updated.start_offset <= TimeDelta::minutes(1));
        assert_eq!(updated.start_time, updated.official_start + updated.start_offset);
    }

    #[test]
    fn cancel_with_required_response_opts_in() {
        let mut engine = engine();
        let mut store = MemoryStore::new();
        engine
            .create_or_update(&mut store, &oadr_event("evt-1", 0), None, base_time())
            .expect("create should succeed");

        let mut oadr = oadr_event("evt-1", 1);
        oadr.event.status = EventStatus::Cancelled;
        let event = engine
            .create_or_update(&mut store, &oadr, None, base_time())
            .expect("cancel should succeed");

        assert_eq!(event.status, EventStatus::Cancelled);
        assert_eq!(event.opt_type, OptType::OptIn);
    }

    #[test]
    fn uncancel_adopts_the_declared_status() {
        let mut engine = engine();
        let mut store = MemoryStore::new();
        engine
            .create_or_update(&mut store, &oadr_event("evt-1", 0), None, base_time())
            .expect("create should succeed");

        let mut oadr = oadr_event("evt-1", 1);
        oadr.event.status = EventStatus::Cancelled;
        engine
            .create_or_update(&mut store, &oadr, None, base_time())
            .expect("cancel should succeed");

        let mut oadr = oadr_event("evt-1", 2);
        oadr.event.status = EventStatus::Near;
        let event = engine
            .create_or_update(&mut store, &oadr, None, base_time())
            .expect("uncancel should succeed");
        assert_eq!(event.status, EventStatus::Near);
    }

    #[test]
    fn silent_cancel_leaves_the_opt_decision_alone() {
        let mut event = {
            let mut engine = engine();
            let mut store = MemoryStore::new();
            engine
                .create_or_update(&mut store, &oadr_event("evt-1", 0), None, base_time())
                .expect("create should succeed")
        };

        cancel(&mut event, ResponseRequired::Never);
        assert_eq!(event.status, EventStatus::Cancelled);
        assert_eq!(event.opt_type, OptType::None);
    }

    #[test]
    fn implied_cancel_drops_only_unlisted_live_events() {
        let mut engine = engine();
        let mut store = MemoryStore::new();
        for id in ["evt-1", "evt-2", "evt-3"] {
            engine
                .create_or_update(&mut store, &oadr_event(id, 0), None, base_time())
                .expect("create should succeed");
        }
        engine
            .set_status(&mut store, "evt-3", EventStatus::Completed)
            .expect("set_status should succeed");

        let cancelled = engine
            .implied_cancel(&mut store, &["evt-1".to_string()])
            .expect("implied cancel should succeed");

        assert_eq!(cancelled, vec!["evt-2".to_string()]);
        let evt2 = store.event("evt-2").expect("event should exist");
        assert_eq!(evt2.status, EventStatus::Cancelled);
        assert_eq!(evt2.opt_type, OptType::None);
        let evt3 = store.event("evt-3").expect("event should exist");
        assert_eq!(evt3.status, EventStatus::Completed);
    }

    #[test]
    fn decision_is_forced_after_the_opt_timeout() {
        let mut engine = EventEngine::new(OptType::OptOut, 60, 42);
        let mut store = MemoryStore::new();
        engine
            .create_or_update(&mut store, &oadr_event("evt-1", 0), None, base_time())
            .expect("create should succeed");

        let acks = engine
            .process(&mut store, base_time() + TimeDelta::seconds(30))
            .expect("process should succeed");
        assert!(acks.is_empty());

        let acks = engine
            .process(&mut store, base_time() + TimeDelta::seconds(60))
            .expect("process should succeed");
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].event_id, "evt-1");
        let event = store.event("evt-1").expect("event should exist");
        assert_eq!(event.opt_type, OptType::OptOut);
    }

    #[test]
    fn forced_decision_for_a_broadcast_event_is_not_acknowledged() {
        let mut engine = EventEngine::new(OptType::OptIn, 0, 42);
        let mut store = MemoryStore::new();
        let mut oadr = oadr_event("evt-1", 0);
        oadr.response_required = ResponseRequired::Never;
        engine
            .create_or_update(&mut store, &oadr, None, base_time())
            .expect("create should succeed");

        let acks = engine.process(&mut store, base_time()).expect("process should succeed");
        assert!(acks.is_empty());
        let event = store.event("evt-1").expect("event should exist");
        assert_eq!(event.opt_type, OptType::OptIn);
    }

    #[test]
    fn zero_timeout_forces_the_decision_immediately() {
        let mut engine = EventEngine::new(OptType::OptIn, 0, 42);
        let mut store = MemoryStore::new();
        engine
            .create_or_update(&mut store, &oadr_event("evt-1", 0), None, base_time())
            .expect("create should succeed");

        let acks = engine.process(&mut store, base_time()).expect("process should succeed");
        assert_eq!(acks.len(), 1);
    }

    #[test]
    fn opted_in_event_activates_at_its_start_time() {
        let mut engine = EventEngine::new(OptType::OptIn, 0, 42);
        let mut store = MemoryStore::new();
        engine
            .create_or_update(&mut store, &oadr_event("evt-1", 0), None, base_time())
            .expect("create should succeed");

        // Forces optIn but the start is still an hour away.
        engine.process(&mut store, base_time()).expect("process should succeed");
        assert_ne!(
            store.event("evt-1").expect("event should exist").status,
            EventStatus::Active
        );

        engine
            .process(&mut store, base_time() + TimeDelta::hours(1))
            .expect("process should succeed");
        assert_eq!(
            store.event("evt-1").expect("event should exist").status,
            EventStatus::Active
        );
    }

    #[test]
    fn event_completes_only_after_its_end_passes() {
        let mut engine = EventEngine::new(OptType::OptIn, 0, 42);
        let mut store = MemoryStore::new();
        engine
            .create_or_update(&mut store, &oadr_event("evt-1", 0), None, base_time())
            .expect("create should succeed");

        // At the end instant the event is still running.
        let end = base_time() + TimeDelta::minutes(90);
        engine.process(&mut store, end).expect("process should succeed");
        assert_eq!(
            store.event("evt-1").expect("event should exist").status,
            EventStatus::Active
        );

        engine
            .process(&mut store, end + TimeDelta::seconds(1))
            .expect("process should succeed");
        assert_eq!(
            store.event("evt-1").expect("event should exist").status,
            EventStatus::Completed
        );
    }

    #[test]
    fn activation_requires_an_opt_in_decision() {
        let mut engine = engine();
        let mut store = MemoryStore::new();
        engine
            .create_or_update(&mut store, &oadr_event("evt-1", 0), None, base_time())
            .expect("create should succeed");

        let err = engine
            .set_status(&mut store, "evt-1", EventStatus::Active)
            .expect_err("activation without optIn must fail");
        assert!(matches!(err, OadrError::InvalidStatus(_)));
    }

    #[test]
    fn active_or_pending_sorts_by_urgency() {
        let mut engine = engine();
        let mut store = MemoryStore::new();
        for (id, status, opt) in [
            ("evt-unresponded", EventStatus::Unresponded, OptType::None),
            ("evt-active", EventStatus::Active, OptType::OptIn),
            ("evt-far", EventStatus::Far, OptType::OptIn),
            ("evt-near", EventStatus::Near, OptType::OptIn),
        ] {
            engine
                .create_or_update(&mut store, &oadr_event(id, 0), None, base_time())
                .expect("create should succeed");
            let mut event = store.event(id).expect("event should exist");
            event.status = status;
            event.opt_type = opt;
            store.update_event(&event).expect("update should succeed");
        }

        let ordered: Vec<String> = engine
            .active_or_pending(&store)
            .into_iter()
            .map(|e| e.event_id)
            .collect();
        assert_eq!(
            ordered,
            vec!["evt-active", "evt-near", "evt-far", "evt-unresponded"]
        );
    }
}
