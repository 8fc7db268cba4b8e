use std::collections::HashMap;

use schema::{
    AnswerTelemetry, AnswerUpdatePayload, HesitationPayload, NavigationPayload, TelemetryEvent,
    unix_timestamp_millis,
};
use serde_json::Value;

/// Caller-supplied telemetry fields for one tracked answer. `time_ms`
/// overrides the auto-timed delta; the rest pass through.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnswerOverrides {
    pub time_ms: Option<u64>,
    pub focus_lost_count: u32,
    pub confidence: Option<f32>,
}

#[derive(Debug, Default)]
struct QuestionTrack {
    last_value: Option<Value>,
    hesitations: u32,
}

/// Client-side event buffer. Purely synchronous, single-threaded, no network
/// I/O: events accumulate here until the sync scheduler acknowledges a batch.
/// Per-question tracking state survives acknowledgement so hesitation counts
/// and auto-timing stay correct across flushes.
#[derive(Debug, Default)]
pub struct TelemetryQueue {
    events: Vec<TelemetryEvent>,
    tracking: HashMap<String, QuestionTrack>,
    last_answer_at_ms: u64,
}

impl TelemetryQueue {
    pub fn new() -> Self {
        Self::new_at(unix_timestamp_millis())
    }

    pub fn new_at(now_ms: u64) -> Self {
        Self {
            events: Vec::new(),
            tracking: HashMap::new(),
            last_answer_at_ms: now_ms,
        }
    }

    /// Append a pre-built event. Events are never dropped until a successful
    /// sync acknowledges them.
    pub fn track_event(&mut self, event: TelemetryEvent) {
        self.events.push(event);
    }

    pub fn track_navigation(&mut self, question_id: &str) {
        self.track_navigation_at(unix_timestamp_millis(), question_id);
    }

    pub fn track_navigation_at(&mut self, now_ms: u64, question_id: &str) {
        self.track_event(TelemetryEvent::Navigation(NavigationPayload {
            question_id: question_id.to_string(),
            timestamp_ms: now_ms,
        }));
    }

    pub fn track_answer(&mut self, question_id: &str, value: Value, overrides: AnswerOverrides) {
        self.track_answer_at(unix_timestamp_millis(), question_id, value, overrides);
    }

    /// Track an answer for a question. Auto-times `time_ms` as the delta
    /// since the last tracked answer unless overridden, and synthesizes a
    /// HESITATION event ahead of the update when the value replaces a
    /// different, non-empty prior value.
    pub fn track_answer_at(
        &mut self,
        now_ms: u64,
        question_id: &str,
        value: Value,
        overrides: AnswerOverrides,
    ) {
        let (previous, mut hesitations) = {
            let track = self.tracking.entry(question_id.to_string()).or_default();
            (track.last_value.take(), track.hesitations)
        };

        if let Some(previous) = previous
            && previous != value
            && !is_empty_value(&previous)
        {
            self.events
                .push(TelemetryEvent::Hesitation(HesitationPayload {
                    question_id: question_id.to_string(),
                    from: previous,
                    to: value.clone(),
                    timestamp_ms: now_ms,
                }));
            hesitations += 1;
        }

        let time_ms = overrides
            .time_ms
            .unwrap_or_else(|| now_ms.saturating_sub(self.last_answer_at_ms));
        self.events
            .push(TelemetryEvent::AnswerUpdate(AnswerUpdatePayload {
                question_id: question_id.to_string(),
                value: value.clone(),
                telemetry: AnswerTelemetry {
                    time_ms,
                    hesitation_count: hesitations,
                    focus_lost_count: overrides.focus_lost_count,
                    confidence: overrides.confidence,
                },
                timestamp_ms: now_ms,
            }));

        let track = self.tracking.entry(question_id.to_string()).or_default();
        track.last_value = Some(value);
        track.hesitations = hesitations;
        self.last_answer_at_ms = now_ms;
    }

    // -- narrow buffer interface -------------------------------------------

    pub fn peek_all(&self) -> &[TelemetryEvent] {
        &self.events
    }

    /// Remove the first `count` events after the server durably accepted
    /// them. Events enqueued meanwhile stay for the next round.
    pub fn ack(&mut self, count: usize) {
        let count = count.min(self.events.len());
        self.events.drain(..count);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(raw) => raw.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn answers(queue: &TelemetryQueue) -> Vec<&AnswerUpdatePayload> {
        queue
            .peek_all()
            .iter()
            .filter_map(|event| match event {
                TelemetryEvent::AnswerUpdate(payload) => Some(payload),
                _ => None,
            })
            .collect()
    }

    fn hesitations(queue: &TelemetryQueue) -> Vec<&HesitationPayload> {
        queue
            .peek_all()
            .iter()
            .filter_map(|event| match event {
                TelemetryEvent::Hesitation(payload) => Some(payload),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn changing_an_answer_synthesizes_hesitations() {
        let mut queue = TelemetryQueue::new_at(0);
        queue.track_answer_at(10, "q1", json!("a"), AnswerOverrides::default());
        queue.track_answer_at(20, "q1", json!("b"), AnswerOverrides::default());
        queue.track_answer_at(30, "q1", json!("a"), AnswerOverrides::default());

        let hesitations = hesitations(&queue);
        assert_eq!(hesitations.len(), 2);
        assert_eq!(hesitations[0].from, json!("a"));
        assert_eq!(hesitations[0].to, json!("b"));
        assert_eq!(hesitations[1].from, json!("b"));
        assert_eq!(hesitations[1].to, json!("a"));

        let answers = answers(&queue);
        assert_eq!(answers[0].telemetry.hesitation_count, 0);
        assert_eq!(answers[1].telemetry.hesitation_count, 1);
        assert_eq!(answers[2].telemetry.hesitation_count, 2);
    }

    #[test]
    fn hesitation_precedes_the_answer_update_in_the_buffer() {
        let mut queue = TelemetryQueue::new_at(0);
        queue.track_answer_at(10, "q1", json!("a"), AnswerOverrides::default());
        queue.track_answer_at(20, "q1", json!("b"), AnswerOverrides::default());
        let events = queue.peek_all();
        assert!(matches!(events[1], TelemetryEvent::Hesitation(_)));
        assert!(matches!(events[2], TelemetryEvent::AnswerUpdate(_)));
    }

    #[test]
    fn retracking_the_same_value_is_not_a_hesitation() {
        let mut queue = TelemetryQueue::new_at(0);
        queue.track_answer_at(10, "q1", json!("a"), AnswerOverrides::default());
        queue.track_answer_at(20, "q1", json!("a"), AnswerOverrides::default());
        assert!(hesitations(&queue).is_empty());
    }

    #[test]
    fn replacing_an_empty_prior_value_is_not_a_hesitation() {
        let mut queue = TelemetryQueue::new_at(0);
        queue.track_answer_at(10, "q1", json!(""), AnswerOverrides::default());
        queue.track_answer_at(20, "q1", json!("a"), AnswerOverrides::default());
        assert!(hesitations(&queue).is_empty());
    }

    #[test]
    fn auto_timing_stamps_the_delta_since_the_last_answer() {
        let mut queue = TelemetryQueue::new_at(1_000);
        queue.track_answer_at(1_500, "q1", json!("a"), AnswerOverrides::default());
        queue.track_answer_at(4_000, "q2", json!("b"), AnswerOverrides::default());

        let answers = answers(&queue);
        assert_eq!(answers[0].telemetry.time_ms, 500);
        assert_eq!(answers[1].telemetry.time_ms, 2_500);
    }

    #[test]
    fn explicit_time_override_wins_over_auto_timing() {
        let mut queue = TelemetryQueue::new_at(1_000);
        queue.track_answer_at(
            9_000,
            "q1",
            json!("a"),
            AnswerOverrides {
                time_ms: Some(111),
                ..AnswerOverrides::default()
            },
        );
        assert_eq!(answers(&queue)[0].telemetry.time_ms, 111);
    }

    #[test]
    fn hesitation_count_survives_acknowledgement() {
        let mut queue = TelemetryQueue::new_at(0);
        queue.track_answer_at(10, "q1", json!("a"), AnswerOverrides::default());
        queue.ack(queue.len());
        queue.track_answer_at(20, "q1", json!("b"), AnswerOverrides::default());

        // The flush in between must not reset the per-question count.
        assert_eq!(hesitations(&queue).len(), 1);
        assert_eq!(answers(&queue)[0].telemetry.hesitation_count, 1);
    }

    #[test]
    fn ack_removes_exactly_the_acknowledged_prefix() {
        let mut queue = TelemetryQueue::new_at(0);
        queue.track_answer_at(10, "q1", json!("a"), AnswerOverrides::default());
        queue.track_answer_at(20, "q2", json!("b"), AnswerOverrides::default());
        queue.track_answer_at(30, "q3", json!("c"), AnswerOverrides::default());

        queue.ack(2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.peek_all()[0].question_id(), "q3");
    }
}
