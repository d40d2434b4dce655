//! Phase Timeline
//!
//! Tracks job start/end times within a phase for execution reports and
//! Gantt charts.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Job started executing
    Started,
    /// Job exited with status 0
    Completed,
    /// Job failed or exited non-zero
    Failed,
}

/// A single event in the timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    pub job: String,
    pub event_type: EventType,
    pub timestamp: Instant,
}

/// One job's run, relative to the start of the timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSpan {
    pub job: String,
    pub start_ms: u128,
    pub end_ms: u128,
    pub failed: bool,
}

impl JobSpan {
    pub fn duration_ms(&self) -> u128 {
        self.end_ms.saturating_sub(self.start_ms)
    }
}

/// Start/finish events of the jobs of one phase.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    /// Creates a timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    /// Records an event happening now.
    pub fn add_event(&mut self, job: String, event_type: EventType) {
        self.add_event_at(job, event_type, Instant::now());
    }

    /// Records an event observed elsewhere, at its own timestamp.
    pub fn add_event_at(&mut self, job: String, event_type: EventType, timestamp: Instant) {
        self.events.push(TimelineEvent {
            job,
            event_type,
            timestamp,
        });
    }

    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Time since the timeline was created.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Completed runs, ordered by start time.
    pub fn spans(&self) -> Vec<JobSpan> {
        let mut starts: HashMap<&str, u128> = HashMap::new();
        let mut spans = Vec::new();

        for event in &self.events {
            let offset = self.offset_ms(event.timestamp);
            match event.event_type {
                EventType::Started => {
                    starts.insert(event.job.as_str(), offset);
                }
                EventType::Completed | EventType::Failed => {
                    if let Some(start) = starts.remove(event.job.as_str()) {
                        spans.push(JobSpan {
                            job: event.job.clone(),
                            start_ms: start,
                            end_ms: offset,
                            failed: event.event_type == EventType::Failed,
                        });
                    }
                }
            }
        }

        spans.sort_by_key(|span| span.start_ms);
        spans
    }

    /// Job durations in milliseconds.
    pub fn get_durations(&self) -> HashMap<String, u128> {
        self.spans()
            .into_iter()
            .map(|span| {
                let duration = span.duration_ms();
                (span.job, duration)
            })
            .collect()
    }

    /// Labels of failed jobs, in completion order.
    pub fn failed_jobs(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter(|event| event.event_type == EventType::Failed)
            .map(|event| event.job.as_str())
            .collect()
    }

    /// Generates an ASCII Gantt chart, one bar per job.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nPhase Timeline:\n\n");

        let total_time = self.elapsed().as_millis();
        if total_time == 0 {
            return output;
        }

        // Scale to 50 characters width
        let scale = 50.0 / total_time as f64;

        for span in self.spans() {
            let start_pos = (span.start_ms as f64 * scale) as usize;
            let width = (span.duration_ms() as f64 * scale).max(1.0) as usize;

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&(if span.failed { "x" } else { "#" }).repeat(width));

            output.push_str(&format!(
                "{:16} |{}| ({} ms)\n",
                truncate(&span.job, 16),
                bar,
                span.duration_ms()
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }

    fn offset_ms(&self, timestamp: Instant) -> u128 {
        timestamp.saturating_duration_since(self.start_time).as_millis()
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or truncates a label to `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_timeline_creation() {
        let timeline = ExecutionTimeline::new();
        assert!(timeline.get_events().is_empty());
        assert!(timeline.spans().is_empty());
    }

    #[test]
    fn test_get_durations() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("load".to_string(), EventType::Started);
        thread::sleep(Duration::from_millis(50));
        timeline.add_event("load".to_string(), EventType::Completed);

        let durations = timeline.get_durations();
        assert!(*durations.get("load").unwrap() >= 50);
    }

    #[test]
    fn test_add_event_at_uses_given_time() {
        let mut timeline = ExecutionTimeline::new();
        let start = Instant::now();
        let end = start + Duration::from_millis(120);
        timeline.add_event_at("job".to_string(), EventType::Started, start);
        timeline.add_event_at("job".to_string(), EventType::Failed, end);

        let spans = timeline.spans();
        assert_eq!(spans.len(), 1);
        assert!(spans[0].failed);
        assert!(spans[0].duration_ms() >= 119);
        assert_eq!(timeline.failed_jobs(), vec!["job"]);
    }

    #[test]
    fn test_spans_sorted_by_start() {
        let mut timeline = ExecutionTimeline::new();
        let base = Instant::now();
        timeline.add_event_at("late".to_string(), EventType::Started, base + Duration::from_millis(30));
        timeline.add_event_at("early".to_string(), EventType::Started, base);
        timeline.add_event_at("late".to_string(), EventType::Completed, base + Duration::from_millis(40));
        timeline.add_event_at("early".to_string(), EventType::Completed, base + Duration::from_millis(50));

        let labels: Vec<_> = timeline.spans().into_iter().map(|s| s.job).collect();
        assert_eq!(labels, vec!["early", "late"]);
    }

    #[test]
    fn test_only_started_has_no_span() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("job".to_string(), EventType::Started);
        assert!(timeline.get_durations().is_empty());
    }

    #[test]
    fn test_gantt_chart_generation() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("import".to_string(), EventType::Started);
        thread::sleep(Duration::from_millis(20));
        timeline.add_event("import".to_string(), EventType::Completed);
        timeline.add_event("export".to_string(), EventType::Started);
        thread::sleep(Duration::from_millis(20));
        timeline.add_event("export".to_string(), EventType::Failed);

        let chart = timeline.gantt_chart();
        assert!(chart.contains("import"));
        assert!(chart.contains("export"));
        assert!(chart.contains('x'));
        assert!(chart.contains("Total:"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 8), "short   ");
        assert_eq!(truncate("a-very-long-job-label", 8), "a-ver...");
    }

    #[test]
    fn test_span_serializes() {
        let span = JobSpan {
            job: "j".to_string(),
            start_ms: 1,
            end_ms: 5,
            failed: false,
        };
        let json = serde_json::to_string(&span).unwrap();
        assert!(json.contains("\"start_ms\":1"));
    }
}
