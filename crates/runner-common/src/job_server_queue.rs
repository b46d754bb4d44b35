// JobServerQueue: fire-and-forget sink for timeline updates and live console
// lines. Delivery to the server is the implementation's concern.

use parking_lot::Mutex;

use crate::timeline::TimelineRecord;

pub trait JobServerQueue: Send + Sync {
    /// Queue the latest state of a timeline record.
    fn queue_timeline_record_update(&self, job_id: &str, record: &TimelineRecord);

    /// Queue one line of live console output for a step record.
    fn queue_web_console_line(&self, job_id: &str, line: &str, line_number: u64);
}

/// Writes console lines to stdout and timeline updates to the `tracing` log.
#[derive(Debug, Default)]
pub struct ConsoleJobServerQueue;

impl JobServerQueue for ConsoleJobServerQueue {
    fn queue_timeline_record_update(&self, job_id: &str, record: &TimelineRecord) {
        tracing::debug!(
            job_id,
            record = %record.name,
            state = ?record.state,
            result = ?record.result,
            errors = record.error_count,
            warnings = record.warning_count,
            "Timeline record update"
        );
    }

    fn queue_web_console_line(&self, _job_id: &str, line: &str, _line_number: u64) {
        println!("{line}");
    }
}

/// Keeps everything in memory. Used by tests.
#[derive(Debug, Default)]
pub struct MemoryJobServerQueue {
    records: Mutex<Vec<TimelineRecord>>,
    lines: Mutex<Vec<(u64, String)>>,
}

impl MemoryJobServerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// All queued record updates, oldest first.
    pub fn records(&self) -> Vec<TimelineRecord> {
        self.records.lock().clone()
    }

    /// The most recent update queued for the record named `name`.
    pub fn last_record(&self, name: &str) -> Option<TimelineRecord> {
        self.records.lock().iter().rev().find(|r| r.name == name).cloned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().iter().map(|(_, l)| l.clone()).collect()
    }
}

impl JobServerQueue for MemoryJobServerQueue {
    fn queue_timeline_record_update(&self, _job_id: &str, record: &TimelineRecord) {
        self.records.lock().push(record.clone());
    }

    fn queue_web_console_line(&self, _job_id: &str, line: &str, line_number: u64) {
        self.lines.lock().push((line_number, line.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn memory_queue_keeps_latest_record() {
        let queue = MemoryJobServerQueue::new();
        let mut record = TimelineRecord::new(Uuid::new_v4(), None, "step");
        queue.queue_timeline_record_update("job", &record);
        record.error_count = 2;
        queue.queue_timeline_record_update("job", &record);
        queue.queue_web_console_line("job", "hello", 1);

        assert_eq!(queue.records().len(), 2);
        assert_eq!(queue.last_record("step").unwrap().error_count, 2);
        assert_eq!(queue.lines(), vec!["hello".to_string()]);
    }
}
