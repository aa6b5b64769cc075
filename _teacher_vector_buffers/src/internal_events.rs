use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::LazyLock;
use std::time::Duration;

use crate::cast_utils::{i64_to_f64_safe, u64_to_f64_safe};
use metrics::{counter, gauge, histogram, Histogram};
use vector_common::{
    internal_event::{error_type, InternalEvent},
    registered_event,
};

static BUFFER_COUNTERS: LazyLock<DashMap<(String, usize), (AtomicI64, AtomicI64)>> =
    LazyLock::new(DashMap::new);

fn update_and_get(counter: &AtomicI64, delta: i64) -> i64 {
    let mut new_val = 0;
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
            let updated = current.saturating_add(delta).clamp(0, i64::MAX);
            new_val = updated;
            Some(updated)
        })
        .ok();
    new_val
}

fn update_buffer_gauge(buffer_id: &str, stage: usize, events_delta: i64, bytes_delta: i64) {
    let counters = BUFFER_COUNTERS
        .entry((buffer_id.to_string(), stage))
        .or_insert_with(|| (AtomicI64::new(0), AtomicI64::new(0)));

    let new_events = update_and_get(&counters.0, events_delta);
    let new_bytes = update_and_get(&counters.1, bytes_delta);

    gauge!("buffer_events",
        "buffer_id" => buffer_id.to_string(),
        "stage" => stage.to_string()
    )
    .set(i64_to_f64_safe(new_events));

    gauge!("buffer_byte_size",
        "buffer_id" => buffer_id.to_string(),
        "stage" => stage.to_string()
    )
    .set(i64_to_f64_safe(new_bytes));
}

pub struct BufferCreated {
    pub idx: usize,
    pub max_size_events: usize,
    pub max_size_bytes: u64,
}

impl InternalEvent for BufferCreated {
    fn emit(self) {
        if self.max_size_events != 0 {
            gauge!("buffer_max_event_size", "stage" => self.idx.to_string())
                .set(u64_to_f64_safe(self.max_size_events as u64));
        }
        if self.max_size_bytes != 0 {
            gauge!("buffer_max_byte_size", "stage" => self.idx.to_string())
                .set(u64_to_f64_safe(self.max_size_bytes));
        }
    }
}

pub struct BufferEventsReceived {
    pub buffer_id: String,
    pub idx: usize,
    pub count: u64,
    pub byte_size: u64,
}

impl InternalEvent for BufferEventsReceived {
    fn emit(self) {
        counter!("buffer_received_events_total",
            "buffer_id" => self.buffer_id.clone(),
            "stage" => self.idx.to_string()
        )
        .increment(self.count);

        counter!("buffer_received_bytes_total",
            "buffer_id" => self.buffer_id.clone(),
            "stage" => self.idx.to_string()
        )
        .increment(self.byte_size);

        let count_delta = i64::try_from(self.count).unwrap_or(i64::MAX);
        let bytes_delta = i64::try_from(self.byte_size).unwrap_or(i64::MAX);
        update_buffer_gauge(&self.buffer_id, self.idx, count_delta, bytes_delta);
    }
}

pub struct BufferEventsSent {
    pub buffer_id: String,
    pub idx: usize,
    pub count: u64,
    pub byte_size: u64,
}

impl InternalEvent for BufferEventsSent {
    fn emit(self) {
        counter!("buffer_sent_events_total",
            "buffer_id" => self.buffer_id.clone(),
            "stage" => self.idx.to_string()
        )
        .increment(self.count);

        counter!("buffer_sent_bytes_total",
            "buffer_id" => self.buffer_id.clone(),
            "stage" => self.idx.to_string())
        .increment(self.byte_size);

        let count_delta = i64::try_from(self.count).unwrap_or(i64::MAX);
        let bytes_delta = i64::try_from(self.byte_size).unwrap_or(i64::MAX);
        update_buffer_gauge(&self.buffer_id, self.idx, -count_delta, -bytes_delta);
    }
}

pub struct BufferEventsDropped {
    pub buffer_id: String,
    pub idx: usize,
    pub count: u64,
    pub byte_size: u64,
    pub intentional: bool,
    pub reason: &'static str,
}

impl InternalEvent for BufferEventsDropped {
    fn emit(self) {
        let intentional_str = if self.intentional { "true" } else { "false" };
        if self.intentional {
            debug!(
                message = "Events dropped.",
                count = %self.count,
                intentional = %intentional_str,
                reason = %self.reason,
                buffer_id = %self.buffer_id,
                stage = %self.idx,
            );
        } else {
            error!(
                message = "Events dropped.",
                count = %self.count,
                intentional = %intentional_str,
                reason = %self.reason,
                buffer_id = %self.buffer_id,
                stage = %self.idx,
            );
        }

        counter!(
            "buffer_discarded_events_total",
            "buffer_id" => self.buffer_id.clone(),
            "intentional" => intentional_str,
        )
        .increment(self.count);

        let count_delta = i64::try_from(self.count).unwrap_or(i64::MAX);
        let bytes_delta = i64::try_from(self.byte_size).unwrap_or(i64::MAX);

        update_buffer_gauge(&self.buffer_id, self.idx, -count_delta, -bytes_delta);
    }
}

pub struct BufferReadError {
    pub error_code: &'static str,
    pub error: String,
}

impl InternalEvent for BufferReadError {
    fn emit(self) {
        error!(
            message = "Error encountered during buffer read.",
            error = %self.error,
            error_code = self.error_code,
            error_type = error_type::READER_FAILED,
            stage = "processing",
        );
        counter!(
            "buffer_errors_total", "error_code" => self.error_code,
            "error_type" => "reader_failed",
            "stage" => "processing",
        )
        .increment(1);
    }
}

registered_event! {
    BufferSendDuration {
        stage: usize,
    } => {
        send_duration: Histogram = histogram!("buffer_send_duration_seconds", "stage" => self.stage.to_string()),
    }

    fn emit(&self, duration: Duration) {
        self.send_duration.record(duration);
    }
}
