//! Table rendering for pool status.

use chrono::{DateTime, Local};
use comfy_table::{Cell, Color, ContentArrangement, Table};
use modelhost_foundation::{ModelRegistration, WorkerState, WorkerStatus};

fn state_color(state: WorkerState) -> Color {
    match state {
        WorkerState::Idle => Color::Green,
        WorkerState::Busy | WorkerState::Loading => Color::Yellow,
        WorkerState::Error => Color::Red,
        WorkerState::Unloading | WorkerState::Shutdown => Color::DarkGrey,
    }
}

pub fn workers_table(workers: &[WorkerStatus]) -> Table {
    let mut table = Table::new();
    table
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_width(120)
        .set_header(vec![
            "worker", "device", "state", "model", "assigned", "queue", "done", "failed", "avg ms",
        ]);
    for worker in workers {
        table.add_row(vec![
            Cell::new(&worker.worker_id),
            Cell::new(worker.device),
            Cell::new(worker.state).fg(state_color(worker.state)),
            Cell::new(worker.current_model.as_deref().unwrap_or("-")),
            Cell::new(worker.assigned_model.as_deref().unwrap_or("-")),
            Cell::new(worker.queue_depth),
            Cell::new(worker.tasks_processed),
            Cell::new(worker.tasks_failed),
            Cell::new(format!("{:.1}", worker.avg_processing_ms)),
        ]);
    }
    table
}

/// Epoch milliseconds as local `HH:MM:SS`, `-` when out of range.
fn clock_time(millis: u64) -> String {
    i64::try_from(millis)
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .map(|t| t.with_timezone(&Local).format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

pub fn models_table(models: &[ModelRegistration]) -> Table {
    let mut table = Table::new();
    table
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_width(120)
        .set_header(vec![
            "model",
            "type",
            "device",
            "workers",
            "refs",
            "loaded",
            "memory gb",
            "last active",
        ]);
    for model in models {
        table.add_row(vec![
            Cell::new(&model.model_name),
            Cell::new(model.model_type),
            Cell::new(model.device),
            Cell::new(model.workers),
            Cell::new(model.reference_count),
            Cell::new(model.loaded),
            Cell::new(format!("{:.2}", model.model_memory_gb)),
            Cell::new(clock_time(model.last_activity)),
        ]);
    }
    table
}
