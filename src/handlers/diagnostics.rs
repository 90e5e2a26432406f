use crate::{models::DiagnosticsResponse, AppState};
use axum::{extract::State, http::StatusCode, Json};
use std::sync::{Mutex, OnceLock};
use sysinfo::System;
use tracing::info;

static SYSTEM_MONITOR: OnceLock<Mutex<System>> = OnceLock::new();

/// Aggregated room statistics plus process resource usage
pub async fn diagnostics(State(state): State<AppState>) -> (StatusCode, Json<DiagnosticsResponse>) {
    // Aggregate diagnostics from the registry
    let mut n_conn: u32 = 0;
    let mut n_rooms: u32 = 0;
    let mut n_dirty_docs: u32 = 0;
    let mut n_ops: u64 = 0;
    let mut n_pending_ops: u64 = 0;
    let mut n_awareness: u32 = 0;
    let mut n_store_failures: u32 = 0;
    for room in state.registry.stats().await {
        n_rooms += 1;
        n_conn += room.connections as u32;
        n_awareness += room.awareness as u32;
        n_ops += room.ops as u64;
        n_pending_ops += room.pending_ops as u64;
        if room.dirty {
            n_dirty_docs += 1;
        }
        if room.store_failures > 0 {
            n_store_failures += 1;
        }
    }

    // System stats
    let (cpu_usage, memory_alloc, memory_free, memory_total) = {
        let sys_lock = SYSTEM_MONITOR.get_or_init(|| Mutex::new(System::new_all()));
        match sys_lock.lock() {
            Ok(mut sys) => {
                sys.refresh_cpu();
                sys.refresh_memory();
                (
                    sys.global_cpu_info().cpu_usage(),
                    sys.used_memory(),
                    sys.free_memory(),
                    sys.total_memory(),
                )
            }
            Err(_) => (0.0, 0, 0, 0),
        }
    };

    info!(
        "Diagnostics: CPU: {:.2}%, Mem: {}/{} MB (Free: {} MB), Conn: {}, Rooms: {}, Dirty: {}",
        cpu_usage,
        memory_alloc / 1024 / 1024,
        memory_total / 1024 / 1024,
        memory_free / 1024 / 1024,
        n_conn,
        n_rooms,
        n_dirty_docs
    );

    (
        StatusCode::OK,
        Json(DiagnosticsResponse {
            n_conn,
            n_rooms,
            n_dirty_docs,
            n_ops,
            n_pending_ops,
            n_awareness,
            n_store_failures,
            cpu_usage,
            memory_alloc,
            memory_total,
            memory_free,
        }),
    )
}
