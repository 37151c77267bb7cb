//! Millisecond deltas between epoch-second timestamps.
//!
//! Results are never clamped. A negative cold start means the runtime's clock
//! disagrees with ours (or the pair is mis-ordered) and callers need to see it.

/// Time from the client issuing the call to the runtime logging its start.
pub fn cold_start_ms(client_invoke_time: f64, agent_start_time: f64) -> f64 {
    (agent_start_time - client_invoke_time) * 1000.0
}

/// Time from the client issuing the call to the stream completing.
pub fn client_duration_ms(client_invoke_time: f64, client_done_time: f64) -> f64 {
    (client_done_time - client_invoke_time) * 1000.0
}
