/// The protocol agent tying transport, dispatch, and state machines together.
pub mod agent;
pub mod clock;
/// Payload identification and per-kind dispatch policy.
pub mod dispatch;
pub mod events;
/// Telemetry report registration, scheduling, and delivery.
pub mod reports;
