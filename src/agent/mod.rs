//! In-container worker programs: the server side of the control-plane
//! protocol. `worker` runs inside each warm pool container, `workspace`
//! inside the interactive workspace container.

pub mod worker;
pub mod workspace;
