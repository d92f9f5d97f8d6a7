// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Control channel between a manager and the context running its core.
//!
//! Two independent FIFO streams share one transport: commands (host → core,
//! each answered by one reply) and notifications (core → host, one-way).

pub mod codec;
pub mod protocol;
mod responder;

pub use codec::{MAX_FRAME_LEN, read_frame, write_frame};
pub use protocol::{
    CommandOutput, CoreCommand, HelperMessage, HostMessage, Notification, PROTOCOL_VERSION,
};
pub use responder::Responder;
