// SPDX-License-Identifier: LGPL-3.0-or-later

//! Poll-loop timing constants (§5 "Suspension points"): every bounded wait
//! in the core (apply-run latch, stop-run drain, control-task busy poll)
//! shares these so a single place governs how "bounded" a given retry loop
//! actually is.

use std::time::Duration;

/// Sleep between polls of a run-control status bit.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Iteration cap for the "apply" run used to latch gain/clock settings
/// (§4.6 dependency recomputation step 4, §4.8 user-setup steps ii/iv).
pub const APPLY_RUN_MAX_POLLS: u32 = 500;

/// Iteration cap for `stop_run`'s `BUSY==0` drain (§4.9).
pub const STOP_RUN_MAX_POLLS: u32 = 1000;

/// Iteration cap for control-task busy polling (§4.9 special runs).
pub const CONTROL_TASK_MAX_POLLS: u32 = 6000;

/// `BUSY` value hardware reports while an apply/latch run is in progress;
/// the driver polls until it sees this or the run-ident counter advances.
pub const BUSY_APPLY_LATCHED: u16 = 6;
