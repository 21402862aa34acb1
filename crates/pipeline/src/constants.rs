// SPDX-FileCopyrightText: © 2025 Castflow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Tunables for the pipeline runtime.

/// Buffer size of the bounded channel behind a `force_async` edge.
///
/// Deep enough to absorb jitter between producer and consumer tasks without
/// letting an unbounded backlog build up.
pub const ASYNC_EDGE_CAPACITY: usize = 256;
