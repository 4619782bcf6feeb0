// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker collaborators - container runtime and volume store clients.

pub mod mock;
mod traits;

pub use mock::{MockRuntimeClient, MockVolumeClient, MockWorkerClients};
pub use traits::*;
