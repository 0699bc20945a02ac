// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The application host (§4.15/Component L15): wires a process's config
//! into running gate/gate-master/service components and drives the
//! per-frame tick until shutdown.

pub mod host;

pub use host::{Host, ServiceFactory};
