// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Time and location sources stamped onto every entry.
//!
//! Both are injected so tests can pin timestamps and paths.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock source, in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or_default()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    millis: Arc<AtomicI64>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start_millis: i64) -> Self {
        Self {
            millis: Arc::new(AtomicI64::new(start_millis)),
        }
    }

    pub fn advance(&self, millis: i64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Logical application location attached to each entry.
pub trait PathProvider: Send + Sync + std::fmt::Debug {
    fn current_path(&self) -> String;
}

/// Current location, updated by whatever tracks navigation in the host
/// application. Clones share the same location.
#[derive(Debug, Clone, Default)]
pub struct NavigationState {
    path: Arc<RwLock<String>>,
}

impl NavigationState {
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: Arc::new(RwLock::new(path.into())),
        }
    }

    pub fn navigate(&self, path: impl Into<String>) {
        match self.path.write() {
            Ok(mut current) => *current = path.into(),
            Err(poisoned) => *poisoned.into_inner() = path.into(),
        }
    }
}

impl PathProvider for NavigationState {
    fn current_path(&self) -> String {
        match self.path.read() {
            Ok(current) => current.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
