// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Structured log events shared by all decorators.

use std::fmt::Debug;

/// The decorator emitting an event, logged as `cache.name`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Component {
    SingleFlight,
    Lazy,
    Coalescing,
    Swr,
}

impl Component {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::SingleFlight => "single_flight",
            Self::Lazy => "single_flight_lazy",
            Self::Coalescing => "coalescing",
            Self::Swr => "swr",
        }
    }
}

/// What happened, logged as `cache.activity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CacheActivity {
    Hit,
    StaleHit,
    Miss,
    Joined,
    GateAcquired,
    Populated,
    Uncoalesced,
    RefreshScheduled,
    Refreshed,
    RefreshFailed,
}

impl CacheActivity {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::StaleHit => "stale_hit",
            Self::Miss => "miss",
            Self::Joined => "joined",
            Self::GateAcquired => "gate_acquired",
            Self::Populated => "populated",
            Self::Uncoalesced => "uncoalesced",
            Self::RefreshScheduled => "refresh_scheduled",
            Self::Refreshed => "refreshed",
            Self::RefreshFailed => "refresh_failed",
        }
    }
}

pub(crate) fn emit(component: Component, activity: CacheActivity, key: &dyn Debug) {
    record(component, activity, key, None);
}

/// Logs a swallowed background failure together with its cause.
pub(crate) fn emit_refresh_failure(key: &dyn Debug, error: &crate::Error) {
    record(Component::Swr, CacheActivity::RefreshFailed, key, Some(error));
}

fn record(component: Component, activity: CacheActivity, key: &dyn Debug, error: Option<&crate::Error>) {
    let name = component.as_str();
    let ev = activity.as_str();

    // Tracing level must be constant, so a macro selects it per activity.
    macro_rules! emit_event {
        ($level:ident $(, $($fields:tt)+)?) => {
            tracing::$level!(cache.name = name, cache.activity = ev, cache.key = ?key, $($($fields)+,)? "cache.event")
        };
    }

    match activity {
        CacheActivity::Hit | CacheActivity::StaleHit => emit_event!(trace),
        CacheActivity::Miss
        | CacheActivity::Joined
        | CacheActivity::GateAcquired
        | CacheActivity::Populated
        | CacheActivity::Uncoalesced
        | CacheActivity::RefreshScheduled
        | CacheActivity::Refreshed => emit_event!(debug),
        CacheActivity::RefreshFailed => {
            let source = error
                .and_then(std::error::Error::source)
                .map(ToString::to_string);
            emit_event!(warn, error = error.map(tracing::field::display), error.source = ?source);
        }
    }
}
