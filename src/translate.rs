//! Mapping between the remote tracker's state vocabulary and local statuses.
//!
//! Both directions are lossy. Several remote states collapse onto one local
//! status, and `AT_RISK` has no remote counterpart of its own.

use std::collections::HashMap;

use crate::model::priority::PriorityStatus;

const DEFAULT_TABLE: &[(&str, PriorityStatus)] = &[
    ("new", PriorityStatus::OnTrack),
    ("active", PriorityStatus::OnTrack),
    ("committed", PriorityStatus::OnTrack),
    ("approved", PriorityStatus::OnTrack),
    ("to do", PriorityStatus::OnTrack),
    ("in progress", PriorityStatus::OnTrack),
    ("resolved", PriorityStatus::Done),
    ("closed", PriorityStatus::Done),
    ("done", PriorityStatus::Done),
    ("removed", PriorityStatus::Blocked),
];

#[derive(Debug, Clone, Default)]
pub struct StateTranslator {
    overrides: HashMap<String, PriorityStatus>,
}

impl StateTranslator {
    pub fn new(overrides: &HashMap<String, PriorityStatus>) -> Self {
        Self {
            overrides: overrides
                .iter()
                .map(|(state, status)| (normalize(state), *status))
                .collect(),
        }
    }

    /// Override table first, then the default table. Unknown states land on
    /// `ON_TRACK` so an unfamiliar workflow never blocks a sync.
    pub fn remote_to_local(&self, remote_state: &str) -> PriorityStatus {
        let key = normalize(remote_state);
        if let Some(status) = self.overrides.get(&key) {
            return *status;
        }
        match DEFAULT_TABLE.iter().find(|(state, _)| *state == key) {
            Some((_, status)) => *status,
            None => {
                tracing::warn!(
                    state = remote_state,
                    "unrecognized remote state, treating as ON_TRACK; add it to state_mapping"
                );
                PriorityStatus::OnTrack
            }
        }
    }

    /// Fixed table, no per-installation override.
    pub fn local_to_remote(status: PriorityStatus) -> &'static str {
        match status {
            PriorityStatus::OnTrack | PriorityStatus::AtRisk => "Active",
            PriorityStatus::Blocked => "Removed",
            PriorityStatus::Done => "Closed",
        }
    }

    pub fn is_closed(&self, remote_state: &str) -> bool {
        self.remote_to_local(remote_state).is_closed()
    }

    /// Remote states excluded from the "assigned to me" query: everything that
    /// translates to DONE or BLOCKED, from both tables.
    pub fn terminal_states(&self) -> Vec<String> {
        let mut states: Vec<String> = DEFAULT_TABLE
            .iter()
            .filter(|(state, _)| !self.overrides.contains_key(*state))
            .filter(|(_, status)| is_terminal(*status))
            .map(|(state, _)| title_case(state))
            .collect();
        let mut overridden: Vec<String> = self
            .overrides
            .iter()
            .filter(|(_, status)| is_terminal(**status))
            .map(|(state, _)| title_case(state))
            .collect();
        overridden.sort();
        states.extend(overridden);
        states
    }
}

fn is_terminal(status: PriorityStatus) -> bool {
    matches!(status, PriorityStatus::Done | PriorityStatus::Blocked)
}

fn normalize(state: &str) -> String {
    state.trim().to_lowercase()
}

fn title_case(state: &str) -> String {
    state
        .split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
